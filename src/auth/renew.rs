//! Auth-token renewal against the token service.

use serde::Deserialize;

use crate::error::BitfinexError;

/// A freshly issued auth token as returned by the token service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewedToken {
    /// The new auth token.
    pub token: String,
    /// Unix timestamp (seconds) at which the token was issued.
    pub renewed_at: Option<i64>,
    /// Unix timestamp (seconds) at which the token expires.
    pub expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RenewalResponse {
    data: Option<RenewedToken>,
}

/// Exchange the current auth token for a fresh one.
///
/// Issues `POST {auth_url}/v1/user/auth` with `{"userId", "token"}` and
/// returns the `data` object of the reply.
pub async fn renew_auth_token(
    client: &reqwest::Client,
    auth_url: &str,
    user_id: &str,
    token: &str,
) -> Result<RenewedToken, BitfinexError> {
    let url = format!("{auth_url}/v1/user/auth");
    let body = serde_json::json!({
        "userId": user_id,
        "token": token,
    });

    let response = client.post(&url).json(&body).send().await?;
    let parsed: RenewalResponse = response.json().await?;

    parsed
        .data
        .ok_or_else(|| BitfinexError::InvalidResponse("renewal reply carried no data".to_string()))
}
