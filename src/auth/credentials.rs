//! Credential management for Bitfinex WebSocket authentication.

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};

use crate::auth::signature::{auth_payload, sign_auth_payload};
use crate::error::BitfinexError;

/// Credentials and options for the `auth` handshake.
///
/// Either an API key/secret pair or an auth token may be supplied; when both
/// are present the token takes priority. The same arguments are applied to
/// every connection in a pool on (re)open.
#[derive(Clone, Default)]
pub struct AuthArgs {
    /// The API key (public identifier)
    pub api_key: Option<String>,
    /// The API secret (private, used for signing)
    api_secret: Option<SecretString>,
    /// Auth token issued by the token service
    token: Option<SecretString>,
    /// Dead-man-switch flag (4 = cancel all orders on disconnect)
    pub dms: u8,
    /// Calculation-set selector
    pub calc: u8,
}

impl AuthArgs {
    /// Create auth arguments from an API key and secret.
    pub fn from_key_secret(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            api_secret: Some(SecretString::from(api_secret.into())),
            ..Self::default()
        }
    }

    /// Create auth arguments from an auth token.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(SecretString::from(token.into())),
            ..Self::default()
        }
    }

    /// Try to create auth arguments from `BFX_API_KEY`/`BFX_API_SECRET`.
    ///
    /// Returns `None` if either variable is not set.
    pub fn try_from_env() -> Option<Self> {
        let api_key = std::env::var("BFX_API_KEY").ok()?;
        let api_secret = std::env::var("BFX_API_SECRET").ok()?;
        Some(Self::from_key_secret(api_key, api_secret))
    }

    /// Set the dead-man-switch flag.
    pub fn with_dms(mut self, dms: u8) -> Self {
        self.dms = dms;
        self
    }

    /// Set the calculation-set selector.
    pub fn with_calc(mut self, calc: u8) -> Self {
        self.calc = calc;
        self
    }

    /// Whether enough material is present to attempt authentication.
    pub fn has_credentials(&self) -> bool {
        self.token.is_some() || (self.api_key.is_some() && self.api_secret.is_some())
    }

    /// Get the auth token, if one is set.
    pub fn token(&self) -> Option<&str> {
        self.token.as_ref().map(ExposeSecret::expose_secret)
    }

    /// Replace the auth token, keeping all other fields.
    pub fn set_token(&mut self, token: impl Into<String>) {
        self.token = Some(SecretString::from(token.into()));
    }

    /// Merge non-empty fields of `other` over this set of arguments.
    ///
    /// Used when a caller re-authenticates a pool with partial updates.
    pub fn merge(&mut self, other: AuthArgs) {
        if other.api_key.is_some() {
            self.api_key = other.api_key;
        }
        if other.api_secret.is_some() {
            self.api_secret = other.api_secret;
        }
        if other.token.is_some() {
            self.token = other.token;
        }
        self.dms = other.dms;
        self.calc = other.calc;
    }

    /// Build the on-wire `auth` command.
    ///
    /// A token yields `{event, token, dms, calc}`; a key/secret pair yields
    /// `{event, apiKey, authSig, authPayload, authNonce, dms, calc}` where
    /// the signature covers `AUTH<nonce><nonce>`.
    pub fn auth_command(&self, nonce: u64) -> Result<Value, BitfinexError> {
        if let Some(token) = &self.token {
            return Ok(json!({
                "event": "auth",
                "token": token.expose_secret(),
                "dms": self.dms,
                "calc": self.calc,
            }));
        }

        match (&self.api_key, &self.api_secret) {
            (Some(api_key), Some(api_secret)) => {
                let payload = auth_payload(nonce);
                let sig = sign_auth_payload(api_secret.expose_secret(), &payload)?;

                Ok(json!({
                    "event": "auth",
                    "apiKey": api_key,
                    "authSig": sig,
                    "authPayload": payload,
                    "authNonce": nonce,
                    "dms": self.dms,
                    "calc": self.calc,
                }))
            }
            _ => Err(BitfinexError::MissingCredentials),
        }
    }
}

impl std::fmt::Debug for AuthArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthArgs")
            .field("api_key", &self.api_key)
            .field("api_secret", &self.api_secret.as_ref().map(|_| "[REDACTED]"))
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("dms", &self.dms)
            .field("calc", &self.calc)
            .finish()
    }
}
