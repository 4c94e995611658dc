//! HMAC-SHA384 signature generation for the Bitfinex auth handshake.
//!
//! The `auth` event carries a signature computed as:
//! ```text
//! hex(HMAC-SHA384("AUTH" + nonce + nonce, api_secret))
//! ```

use hmac::{Hmac, Mac};
use sha2::Sha384;

use crate::error::BitfinexError;

type HmacSha384 = Hmac<Sha384>;

/// Build the payload string signed during authentication.
///
/// The nonce appears twice: `AUTH<nonce><nonce>`.
pub fn auth_payload(nonce: u64) -> String {
    format!("AUTH{nonce}{nonce}")
}

/// Sign an auth payload with the API secret.
///
/// # Arguments
///
/// * `api_secret` - The API secret in plain text
/// * `payload` - The payload produced by [`auth_payload`]
///
/// # Returns
///
/// Lowercase hex-encoded HMAC-SHA384 signature.
pub fn sign_auth_payload(api_secret: &str, payload: &str) -> Result<String, BitfinexError> {
    let mut hmac = HmacSha384::new_from_slice(api_secret.as_bytes())
        .map_err(|e| BitfinexError::Auth(format!("Invalid HMAC key: {e}")))?;
    hmac.update(payload.as_bytes());
    let hmac_result = hmac.finalize().into_bytes();

    Ok(hex::encode(hmac_result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_payload_format() {
        assert_eq!(auth_payload(12345), "AUTH1234512345");
    }

    #[test]
    fn test_signature_generation() {
        let signature = sign_auth_payload("test_secret", &auth_payload(1616492376594)).unwrap();

        // The signature should be lowercase hex.
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!signature.chars().any(|c| c.is_ascii_uppercase()));
        // HMAC-SHA384 produces 48 bytes, hex encoded = 96 chars.
        assert_eq!(signature.len(), 96);
    }

    #[test]
    fn test_signature_consistency() {
        // Same inputs should produce same signature.
        let sig1 = sign_auth_payload("my_secret", "AUTH1234512345").unwrap();
        let sig2 = sign_auth_payload("my_secret", "AUTH1234512345").unwrap();

        assert_eq!(sig1, sig2);
    }

    #[test]
    fn test_signature_changes_with_nonce() {
        let sig1 = sign_auth_payload("my_secret", &auth_payload(12345)).unwrap();
        let sig2 = sign_auth_payload("my_secret", &auth_payload(12346)).unwrap();

        assert_ne!(sig1, sig2);
    }

    #[test]
    fn test_signature_changes_with_secret() {
        let sig1 = sign_auth_payload("secret_one", "AUTH1212").unwrap();
        let sig2 = sign_auth_payload("secret_two", "AUTH1212").unwrap();

        assert_ne!(sig1, sig2);
    }
}
