//! Authentication module for the Bitfinex WebSocket API.
//!
//! This module provides:
//! - Credential management with secure secret storage
//! - Nonce generation for auth payloads
//! - HMAC-SHA384 signature generation for the auth handshake
//! - Auth-token renewal against the token service

mod credentials;
mod nonce;
mod renew;
mod signature;

pub use credentials::AuthArgs;
pub use nonce::AuthNonce;
pub use renew::{RenewedToken, renew_auth_token};
pub use signature::{auth_payload, sign_auth_payload};
