//! Error types for the Bitfinex client library.

use thiserror::Error;

/// The main error type for all Bitfinex client operations.
#[derive(Error, Debug)]
pub enum BitfinexError {
    /// HTTP request failed (auth-token renewal endpoint)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// URL parsing error
    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    /// Authentication failed
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An order command was rejected by the server notification
    #[error("Request failed ({status}): {message}")]
    RequestFailed {
        /// Notification status, e.g. "ERROR"
        status: String,
        /// Human-readable rejection message
        message: String,
    },

    /// Order payload rejected before any network action
    #[error("Invalid order payload: {0}")]
    InvalidOrder(String),

    /// Invalid response from the API
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// WebSocket connection closed unexpectedly
    #[error("WebSocket connection closed: {reason}")]
    ConnectionClosed {
        /// Reason for the closure
        reason: String,
    },

    /// Correlated request timed out
    #[error("Request timed out")]
    Timeout,

    /// No connection with the given id exists in the pool
    #[error("Unknown connection id: {0}")]
    UnknownConnection(u64),

    /// A self event was raised for a plugin id that was never registered
    #[error("Unknown plugin id: {0}")]
    UnknownPlugin(String),

    /// Missing required credentials
    #[error("Missing credentials: API key/secret or auth token required")]
    MissingCredentials,

    /// The manager task is no longer running
    #[error("Manager has shut down")]
    ManagerClosed,
}

/// An error event reported by the Bitfinex server.
///
/// Arrives on the socket as `{ "event": "error", "msg": ..., "code": ... }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Numeric error code, when the server supplied one
    pub code: Option<i64>,
    /// Human-readable error message
    pub message: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{}: {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl ApiError {
    /// Create a new API error from code and message.
    pub fn new(code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Parse an API error out of a protocol error event.
    ///
    /// The server sends `{"event": "error", "msg": "...", "code": 10305}`;
    /// older gateways use `"message"` instead of `"msg"`.
    pub fn from_event(event: &serde_json::Value) -> Self {
        let code = event.get("code").and_then(serde_json::Value::as_i64);
        let message = event
            .get("msg")
            .or_else(|| event.get("message"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        Self { code, message }
    }

    /// Check if this is a duplicate-subscription error.
    pub fn is_already_subscribed(&self) -> bool {
        self.code == Some(error_codes::ALREADY_SUBSCRIBED)
    }

    /// Check if this is a not-subscribed error.
    pub fn is_not_subscribed(&self) -> bool {
        self.code == Some(error_codes::NOT_SUBSCRIBED)
    }

    /// Check if this connection hit the server-side open-channel limit.
    pub fn is_channel_limit(&self) -> bool {
        self.code == Some(error_codes::CHANNEL_LIMIT)
    }

    /// Check if this is an authentication error.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self.code,
            Some(
                error_codes::AUTH_FAILED
                    | error_codes::AUTH_PAYLOAD
                    | error_codes::AUTH_SIGNATURE
                    | error_codes::AUTH_ENCRYPTION
                    | error_codes::AUTH_NONCE
            )
        )
    }
}

/// Known Bitfinex error codes for pattern matching.
pub mod error_codes {
    /// Event errors
    pub const UNKNOWN_EVENT: i64 = 10000;
    pub const UNKNOWN_PAIR: i64 = 10001;
    pub const UNKNOWN_BOOK_PRECISION: i64 = 10011;
    pub const UNKNOWN_BOOK_LENGTH: i64 = 10012;

    /// Authentication errors
    pub const AUTH_FAILED: i64 = 10100;
    pub const AUTH_PAYLOAD: i64 = 10111;
    pub const AUTH_SIGNATURE: i64 = 10112;
    pub const AUTH_ENCRYPTION: i64 = 10113;
    pub const AUTH_NONCE: i64 = 10114;
    pub const UNAUTH_REQUEST: i64 = 10200;

    /// Subscription errors
    pub const SUBSCRIPTION_FAILED: i64 = 10300;
    pub const ALREADY_SUBSCRIBED: i64 = 10301;
    pub const UNKNOWN_CHANNEL: i64 = 10302;
    pub const CHANNEL_LIMIT: i64 = 10305;
    pub const UNSUBSCRIPTION_FAILED: i64 = 10400;
    pub const NOT_SUBSCRIBED: i64 = 10401;
}
