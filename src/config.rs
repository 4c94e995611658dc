//! Endpoint constants, protocol constants and pool configuration.

use std::time::Duration;

use crate::auth::AuthArgs;

/// Bitfinex endpoint URLs.
pub mod endpoints {
    /// REST API base URL.
    pub const REST_URL: &str = "https://api.bitfinex.com";
    /// WebSocket v2 endpoint.
    pub const WS_URL: &str = "wss://api.bitfinex.com/ws/2";
    /// Default auth-token service base URL.
    pub const AUTH_URL: &str = "http://localhost:5050";
}

/// Session flag bitmask values, settable via the `conf` event.
pub mod flags {
    /// Enables all decimals as strings.
    pub const DEC_S: u32 = 8;
    /// Enables all timestamps as strings.
    pub const TIME_S: u32 = 32;
    /// Timestamps in milliseconds.
    pub const TIMESTAMP: u32 = 32768;
    /// Enable sequencing on all frames.
    pub const SEQ_ALL: u32 = 65536;
    /// Enable a checksum per order book change, top 25 levels per side.
    pub const OB_CHECKSUM: u32 = 131072;
}

/// Status codes carried by server `info` events.
pub mod info_codes {
    /// Server restarting soon, please reconnect.
    pub const SERVER_RESTART: i64 = 20051;
    /// Maintenance period started.
    pub const MAINTENANCE_START: i64 = 20060;
    /// Maintenance period ended, resubscribe to channels.
    pub const MAINTENANCE_END: i64 = 20061;
}

/// WebSocket protocol version this client speaks.
pub const PROTOCOL_VERSION: u64 = 2;

/// Default number of data channels allowed per socket before the pool
/// spills onto a new connection.
pub const DEFAULT_CHANNELS_PER_SOCKET: usize = 50;

/// Default timeout for correlated order/auth requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(3000);

/// Timeout for ping/pong round trips.
pub const PING_TIMEOUT: Duration = Duration::from_millis(7000);

/// Auth tokens are renewed this long before their expiry.
pub const TOKEN_RENEWAL_LEAD: Duration = Duration::from_secs(60 * 60);

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// WebSocket endpoint to connect to.
    pub ws_url: String,
    /// Auth-token service base URL (token renewal).
    pub auth_url: String,
    /// Credentials applied to every connection on (re)open.
    pub auth: AuthArgs,
    /// User id for auth-token renewal; renewal is scheduled only when both
    /// a token and a user id are present.
    pub user_id: Option<String>,
    /// Unix timestamp (seconds) at which the current auth token expires.
    /// Without it the first renewal fires immediately.
    pub auth_token_expires_at: Option<i64>,
    /// Maximum data channels per socket before spilling to a new one.
    pub channels_per_socket: usize,
    /// Replay confirmed subscriptions after a reconnect.
    pub auto_resubscribe: bool,
    /// Request payload transformation on data events.
    pub transform: bool,
    /// Timeout for correlated order/auth requests.
    pub request_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ws_url: endpoints::WS_URL.to_string(),
            auth_url: endpoints::AUTH_URL.to_string(),
            auth: AuthArgs::default(),
            user_id: None,
            auth_token_expires_at: None,
            channels_per_socket: DEFAULT_CHANNELS_PER_SOCKET,
            auto_resubscribe: true,
            transform: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::new()
    }
}

/// Builder for [`ManagerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ManagerConfig::default(),
        }
    }

    /// Set the WebSocket endpoint URL.
    pub fn ws_url(mut self, url: impl Into<String>) -> Self {
        self.config.ws_url = url.into();
        self
    }

    /// Set the auth-token service base URL.
    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.config.auth_url = url.into();
        self
    }

    /// Set the credentials applied to new connections.
    pub fn auth(mut self, auth: AuthArgs) -> Self {
        self.config.auth = auth;
        self
    }

    /// Set the user id used for auth-token renewal.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.config.user_id = Some(user_id.into());
        self
    }

    /// Set the expiry (unix seconds) of the current auth token.
    pub fn auth_token_expires_at(mut self, expires_at: i64) -> Self {
        self.config.auth_token_expires_at = Some(expires_at);
        self
    }

    /// Set the per-socket data channel limit.
    pub fn channels_per_socket(mut self, limit: usize) -> Self {
        self.config.channels_per_socket = limit;
        self
    }

    /// Enable or disable automatic resubscription after reconnects.
    pub fn auto_resubscribe(mut self, enabled: bool) -> Self {
        self.config.auto_resubscribe = enabled;
        self
    }

    /// Enable or disable payload transformation on data events.
    pub fn transform(mut self, enabled: bool) -> Self {
        self.config.transform = enabled;
        self
    }

    /// Set the timeout for correlated order/auth requests.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert_eq!(config.ws_url, "wss://api.bitfinex.com/ws/2");
        assert_eq!(config.auth_url, "http://localhost:5050");
        assert_eq!(config.channels_per_socket, 50);
        assert!(config.auto_resubscribe);
        assert!(!config.transform);
        assert_eq!(config.request_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn test_config_builder() {
        let config = ManagerConfig::builder()
            .ws_url("ws://127.0.0.1:9997")
            .channels_per_socket(2)
            .auto_resubscribe(false)
            .transform(true)
            .request_timeout(Duration::from_millis(500))
            .build();

        assert_eq!(config.ws_url, "ws://127.0.0.1:9997");
        assert_eq!(config.channels_per_socket, 2);
        assert!(!config.auto_resubscribe);
        assert!(config.transform);
        assert_eq!(config.request_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(flags::DEC_S, 8);
        assert_eq!(flags::TIME_S, 32);
        assert_eq!(flags::TIMESTAMP, 32768);
        assert_eq!(flags::SEQ_ALL, 65536);
        assert_eq!(flags::OB_CHECKSUM, 131072);
    }
}
