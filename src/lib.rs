//! # Bitfinex WebSocket Client
//!
//! An async Rust client library for the Bitfinex WebSocket v2 streaming API.
//!
//! ## Features
//!
//! - Multiplexed connection pool with a per-socket channel limit
//! - Public channels: trades, ticker, candles, order books with checksums
//! - Authenticated channel with HMAC-SHA384 or token auth
//! - Order submit/update/cancel with correlated confirmations
//! - Automatic reconnection and resubscription
//! - Auth-token renewal against a token service
//! - Financial precision with `rust_decimal`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bitfinex_ws_client::{Manager, ManagerConfig, PoolEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Manager::new(ManagerConfig::default());
//!     let mut events = manager.events();
//!
//!     manager.open_connection().await?;
//!     manager.subscribe_trades("tBTCUSD").await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         if let PoolEvent::Data { event, .. } = event {
//!             println!("{}", event.requested);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod channel;
pub mod config;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod orders;
pub mod plugin;
pub mod state;
pub mod transport;

// Re-export commonly used types at crate root
pub use auth::AuthArgs;
pub use channel::{ChannelDescriptor, ChannelKind};
pub use config::{ManagerConfig, flags};
pub use dispatch::DataEvent;
pub use error::{ApiError, BitfinexError};
pub use manager::{Manager, PoolEvent};
pub use orders::{CancelTarget, OrderPayload};
pub use plugin::{Plugin, PluginCtx, PluginUpdate};
pub use state::{ConnectionId, ConnectionState};

/// Result type alias using BitfinexError
pub type Result<T> = std::result::Result<T, BitfinexError>;
