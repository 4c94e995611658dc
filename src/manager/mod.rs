//! Connection pool manager.
//!
//! A single actor task owns every connection record; the cloneable
//! [`Manager`] handle talks to it over a command channel and observes the
//! pool through a broadcast of [`PoolEvent`]s. Because all state mutation
//! happens inside the actor, interleaved delivery from any number of
//! transports needs no locking, and cross-connection policies (auth
//! propagation, flag mirroring, resubscription, plugin fan-out) run inside
//! a single actor turn.

mod actor;
mod events;

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::auth::AuthArgs;
use crate::channel::{ChannelDescriptor, ChannelKind};
use crate::config::ManagerConfig;
use crate::dispatch::DataEvent;
use crate::error::{ApiError, BitfinexError};
use crate::orders::{CancelTarget, OrderPayload};
use crate::plugin::Plugin;
use crate::state::{ConnectionId, ConnectionState};

/// A pool-level event, fanned out to every subscriber.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A transport completed its first open.
    ConnectionOpened {
        /// Connection that opened.
        id: ConnectionId,
    },
    /// A replacement transport opened after a reconnect.
    ConnectionReopened {
        /// Connection that reopened.
        id: ConnectionId,
    },
    /// A connection closed and was removed from the pool.
    ConnectionClosed {
        /// Connection that closed.
        id: ConnectionId,
    },
    /// A socket-level or frame-decode error; never fatal to the pool.
    ConnectionError {
        /// Connection the error belongs to.
        id: ConnectionId,
        /// Error description.
        message: String,
    },
    /// Every successfully parsed inbound frame, verbatim.
    Message {
        /// Receiving connection.
        id: ConnectionId,
        /// The parsed frame.
        frame: Value,
    },
    /// The server accepted our `auth` command.
    AuthSuccess {
        /// Authenticated connection.
        id: ConnectionId,
        /// The full auth event.
        event: Value,
    },
    /// The server rejected our `auth` command.
    AuthError {
        /// Connection left unauthenticated.
        id: ConnectionId,
        /// Server-reported failure.
        error: ApiError,
    },
    /// A subscription was confirmed.
    Subscribed {
        /// Owning connection.
        id: ConnectionId,
        /// Server-assigned channel id.
        chan_id: u64,
        /// The confirmed channel.
        channel: ChannelDescriptor,
    },
    /// An unsubscription was confirmed.
    Unsubscribed {
        /// Owning connection.
        id: ConnectionId,
        /// Channel id removed.
        chan_id: u64,
    },
    /// A server `info` event.
    Info {
        /// Receiving connection.
        id: ConnectionId,
        /// The full info event.
        event: Value,
    },
    /// The server announced a restart (info code 20051).
    ServerRestart {
        /// Receiving connection.
        id: ConnectionId,
    },
    /// Maintenance period started (info code 20060).
    MaintenanceStart {
        /// Receiving connection.
        id: ConnectionId,
    },
    /// Maintenance period ended (info code 20061).
    MaintenanceEnd {
        /// Receiving connection.
        id: ConnectionId,
    },
    /// The server acknowledged a `conf` command.
    FlagsUpdated {
        /// Connection whose flags changed.
        id: ConnectionId,
        /// Acknowledged bitmask.
        flags: u32,
    },
    /// A flag-set command was issued against a connection. Mirrored
    /// configurations on other pool members do not re-emit this.
    FlagsSet {
        /// Connection the command was issued on.
        id: ConnectionId,
        /// Requested bitmask.
        flags: u32,
    },
    /// The server rejected a `conf` command; flags unchanged.
    ConfigError {
        /// Receiving connection.
        id: ConnectionId,
        /// Server-reported failure.
        error: ApiError,
    },
    /// A server-reported protocol error.
    ProtocolError {
        /// Receiving connection.
        id: ConnectionId,
        /// The error event.
        error: ApiError,
    },
    /// A pong reply.
    Pong {
        /// Receiving connection.
        id: ConnectionId,
        /// Correlation id, when the ping carried one.
        cid: Option<u64>,
        /// The full pong event.
        event: Value,
    },
    /// Data arrived on a public channel.
    Data {
        /// Receiving connection.
        id: ConnectionId,
        /// The decoded data event.
        event: DataEvent,
    },
    /// An order-book checksum sub-frame.
    BookChecksum {
        /// Receiving connection.
        id: ConnectionId,
        /// Checksum value as sent by the server.
        checksum: Value,
        /// Filter fields of the book channel.
        chan_filter: Value,
    },
    /// Account data on the authenticated channel, keyed by type tag.
    AuthData {
        /// Receiving connection.
        id: ConnectionId,
        /// Type tag, e.g. `os`, `ws`, `te`.
        tag: String,
        /// Raw payload.
        payload: Value,
    },
    /// A notification (`n`) on the authenticated channel.
    Notification {
        /// Receiving connection.
        id: ConnectionId,
        /// The notification payload array.
        payload: Value,
    },
    /// The auth token was renewed against the token service.
    AuthTokenRenewed {
        /// Expiry of the fresh token (unix seconds), when reported.
        expires_at: Option<i64>,
    },
}

/// Predicate over channel descriptors, used for connection selection.
pub type ChannelPredicate = Box<dyn Fn(&ChannelDescriptor) -> bool + Send>;

/// Commands accepted by the pool actor.
pub(crate) enum Command {
    OpenConnection {
        reply: oneshot::Sender<ConnectionId>,
    },
    CloseConnection {
        id: ConnectionId,
        reply: oneshot::Sender<Result<(), BitfinexError>>,
    },
    CloseAll {
        reply: oneshot::Sender<()>,
    },
    ReconnectAll {
        reply: oneshot::Sender<()>,
    },
    ConnectionCount {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        id: ConnectionId,
        reply: oneshot::Sender<Result<ConnectionState, BitfinexError>>,
    },
    Snapshots {
        reply: oneshot::Sender<Vec<ConnectionState>>,
    },
    Subscribe {
        kind: ChannelKind,
        filter: Value,
        reply: oneshot::Sender<Result<(), BitfinexError>>,
    },
    Unsubscribe {
        predicate: ChannelPredicate,
        reply: oneshot::Sender<Result<bool, BitfinexError>>,
    },
    Auth {
        args: Option<AuthArgs>,
        force: bool,
        reply: oneshot::Sender<Result<(), BitfinexError>>,
    },
    AuthenticateConnection {
        id: ConnectionId,
        reply: oneshot::Sender<Result<Value, BitfinexError>>,
    },
    UpdateAuthArgs {
        args: AuthArgs,
        reply: oneshot::Sender<()>,
    },
    SubmitOrder {
        payload: Value,
        reply: oneshot::Sender<Result<Value, BitfinexError>>,
    },
    UpdateOrder {
        changes: Value,
        reply: oneshot::Sender<Result<Value, BitfinexError>>,
    },
    CancelOrder {
        target: CancelTarget,
        reply: oneshot::Sender<Result<Value, BitfinexError>>,
    },
    CancelOrdersByGid {
        gid: u64,
        reply: oneshot::Sender<Result<Value, BitfinexError>>,
    },
    Ping {
        reply: oneshot::Sender<Result<Value, BitfinexError>>,
    },
    SetFlags {
        flags: u32,
        reply: oneshot::Sender<Result<(), BitfinexError>>,
    },
    EnableFlag {
        flag: u32,
        reply: oneshot::Sender<Result<(), BitfinexError>>,
    },
    DisableFlag {
        flag: u32,
        reply: oneshot::Sender<Result<(), BitfinexError>>,
    },
    NotifyPlugin {
        plugin_id: String,
        label: String,
        args: Value,
        reply: oneshot::Sender<Result<(), BitfinexError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a connection pool.
///
/// Cloneable; all clones talk to the same actor. Dropping every clone shuts
/// the pool down.
///
/// # Example
///
/// ```rust,ignore
/// use bitfinex_ws_client::{ChannelKind, Manager, ManagerConfig, PoolEvent};
/// use serde_json::json;
///
/// let manager = Manager::new(ManagerConfig::default());
/// let mut events = manager.events();
///
/// manager.open_connection().await?;
/// manager.subscribe(ChannelKind::Trades, json!({"symbol": "tBTCUSD"})).await?;
///
/// while let Ok(event) = events.recv().await {
///     if let PoolEvent::Data { event, .. } = event {
///         println!("{:?}", event.requested);
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Manager {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<PoolEvent>,
}

impl Manager {
    /// Spawn a pool actor with no plugins.
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_plugins(config, Vec::new())
    }

    /// Spawn a pool actor with the given plugins registered.
    pub fn with_plugins(config: ManagerConfig, plugins: Vec<Box<dyn Plugin>>) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(1024);

        actor::spawn(config, plugins, commands_rx, events_tx.clone());

        Self {
            commands: commands_tx,
            events: events_tx,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, BitfinexError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| BitfinexError::ManagerClosed)?;
        rx.await.map_err(|_| BitfinexError::ManagerClosed)
    }

    /// Open a new connection and append it to the pool.
    ///
    /// Returns as soon as the record exists; the transport handshake
    /// completes in the background and surfaces as
    /// [`PoolEvent::ConnectionOpened`].
    pub async fn open_connection(&self) -> Result<ConnectionId, BitfinexError> {
        self.request(|reply| Command::OpenConnection { reply }).await
    }

    /// Close a connection and remove it from the pool.
    pub async fn close_connection(&self, id: ConnectionId) -> Result<(), BitfinexError> {
        self.request(|reply| Command::CloseConnection { id, reply })
            .await?
    }

    /// Close every connection in the pool.
    pub async fn close_all(&self) -> Result<(), BitfinexError> {
        self.request(|reply| Command::CloseAll { reply }).await
    }

    /// Replace every connection's transport in place.
    ///
    /// Connection ids and channel tables are preserved; with
    /// auto-resubscribe enabled the channel state is restored once each
    /// replacement transport reports open.
    pub async fn reconnect_all(&self) -> Result<(), BitfinexError> {
        self.request(|reply| Command::ReconnectAll { reply }).await
    }

    /// Number of connections currently in the pool.
    pub async fn connection_count(&self) -> Result<usize, BitfinexError> {
        self.request(|reply| Command::ConnectionCount { reply }).await
    }

    /// Snapshot of one connection's bookkeeping state.
    pub async fn connection(&self, id: ConnectionId) -> Result<ConnectionState, BitfinexError> {
        self.request(|reply| Command::Snapshot { id, reply }).await?
    }

    /// Snapshots of every connection in the pool, in creation order.
    pub async fn connections(&self) -> Result<Vec<ConnectionState>, BitfinexError> {
        self.request(|reply| Command::Snapshots { reply }).await
    }

    /// Subscribe to a channel on a connection with free data-channel
    /// capacity, opening a new connection when the pool is full.
    pub async fn subscribe(
        &self,
        kind: ChannelKind,
        filter: Value,
    ) -> Result<(), BitfinexError> {
        self.request(|reply| Command::Subscribe { kind, filter, reply })
            .await?
    }

    /// Subscribe to the trade feed for a symbol.
    pub async fn subscribe_trades(&self, symbol: &str) -> Result<(), BitfinexError> {
        self.subscribe(ChannelKind::Trades, serde_json::json!({"symbol": symbol}))
            .await
    }

    /// Subscribe to the ticker feed for a symbol.
    pub async fn subscribe_ticker(&self, symbol: &str) -> Result<(), BitfinexError> {
        self.subscribe(ChannelKind::Ticker, serde_json::json!({"symbol": symbol}))
            .await
    }

    /// Subscribe to a candle feed by key, e.g. `trade:1m:tBTCUSD`.
    pub async fn subscribe_candles(&self, key: &str) -> Result<(), BitfinexError> {
        self.subscribe(ChannelKind::Candles, serde_json::json!({"key": key}))
            .await
    }

    /// Subscribe to the order book for a symbol.
    pub async fn subscribe_book(&self, symbol: &str) -> Result<(), BitfinexError> {
        self.subscribe(ChannelKind::Book, serde_json::json!({"symbol": symbol}))
            .await
    }

    /// Unsubscribe every channel matching `predicate` on the first
    /// connection that has one. Returns whether a channel matched.
    pub async fn unsubscribe_where(
        &self,
        predicate: impl Fn(&ChannelDescriptor) -> bool + Send + 'static,
    ) -> Result<bool, BitfinexError> {
        self.request(|reply| Command::Unsubscribe {
            predicate: Box::new(predicate),
            reply,
        })
        .await?
    }

    /// Merge `args` into the pool's auth arguments and authenticate every
    /// connection that is not yet authenticated.
    ///
    /// Results surface as [`PoolEvent::AuthSuccess`] /
    /// [`PoolEvent::AuthError`] per connection.
    pub async fn auth(&self, args: AuthArgs) -> Result<(), BitfinexError> {
        self.request(|reply| Command::Auth {
            args: Some(args),
            force: false,
            reply,
        })
        .await?
    }

    /// Like [`auth`](Manager::auth), but re-authenticates every connection,
    /// including ones that already hold an authenticated session.
    pub async fn auth_forced(&self, args: AuthArgs) -> Result<(), BitfinexError> {
        self.request(|reply| Command::Auth {
            args: Some(args),
            force: true,
            reply,
        })
        .await?
    }

    /// Authenticate every unauthenticated connection with the pool's
    /// current auth arguments.
    pub async fn authenticate(&self) -> Result<(), BitfinexError> {
        self.request(|reply| Command::Auth {
            args: None,
            force: false,
            reply,
        })
        .await?
    }

    /// Authenticate one connection and await the handshake result.
    pub async fn authenticate_connection(
        &self,
        id: ConnectionId,
    ) -> Result<Value, BitfinexError> {
        self.request(|reply| Command::AuthenticateConnection { id, reply })
            .await?
    }

    /// Merge new auth arguments into the pool defaults without
    /// re-authenticating.
    pub async fn update_auth_args(&self, args: AuthArgs) -> Result<(), BitfinexError> {
        self.request(|reply| Command::UpdateAuthArgs { args, reply })
            .await
    }

    /// Submit a new order on an authenticated connection and await its
    /// confirmation notification.
    pub async fn submit_order(&self, order: OrderPayload) -> Result<Value, BitfinexError> {
        self.submit_order_raw(serde_json::to_value(&order)?).await
    }

    /// Submit a raw new-order payload.
    ///
    /// Array-shaped payloads pass through unchanged; object payloads must
    /// carry a `cid`.
    pub async fn submit_order_raw(&self, payload: Value) -> Result<Value, BitfinexError> {
        self.request(|reply| Command::SubmitOrder { payload, reply })
            .await?
    }

    /// Submit an order after a fixed delay, for controlled-rate pacing.
    pub async fn submit_order_with_delay(
        &self,
        delay: Duration,
        order: OrderPayload,
    ) -> Result<Value, BitfinexError> {
        tokio::time::sleep(delay).await;
        self.submit_order(order).await
    }

    /// Update an order in place. The changeset must carry the
    /// server-assigned `id`; a missing id fails locally without any network
    /// round-trip.
    pub async fn update_order(&self, changes: Value) -> Result<Value, BitfinexError> {
        self.request(|reply| Command::UpdateOrder { changes, reply })
            .await?
    }

    /// Cancel an order given an order object, a raw order array, or a bare
    /// id, and await the confirmation notification.
    pub async fn cancel_order(
        &self,
        target: impl Into<CancelTarget>,
    ) -> Result<Value, BitfinexError> {
        let target = target.into();
        self.request(|reply| Command::CancelOrder { target, reply })
            .await?
    }

    /// Cancel an order after a fixed delay.
    pub async fn cancel_order_with_delay(
        &self,
        delay: Duration,
        target: impl Into<CancelTarget>,
    ) -> Result<Value, BitfinexError> {
        tokio::time::sleep(delay).await;
        self.cancel_order(target.into()).await
    }

    /// Cancel every order in a group and await the confirmation.
    pub async fn cancel_orders_by_gid(&self, gid: u64) -> Result<Value, BitfinexError> {
        self.request(|reply| Command::CancelOrdersByGid { gid, reply })
            .await?
    }

    /// Send a tagged ping on a random connection and await the matching
    /// pong.
    pub async fn ping(&self) -> Result<Value, BitfinexError> {
        self.request(|reply| Command::Ping { reply }).await?
    }

    /// Set the session flag bitmask pool-wide.
    ///
    /// The command is issued against one connection and mirrored silently
    /// onto every other; flags are pool-wide from the caller's perspective.
    pub async fn set_flags(&self, flags: u32) -> Result<(), BitfinexError> {
        self.request(|reply| Command::SetFlags { flags, reply }).await?
    }

    /// Enable a flag bit pool-wide.
    pub async fn enable_flag(&self, flag: u32) -> Result<(), BitfinexError> {
        self.request(|reply| Command::EnableFlag { flag, reply }).await?
    }

    /// Disable a flag bit pool-wide.
    pub async fn disable_flag(&self, flag: u32) -> Result<(), BitfinexError> {
        self.request(|reply| Command::DisableFlag { flag, reply })
            .await?
    }

    /// Raise a self event for a registered plugin.
    ///
    /// Fails fast with [`BitfinexError::UnknownPlugin`] when no plugin with
    /// that id exists.
    pub async fn notify_plugin(
        &self,
        plugin_id: impl Into<String>,
        label: impl Into<String>,
        args: Value,
    ) -> Result<(), BitfinexError> {
        let (plugin_id, label) = (plugin_id.into(), label.into());
        self.request(|reply| Command::NotifyPlugin {
            plugin_id,
            label,
            args,
            reply,
        })
        .await?
    }

    /// Shut the pool down: close every connection and stop the actor.
    pub async fn close(&self) -> Result<(), BitfinexError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Subscribe to the raw pool event broadcast.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Stream of every data event in the pool.
    pub fn data_events(&self) -> impl tokio_stream::Stream<Item = DataEvent> + use<> {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| match event {
            Ok(PoolEvent::Data { event, .. }) => Some(event),
            _ => None,
        })
    }

    fn filtered_data(
        &self,
        kind: ChannelKind,
        field: &'static str,
        value: String,
    ) -> impl tokio_stream::Stream<Item = DataEvent> + use<> {
        BroadcastStream::new(self.events.subscribe()).filter_map(move |event| match event {
            Ok(PoolEvent::Data { event, .. })
                if event.kind == kind
                    && event.chan_filter.get(field).and_then(Value::as_str)
                        == Some(value.as_str()) =>
            {
                Some(event)
            }
            _ => None,
        })
    }

    /// Stream of trade events for one symbol.
    pub fn trades(&self, symbol: &str) -> impl tokio_stream::Stream<Item = DataEvent> + use<> {
        self.filtered_data(ChannelKind::Trades, "symbol", symbol.to_string())
    }

    /// Stream of ticker events for one symbol.
    pub fn ticker(&self, symbol: &str) -> impl tokio_stream::Stream<Item = DataEvent> + use<> {
        self.filtered_data(ChannelKind::Ticker, "symbol", symbol.to_string())
    }

    /// Stream of candle events for one key.
    pub fn candles(&self, key: &str) -> impl tokio_stream::Stream<Item = DataEvent> + use<> {
        self.filtered_data(ChannelKind::Candles, "key", key.to_string())
    }

    /// Stream of order-book events for one symbol.
    pub fn book(&self, symbol: &str) -> impl tokio_stream::Stream<Item = DataEvent> + use<> {
        self.filtered_data(ChannelKind::Book, "symbol", symbol.to_string())
    }
}
