//! Per-connection state: channel table, pending lists, send buffer, flags.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::auth::AuthArgs;
use crate::channel::{ChannelDescriptor, ChannelKind, SubscriptionRequest};
use crate::error::BitfinexError;
use crate::transport::TransportLink;

/// Stable identifier of one logical connection in a pool.
///
/// Assigned at open and never reused; closing one connection does not affect
/// the ids of others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The bookkeeping record for one logical connection.
///
/// Pure data: all I/O goes through the owning [`Connection`]. A channel id
/// appears in `channels` only after the server confirmed it and is removed
/// only on unsubscribe confirmation or teardown.
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Pool-assigned connection id.
    pub id: ConnectionId,
    /// Confirmed subscriptions by server-assigned channel id (0 = auth).
    pub channels: HashMap<u64, ChannelDescriptor>,
    /// Subscribe commands sent but not yet confirmed.
    pub pending_subscriptions: Vec<SubscriptionRequest>,
    /// Unsubscribe commands sent but not yet confirmed.
    pub pending_unsubscriptions: Vec<u64>,
    /// Commands issued before the socket reported open, FIFO.
    pub send_buffer: Vec<String>,
    /// Whether the transport has reported open.
    pub is_open: bool,
    /// Whether the server accepted our `auth` command.
    pub authenticated: bool,
    /// Acknowledged session flag bitmask.
    pub flags: u32,
    /// Credentials applied to this connection.
    pub auth: AuthArgs,
    /// Whether data payloads are decoded before emission.
    pub transform: bool,
    /// Endpoint this connection targets.
    pub url: String,
    /// Set when the pool initiated the close; an unset flag on a close event
    /// marks an unexpected drop.
    pub managed_close: bool,
    /// Per-plugin namespaced state, keyed by plugin id.
    pub plugin_state: HashMap<String, Value>,
}

impl ConnectionState {
    /// Create the state for a freshly opened connection: empty channel
    /// table, closed, unauthenticated.
    pub fn new(id: ConnectionId, url: impl Into<String>, auth: AuthArgs, transform: bool) -> Self {
        Self {
            id,
            channels: HashMap::new(),
            pending_subscriptions: Vec::new(),
            pending_unsubscriptions: Vec::new(),
            send_buffer: Vec::new(),
            is_open: false,
            authenticated: false,
            flags: 0,
            auth,
            transform,
            url: url.into(),
            managed_close: false,
            plugin_state: HashMap::new(),
        }
    }

    /// Whether a flag bit (or combination) is currently enabled.
    pub fn is_flag_enabled(&self, flag: u32) -> bool {
        self.flags & flag == flag
    }

    /// Number of data channels this connection accounts for.
    ///
    /// Confirmed data channels, plus pending data subscribes, minus pending
    /// unsubscribes of data channels. Used by the per-socket channel limit.
    pub fn data_channel_count(&self) -> usize {
        let confirmed = self
            .channels
            .values()
            .filter(|c| c.kind().is_data())
            .count();
        let pending_subs = self
            .pending_subscriptions
            .iter()
            .filter(|s| s.kind.is_data())
            .count();
        let pending_unsubs = self
            .pending_unsubscriptions
            .iter()
            .filter(|id| {
                self.channels
                    .get(id)
                    .is_some_and(|c| c.kind().is_data())
            })
            .count();

        confirmed + pending_subs - pending_unsubs.min(confirmed + pending_subs)
    }

    /// Whether any confirmed channel satisfies `predicate`.
    pub fn has_channel(&self, predicate: impl Fn(&ChannelDescriptor) -> bool) -> bool {
        self.channels.values().any(predicate)
    }

    /// Record a confirmed subscription and reconcile the pending list.
    ///
    /// The matching pending entry (channel type plus filter-subset equality)
    /// is removed exactly once; extra confirmations leave the list alone.
    pub fn confirm_subscription(&mut self, chan_id: u64, descriptor: ChannelDescriptor) {
        if let Some(pos) = self
            .pending_subscriptions
            .iter()
            .position(|p| p.matches_confirmation(&descriptor))
        {
            self.pending_subscriptions.remove(pos);
        }
        self.channels.insert(chan_id, descriptor);
    }

    /// Record a confirmed unsubscription.
    pub fn confirm_unsubscription(&mut self, chan_id: u64) -> Option<ChannelDescriptor> {
        self.pending_unsubscriptions.retain(|id| *id != chan_id);
        self.channels.remove(&chan_id)
    }

    /// Mark the connection authenticated and install the channel-0
    /// descriptor for the private stream.
    pub fn mark_authenticated(&mut self, chan_id: u64) {
        self.authenticated = true;
        self.channels.insert(chan_id, ChannelDescriptor::auth());
    }
}

/// One live connection: bookkeeping state plus the transport behind it.
#[derive(Debug)]
pub struct Connection {
    /// The bookkeeping record.
    pub state: ConnectionState,
    /// Writer handle to the current transport.
    pub link: TransportLink,
    /// Set between a transport replacement and the new transport reporting
    /// open; makes the next open emit `Reopened` exactly once.
    pub reopen_pending: bool,
}

impl Connection {
    /// Create a connection from its state and transport link.
    pub fn new(state: ConnectionState, link: TransportLink) -> Self {
        Self {
            state,
            link,
            reopen_pending: false,
        }
    }

    /// Send a command, buffering it if the socket is not yet open.
    ///
    /// Buffered commands are replayed in order by [`flush_send_buffer`]
    /// once the transport reports open.
    ///
    /// [`flush_send_buffer`]: Connection::flush_send_buffer
    pub fn send(&mut self, message: &Value) -> Result<(), BitfinexError> {
        let text = serde_json::to_string(message)?;

        if self.state.is_open {
            tracing::debug!(id = %self.state.id, "send: {text}");
            self.link.send(text)
        } else {
            tracing::debug!(id = %self.state.id, "buffering send: {text}");
            self.state.send_buffer.push(text);
            Ok(())
        }
    }

    /// Write every buffered command in original order, then clear the
    /// buffer. Invoked once per open transition.
    pub fn flush_send_buffer(&mut self) -> Result<(), BitfinexError> {
        if self.state.send_buffer.is_empty() {
            return Ok(());
        }

        tracing::debug!(
            id = %self.state.id,
            "flushing {} buffered commands",
            self.state.send_buffer.len()
        );

        for text in std::mem::take(&mut self.state.send_buffer) {
            self.link.send(text)?;
        }

        Ok(())
    }

    /// Issue a subscribe command and record it as pending.
    ///
    /// An identical in-flight request (same type and exact filter payload)
    /// is not re-sent.
    pub fn subscribe(&mut self, kind: ChannelKind, filter: Value) -> Result<(), BitfinexError> {
        let request = SubscriptionRequest::new(kind, filter);

        if self.state.pending_subscriptions.contains(&request) {
            tracing::debug!(id = %self.state.id, %kind, "subscribe already pending");
            return Ok(());
        }

        tracing::debug!(id = %self.state.id, %kind, "subscribing: {}", request.filter);
        self.send(&request.command())?;
        self.state.pending_subscriptions.push(request);
        Ok(())
    }

    /// Issue an unsubscribe command keyed by channel id and record it as
    /// pending.
    pub fn unsubscribe(&mut self, chan_id: u64) -> Result<(), BitfinexError> {
        tracing::debug!(id = %self.state.id, chan_id, "unsubscribing");
        self.send(&json!({"event": "unsubscribe", "chanId": chan_id}))?;
        self.state.pending_unsubscriptions.push(chan_id);
        Ok(())
    }

    /// Send a `conf` command for the full flag set.
    ///
    /// The local bitmask is updated immediately; the server's `conf`
    /// confirmation re-applies the acknowledged value.
    pub fn set_flags(&mut self, flags: u32) -> Result<(), BitfinexError> {
        self.send(&json!({"event": "conf", "flags": flags}))?;
        self.state.flags = flags;
        Ok(())
    }

    /// Enable a flag bit on top of the current set.
    pub fn enable_flag(&mut self, flag: u32) -> Result<(), BitfinexError> {
        self.set_flags(self.state.flags | flag)
    }

    /// Disable a flag bit.
    pub fn disable_flag(&mut self, flag: u32) -> Result<(), BitfinexError> {
        self.set_flags(self.state.flags & !flag)
    }

    /// Send the `auth` command built from this connection's credentials.
    pub fn authenticate(&mut self, nonce: u64) -> Result<(), BitfinexError> {
        let command = self.state.auth.auth_command(nonce)?;
        self.send(&command)
    }

    /// Request a managed close of the transport.
    pub fn close(&mut self) {
        self.state.managed_close = true;
        self.link.close();
    }
}
