//! Transport event handling: open/reopen transitions, inbound frame
//! dispatch, correlation resolution and plugin fan-out.

use serde_json::json;

use super::PoolEvent;
use super::actor::PoolActor;
use crate::correlation::{CorrelationKey, from_notification};
use crate::dispatch::{self, DataEvent};
use crate::error::BitfinexError;
use crate::plugin::{Plugin, PluginCtx, PluginUpdate};
use crate::state::ConnectionId;
use crate::transport::{TaggedTransportEvent, TransportEvent};

impl PoolActor {
    /// Route one transport event to its connection.
    ///
    /// Events from a transport generation older than the connection's
    /// current link are stale leftovers of a replaced socket and are
    /// dropped.
    pub(super) fn on_transport_event(&mut self, tagged: TaggedTransportEvent) {
        let Some(connection) = self.pool.get(&tagged.connection) else {
            tracing::debug!(
                id = %tagged.connection,
                "event for unknown connection: {:?}",
                tagged.event
            );
            return;
        };
        if connection.link.generation() != tagged.generation {
            tracing::debug!(
                id = %tagged.connection,
                generation = tagged.generation,
                "dropping stale transport event"
            );
            return;
        }

        match tagged.event {
            TransportEvent::Opened => self.on_opened(tagged.connection),
            TransportEvent::Frame(text) => self.on_frame(tagged.connection, &text),
            TransportEvent::Error(message) => self.on_socket_error(tagged.connection, message),
            TransportEvent::Closed => self.on_closed(tagged.connection),
        }
    }

    /// A transport finished its handshake: flush buffered commands, restore
    /// channel state after a reconnect, then authenticate if credentials
    /// are present.
    fn on_opened(&mut self, id: ConnectionId) {
        let Some(connection) = self.pool.get_mut(&id) else {
            return;
        };
        if connection.state.is_open {
            return;
        }

        connection.state.is_open = true;
        let reopened = std::mem::take(&mut connection.reopen_pending);
        if let Err(e) = connection.flush_send_buffer() {
            tracing::warn!(%id, error = %e, "send buffer flush failed");
        }

        self.notify_for(id, |p, cx| p.on_open(cx, id));
        if reopened {
            self.emit(PoolEvent::ConnectionReopened { id });
        } else {
            self.emit(PoolEvent::ConnectionOpened { id });
        }

        if reopened && self.config.auto_resubscribe {
            self.resubscribe(id);
        }

        if self.auth.has_credentials() {
            let nonce = self.nonce.take();
            if let Some(connection) = self.pool.get_mut(&id) {
                if !connection.state.authenticated {
                    connection.state.auth = self.auth.clone();
                    if let Err(e) = connection.authenticate(nonce) {
                        tracing::warn!(%id, error = %e, "auth send failed");
                    }
                }
            }
        }
    }

    /// Replay every data subscription recorded before the reconnect.
    fn resubscribe(&mut self, id: ConnectionId) {
        let Some(connection) = self.pool.get_mut(&id) else {
            return;
        };

        let filters: Vec<_> = connection
            .state
            .channels
            .values()
            .filter(|channel| channel.kind().is_data())
            .map(|channel| (channel.kind(), channel.resubscribe_filter()))
            .collect();
        connection.state.channels.clear();

        tracing::info!(%id, count = filters.len(), "resubscribing channels");
        for (kind, filter) in filters {
            if let Err(e) = connection.subscribe(kind, filter) {
                tracing::warn!(%id, %kind, error = %e, "resubscribe failed");
            }
        }
    }

    /// Decode one inbound frame and fan out the resulting pool events.
    fn on_frame(&mut self, id: ConnectionId, raw: &str) {
        let Some(connection) = self.pool.get_mut(&id) else {
            return;
        };

        let output = dispatch::on_frame(&mut connection.state, raw);
        for event in output.events {
            self.process_event(event);
        }

        if output.close_transport {
            // Unmanaged close: the teardown path runs when the transport
            // reports closed.
            if let Some(connection) = self.pool.get(&id) {
                connection.link.close();
            }
        }
    }

    /// Notify plugins, resolve correlated requests, then broadcast.
    fn process_event(&mut self, event: PoolEvent) {
        match &event {
            PoolEvent::Message { id, frame } => {
                let (id, frame) = (*id, frame.clone());
                self.notify_for(id, |p, cx| p.on_message(cx, id, &frame));
            }
            PoolEvent::AuthSuccess { id, event } => {
                let (id, event) = (*id, event.clone());
                self.correlations
                    .resolve(id, CorrelationKey::Auth, Ok(event.clone()));
                self.notify_for(id, |p, cx| p.on_protocol_event(cx, id, "auth", &event));
            }
            PoolEvent::AuthError { id, error } => {
                let (id, error) = (*id, error.clone());
                self.correlations.resolve(
                    id,
                    CorrelationKey::Auth,
                    Err(BitfinexError::Auth(error.to_string())),
                );
                let event = json!({"code": error.code, "msg": error.message});
                self.notify_for(id, |p, cx| p.on_protocol_event(cx, id, "auth", &event));
            }
            PoolEvent::Subscribed {
                id,
                chan_id,
                channel,
            } => {
                let id = *id;
                let mut event = channel.chan_filter();
                event["chanId"] = json!(chan_id);
                event["channel"] = json!(channel.kind().as_str());
                self.notify_for(id, |p, cx| p.on_protocol_event(cx, id, "subscribed", &event));
            }
            PoolEvent::Unsubscribed { id, chan_id } => {
                let (id, event) = (*id, json!({"chanId": chan_id}));
                self.notify_for(id, |p, cx| {
                    p.on_protocol_event(cx, id, "unsubscribed", &event)
                });
            }
            PoolEvent::Info { id, event } => {
                let (id, event) = (*id, event.clone());
                self.notify_for(id, |p, cx| p.on_protocol_event(cx, id, "info", &event));
            }
            PoolEvent::FlagsUpdated { id, flags } => {
                let (id, event) = (*id, json!({"flags": flags}));
                self.notify_for(id, |p, cx| p.on_protocol_event(cx, id, "conf", &event));
            }
            PoolEvent::ConfigError { id, error } | PoolEvent::ProtocolError { id, error } => {
                let (id, event) = (*id, json!({"code": error.code, "msg": error.message}));
                self.notify_for(id, |p, cx| p.on_protocol_event(cx, id, "error", &event));
            }
            PoolEvent::Pong { id, cid, event } => {
                let (id, event) = (*id, event.clone());
                if let Some(cid) = cid {
                    self.correlations
                        .resolve(id, CorrelationKey::Ping(*cid), Ok(event.clone()));
                }
                self.notify_for(id, |p, cx| p.on_protocol_event(cx, id, "pong", &event));
            }
            PoolEvent::Data { id, event } => {
                let (id, event) = (*id, event.clone());
                self.notify_for(id, |p, cx| p.on_data(cx, id, event.kind, &event));
            }
            PoolEvent::BookChecksum {
                id,
                checksum,
                chan_filter,
            } => {
                let id = *id;
                let event = DataEvent {
                    kind: crate::channel::ChannelKind::Book,
                    original: checksum.clone(),
                    requested: checksum.clone(),
                    chan_filter: chan_filter.clone(),
                };
                self.notify_for(id, |p, cx| p.on_data(cx, id, event.kind, &event));
            }
            PoolEvent::AuthData { id, tag, payload } => {
                let (id, tag, payload) = (*id, tag.clone(), payload.clone());
                self.notify_for(id, |p, cx| p.on_auth_data(cx, id, &tag, &payload));
            }
            PoolEvent::Notification { id, payload } => {
                let (id, payload) = (*id, payload.clone());
                if let Some(outcome) = from_notification(&payload) {
                    let result = if outcome.success {
                        Ok(outcome.payload)
                    } else {
                        Err(BitfinexError::RequestFailed {
                            status: outcome.status,
                            message: outcome.message,
                        })
                    };
                    self.correlations.resolve(id, outcome.key, result);
                }
                self.notify_for(id, |p, cx| p.on_auth_data(cx, id, "n", &payload));
            }
            _ => {}
        }

        self.emit(event);
    }

    /// A socket-level error; the transport reports closed separately when
    /// the error was fatal.
    fn on_socket_error(&mut self, id: ConnectionId, message: String) {
        tracing::warn!(%id, "socket error: {message}");
        self.notify_for(id, |p, cx| p.on_socket_error(cx, id, &message));
        self.emit(PoolEvent::ConnectionError { id, message });
    }

    /// A transport closed.
    ///
    /// A pool-initiated close has already torn the record down; anything
    /// else is an unexpected drop and removes the connection from the pool.
    fn on_closed(&mut self, id: ConnectionId) {
        let Some(connection) = self.pool.get_mut(&id) else {
            return;
        };

        if connection.state.managed_close {
            connection.state.is_open = false;
            return;
        }

        tracing::warn!(%id, "connection dropped");
        self.notify_for(id, |p, cx| p.on_close(cx, id));
        self.notify_for(id, |p, cx| p.on_connection_destroyed(cx, id));
        self.pool.remove(&id);
        self.emit(PoolEvent::ConnectionClosed { id });
    }

    /// Run one plugin hook against a single connection.
    pub(super) fn notify_for(
        &mut self,
        id: ConnectionId,
        hook: impl Fn(&dyn Plugin, PluginCtx<'_>) -> PluginUpdate,
    ) {
        let queued = self.plugins.notify(&mut self.pool, |p, cx| {
            if cx.state.id == id {
                hook(p, cx)
            } else {
                PluginUpdate::none()
            }
        });
        self.dispatch_self_events(queued);
    }
}
