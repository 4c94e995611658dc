//! The pool actor: owns every connection record and all pool state.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use super::{Command, PoolEvent};
use crate::auth::{AuthArgs, AuthNonce, RenewedToken, renew_auth_token};
use crate::channel::ChannelKind;
use crate::config::{ManagerConfig, PING_TIMEOUT, TOKEN_RENEWAL_LEAD};
use crate::correlation::{CorrelationKey, CorrelationTable};
use crate::error::BitfinexError;
use crate::orders;
use crate::plugin::{Plugin, PluginHost};
use crate::state::{Connection, ConnectionId, ConnectionState};
use crate::transport::{TaggedTransportEvent, TransportLink};

/// Actor-internal messages produced by background tasks.
pub(super) enum InternalEvent {
    /// The renewal timer fired.
    RenewToken,
    /// A renewal attempt finished.
    TokenRenewed(Result<RenewedToken, BitfinexError>),
}

/// Spawn the actor task for one pool.
pub(super) fn spawn(
    config: ManagerConfig,
    plugins: Vec<Box<dyn Plugin>>,
    commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<PoolEvent>,
) {
    let actor = PoolActor::new(config, plugins, commands, events);
    tokio::spawn(actor.run());
}

pub(super) struct PoolActor {
    pub(super) config: ManagerConfig,
    /// Pool-wide auth arguments; copied onto connections when they
    /// authenticate.
    pub(super) auth: AuthArgs,
    /// Connection records in creation order.
    pub(super) pool: BTreeMap<ConnectionId, Connection>,
    pub(super) plugins: PluginHost,
    pub(super) correlations: CorrelationTable,
    commands: mpsc::Receiver<Command>,
    pub(super) events: broadcast::Sender<PoolEvent>,
    transport_tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    transport_rx: mpsc::UnboundedReceiver<TaggedTransportEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    pub(super) nonce: AuthNonce,
    http: reqwest::Client,
    next_connection_id: u64,
    next_generation: u64,
    renewal: Option<tokio::task::JoinHandle<()>>,
}

impl PoolActor {
    fn new(
        config: ManagerConfig,
        plugins: Vec<Box<dyn Plugin>>,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<PoolEvent>,
    ) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let auth = config.auth.clone();

        Self {
            config,
            auth,
            pool: BTreeMap::new(),
            plugins: PluginHost::new(plugins),
            correlations: CorrelationTable::new(),
            commands,
            events,
            transport_tx,
            transport_rx,
            internal_tx,
            internal_rx,
            nonce: AuthNonce::new(),
            http: reqwest::Client::new(),
            next_connection_id: 0,
            next_generation: 0,
            renewal: None,
        }
    }

    async fn run(mut self) {
        self.schedule_renewal(self.config.auth_token_expires_at);

        let mut sweep = tokio::time::interval(Duration::from_millis(100));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    }
                    // Every handle dropped.
                    None => break,
                },
                Some(event) = self.transport_rx.recv() => self.on_transport_event(event),
                Some(event) = self.internal_rx.recv() => self.on_internal_event(event),
                _ = sweep.tick() => self.correlations.sweep(Instant::now()),
            }
        }

        self.shutdown();
    }

    /// Handle one command; returns `true` on shutdown.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::OpenConnection { reply } => {
                let id = self.open_connection();
                let _ = reply.send(id);
            }
            Command::CloseConnection { id, reply } => {
                let _ = reply.send(self.close_connection(id));
            }
            Command::CloseAll { reply } => {
                self.close_all();
                let _ = reply.send(());
            }
            Command::ReconnectAll { reply } => {
                let ids: Vec<_> = self.pool.keys().copied().collect();
                for id in ids {
                    self.reopen_connection(id);
                }
                let _ = reply.send(());
            }
            Command::ConnectionCount { reply } => {
                let _ = reply.send(self.pool.len());
            }
            Command::Snapshot { id, reply } => {
                let snapshot = self
                    .pool
                    .get(&id)
                    .map(|c| c.state.clone())
                    .ok_or(BitfinexError::UnknownConnection(id.0));
                let _ = reply.send(snapshot);
            }
            Command::Snapshots { reply } => {
                let _ = reply.send(self.pool.values().map(|c| c.state.clone()).collect());
            }
            Command::Subscribe { kind, filter, reply } => {
                let _ = reply.send(self.subscribe(kind, filter));
            }
            Command::Unsubscribe { predicate, reply } => {
                let _ = reply.send(self.unsubscribe_where(&predicate));
            }
            Command::Auth { args, force, reply } => {
                let _ = reply.send(self.auth_pool(args, force));
            }
            Command::AuthenticateConnection { id, reply } => {
                self.authenticate_connection(id, reply);
            }
            Command::UpdateAuthArgs { args, reply } => {
                for connection in self.pool.values_mut() {
                    connection.state.auth.merge(args.clone());
                }
                self.auth.merge(args);
                let _ = reply.send(());
            }
            Command::SubmitOrder { payload, reply } => {
                match orders::order_cid(&payload) {
                    Ok(cid) => self.issue_order(
                        orders::new_order_envelope(&payload),
                        CorrelationKey::NewOrder(cid),
                        reply,
                    ),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::UpdateOrder { changes, reply } => {
                match orders::update_order_id(&changes) {
                    Ok(id) => self.issue_order(
                        orders::update_order_envelope(&changes),
                        CorrelationKey::UpdateOrder(id),
                        reply,
                    ),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::CancelOrder { target, reply } => {
                match target.order_id() {
                    Ok(id) => self.issue_order(
                        orders::cancel_order_envelope(id),
                        CorrelationKey::CancelOrder(id),
                        reply,
                    ),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::CancelOrdersByGid { gid, reply } => {
                self.issue_order(
                    orders::cancel_group_envelope(gid),
                    CorrelationKey::CancelGroup(gid),
                    reply,
                );
            }
            Command::Ping { reply } => {
                self.ping(reply);
            }
            Command::SetFlags { flags, reply } => {
                let _ = reply.send(self.apply_flags(|_| flags));
            }
            Command::EnableFlag { flag, reply } => {
                let _ = reply.send(self.apply_flags(|current| current | flag));
            }
            Command::DisableFlag { flag, reply } => {
                let _ = reply.send(self.apply_flags(|current| current & !flag));
            }
            Command::NotifyPlugin {
                plugin_id,
                label,
                args,
                reply,
            } => {
                let result = if self.plugins.contains(&plugin_id) {
                    self.plugins.notify_one(&plugin_id, &mut self.pool, |p, cx| {
                        p.on_self_event(cx, &label, &args)
                    });
                    Ok(())
                } else {
                    Err(BitfinexError::UnknownPlugin(plugin_id))
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
                return true;
            }
        }

        false
    }

    fn on_internal_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::RenewToken => self.renew_token(),
            InternalEvent::TokenRenewed(Ok(token)) => {
                tracing::info!(expires_at = ?token.expires_at, "auth token renewed");
                self.auth.set_token(token.token.clone());
                for connection in self.pool.values_mut() {
                    connection.state.auth.set_token(token.token.clone());
                }
                self.emit(PoolEvent::AuthTokenRenewed {
                    expires_at: token.expires_at,
                });
                self.schedule_renewal(token.expires_at);
            }
            InternalEvent::TokenRenewed(Err(e)) => {
                tracing::error!(error = %e, "auth token renewal failed");
            }
        }
    }

    /// Append a new connection record and start its transport.
    pub(super) fn open_connection(&mut self) -> ConnectionId {
        self.next_connection_id += 1;
        let id = ConnectionId(self.next_connection_id);

        let mut state = ConnectionState::new(
            id,
            &self.config.ws_url,
            self.auth.clone(),
            self.config.transform,
        );
        state.plugin_state = self.plugins.initial_states();

        let generation = self.next_generation();
        let link = TransportLink::connect(
            &self.config.ws_url,
            id,
            generation,
            self.transport_tx.clone(),
        );

        tracing::info!(%id, url = %self.config.ws_url, "opening connection");
        self.pool.insert(id, Connection::new(state, link));

        let queued = self.plugins.notify(&mut self.pool, |p, cx| {
            if cx.state.id == id {
                p.on_connection_created(cx, id)
            } else {
                crate::plugin::PluginUpdate::none()
            }
        });
        self.dispatch_self_events(queued);

        id
    }

    /// Close a connection and drop its record.
    pub(super) fn close_connection(&mut self, id: ConnectionId) -> Result<(), BitfinexError> {
        if !self.pool.contains_key(&id) {
            return Err(BitfinexError::UnknownConnection(id.0));
        }

        tracing::info!(%id, "closing connection");
        let queued = self.plugins.notify(&mut self.pool, |p, cx| {
            if cx.state.id == id {
                p.on_connection_destroyed(cx, id)
            } else {
                crate::plugin::PluginUpdate::none()
            }
        });
        self.dispatch_self_events(queued);

        if let Some(mut connection) = self.pool.remove(&id) {
            connection.close();
        }
        self.emit(PoolEvent::ConnectionClosed { id });
        Ok(())
    }

    fn close_all(&mut self) {
        let ids: Vec<_> = self.pool.keys().copied().collect();
        for id in ids {
            let _ = self.close_connection(id);
        }
    }

    /// Replace a connection's transport in place, keeping its id and
    /// channel table for resubscription.
    pub(super) fn reopen_connection(&mut self, id: ConnectionId) {
        let generation = self.next_generation();
        let Some(connection) = self.pool.get_mut(&id) else {
            return;
        };

        tracing::info!(%id, generation, "reopening connection");
        connection.link.close();
        connection.link = TransportLink::connect(
            &self.config.ws_url,
            id,
            generation,
            self.transport_tx.clone(),
        );
        connection.reopen_pending = true;

        // The auth channel is renegotiated on the new socket; pending lists
        // and buffered commands belong to the old one.
        connection.state.is_open = false;
        connection.state.authenticated = false;
        connection.state.channels.remove(&0);
        connection.state.pending_subscriptions.clear();
        connection.state.pending_unsubscriptions.clear();
        connection.state.send_buffer.clear();
        connection.state.managed_close = false;
    }

    /// Subscribe on the first connection with free data-channel capacity,
    /// opening a new one when the pool is saturated.
    ///
    /// A subscribe issued against a socket that has not finished opening is
    /// buffered and flushed on the open transition.
    fn subscribe(&mut self, kind: ChannelKind, filter: Value) -> Result<(), BitfinexError> {
        let target = self
            .pool
            .values()
            .find(|c| c.state.data_channel_count() < self.config.channels_per_socket)
            .map(|c| c.state.id);

        let id = match target {
            Some(id) => id,
            None => {
                let id = self.open_connection();
                tracing::debug!(%id, %kind, "pool saturated, subscribing on a new connection");
                id
            }
        };

        let connection = self
            .pool
            .get_mut(&id)
            .ok_or(BitfinexError::UnknownConnection(id.0))?;
        connection.subscribe(kind, filter)
    }

    /// Unsubscribe every matching data channel on the first connection
    /// carrying one.
    fn unsubscribe_where(
        &mut self,
        predicate: &super::ChannelPredicate,
    ) -> Result<bool, BitfinexError> {
        for connection in self.pool.values_mut() {
            let matching: Vec<u64> = connection
                .state
                .channels
                .iter()
                .filter(|(_, channel)| channel.kind().is_data() && predicate(channel))
                .map(|(chan_id, _)| *chan_id)
                .collect();

            if !matching.is_empty() {
                for chan_id in matching {
                    connection.unsubscribe(chan_id)?;
                }
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Merge auth arguments and fire the auth handshake across the pool.
    fn auth_pool(&mut self, args: Option<AuthArgs>, force: bool) -> Result<(), BitfinexError> {
        if let Some(args) = args {
            self.auth.merge(args);
        }
        if !self.auth.has_credentials() {
            return Err(BitfinexError::MissingCredentials);
        }

        for connection in self.pool.values_mut() {
            if !force && connection.state.authenticated {
                continue;
            }
            connection.state.auth = self.auth.clone();
            connection.state.authenticated = false;
            let nonce = self.nonce.take();
            if let Err(e) = connection.authenticate(nonce) {
                tracing::warn!(id = %connection.state.id, error = %e, "auth send failed");
            }
        }

        Ok(())
    }

    /// Authenticate one connection, resolving `reply` on the handshake
    /// outcome.
    fn authenticate_connection(
        &mut self,
        id: ConnectionId,
        reply: oneshot::Sender<Result<Value, BitfinexError>>,
    ) {
        let Some(connection) = self.pool.get_mut(&id) else {
            let _ = reply.send(Err(BitfinexError::UnknownConnection(id.0)));
            return;
        };

        if self.auth.has_credentials() {
            connection.state.auth = self.auth.clone();
        }
        let nonce = self.nonce.take();
        if let Err(e) = connection.authenticate(nonce) {
            let _ = reply.send(Err(e));
            return;
        }

        self.correlations.insert(
            id,
            CorrelationKey::Auth,
            reply,
            Instant::now() + self.config.request_timeout,
        );
    }

    /// Send a correlated order command on an authenticated connection.
    fn issue_order(
        &mut self,
        envelope: Value,
        key: CorrelationKey,
        reply: oneshot::Sender<Result<Value, BitfinexError>>,
    ) {
        let target = self
            .pool
            .values()
            .find(|c| c.state.authenticated)
            .map(|c| c.state.id);

        let Some(id) = target else {
            let _ = reply.send(Err(BitfinexError::Auth(
                "no authenticated connection in pool".to_string(),
            )));
            return;
        };

        let Some(connection) = self.pool.get_mut(&id) else {
            let _ = reply.send(Err(BitfinexError::UnknownConnection(id.0)));
            return;
        };

        if let Err(e) = connection.send(&envelope) {
            let _ = reply.send(Err(e));
            return;
        }

        self.correlations.insert(
            id,
            key,
            reply,
            Instant::now() + self.config.request_timeout,
        );
    }

    /// Send a tagged ping on a random pool member.
    fn ping(&mut self, reply: oneshot::Sender<Result<Value, BitfinexError>>) {
        let ids: Vec<_> = self.pool.keys().copied().collect();
        if ids.is_empty() {
            let _ = reply.send(Err(BitfinexError::ConnectionClosed {
                reason: "no connections in pool".to_string(),
            }));
            return;
        }

        use rand::Rng;
        let id = ids[rand::thread_rng().gen_range(0..ids.len())];
        let cid = self.nonce.take();

        let Some(connection) = self.pool.get_mut(&id) else {
            let _ = reply.send(Err(BitfinexError::UnknownConnection(id.0)));
            return;
        };
        if let Err(e) = connection.send(&json!({"event": "ping", "cid": cid})) {
            let _ = reply.send(Err(e));
            return;
        }

        self.correlations.insert(
            id,
            CorrelationKey::Ping(cid),
            reply,
            Instant::now() + PING_TIMEOUT,
        );
    }

    /// Apply a flag transformation pool-wide.
    ///
    /// The first connection is the nominal target and emits `FlagsSet`;
    /// every other member mirrors the configuration silently, keeping flags
    /// uniform across the pool.
    fn apply_flags(&mut self, compute: impl Fn(u32) -> u32) -> Result<(), BitfinexError> {
        let mut result = Ok(());
        let mut emitted: Option<PoolEvent> = None;

        for connection in self.pool.values_mut() {
            let flags = compute(connection.state.flags);
            if let Err(e) = connection.set_flags(flags) {
                tracing::warn!(id = %connection.state.id, error = %e, "conf send failed");
                if result.is_ok() {
                    result = Err(e);
                }
                continue;
            }
            if emitted.is_none() {
                emitted = Some(PoolEvent::FlagsSet {
                    id: connection.state.id,
                    flags,
                });
            }
        }

        if let Some(event) = emitted {
            self.emit(event);
        }
        result
    }

    /// Kick off an asynchronous token renewal.
    fn renew_token(&mut self) {
        let (Some(user_id), Some(token)) = (
            self.config.user_id.clone(),
            self.auth.token().map(str::to_string),
        ) else {
            tracing::debug!("token renewal skipped: no user id or token");
            return;
        };

        let client = self.http.clone();
        let auth_url = self.config.auth_url.clone();
        let internal = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = renew_auth_token(&client, &auth_url, &user_id, &token).await;
            let _ = internal.send(InternalEvent::TokenRenewed(result));
        });
    }

    /// (Re)schedule the renewal timer to fire one lead interval before the
    /// token expires; without an expiry it fires immediately.
    fn schedule_renewal(&mut self, expires_at: Option<i64>) {
        if self.config.user_id.is_none() || self.auth.token().is_none() {
            return;
        }
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }

        let delay = expires_at
            .map(|at| {
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                let lead = TOKEN_RENEWAL_LEAD.as_secs() as i64;
                Duration::from_secs((at - now - lead).max(0) as u64)
            })
            .unwrap_or(Duration::ZERO);

        tracing::debug!(?delay, "scheduling auth token renewal");
        let internal = self.internal_tx.clone();
        self.renewal = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(InternalEvent::RenewToken);
        }));
    }

    pub(super) fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub(super) fn emit(&self, event: PoolEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub(super) fn dispatch_self_events(&mut self, queued: Vec<crate::plugin::QueuedSelfEvent>) {
        for event in queued {
            self.plugins
                .notify_one(&event.plugin_id, &mut self.pool, |p, cx| {
                    p.on_self_event(cx, &event.label, &event.args)
                });
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("pool shutting down");
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
        self.close_all();
    }
}
