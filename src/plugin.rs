//! Plugins: optional handler bundles invoked at defined pool lifecycle and
//! data points.
//!
//! A plugin implements [`Plugin`] and overrides only the hooks it cares
//! about; every hook has a no-op default. Hooks receive a read-only view of
//! one connection plus the plugin's per-connection state, and return a
//! [`PluginUpdate`] naming what to write back. Plugin state is namespaced
//! per connection under the plugin's id.

use std::collections::HashMap;

use serde_json::Value;

use crate::channel::ChannelKind;
use crate::dispatch::DataEvent;
use crate::state::{Connection, ConnectionId, ConnectionState};

/// Connection kind tag handled by WebSocket v2 plugins.
pub const PLUGIN_KIND_WS2: &str = "ws2";

/// Read-only view handed to every plugin hook.
#[derive(Debug, Clone, Copy)]
pub struct PluginCtx<'a> {
    /// The connection being visited.
    pub state: &'a ConnectionState,
    /// This plugin's state on that connection.
    pub plugin_state: &'a Value,
}

/// What a hook wants written back, plus follow-up self events.
///
/// Both write-back fields are optional; the default is "change nothing".
#[derive(Debug, Default)]
pub struct PluginUpdate {
    /// Replacement connection state.
    pub connection: Option<ConnectionState>,
    /// Replacement plugin state for the visited connection.
    pub plugin_state: Option<Value>,
    /// Self events to dispatch back to this plugin after the write-back.
    pub self_events: Vec<(String, Value)>,
}

impl PluginUpdate {
    /// An update that changes nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// An update that only replaces the plugin state.
    pub fn plugin_state(state: Value) -> Self {
        Self {
            plugin_state: Some(state),
            ..Self::default()
        }
    }
}

/// An external handler bundle attached to a pool.
///
/// Every hook defaults to a no-op; implement only the sections needed.
#[allow(unused_variables)]
pub trait Plugin: Send {
    /// Unique plugin id; also the namespace of its per-connection state.
    fn id(&self) -> &str;

    /// Connection kind this plugin handles.
    fn kind(&self) -> &str {
        PLUGIN_KIND_WS2
    }

    /// Initial per-connection state, installed at connection creation.
    fn initial_state(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// A connection was created. `id` names the new connection.
    fn on_connection_created(&self, cx: PluginCtx<'_>, id: ConnectionId) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// A connection is about to be destroyed.
    fn on_connection_destroyed(&self, cx: PluginCtx<'_>, id: ConnectionId) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// A transport reported open.
    fn on_open(&self, cx: PluginCtx<'_>, id: ConnectionId) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// A raw inbound frame was parsed.
    fn on_message(&self, cx: PluginCtx<'_>, id: ConnectionId, frame: &Value) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// A transport reported an error.
    fn on_socket_error(&self, cx: PluginCtx<'_>, id: ConnectionId, message: &str) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// A transport closed.
    fn on_close(&self, cx: PluginCtx<'_>, id: ConnectionId) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// A protocol event was processed, named as on the wire.
    fn on_protocol_event(
        &self,
        cx: PluginCtx<'_>,
        id: ConnectionId,
        name: &str,
        event: &Value,
    ) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// Data arrived on a public channel.
    fn on_data(
        &self,
        cx: PluginCtx<'_>,
        id: ConnectionId,
        kind: ChannelKind,
        event: &DataEvent,
    ) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// Data arrived on the authenticated channel, keyed by its type tag.
    fn on_auth_data(
        &self,
        cx: PluginCtx<'_>,
        id: ConnectionId,
        tag: &str,
        payload: &Value,
    ) -> PluginUpdate {
        PluginUpdate::none()
    }

    /// A self event raised by one of this plugin's own hooks.
    fn on_self_event(&self, cx: PluginCtx<'_>, label: &str, args: &Value) -> PluginUpdate {
        PluginUpdate::none()
    }
}

/// A self event queued for dispatch after a notification round.
#[derive(Debug)]
pub struct QueuedSelfEvent {
    /// Target plugin id.
    pub plugin_id: String,
    /// Event label.
    pub label: String,
    /// Event arguments.
    pub args: Value,
}

/// The registered plugins of one pool.
pub struct PluginHost {
    plugins: Vec<Box<dyn Plugin>>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugins", &self.plugins.iter().map(|p| p.id()).collect::<Vec<_>>())
            .finish()
    }
}

impl PluginHost {
    /// Create a host over the given plugins.
    pub fn new(plugins: Vec<Box<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    /// Whether a plugin with this id is registered.
    pub fn contains(&self, plugin_id: &str) -> bool {
        self.plugins.iter().any(|p| p.id() == plugin_id)
    }

    /// Initial plugin-state map for a new connection.
    pub fn initial_states(&self) -> HashMap<String, Value> {
        self.plugins
            .iter()
            .filter(|p| p.kind() == PLUGIN_KIND_WS2)
            .map(|p| (p.id().to_string(), p.initial_state()))
            .collect()
    }

    /// Invoke one hook on every registered plugin, once per connection.
    ///
    /// Write-backs are applied immediately; self events raised by hooks are
    /// collected and returned for the caller to dispatch afterwards.
    pub fn notify<F>(
        &self,
        pool: &mut std::collections::BTreeMap<ConnectionId, Connection>,
        hook: F,
    ) -> Vec<QueuedSelfEvent>
    where
        F: Fn(&dyn Plugin, PluginCtx<'_>) -> PluginUpdate,
    {
        let mut queued = Vec::new();

        for plugin in self.plugins.iter().filter(|p| p.kind() == PLUGIN_KIND_WS2) {
            for connection in pool.values_mut() {
                let empty = Value::Null;
                let plugin_state = connection
                    .state
                    .plugin_state
                    .get(plugin.id())
                    .unwrap_or(&empty);

                let update = hook(
                    plugin.as_ref(),
                    PluginCtx {
                        state: &connection.state,
                        plugin_state,
                    },
                );

                apply_update(connection, plugin.id(), update, &mut queued);
            }
        }

        queued
    }

    /// Invoke one hook on a single plugin by id, once per connection.
    ///
    /// Returns `false` when no plugin with that id is registered.
    pub fn notify_one<F>(
        &self,
        plugin_id: &str,
        pool: &mut std::collections::BTreeMap<ConnectionId, Connection>,
        hook: F,
    ) -> bool
    where
        F: Fn(&dyn Plugin, PluginCtx<'_>) -> PluginUpdate,
    {
        let Some(plugin) = self.plugins.iter().find(|p| p.id() == plugin_id) else {
            return false;
        };

        let mut queued = Vec::new();
        for connection in pool.values_mut() {
            let empty = Value::Null;
            let plugin_state = connection
                .state
                .plugin_state
                .get(plugin.id())
                .unwrap_or(&empty);

            let update = hook(
                plugin.as_ref(),
                PluginCtx {
                    state: &connection.state,
                    plugin_state,
                },
            );

            apply_update(connection, plugin.id(), update, &mut queued);
        }

        // Self events from self events would recurse without bound; one
        // level deep matches how plugins use them.
        for event in queued {
            for connection in pool.values_mut() {
                let empty = Value::Null;
                let plugin_state = connection
                    .state
                    .plugin_state
                    .get(plugin.id())
                    .unwrap_or(&empty);
                let update = plugin.on_self_event(
                    PluginCtx {
                        state: &connection.state,
                        plugin_state,
                    },
                    &event.label,
                    &event.args,
                );
                let mut ignored = Vec::new();
                apply_update(connection, plugin.id(), update, &mut ignored);
            }
        }

        true
    }
}

fn apply_update(
    connection: &mut Connection,
    plugin_id: &str,
    update: PluginUpdate,
    queued: &mut Vec<QueuedSelfEvent>,
) {
    if let Some(next) = update.connection {
        connection.state = next;
    }
    if let Some(state) = update.plugin_state {
        connection
            .state
            .plugin_state
            .insert(plugin_id.to_string(), state);
    }
    for (label, args) in update.self_events {
        queued.push(QueuedSelfEvent {
            plugin_id: plugin_id.to_string(),
            label,
            args,
        });
    }
}
