//! Protocol-event frame handling and the state transitions they cause.

use serde_json::Value;

use super::DispatchOutput;
use crate::channel::ChannelDescriptor;
use crate::config::{PROTOCOL_VERSION, info_codes};
use crate::error::ApiError;
use crate::manager::PoolEvent;
use crate::state::ConnectionState;

/// Dispatch an object frame by its `event` field.
pub(super) fn on_event_frame(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    let Some(name) = frame.get("event").and_then(Value::as_str) else {
        return;
    };

    match name {
        "auth" => on_auth(state, frame, out),
        "subscribed" | "subscribe" => on_subscribed(state, frame, out),
        "unsubscribed" | "unsubscribe" => on_unsubscribed(state, frame, out),
        "conf" => on_conf(state, frame, out),
        "info" => on_info(state, frame, out),
        "error" => on_error(state, frame, out),
        "pong" => on_pong(state, frame, out),
        _ => {
            tracing::warn!(id = %state.id, event = name, "unknown protocol event, ignoring");
        }
    }
}

fn status_ok(frame: &Value) -> bool {
    frame.get("status").and_then(Value::as_str) == Some("OK")
}

/// Auth handshake result.
///
/// Success marks the connection authenticated and installs the channel-0
/// descriptor for the private stream. Failure leaves the state untouched;
/// the caller decides whether to retry.
fn on_auth(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    if status_ok(frame) {
        let chan_id = frame.get("chanId").and_then(Value::as_u64).unwrap_or(0);
        state.mark_authenticated(chan_id);
        tracing::debug!(id = %state.id, "authenticated");

        out.push(PoolEvent::AuthSuccess {
            id: state.id,
            event: frame.clone(),
        });
    } else {
        let error = ApiError::from_event(frame);
        tracing::warn!(id = %state.id, %error, "auth failed");

        out.push(PoolEvent::AuthError {
            id: state.id,
            error: error.clone(),
        });
        out.push(PoolEvent::ProtocolError {
            id: state.id,
            error,
        });
    }
}

fn on_subscribed(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    let Some((chan_id, descriptor)) = ChannelDescriptor::from_subscribed_event(frame) else {
        tracing::warn!(id = %state.id, "malformed subscription confirmation: {frame}");
        return;
    };

    tracing::debug!(id = %state.id, chan_id, kind = %descriptor.kind(), "subscribed");
    state.confirm_subscription(chan_id, descriptor.clone());

    out.push(PoolEvent::Subscribed {
        id: state.id,
        chan_id,
        channel: descriptor,
    });
}

fn on_unsubscribed(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    let Some(chan_id) = frame.get("chanId").and_then(Value::as_u64) else {
        tracing::warn!(id = %state.id, "unsubscribe confirmation without chanId: {frame}");
        return;
    };

    if state.confirm_unsubscription(chan_id).is_none() {
        tracing::debug!(id = %state.id, chan_id, "unsubscribed from unknown channel");
        return;
    }

    out.push(PoolEvent::Unsubscribed {
        id: state.id,
        chan_id,
    });
}

/// Flag acknowledgement: the acknowledged bitmask replaces the local one on
/// success; on failure the flags are left unchanged.
fn on_conf(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    if status_ok(frame) {
        if let Some(flags) = frame.get("flags").and_then(Value::as_u64) {
            state.flags = flags as u32;
        }
        out.push(PoolEvent::FlagsUpdated {
            id: state.id,
            flags: state.flags,
        });
    } else {
        let error = ApiError::from_event(frame);
        tracing::warn!(id = %state.id, %error, "conf rejected");
        out.push(PoolEvent::ConfigError {
            id: state.id,
            error,
        });
    }
}

/// Server info: version validation plus named status-code events.
///
/// A protocol version other than 2 is the one fatal frame; the transport is
/// closed and the connection torn down.
fn on_info(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    out.push(PoolEvent::Info {
        id: state.id,
        event: frame.clone(),
    });

    if let Some(version) = frame.get("version").and_then(Value::as_u64) {
        if version != PROTOCOL_VERSION {
            tracing::error!(id = %state.id, version, "server not running API v2, closing");
            out.push(PoolEvent::ProtocolError {
                id: state.id,
                error: ApiError::new(None, format!("server not running API v2: v{version}")),
            });
            out.close_transport = true;
            return;
        }
    }

    match frame.get("code").and_then(Value::as_i64) {
        Some(info_codes::SERVER_RESTART) => out.push(PoolEvent::ServerRestart { id: state.id }),
        Some(info_codes::MAINTENANCE_START) => {
            out.push(PoolEvent::MaintenanceStart { id: state.id });
        }
        Some(info_codes::MAINTENANCE_END) => out.push(PoolEvent::MaintenanceEnd { id: state.id }),
        _ => {}
    }
}

fn on_error(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    let error = ApiError::from_event(frame);
    tracing::warn!(id = %state.id, %error, "server error event");
    out.push(PoolEvent::ProtocolError {
        id: state.id,
        error,
    });
}

fn on_pong(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    out.push(PoolEvent::Pong {
        id: state.id,
        cid: frame.get("cid").and_then(Value::as_u64),
        event: frame.clone(),
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::on_frame;
    use super::super::tests::test_state;
    use super::*;
    use crate::channel::ChannelKind;

    #[test]
    fn test_auth_success_installs_channel_zero() {
        let mut state = test_state();
        let out = on_frame(
            &mut state,
            r#"{"event":"auth","status":"OK","chanId":0,"userId":9}"#,
        );

        assert!(state.authenticated);
        assert_eq!(state.channels.get(&0).unwrap().kind(), ChannelKind::Auth);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, PoolEvent::AuthSuccess { .. })));
    }

    #[test]
    fn test_auth_failure_leaves_state_unchanged() {
        let mut state = test_state();
        let out = on_frame(
            &mut state,
            r#"{"event":"auth","status":"FAILED","code":10100,"msg":"apikey: invalid"}"#,
        );

        assert!(!state.authenticated);
        assert!(state.channels.is_empty());
        assert!(out.events.iter().any(|e| matches!(
            e,
            PoolEvent::AuthError { error, .. } if error.code == Some(10100)
        )));
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, PoolEvent::ProtocolError { .. })));
    }

    #[test]
    fn test_subscribed_reconciles_pending_entry() {
        let mut state = test_state();
        state.pending_subscriptions.push(
            crate::channel::SubscriptionRequest::new(
                ChannelKind::Trades,
                json!({"symbol": "tBTCUSD"}),
            ),
        );

        let out = on_frame(
            &mut state,
            r#"{"event":"subscribed","channel":"trades","chanId":5,"symbol":"tBTCUSD","pair":"BTCUSD"}"#,
        );

        assert!(state.pending_subscriptions.is_empty());
        assert_eq!(
            state.channels.get(&5).unwrap().symbol(),
            Some("tBTCUSD")
        );
        assert!(out.events.iter().any(|e| matches!(
            e,
            PoolEvent::Subscribed { chan_id: 5, .. }
        )));
    }

    #[test]
    fn test_unsubscribed_removes_channel() {
        let mut state = test_state();
        let confirmation = json!({
            "event": "subscribed", "channel": "ticker", "chanId": 3, "symbol": "tBTCUSD",
        });
        let (chan_id, desc) = ChannelDescriptor::from_subscribed_event(&confirmation).unwrap();
        state.confirm_subscription(chan_id, desc);
        state.pending_unsubscriptions.push(3);

        let out = on_frame(&mut state, r#"{"event":"unsubscribed","status":"OK","chanId":3}"#);

        assert!(state.channels.is_empty());
        assert!(state.pending_unsubscriptions.is_empty());
        assert!(out.events.iter().any(|e| matches!(
            e,
            PoolEvent::Unsubscribed { chan_id: 3, .. }
        )));
    }

    #[test]
    fn test_conf_success_sets_flags() {
        let mut state = test_state();
        let out = on_frame(&mut state, r#"{"event":"conf","status":"OK","flags":131072}"#);

        assert_eq!(state.flags, 131072);
        assert!(out.events.iter().any(|e| matches!(
            e,
            PoolEvent::FlagsUpdated { flags: 131072, .. }
        )));
    }

    #[test]
    fn test_conf_failure_keeps_flags() {
        let mut state = test_state();
        state.flags = 8;

        let out = on_frame(&mut state, r#"{"event":"conf","status":"FAILED","flags":131072}"#);

        assert_eq!(state.flags, 8);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, PoolEvent::ConfigError { .. })));
    }

    #[test]
    fn test_info_version_mismatch_is_fatal() {
        let mut state = test_state();
        let out = on_frame(&mut state, r#"{"event":"info","version":3}"#);

        assert!(out.close_transport);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, PoolEvent::ProtocolError { .. })));
    }

    #[test]
    fn test_info_version_match_passes() {
        let mut state = test_state();
        let out = on_frame(
            &mut state,
            r#"{"event":"info","version":2,"platform":{"status":1}}"#,
        );

        assert!(!out.close_transport);
        assert!(out.events.iter().any(|e| matches!(e, PoolEvent::Info { .. })));
    }

    #[test]
    fn test_info_codes_emit_named_events() {
        let mut state = test_state();

        let out = on_frame(&mut state, r#"{"event":"info","code":20051,"msg":"restarting"}"#);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, PoolEvent::ServerRestart { .. })));

        let out = on_frame(&mut state, r#"{"event":"info","code":20060}"#);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, PoolEvent::MaintenanceStart { .. })));

        let out = on_frame(&mut state, r#"{"event":"info","code":20061}"#);
        assert!(out
            .events
            .iter()
            .any(|e| matches!(e, PoolEvent::MaintenanceEnd { .. })));
    }

    #[test]
    fn test_error_event_re_emitted() {
        let mut state = test_state();
        let out = on_frame(
            &mut state,
            r#"{"event":"error","msg":"subscribe: dup","code":10301}"#,
        );

        assert!(out.events.iter().any(|e| matches!(
            e,
            PoolEvent::ProtocolError { error, .. } if error.code == Some(10301)
        )));
    }

    #[test]
    fn test_pong_carries_correlation_id() {
        let mut state = test_state();
        let out = on_frame(&mut state, r#"{"event":"pong","cid":1234,"ts":1575282446000}"#);

        assert!(out.events.iter().any(|e| matches!(
            e,
            PoolEvent::Pong { cid: Some(1234), .. }
        )));
    }

    #[test]
    fn test_unknown_event_ignored() {
        let mut state = test_state();
        let out = on_frame(&mut state, r#"{"event":"mystery","value":1}"#);
        // Only the generic message event; no state change.
        assert_eq!(out.events.len(), 1);
        assert!(!out.close_transport);
    }
}
