//! Inbound frame dispatch.
//!
//! Decides protocol-event vs. channel-data for every raw frame, applies the
//! resulting state transitions to the connection record, and returns the
//! normalized pool events to publish. Malformed frames are logged and
//! dropped; they are never fatal to the connection.

mod data;
mod events;

pub use data::DataEvent;

use serde_json::Value;

use crate::manager::PoolEvent;
use crate::state::ConnectionState;

/// Everything a single inbound frame produced.
#[derive(Debug, Default)]
pub struct DispatchOutput {
    /// Pool events to publish, in emission order.
    pub events: Vec<PoolEvent>,
    /// Set when the frame is fatal to the connection (protocol version
    /// mismatch) and the transport must be closed.
    pub close_transport: bool,
}

impl DispatchOutput {
    fn push(&mut self, event: PoolEvent) {
        self.events.push(event);
    }
}

/// Dispatch one raw inbound frame against the connection's state.
pub fn on_frame(state: &mut ConnectionState, raw: &str) -> DispatchOutput {
    let mut out = DispatchOutput::default();

    let frame: Value = match serde_json::from_str(raw) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(id = %state.id, error = %e, "invalid frame JSON, dropping");
            out.push(PoolEvent::ConnectionError {
                id: state.id,
                message: format!("invalid frame JSON: {e}"),
            });
            return out;
        }
    };

    out.push(PoolEvent::Message {
        id: state.id,
        frame: frame.clone(),
    });

    match &frame {
        Value::Array(_) => data::on_channel_frame(state, &frame, &mut out),
        Value::Object(fields) if fields.contains_key("event") => {
            events::on_event_frame(state, &frame, &mut out);
        }
        _ => {
            tracing::debug!(id = %state.id, "unidentified frame: {frame}");
        }
    }

    out
}

/// Locate the payload within a channel frame.
///
/// The payload is the first array or object element; scanning instead of
/// indexing skips the channel id and any sequence numbers appended by the
/// `SEQ_ALL` flag.
pub(crate) fn frame_payload(frame: &[Value]) -> Option<&Value> {
    frame.iter().find(|v| v.is_array() || v.is_object())
}

/// Wrap a flat single-row payload into an array of rows.
///
/// Snapshot payloads arrive as arrays of rows; update payloads as one flat
/// row. Listeners always see rows.
pub(crate) fn normalize_rows(payload: &Value) -> Value {
    match payload.as_array() {
        Some(rows) if rows.first().is_some_and(Value::is_array) => payload.clone(),
        Some(_) => Value::Array(vec![payload.clone()]),
        None => payload.clone(),
    }
}
