//! Channel-data frame decoding.

use serde_json::Value;

use super::{DispatchOutput, frame_payload, normalize_rows};
use crate::channel::ChannelKind;
use crate::manager::PoolEvent;
use crate::state::ConnectionState;

/// A decoded data-channel message.
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// Channel type the data arrived on.
    pub kind: ChannelKind,
    /// Payload exactly as it appeared in the frame.
    pub original: Value,
    /// Row-normalized payload (single updates wrapped into one row).
    pub requested: Value,
    /// Filter fields of the channel the data arrived on.
    pub chan_filter: Value,
}

/// Handle an array frame: look up the channel, decode by its type.
pub(super) fn on_channel_frame(state: &mut ConnectionState, frame: &Value, out: &mut DispatchOutput) {
    let Some(elements) = frame.as_array() else {
        return;
    };
    let Some(chan_id) = elements.first().and_then(Value::as_u64) else {
        tracing::debug!(id = %state.id, "channel frame without numeric id: {frame}");
        return;
    };

    let Some(channel) = state.channels.get(&chan_id) else {
        // Not attributable; can happen for frames racing an unsubscribe.
        tracing::warn!(id = %state.id, chan_id, "frame from unknown channel, dropping");
        return;
    };

    let kind = channel.kind();
    let chan_filter = channel.chan_filter();
    let tag = elements.get(1).and_then(Value::as_str);

    match kind {
        ChannelKind::Auth => on_auth_frame(state.id, elements, tag, out),
        ChannelKind::Book if tag == Some("cs") => {
            // Checksum sub-frame; forwarded without touching channel state.
            let checksum = elements.get(2).cloned().unwrap_or(Value::Null);
            out.push(PoolEvent::BookChecksum {
                id: state.id,
                checksum,
                chan_filter,
            });
        }
        _ => {
            let Some(payload) = frame_payload(&elements[1..]) else {
                // Heartbeat or empty frame.
                return;
            };

            out.push(PoolEvent::Data {
                id: state.id,
                event: DataEvent {
                    kind,
                    original: payload.clone(),
                    requested: normalize_rows(payload),
                    chan_filter,
                },
            });
        }
    }
}

/// Handle a frame on the authenticated channel (id 0).
///
/// The second element is a type tag: `"n"` marks a notification (order
/// confirmations feed the request correlator off these), `"hb"` a heartbeat,
/// and everything else an account data message re-emitted under its tag.
fn on_auth_frame(
    id: crate::state::ConnectionId,
    elements: &[Value],
    tag: Option<&str>,
    out: &mut DispatchOutput,
) {
    let Some(tag) = tag else {
        tracing::debug!(%id, "auth frame without type tag");
        return;
    };

    match tag {
        "hb" => {}
        "n" => {
            let Some(payload) = frame_payload(&elements[1..]) else {
                return;
            };
            out.push(PoolEvent::Notification {
                id,
                payload: payload.clone(),
            });
        }
        _ => {
            let payload = frame_payload(&elements[1..])
                .cloned()
                .unwrap_or(Value::Null);
            out.push(PoolEvent::AuthData {
                id,
                tag: tag.to_string(),
                payload,
            });
        }
    }
}
