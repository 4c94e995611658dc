//! Request/response correlation for trading commands, auth and ping.
//!
//! Every command that expects an asynchronous confirmation registers a
//! pending entry keyed by `(connection, correlation key)`. Confirmations
//! resolve the entry exactly once; a periodic sweep rejects entries past
//! their deadline with a timeout. Entries are removed on every exit path,
//! so nothing leaks regardless of how a request ends.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::BitfinexError;
use crate::state::ConnectionId;

/// Key tying a server confirmation back to the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// The auth handshake (one per connection at a time).
    Auth,
    /// New order, keyed by client order id.
    NewOrder(u64),
    /// Order update, keyed by server-assigned order id.
    UpdateOrder(u64),
    /// Order cancel, keyed by server-assigned order id.
    CancelOrder(u64),
    /// Group cancel, keyed by group id.
    CancelGroup(u64),
    /// Ping, keyed by client-chosen cid.
    Ping(u64),
}

/// A registered request awaiting its confirmation.
#[derive(Debug)]
pub struct PendingRequest {
    sender: oneshot::Sender<Result<Value, BitfinexError>>,
    deadline: Instant,
}

/// The correlation table for one pool.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<(ConnectionId, CorrelationKey), PendingRequest>,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request. A duplicate key replaces the previous
    /// entry, rejecting it immediately.
    pub fn insert(
        &mut self,
        connection: ConnectionId,
        key: CorrelationKey,
        sender: oneshot::Sender<Result<Value, BitfinexError>>,
        deadline: Instant,
    ) {
        if let Some(previous) = self
            .entries
            .insert((connection, key), PendingRequest { sender, deadline })
        {
            let _ = previous.sender.send(Err(BitfinexError::Timeout));
        }
    }

    /// Resolve a pending request, removing it. Returns `false` when no
    /// matching entry exists (late or unsolicited confirmation).
    pub fn resolve(
        &mut self,
        connection: ConnectionId,
        key: CorrelationKey,
        result: Result<Value, BitfinexError>,
    ) -> bool {
        match self.entries.remove(&(connection, key)) {
            Some(pending) => {
                let _ = pending.sender.send(result);
                true
            }
            None => false,
        }
    }

    /// Reject every entry whose deadline has passed.
    pub fn sweep(&mut self, now: Instant) {
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in expired {
            tracing::debug!(connection = %key.0, "request timed out: {:?}", key.1);
            if let Some(pending) = self.entries.remove(&key) {
                let _ = pending.sender.send(Err(BitfinexError::Timeout));
            }
        }
    }

    /// Number of requests currently in flight.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no requests are in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome extracted from a notification's inner payload.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationOutcome {
    /// The correlation key the notification targets.
    pub key: CorrelationKey,
    /// Whether the request succeeded.
    pub success: bool,
    /// The notification's inner payload (resolution value on success).
    pub payload: Value,
    /// Notification status string, e.g. `SUCCESS` or `ERROR`.
    pub status: String,
    /// Human-readable server message.
    pub message: String,
}

/// Extract the correlation outcome from a notification payload.
///
/// Notifications arrive as `[ts, reqType, id, null, innerPayload, null,
/// status, message]`. The position of the correlation id inside
/// `innerPayload` is fixed per request type: new-order confirmations carry
/// the client order id at position 2, update/cancel confirmations the order
/// id at position 0, and group cancels the group id at position 1 of the
/// first row. Returns `None` for notification types that do not correlate
/// with a command.
pub fn from_notification(notification: &Value) -> Option<NotificationOutcome> {
    let fields = notification.as_array()?;
    let req_type = fields.get(1)?.as_str()?;
    let payload = fields.get(4)?;
    let status = fields
        .get(6)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let message = fields
        .get(7)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let key = match req_type {
        "on-req" => CorrelationKey::NewOrder(payload.get(2)?.as_u64()?),
        "ou-req" => CorrelationKey::UpdateOrder(payload.get(0)?.as_u64()?),
        "oc-req" => CorrelationKey::CancelOrder(payload.get(0)?.as_u64()?),
        "oc_multi-req" => CorrelationKey::CancelGroup(payload.get(0)?.get(1)?.as_u64()?),
        _ => return None,
    };

    Some(NotificationOutcome {
        key,
        success: status == "SUCCESS",
        payload: payload.clone(),
        status,
        message,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn pending() -> (
        oneshot::Sender<Result<Value, BitfinexError>>,
        oneshot::Receiver<Result<Value, BitfinexError>>,
    ) {
        oneshot::channel()
    }

    #[tokio::test]
    async fn test_resolve_exactly_once() {
        let mut table = CorrelationTable::new();
        let (tx, rx) = pending();

        table.insert(
            ConnectionId(1),
            CorrelationKey::NewOrder(42),
            tx,
            Instant::now() + Duration::from_secs(3),
        );

        assert!(table.resolve(
            ConnectionId(1),
            CorrelationKey::NewOrder(42),
            Ok(json!([0, 235, 42])),
        ));
        assert_eq!(rx.await.unwrap().unwrap(), json!([0, 235, 42]));

        // Entry is gone; a second confirmation finds nothing.
        assert!(!table.resolve(
            ConnectionId(1),
            CorrelationKey::NewOrder(42),
            Ok(Value::Null),
        ));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_key_scoped_to_connection() {
        let mut table = CorrelationTable::new();
        let (tx, _rx) = pending();
        table.insert(
            ConnectionId(1),
            CorrelationKey::Ping(7),
            tx,
            Instant::now() + Duration::from_secs(3),
        );

        assert!(!table.resolve(ConnectionId(2), CorrelationKey::Ping(7), Ok(Value::Null)));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_times_out_expired_entries() {
        let mut table = CorrelationTable::new();
        let (expired_tx, expired_rx) = pending();
        let (live_tx, _live_rx) = pending();
        let now = Instant::now();

        table.insert(
            ConnectionId(1),
            CorrelationKey::CancelOrder(9),
            expired_tx,
            now,
        );
        table.insert(
            ConnectionId(1),
            CorrelationKey::Auth,
            live_tx,
            now + Duration::from_secs(60),
        );

        table.sweep(now + Duration::from_millis(1));

        assert!(matches!(
            expired_rx.await.unwrap(),
            Err(BitfinexError::Timeout)
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_new_order_keys_off_position_two() {
        let notification = json!([
            1575282446000u64, "on-req", null, null,
            [0, 235, 42], null, "SUCCESS", "Submitting order",
        ]);
        let outcome = from_notification(&notification).unwrap();

        assert_eq!(outcome.key, CorrelationKey::NewOrder(42));
        assert!(outcome.success);
        assert_eq!(outcome.payload, json!([0, 235, 42]));
    }

    #[test]
    fn test_update_and_cancel_key_off_position_zero() {
        let update = json!([
            1575282446000u64, "ou-req", null, null,
            [555, 0, 42], null, "SUCCESS", "Updating order",
        ]);
        assert_eq!(
            from_notification(&update).unwrap().key,
            CorrelationKey::UpdateOrder(555)
        );

        let cancel = json!([
            1575282446000u64, "oc-req", null, null,
            [42, null, 301], null, "ERROR", "Order not found",
        ]);
        let outcome = from_notification(&cancel).unwrap();
        assert_eq!(outcome.key, CorrelationKey::CancelOrder(42));
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Order not found");
    }

    #[test]
    fn test_group_cancel_keys_off_first_row_gid() {
        let notification = json!([
            1575282446000u64, "oc_multi-req", null, null,
            [[42, 900, null]], null, "SUCCESS", "Canceling orders",
        ]);
        assert_eq!(
            from_notification(&notification).unwrap().key,
            CorrelationKey::CancelGroup(900)
        );
    }

    #[test]
    fn test_uncorrelated_notification_types_ignored() {
        let notification = json!([
            1575282446000u64, "deposit_new", null, null,
            [0, 1, 2], null, "SUCCESS", "",
        ]);
        assert!(from_notification(&notification).is_none());
    }
}
