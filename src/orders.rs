//! Order command payloads and the envelopes that carry them.
//!
//! Order commands travel on channel 0 as 4-element envelopes:
//! `[0, "on" | "ou" | "oc" | "oc_multi", null, payload]`.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::BitfinexError;

/// A new-order payload.
///
/// Price and amount serialize as strings, as the API expects. The client
/// order id defaults to the current epoch milliseconds; it is the
/// correlation key for the submit confirmation.
#[derive(Debug, Clone, Serialize)]
pub struct OrderPayload {
    /// Group id, optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u64>,
    /// Client order id; correlation key for the confirmation.
    pub cid: u64,
    /// Order type, e.g. `EXCHANGE LIMIT` or `MARKET`.
    #[serde(rename = "type")]
    pub order_type: String,
    /// Symbol, e.g. `tBTCUSD`.
    pub symbol: String,
    /// Signed amount; positive buys, negative sells.
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    /// Limit price, required for limit order types.
    #[serde(with = "rust_decimal::serde::str_option", skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Trailing price offset.
    #[serde(
        rename = "price_trailing",
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub price_trailing: Option<Decimal>,
    /// Auxiliary limit price (OCO stop).
    #[serde(
        rename = "price_aux_limit",
        with = "rust_decimal::serde::str_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub price_aux_limit: Option<Decimal>,
    /// Order flags bitmask (hidden, post-only, OCO, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    /// Time-in-force timestamp, `YYYY-MM-DD HH:MM:SS`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tif: Option<String>,
    /// Free-form metadata attached to the order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl OrderPayload {
    /// Create an order payload with a fresh client order id.
    pub fn new(
        order_type: impl Into<String>,
        symbol: impl Into<String>,
        amount: Decimal,
    ) -> Self {
        Self {
            gid: None,
            cid: epoch_millis(),
            order_type: order_type.into(),
            symbol: symbol.into(),
            amount,
            price: None,
            price_trailing: None,
            price_aux_limit: None,
            flags: None,
            tif: None,
            meta: None,
        }
    }

    /// Set the client order id.
    pub fn with_cid(mut self, cid: u64) -> Self {
        self.cid = cid;
        self
    }

    /// Set the group id.
    pub fn with_gid(mut self, gid: u64) -> Self {
        self.gid = Some(gid);
        self
    }

    /// Set the limit price.
    pub fn with_price(mut self, price: Decimal) -> Self {
        self.price = Some(price);
        self
    }

    /// Set the order flags bitmask.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = Some(flags);
        self
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Extract the client order id from a raw new-order payload.
///
/// Object payloads carry it in `cid`; array-shaped payloads (the order
/// model's serialized form) carry it at position 2.
pub fn order_cid(payload: &Value) -> Result<u64, BitfinexError> {
    let cid = match payload {
        Value::Object(fields) => fields.get("cid").and_then(Value::as_u64),
        Value::Array(fields) => fields.get(2).and_then(Value::as_u64),
        _ => None,
    };

    cid.ok_or_else(|| {
        BitfinexError::InvalidOrder("client order id (cid) required for submit".to_string())
    })
}

/// Extract the server order id from an update changeset.
///
/// A missing id is a local error; no command is sent.
pub fn update_order_id(changes: &Value) -> Result<u64, BitfinexError> {
    changes
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| BitfinexError::InvalidOrder("order id required for update".to_string()))
}

/// A cancel target: an order object, a raw order array, or a bare id.
#[derive(Debug, Clone)]
pub enum CancelTarget {
    /// Server-assigned order id.
    Id(u64),
    /// An order object (`{"id": ...}`) or array (`[id, ...]`).
    Order(Value),
}

impl From<u64> for CancelTarget {
    fn from(id: u64) -> Self {
        Self::Id(id)
    }
}

impl From<Value> for CancelTarget {
    fn from(order: Value) -> Self {
        Self::Order(order)
    }
}

impl CancelTarget {
    /// Normalize to the server order id.
    pub fn order_id(&self) -> Result<u64, BitfinexError> {
        let id = match self {
            Self::Id(id) => Some(*id),
            Self::Order(Value::Array(fields)) => fields.first().and_then(Value::as_u64),
            Self::Order(Value::Object(fields)) => fields.get("id").and_then(Value::as_u64),
            Self::Order(_) => None,
        };

        id.ok_or_else(|| {
            BitfinexError::InvalidOrder("order id required for cancel".to_string())
        })
    }
}

/// Envelope for a new order.
pub fn new_order_envelope(payload: &Value) -> Value {
    json!([0, "on", null, payload])
}

/// Envelope for an order update.
pub fn update_order_envelope(changes: &Value) -> Value {
    json!([0, "ou", null, changes])
}

/// Envelope for a single-order cancel.
pub fn cancel_order_envelope(id: u64) -> Value {
    json!([0, "oc", null, { "id": id }])
}

/// Envelope for a cancel of every order in a group.
pub fn cancel_group_envelope(gid: u64) -> Value {
    json!([0, "oc_multi", null, { "gid": [gid] }])
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_payload_serializes_decimals_as_strings() {
        let payload = OrderPayload::new("EXCHANGE LIMIT", "tBTCUSD", dec("0.05"))
            .with_cid(42)
            .with_price(dec("7000.5"));

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "cid": 42,
                "type": "EXCHANGE LIMIT",
                "symbol": "tBTCUSD",
                "amount": "0.05",
                "price": "7000.5",
            })
        );
    }

    #[test]
    fn test_order_cid_from_object_and_array() {
        assert_eq!(order_cid(&serde_json::json!({"cid": 42})).unwrap(), 42);
        assert_eq!(
            order_cid(&serde_json::json!([null, null, 42, "tBTCUSD"])).unwrap(),
            42
        );
        assert!(matches!(
            order_cid(&serde_json::json!({"symbol": "tBTCUSD"})),
            Err(BitfinexError::InvalidOrder(_))
        ));
    }

    #[test]
    fn test_update_requires_id() {
        assert_eq!(
            update_order_id(&serde_json::json!({"id": 9, "price": "7100"})).unwrap(),
            9
        );
        assert!(matches!(
            update_order_id(&serde_json::json!({"price": "7100"})),
            Err(BitfinexError::InvalidOrder(_))
        ));
    }

    #[test]
    fn test_cancel_target_normalization() {
        assert_eq!(CancelTarget::from(42u64).order_id().unwrap(), 42);
        assert_eq!(
            CancelTarget::from(serde_json::json!({"id": 42})).order_id().unwrap(),
            42
        );
        assert_eq!(
            CancelTarget::from(serde_json::json!([42, null, 7])).order_id().unwrap(),
            42
        );
        assert!(CancelTarget::from(serde_json::json!("nope")).order_id().is_err());
    }

    #[test]
    fn test_envelope_shapes() {
        let payload = serde_json::json!({"cid": 42, "type": "MARKET"});
        assert_eq!(
            new_order_envelope(&payload),
            serde_json::json!([0, "on", null, {"cid": 42, "type": "MARKET"}])
        );
        assert_eq!(
            cancel_order_envelope(7),
            serde_json::json!([0, "oc", null, {"id": 7}])
        );
        assert_eq!(
            cancel_group_envelope(900),
            serde_json::json!([0, "oc_multi", null, {"gid": [900]}])
        );
        let changes = serde_json::json!({"id": 9, "price": "7100"});
        assert_eq!(
            update_order_envelope(&changes),
            serde_json::json!([0, "ou", null, {"id": 9, "price": "7100"}])
        );
    }
}
