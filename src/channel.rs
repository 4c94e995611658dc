//! Channel kinds, descriptors and subscription requests.

use serde_json::{Map, Value, json};

/// Filter fields recognized on subscription confirmations.
///
/// Everything else on a `subscribed` event (chanId, event name, ...) is
/// bookkeeping, not part of the channel identity.
const FILTER_FIELDS: &[&str] = &["symbol", "pair", "prec", "freq", "len", "key"];

/// The closed set of channel types carried by a WebSocket v2 connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// The private channel (always channel id 0), established via `auth`.
    Auth,
    /// Public trade feed.
    Trades,
    /// OHLC candle feed.
    Candles,
    /// Order book feed.
    Book,
    /// Ticker feed.
    Ticker,
}

impl ChannelKind {
    /// Wire name of the channel type, as used in subscribe commands and
    /// confirmation events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Trades => "trades",
            Self::Candles => "candles",
            Self::Book => "book",
            Self::Ticker => "ticker",
        }
    }

    /// Parse a wire channel name.
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "auth" => Some(Self::Auth),
            "trades" => Some(Self::Trades),
            "candles" => Some(Self::Candles),
            "book" => Some(Self::Book),
            "ticker" => Some(Self::Ticker),
            _ => None,
        }
    }

    /// Whether this is a public data channel (everything but `auth`).
    pub fn is_data(&self) -> bool {
        !matches!(self, Self::Auth)
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A confirmed channel subscription.
///
/// Built from a `subscribed` confirmation event; immutable afterwards. The
/// filter fields (`symbol`, `pair`, `prec`, `freq`, `len`, `key`) identify
/// what the channel carries and are replayed on resubscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelDescriptor {
    kind: ChannelKind,
    fields: Map<String, Value>,
}

impl ChannelDescriptor {
    /// Create a descriptor with no filter fields (the auth channel).
    pub fn auth() -> Self {
        Self {
            kind: ChannelKind::Auth,
            fields: Map::new(),
        }
    }

    /// Build a descriptor from a `subscribed` confirmation event.
    ///
    /// Returns the assigned channel id and the descriptor, or `None` when the
    /// event is missing a channel name/id or names an unknown channel type.
    pub fn from_subscribed_event(event: &Value) -> Option<(u64, Self)> {
        let chan_id = event.get("chanId").and_then(Value::as_u64)?;
        let name = event.get("channel").and_then(Value::as_str)?;
        let kind = ChannelKind::from_str(name)?;

        let mut fields = Map::new();
        for field in FILTER_FIELDS {
            if let Some(value) = event.get(*field) {
                if !value.is_null() {
                    fields.insert((*field).to_string(), value.clone());
                }
            }
        }

        Some((chan_id, Self { kind, fields }))
    }

    /// The channel type.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Look up a filter field by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The `symbol` filter field, when present.
    pub fn symbol(&self) -> Option<&str> {
        self.get("symbol").and_then(Value::as_str)
    }

    /// The `pair` filter field, when present.
    pub fn pair(&self) -> Option<&str> {
        self.get("pair").and_then(Value::as_str)
    }

    /// The candle `key` filter field, when present.
    pub fn key(&self) -> Option<&str> {
        self.get("key").and_then(Value::as_str)
    }

    /// The filter fields present on this channel, as a JSON object.
    ///
    /// Attached to every data event so listeners can match on channel
    /// metadata without holding the descriptor.
    pub fn chan_filter(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// The filter payload to replay when resubscribing after a reconnect.
    ///
    /// Trades prefer the recorded `pair` over `symbol`; candles resubscribe
    /// by `key`; books by `symbol`/`prec`/`len` (plus `freq` when recorded);
    /// tickers by `symbol`. The auth channel is re-established via `auth`,
    /// never resubscribed.
    pub fn resubscribe_filter(&self) -> Value {
        let mut filter = Map::new();
        let mut copy = |field: &str| {
            if let Some(value) = self.fields.get(field) {
                filter.insert(field.to_string(), value.clone());
            }
        };

        match self.kind {
            ChannelKind::Auth => {}
            ChannelKind::Trades => {
                if self.fields.contains_key("pair") {
                    copy("pair");
                } else {
                    copy("symbol");
                }
            }
            ChannelKind::Candles => copy("key"),
            ChannelKind::Book => {
                copy("symbol");
                copy("prec");
                copy("len");
                copy("freq");
            }
            ChannelKind::Ticker => copy("symbol"),
        }

        Value::Object(filter)
    }

    /// Whether every field of `filter` equals the corresponding field here.
    ///
    /// This is the subset-equality used to reconcile pending subscriptions
    /// against confirmations: the confirmation carries more fields than the
    /// request, so only the requested fields are compared.
    pub fn matches_filter(&self, filter: &Value) -> bool {
        let Some(filter) = filter.as_object() else {
            return false;
        };

        filter
            .iter()
            .all(|(field, value)| self.fields.get(field) == Some(value))
    }
}

/// A subscribe command sent but not yet confirmed.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionRequest {
    /// Channel type requested.
    pub kind: ChannelKind,
    /// Filter payload sent with the subscribe command (JSON object).
    pub filter: Value,
}

impl SubscriptionRequest {
    /// Create a pending subscription entry.
    pub fn new(kind: ChannelKind, filter: Value) -> Self {
        Self { kind, filter }
    }

    /// The on-wire subscribe command for this request.
    pub fn command(&self) -> Value {
        let mut command = json!({
            "event": "subscribe",
            "channel": self.kind.as_str(),
        });
        if let (Some(target), Some(filter)) = (command.as_object_mut(), self.filter.as_object()) {
            for (field, value) in filter {
                target.insert(field.clone(), value.clone());
            }
        }
        command
    }

    /// Whether a confirmation event matches this pending request.
    ///
    /// Matching is channel type plus subset-equality of the filter fields
    /// present in the request against the confirmation fields.
    pub fn matches_confirmation(&self, descriptor: &ChannelDescriptor) -> bool {
        self.kind == descriptor.kind() && descriptor.matches_filter(&self.filter)
    }
}
