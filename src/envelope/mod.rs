//! sbus wire envelope.
//!
//! Outbound: the raw JSON body is wrapped as `{"body":<body>}` byte for byte
//! and annotated with an ordered header set. Inbound: replies are JSON
//! objects carrying `status` and `body`.

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::Value;

use crate::signing::{Signing, SigningIdentity};

pub const HEADER_CORRELATION_ID: &str = "correlation-id";
pub const HEADER_TIMESTAMP: &str = "timestamp";
pub const HEADER_EXPIRED_AT: &str = "expired-at";
pub const HEADER_ORIGIN: &str = "origin";
pub const HEADER_SIGNATURE: &str = "signature";
pub const HEADER_REPLY_TO: &str = "reply-to";
pub const HEADER_ROUTING_KEY: &str = "routing-key";

/// How long a message stays valid after its timestamp, in milliseconds.
pub const MESSAGE_TTL_MILLIS: i64 = 5 * 60 * 1000;

/// Length of the advisory correlation id.
pub const CORRELATION_ID_LEN: usize = 32;

/// Result type for envelope operations.
pub type Result<T> = std::result::Result<T, EnvelopeError>;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Routing key must not be empty")]
    EmptyRoutingKey,

    #[error("Malformed reply: {0}")]
    Decode(String),
}

/// Random alphanumeric string, used for correlation ids and message keys.
pub fn random_id(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Wrap a raw JSON body without parsing it.
pub fn wrap_body(body: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 9);
    payload.extend_from_slice(b"{\"body\":");
    payload.extend_from_slice(body.as_bytes());
    payload.push(b'}');
    payload
}

// ============================================================================
// Headers
// ============================================================================

/// A header value. Timestamps stay integers so AMQP can carry them as
/// 64-bit ints; Kafka renders everything as UTF-8 text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Millis(i64),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s),
            HeaderValue::Millis(_) => None,
        }
    }

    pub fn as_millis(&self) -> Option<i64> {
        match self {
            HeaderValue::Millis(ms) => Some(*ms),
            HeaderValue::Text(_) => None,
        }
    }

    /// Text form used by transports without typed headers.
    pub fn to_wire_string(&self) -> String {
        match self {
            HeaderValue::Text(s) => s.clone(),
            HeaderValue::Millis(ms) => ms.to_string(),
        }
    }
}

/// Ordered header set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(&'static str, HeaderValue)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing an existing value in place.
    pub fn insert(&mut self, name: &'static str, value: HeaderValue) {
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::as_text)
    }

    pub fn millis(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(HeaderValue::as_millis)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &HeaderValue)> {
        self.0.iter().map(|(n, v)| (*n, v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// What the operator asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub routing_key: String,
    /// Raw JSON text, passed through untouched.
    pub body: String,
    /// Events are fire-and-forget; commands await one reply.
    pub is_event: bool,
}

impl Message {
    pub fn command(routing_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            is_event: false,
        }
    }

    pub fn event(routing_key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            is_event: true,
        }
    }
}

/// An encoded, optionally signed message ready for a transport.
///
/// Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    routing_key: String,
    payload: Vec<u8>,
    headers: Headers,
    is_event: bool,
}

impl Envelope {
    /// Encode a message.
    ///
    /// `reply_to` is the transport's reply address and is only honoured for
    /// commands. Signing soft-fails: an unusable identity yields an unsigned
    /// envelope without `origin` or `signature`.
    pub fn encode(
        message: &Message,
        reply_to: Option<&str>,
        identity: &SigningIdentity,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if message.routing_key.is_empty() {
            return Err(EnvelopeError::EmptyRoutingKey);
        }

        let payload = wrap_body(&message.body);
        let timestamp = now.timestamp_millis();

        let mut headers = Headers::new();
        headers.insert(
            HEADER_CORRELATION_ID,
            HeaderValue::Text(random_id(CORRELATION_ID_LEN)),
        );
        headers.insert(HEADER_TIMESTAMP, HeaderValue::Millis(timestamp));
        headers.insert(
            HEADER_EXPIRED_AT,
            HeaderValue::Millis(timestamp + MESSAGE_TTL_MILLIS),
        );

        if !message.is_event {
            if let Some(reply_to) = reply_to {
                headers.insert(HEADER_REPLY_TO, HeaderValue::Text(reply_to.to_string()));
            }
        }

        if let Signing::Signed { origin, signature } =
            identity.sign(&payload, &message.routing_key)
        {
            headers.insert(HEADER_ORIGIN, HeaderValue::Text(origin));
            headers.insert(HEADER_SIGNATURE, HeaderValue::Text(signature));
        }

        Ok(Self {
            routing_key: message.routing_key.clone(),
            payload,
            headers,
            is_event: message.is_event,
        })
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn is_event(&self) -> bool {
        self.is_event
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.headers.text(HEADER_REPLY_TO)
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// A reply from the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Raw `status` value; a string or a number when well formed.
    pub status: Option<Value>,
    pub body: Value,
}

impl Reply {
    /// Decode raw reply bytes.
    ///
    /// Only the top-level shape is checked here. Status classification is up
    /// to the caller; a missing `body` decodes as `null`.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|e| EnvelopeError::Decode(e.to_string()))?;

        let Value::Object(mut fields) = value else {
            return Err(EnvelopeError::Decode(
                "reply is not a JSON object".to_string(),
            ));
        };

        Ok(Self {
            status: fields.remove("status"),
            body: fields.remove("body").unwrap_or(Value::Null),
        })
    }

    /// Numeric status, parsed from either a JSON number or a numeric string.
    ///
    /// Fractional and exponent forms (`200.0`, `2e2`) count as numeric and
    /// are truncated toward zero.
    pub fn status_code(&self) -> Option<i64> {
        match self.status.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(finite_code)),
            Value::String(s) => {
                let s = s.trim();
                s.parse()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(finite_code))
            }
            _ => None,
        }
    }

    /// Non-numeric status or a status of 400 and above is a failure.
    pub fn is_success(&self) -> bool {
        matches!(self.status_code(), Some(code) if code < 400)
    }

    /// The status as the operator sees it: strings unquoted.
    pub fn status_display(&self) -> String {
        match &self.status {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "null".to_string(),
        }
    }

    /// Body pretty-printed with two-space indentation.
    pub fn pretty_body(&self) -> String {
        serde_json::to_string_pretty(&self.body).unwrap_or_else(|_| self.body.to_string())
    }
}

fn finite_code(code: f64) -> Option<i64> {
    code.is_finite().then(|| code.trunc() as i64)
}
