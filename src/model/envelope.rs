use serde::{Deserialize, Serialize};

use super::{Event, Headers};

/// Wire wrapper that carries a message across re-publications.
///
/// Published as the body of every retry / dead-letter message:
///
/// ```json
/// { "value": "<base64>", "headers": { "x-message-route": "orders" }, "retry_count": 1 }
/// ```
///
/// `retry_count` starts at `0` for a message seen for the first time and only
/// ever grows; dead-lettering leaves it as is.
///
/// Decoding is strict: all three fields are required and no others are
/// allowed, so an ordinary JSON payload is never mistaken for an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryEnvelope {
    /// Original payload, untouched.
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,

    /// Original headers, including the route header.
    pub headers: Headers,

    /// Number of delay round-trips this message has already made.
    pub retry_count: u32,
}

impl RetryEnvelope {
    pub fn new(value: impl Into<Vec<u8>>, headers: Headers, retry_count: u32) -> Self {
        Self {
            value: value.into(),
            headers,
            retry_count,
        }
    }

    /// Envelope for `event` as it should enter the retry path.
    ///
    /// Re-delivered envelopes are returned as they are; anything else is wrapped
    /// with `retry_count = 0`.
    pub fn from_event(event: &dyn Event) -> Self {
        match event.retry_envelope() {
            Some(envelope) => envelope.clone(),
            None => Self::new(event.value(), event.headers().clone(), 0),
        }
    }
}

impl Event for RetryEnvelope {
    fn value(&self) -> &[u8] {
        &self.value
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn retry_envelope(&self) -> Option<&RetryEnvelope> {
        Some(self)
    }
}

// ── Codec ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(m) => write!(f, "envelope encode failed: {m}"),
            Self::Decode(m) => write!(f, "envelope decode failed: {m}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Serialize an envelope into a message body.
pub fn encode(envelope: &RetryEnvelope) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parse a message body produced by [`encode`].
pub fn decode(body: &[u8]) -> Result<RetryEnvelope, CodecError> {
    serde_json::from_slice(body).map_err(|e| CodecError::Decode(e.to_string()))
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD
            .decode(raw.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, HEADER_MESSAGE_ROUTE};

    fn sample() -> RetryEnvelope {
        let mut headers = Headers::new();
        headers.insert(HEADER_MESSAGE_ROUTE.to_string(), "orders".to_string());
        headers.insert("trace-id".to_string(), "abc123".to_string());
        RetryEnvelope::new(vec![0u8, 159, 146, 150, b'{', b'}'], headers, 3)
    }

    #[test]
    fn decode_reverses_encode() {
        let envelope = sample();
        let body = encode(&envelope).unwrap();
        assert_eq!(decode(&body).unwrap(), envelope);
    }

    #[test]
    fn empty_value_and_headers_survive() {
        let envelope = RetryEnvelope::default();
        let body = encode(&envelope).unwrap();
        assert_eq!(decode(&body).unwrap(), envelope);
    }

    #[test]
    fn value_is_base64_on_the_wire() {
        let envelope = RetryEnvelope::new(b"hi".to_vec(), Headers::new(), 1);
        let body = String::from_utf8(encode(&envelope).unwrap()).unwrap();
        assert!(body.contains("\"value\":\"aGk=\""), "body was {body}");
        assert!(body.contains("\"retry_count\":1"));
    }

    #[test]
    fn malformed_body_is_a_decode_error() {
        let err = decode(b"plain text, not an envelope").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));

        let err =
            decode(br#"{"value":"***not base64***","headers":{},"retry_count":0}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn ordinary_json_payload_is_not_an_envelope() {
        let err = decode(br#"{"value":"dGVzdA==","sku":"A-1"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));

        let err = decode(br#"{"value":"dGVzdA==","headers":{},"retry_count":0,"sku":"A-1"}"#)
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)), "unknown fields are rejected");

        let err = decode(br#"{"value":"dGVzdA==","headers":{}}"#).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)), "retry_count is required");
    }

    #[test]
    fn first_attempt_message_starts_at_zero() {
        let msg = Message::new("payload").with_route("orders");
        let envelope = RetryEnvelope::from_event(&msg);
        assert_eq!(envelope.retry_count, 0);
        assert_eq!(envelope.value, b"payload");
        assert_eq!(envelope.headers, msg.headers);
    }

    #[test]
    fn redelivered_envelope_keeps_its_count() {
        let envelope = sample();
        assert_eq!(RetryEnvelope::from_event(&envelope), envelope);
    }
}
