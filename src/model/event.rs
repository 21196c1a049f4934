use std::collections::BTreeMap;

use super::RetryEnvelope;

/// Header carrying the logical route name. Every message travelling through
/// the retry path must have it; the route's [`crate::config::RouteConfig`] is
/// looked up by this value.
pub const HEADER_MESSAGE_ROUTE: &str = "x-message-route";

/// Message headers. Ordered so envelopes compare and serialize deterministically.
///
/// Text only: when built from AMQP headers, non-UTF-8 bytes are replaced and
/// non-text values are left out.
pub type Headers = BTreeMap<String, String>;

/// A unit of work handed to a [`crate::handler::Handler`].
///
/// Implemented by [`Message`] for first-attempt deliveries and by
/// [`RetryEnvelope`] for messages that came back through the delay queue.
pub trait Event: Send + Sync {
    fn value(&self) -> &[u8];

    fn headers(&self) -> &Headers;

    /// The retry envelope this event was decoded from, if any.
    fn retry_envelope(&self) -> Option<&RetryEnvelope> {
        None
    }

    fn route(&self) -> Option<&str> {
        self.headers().get(HEADER_MESSAGE_ROUTE).map(String::as_str)
    }
}

/// A plain inbound message that has never been through the retry path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub value: Vec<u8>,
    pub headers: Headers,
}

impl Message {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Shorthand for setting [`HEADER_MESSAGE_ROUTE`].
    pub fn with_route(self, route: impl Into<String>) -> Self {
        self.with_header(HEADER_MESSAGE_ROUTE, route)
    }
}

impl Event for Message {
    fn value(&self) -> &[u8] {
        &self.value
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_is_read_from_header() {
        let msg = Message::new("hello").with_route("orders");
        assert_eq!(msg.route(), Some("orders"));
        assert!(msg.retry_envelope().is_none());
    }

    #[test]
    fn missing_route_header_yields_none() {
        let msg = Message::new("hello").with_header("content-type", "text/plain");
        assert_eq!(msg.route(), None);
    }
}
