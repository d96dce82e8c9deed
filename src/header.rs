use alloc::string::String;
use alloc::vec::Vec;

use crate::ascii::{CR, LF};

/// Host
pub const HEAD_HOST: &str = "Host";
/// Connection
pub const HEAD_CONNECTION: &str = "Connection";
/// Upgrade
pub const HEAD_UPGRADE: &str = "Upgrade";
/// Expect
pub const HEAD_EXPECT: &str = "Expect";
/// Authorization
pub const HEAD_AUTHORIZATION: &str = "Authorization";
/// Content-Length
pub const HEAD_CONTENT_LENGTH: &str = "Content-Length";
/// Content-Type
pub const HEAD_CONTENT_TYPE: &str = "Content-Type";
/// Content-Disposition
pub const HEAD_CONTENT_DISPOSITION: &str = "Content-Disposition";
/// Transfer-Encoding
pub const HEAD_TRANSFER_ENCODING: &str = "Transfer-Encoding";
/// Access-Control-Allow-Origin
pub const HEAD_ACCESS_CONTROL_ALLOW_ORIGIN: &str = "Access-Control-Allow-Origin";
/// Sec-WebSocket-Key
pub const HEAD_SEC_WEBSOCKET_KEY: &str = "Sec-WebSocket-Key";
/// Sec-WebSocket-Version
pub const HEAD_SEC_WEBSOCKET_VERSION: &str = "Sec-WebSocket-Version";
/// Sec-WebSocket-Accept
pub const HEAD_SEC_WEBSOCKET_ACCEPT: &str = "Sec-WebSocket-Accept";

/// Wildcard used with [`crate::server::RequestHandler::retained_headers`] to retain
/// every request header.
pub const RETAIN_ANY: &str = "*";

/// A single header name/value pair.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Header {
    /// Header name as it appeared on the wire
    pub name: String,
    /// Header value with surrounding whitespace removed
    pub value: String,
}

impl Header {
    /// Construct a header from a name and value.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An ordered collection of headers.  Lookups are case insensitive on the name,
/// iteration preserves insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Headers {
    items: Vec<Header>,
}

impl Headers {
    /// An empty header collection.
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Append a header, keeping any existing headers of the same name.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.items.push(Header::new(name, value));
    }

    /// The value of the first header matching `name`, ignoring ascii case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// True if a header matching `name` is present, ignoring ascii case.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate the headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.items.iter()
    }

    /// Number of headers held.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no headers are held.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Encode all headers as `Name: value\r\n` lines into `out`.
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        for h in self.items.iter() {
            out.extend_from_slice(h.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(h.value.as_bytes());
            out.push(CR);
            out.push(LF);
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::string::ToString;

    use super::*;

    #[test]
    fn test_case_insensitive_get() {
        let mut headers = Headers::new();
        headers.push("Content-Type", "text/plain");
        headers.push("X-Custom", "one");
        headers.push("X-Custom", "two");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(headers.get("X-Custom"), Some("one"));
        assert_eq!(headers.get("Missing"), None);
        assert_eq!(headers.len(), 3);
    }

    #[test]
    fn test_encode_preserves_order() {
        let mut headers = Headers::new();
        headers.push("B", "2");
        headers.push("A", "1");

        let mut out = Vec::new();
        headers.encode(&mut out);
        assert_eq!(
            std::str::from_utf8(&out).unwrap().to_string(),
            "B: 2\r\nA: 1\r\n"
        );
    }
}
