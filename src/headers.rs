//! Canonical header representation shared by all transports.
//!
//! Native header containers (Kafka record headers, AMQP field tables, HTTP
//! header maps) never cross into the generic layer. Adapters translate them
//! into an ordered list of [`Header`] entries on the way in and render the
//! list back into the native encoding on the way out, so headers round-trip
//! deterministically even through clients that do not preserve the original
//! header objects.
//!
//! ## Contract for adapter translations
//!
//! - An absent native container translates to an empty list, never an error.
//! - Duplicate keys are preserved, in order; the list is not collapsed into
//!   a map.
//! - Values are opaque byte sequences; no text encoding is assumed.
//! - A single header the native encoding cannot represent is dropped (with a
//!   warning), never failing the whole message.

/// A single message header: a string key and an opaque byte value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Header key.
    pub key: String,
    /// Header value. Binary-safe; not assumed to be UTF-8.
    pub value: Vec<u8>,
}

impl Header {
    /// Create a header from anything convertible into a key string and a
    /// byte value.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// View the value as UTF-8, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

impl From<(&str, &str)> for Header {
    fn from((key, value): (&str, &str)) -> Self {
        Header::new(key, value.as_bytes())
    }
}

impl From<(String, Vec<u8>)> for Header {
    fn from((key, value): (String, Vec<u8>)) -> Self {
        Header { key, value }
    }
}

/// Convert a header list into plain `(key, value)` pairs.
///
/// This is the identity-shaped translation used by transports whose native
/// header encoding is itself an ordered pair list (the in-memory backend).
pub fn to_pairs(headers: &[Header]) -> Vec<(String, Vec<u8>)> {
    headers
        .iter()
        .map(|h| (h.key.clone(), h.value.clone()))
        .collect()
}

/// Build a header list from plain `(key, value)` pairs, preserving order
/// and duplicates.
pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Vec<u8>)>) -> Vec<Header> {
    pairs
        .into_iter()
        .map(|(key, value)| Header { key, value })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_round_trip_preserves_order_and_duplicates() {
        let headers = vec![
            Header::new("hello", "clement".as_bytes()),
            Header::new("count", "1".as_bytes()),
            Header::new("hello", "again".as_bytes()),
        ];

        let round_tripped = from_pairs(to_pairs(&headers));
        assert_eq!(round_tripped, headers);
    }

    #[test]
    fn empty_list_round_trips() {
        assert_eq!(from_pairs(to_pairs(&[])), Vec::<Header>::new());
    }

    #[test]
    fn values_are_binary_safe() {
        let header = Header::new("bin", vec![0u8, 159, 146, 150]);
        assert_eq!(header.value_str(), None);
        assert_eq!(from_pairs(to_pairs(&[header.clone()])), vec![header]);
    }
}
