//! Typed, ordered metadata attached to a message.
//!
//! [`Metadata`] is an immutable registry of per-message facts populated by a
//! connector adapter on the inbound path (source key, partition, offset,
//! translated headers, …) or by user code on the outbound path (destination
//! overrides). It is built incrementally through [`MetadataBuilder`] and
//! frozen by [`MetadataBuilder::build`]; frozen stores have no mutating API
//! and are safely shared across threads.
//!
//! ## Lookup model
//!
//! Entries are tagged variants of [`MetadataValue`]; the tag is the
//! [`MetadataKind`]. Retrieval is a pattern match — there is no reflective
//! or downcast-based lookup. At most one value per kind is active: inserting
//! a single-valued kind replaces the previous entry, and the most recently
//! inserted value wins. The header kinds are multi-valued: inserting
//! [`MetadataValue::Headers`] appends to the existing list, preserving
//! element insertion order without collapsing duplicates.
//!
//! Adapter-specific facts that have no closed variant go into the
//! [`MetadataValue::Extension`] slot, keyed by name.
//!
//! ## Absence policy
//!
//! A value is attached only when the source field is semantically present.
//! A record with an unknown partition (negative sentinel on the wire) gets
//! *no* `Partition` entry rather than a sentinel value; downstream code
//! distinguishes "not applicable" from "zero" by absence. Accordingly every
//! lookup returns an `Option` (or an empty slice for headers) and never
//! fails on an unknown tag.

use crate::headers::Header;

/// Tag identifying one kind of metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataKind {
    /// Key of the inbound record (Kafka message key, correlation id, …).
    SourceKey,
    /// Name of the source the record was consumed from (topic, queue, path).
    SourceName,
    /// Partition or shard index of the inbound record.
    Partition,
    /// Record timestamp, milliseconds since the Unix epoch.
    Timestamp,
    /// What the timestamp measures (creation vs. broker append).
    TimestampKind,
    /// Offset or sequence number within the ordered source.
    Offset,
    /// Whether the transport flagged this delivery as a redelivery.
    Redelivered,
    /// Headers translated from the inbound native record.
    Headers,
    /// Outbound override: destination (topic, routing key, URL).
    DestinationName,
    /// Outbound override: record key.
    DestinationKey,
    /// Outbound override: headers to render onto the native record.
    OutboundHeaders,
    /// Adapter-specific named entry.
    Extension,
}

/// What a record timestamp measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampKind {
    /// Timestamp set by the producer at creation time.
    Create,
    /// Timestamp assigned by the broker when the record was appended.
    LogAppend,
}

/// One metadata entry. The variant is the type tag; see [`MetadataKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    SourceKey(Vec<u8>),
    SourceName(String),
    Partition(i32),
    Timestamp(i64),
    TimestampKind(TimestampKind),
    Offset(i64),
    Redelivered(bool),
    Headers(Vec<Header>),
    DestinationName(String),
    DestinationKey(Vec<u8>),
    OutboundHeaders(Vec<Header>),
    Extension {
        name: String,
        value: serde_json::Value,
    },
}

impl MetadataValue {
    /// The tag of this entry.
    pub fn kind(&self) -> MetadataKind {
        match self {
            MetadataValue::SourceKey(_) => MetadataKind::SourceKey,
            MetadataValue::SourceName(_) => MetadataKind::SourceName,
            MetadataValue::Partition(_) => MetadataKind::Partition,
            MetadataValue::Timestamp(_) => MetadataKind::Timestamp,
            MetadataValue::TimestampKind(_) => MetadataKind::TimestampKind,
            MetadataValue::Offset(_) => MetadataKind::Offset,
            MetadataValue::Redelivered(_) => MetadataKind::Redelivered,
            MetadataValue::Headers(_) => MetadataKind::Headers,
            MetadataValue::DestinationName(_) => MetadataKind::DestinationName,
            MetadataValue::DestinationKey(_) => MetadataKind::DestinationKey,
            MetadataValue::OutboundHeaders(_) => MetadataKind::OutboundHeaders,
            MetadataValue::Extension { .. } => MetadataKind::Extension,
        }
    }
}

/// Frozen, ordered store of metadata entries.
///
/// Created through [`Metadata::builder`]. Cloning is cheap enough to derive
/// new envelopes from; instances are immutable and `Send + Sync`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<MetadataValue>,
}

impl Metadata {
    /// Start building a new store.
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder::default()
    }

    /// Reopen this store as a builder, for deriving a merged copy.
    ///
    /// The original store is untouched; insert rules apply to the copy.
    pub fn to_builder(&self) -> MetadataBuilder {
        MetadataBuilder {
            entries: self.entries.clone(),
        }
    }

    /// The active value for `kind`, or `None` if no entry carries that tag.
    ///
    /// When several entries share a tag the most recently inserted wins.
    pub fn get(&self, kind: MetadataKind) -> Option<&MetadataValue> {
        self.entries.iter().rev().find(|e| e.kind() == kind)
    }

    /// The extension entry named `name`, if present.
    pub fn extension(&self, name: &str) -> Option<&serde_json::Value> {
        self.entries.iter().rev().find_map(|e| match e {
            MetadataValue::Extension { name: n, value } if n == name => Some(value),
            _ => None,
        })
    }

    /// All entries, in insertion order.
    pub fn entries(&self) -> &[MetadataValue] {
        &self.entries
    }

    /// Iterate over entries in insertion order.
    pub fn iter(&self) -> std::slice::Iter<'_, MetadataValue> {
        self.entries.iter()
    }

    /// True when the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key of the inbound record, if one was present on the wire.
    pub fn source_key(&self) -> Option<&[u8]> {
        match self.get(MetadataKind::SourceKey)? {
            MetadataValue::SourceKey(k) => Some(k.as_slice()),
            _ => None,
        }
    }

    /// Name of the source the record came from, if known.
    pub fn source_name(&self) -> Option<&str> {
        match self.get(MetadataKind::SourceName)? {
            MetadataValue::SourceName(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Partition or shard index. Absent when the transport reported an
    /// unknown partition.
    pub fn partition(&self) -> Option<i32> {
        match self.get(MetadataKind::Partition)? {
            MetadataValue::Partition(p) => Some(*p),
            _ => None,
        }
    }

    /// Record timestamp in epoch milliseconds, when the transport supplied
    /// one.
    pub fn timestamp(&self) -> Option<i64> {
        match self.get(MetadataKind::Timestamp)? {
            MetadataValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    /// What the timestamp measures, when the transport reported it.
    pub fn timestamp_kind(&self) -> Option<TimestampKind> {
        match self.get(MetadataKind::TimestampKind)? {
            MetadataValue::TimestampKind(k) => Some(*k),
            _ => None,
        }
    }

    /// Offset or sequence number within the ordered source.
    pub fn offset(&self) -> Option<i64> {
        match self.get(MetadataKind::Offset)? {
            MetadataValue::Offset(o) => Some(*o),
            _ => None,
        }
    }

    /// Redelivery flag, when the transport exposes one.
    pub fn redelivered(&self) -> Option<bool> {
        match self.get(MetadataKind::Redelivered)? {
            MetadataValue::Redelivered(r) => Some(*r),
            _ => None,
        }
    }

    /// Headers of the inbound record.
    ///
    /// Returns an empty slice when no header entry was attached, so callers
    /// need not distinguish "no headers on the wire" from "empty header
    /// list". Use [`Metadata::get`] when the distinction matters.
    pub fn headers(&self) -> &[Header] {
        match self.get(MetadataKind::Headers) {
            Some(MetadataValue::Headers(h)) => h.as_slice(),
            _ => &[],
        }
    }

    /// Outbound destination override, when user code set one.
    pub fn destination_name(&self) -> Option<&str> {
        match self.get(MetadataKind::DestinationName)? {
            MetadataValue::DestinationName(d) => Some(d.as_str()),
            _ => None,
        }
    }

    /// Outbound key override, when user code set one.
    pub fn destination_key(&self) -> Option<&[u8]> {
        match self.get(MetadataKind::DestinationKey)? {
            MetadataValue::DestinationKey(k) => Some(k.as_slice()),
            _ => None,
        }
    }

    /// Outbound header override, when user code set one.
    ///
    /// `None` means "no override": outbound adapters fall back to their
    /// defaults rather than forwarding inbound headers implicitly.
    pub fn outbound_headers(&self) -> Option<&[Header]> {
        match self.get(MetadataKind::OutboundHeaders)? {
            MetadataValue::OutboundHeaders(h) => Some(h.as_slice()),
            _ => None,
        }
    }
}

/// Incremental builder for [`Metadata`].
///
/// Consumed by [`MetadataBuilder::build`]; once frozen there is no way back
/// to an insertable state except [`Metadata::to_builder`], which copies.
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    entries: Vec<MetadataValue>,
}

impl MetadataBuilder {
    /// Insert one entry.
    ///
    /// Single-valued kinds replace any previous entry of the same kind (the
    /// new value becomes the most recent). The header kinds append their
    /// elements to the existing list. Extension entries replace only the
    /// entry with the same name.
    pub fn with(mut self, value: MetadataValue) -> Self {
        match value {
            MetadataValue::Headers(new) => {
                match self
                    .entries
                    .iter_mut()
                    .find(|e| e.kind() == MetadataKind::Headers)
                {
                    Some(MetadataValue::Headers(existing)) => existing.extend(new),
                    _ => self.entries.push(MetadataValue::Headers(new)),
                }
            }
            MetadataValue::OutboundHeaders(new) => {
                match self
                    .entries
                    .iter_mut()
                    .find(|e| e.kind() == MetadataKind::OutboundHeaders)
                {
                    Some(MetadataValue::OutboundHeaders(existing)) => existing.extend(new),
                    _ => self.entries.push(MetadataValue::OutboundHeaders(new)),
                }
            }
            MetadataValue::Extension { name, value } => {
                self.entries.retain(|e| {
                    !matches!(e, MetadataValue::Extension { name: n, .. } if *n == name)
                });
                self.entries.push(MetadataValue::Extension { name, value });
            }
            other => {
                let kind = other.kind();
                self.entries.retain(|e| e.kind() != kind);
                self.entries.push(other);
            }
        }
        self
    }

    /// Append a single header to the multi-valued header entry.
    pub fn header(self, header: Header) -> Self {
        self.with(MetadataValue::Headers(vec![header]))
    }

    /// Insert a named adapter-specific entry.
    pub fn extension(self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.with(MetadataValue::Extension {
            name: name.into(),
            value,
        })
    }

    /// Freeze the store.
    pub fn build(self) -> Metadata {
        Metadata {
            entries: self.entries,
        }
    }
}
