//! The message envelope: the in-process representation every pipeline stage
//! works with.
//!
//! An [`Envelope`] bundles a payload with the [`Metadata`] an adapter built
//! from the native record and the [`Acker`] bound to the record's consumption
//! handle. It is intentionally generic and transport-agnostic: the pipeline
//! only ever sees this protocol, never a broker client type.
//!
//! ## Derivation
//!
//! Payload and metadata are immutable once constructed. Deriving a new
//! envelope with [`with_payload`](Envelope::with_payload) or
//! [`with_metadata`](Envelope::with_metadata) preserves the original acker
//! unless it is explicitly replaced via [`with_acker`](Envelope::with_acker),
//! so acknowledging a derived envelope settles the same transport obligation
//! as acknowledging the original — exactly once, whichever fires first.

use crate::ack::{AckError, Acker};
use crate::metadata::{Metadata, MetadataValue};

/// Payload + metadata + acknowledgment capability.
///
/// ## Example
///
/// ```rust
/// use courier::{Envelope, metadata::MetadataValue};
///
/// let envelope = Envelope::new("order-created")
///     .with_metadata(MetadataValue::DestinationName("orders".to_owned()));
///
/// assert_eq!(*envelope.payload(), "order-created");
/// assert_eq!(envelope.metadata().destination_name(), Some("orders"));
/// ```
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    payload: T,
    metadata: Metadata,
    acker: Acker,
}

impl<T> Envelope<T> {
    /// Wrap a producer-originated payload: empty metadata, no-op acker.
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            metadata: Metadata::default(),
            acker: Acker::noop(),
        }
    }

    /// Assemble an envelope from its parts. This is the adapter path: the
    /// acker is expected to be bound to the record's consumption handle.
    pub fn from_parts(payload: T, metadata: Metadata, acker: Acker) -> Self {
        Self {
            payload,
            metadata,
            acker,
        }
    }

    /// The stored payload.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consume the envelope, keeping only the payload.
    ///
    /// The acker is dropped without being settled; on at-least-once sources
    /// the record will eventually be redelivered. Clone the acker first if
    /// the obligation should survive.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Decompose into payload, metadata and acker.
    pub fn into_parts(self) -> (T, Metadata, Acker) {
        (self.payload, self.metadata, self.acker)
    }

    /// The metadata attached to this message.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The acknowledgment capability carried by this envelope.
    ///
    /// Cloning it shares the settlement guard; see [`Acker`].
    pub fn acker(&self) -> &Acker {
        &self.acker
    }

    /// Derive an envelope with a different payload, keeping the metadata and
    /// the original acker.
    pub fn with_payload<U>(self, payload: U) -> Envelope<U> {
        Envelope {
            payload,
            metadata: self.metadata,
            acker: self.acker,
        }
    }

    /// Derive an envelope with one more metadata entry, keeping the payload
    /// and the original acker. Insert rules are those of
    /// [`MetadataBuilder::with`](crate::metadata::MetadataBuilder::with).
    pub fn with_metadata(self, value: MetadataValue) -> Self {
        Self {
            metadata: self.metadata.to_builder().with(value).build(),
            ..self
        }
    }

    /// Derive an envelope with a replaced acknowledgment capability.
    pub fn with_acker(self, acker: Acker) -> Self {
        Self { acker, ..self }
    }

    /// Acknowledge this message.
    ///
    /// Delegates to the bound [`Acker`]: the first settlement across all
    /// clones and derived envelopes runs the transport-specific completion;
    /// later calls are no-ops. Failures are returned, never retried.
    pub async fn ack(&self) -> Result<(), AckError> {
        self.acker.ack().await
    }

    /// Negatively acknowledge this message with a failure reason.
    ///
    /// With no negative closure bound the behavior is transport-defined,
    /// commonly a no-op leaving redelivery to the transport's retry policy.
    pub async fn nack(&self, reason: impl Into<tower::BoxError>) -> Result<(), AckError> {
        self.acker.nack(reason).await
    }
}

impl<T> From<T> for Envelope<T> {
    fn from(payload: T) -> Self {
        Envelope::new(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_acker(commits: Arc<AtomicUsize>) -> Acker {
        Acker::new(move || {
            let commits = commits.clone();
            async move {
                commits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn with_payload_preserves_metadata_and_acker() {
        let commits = Arc::new(AtomicUsize::new(0));
        let original = Envelope::from_parts(
            "42".to_owned(),
            Metadata::builder()
                .with(MetadataValue::Partition(3))
                .with(MetadataValue::Offset(100))
                .build(),
            counting_acker(commits.clone()),
        );
        let original_acker = original.acker().clone();

        let derived = original.with_payload(42_u64);

        assert_eq!(*derived.payload(), 42);
        assert_eq!(derived.metadata().partition(), Some(3));
        assert_eq!(derived.metadata().offset(), Some(100));

        // Acking the derived envelope settles the original obligation once.
        derived.ack().await.unwrap();
        original_acker.ack().await.unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_metadata_merges_without_touching_payload_or_acker() {
        let commits = Arc::new(AtomicUsize::new(0));
        let envelope = Envelope::from_parts(
            b"body".to_vec(),
            Metadata::builder()
                .with(MetadataValue::SourceName("orders".to_owned()))
                .build(),
            counting_acker(commits.clone()),
        )
        .with_metadata(MetadataValue::DestinationName("orders-out".to_owned()));

        assert_eq!(envelope.metadata().source_name(), Some("orders"));
        assert_eq!(envelope.metadata().destination_name(), Some("orders-out"));

        envelope.ack().await.unwrap();
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn producer_originated_envelopes_ack_without_effect() {
        let envelope = Envelope::new(1_u8);
        envelope.ack().await.unwrap();
        envelope.nack("ignored").await.unwrap();
    }

    #[tokio::test]
    async fn with_acker_replaces_the_capability() {
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));

        let envelope = Envelope::from_parts((), Metadata::default(), counting_acker(old.clone()))
            .with_acker(counting_acker(new.clone()));

        envelope.ack().await.unwrap();
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }
}
