//! Kafka connector adapter.
//!
//! Inbound, [`KafkaSource`] consumes an `rdkafka` stream consumer and yields
//! envelopes whose ackers commit the consumer's current position. Outbound,
//! [`Kafka`] renders envelopes into producer records. Both translate between
//! native `OwnedHeaders` and the canonical header list; client construction
//! (consumer config, producer config) stays with the caller.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{
    Header as NativeHeader, Headers as NativeHeaders, Message, OwnedHeaders, Timestamp,
};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio_util::sync::CancellationToken;

use crate::ack::{AckError, Acker};
use crate::headers::Header;
use crate::metadata::{Metadata, MetadataValue, TimestampKind};
use crate::transport::{RawPayload, Sender, Source, ToBytes};
use crate::Envelope;

/// Translate native Kafka headers into the canonical list.
///
/// An absent container yields an empty list. Duplicate keys and order are
/// preserved; a header with a null value becomes an empty byte value rather
/// than being dropped.
pub fn from_native<H: NativeHeaders>(native: Option<&H>) -> Vec<Header> {
    let Some(native) = native else {
        return Vec::new();
    };
    native
        .iter()
        .map(|header| Header::new(header.key, header.value.unwrap_or(&[]).to_vec()))
        .collect()
}

/// Render the canonical header list into native Kafka headers.
pub fn to_native(headers: &[Header]) -> OwnedHeaders {
    headers
        .iter()
        .fold(
            OwnedHeaders::new_with_capacity(headers.len()),
            |native, header| {
                native.insert(NativeHeader {
                    key: &header.key,
                    value: Some(header.value.as_slice()),
                })
            },
        )
}

/// Build envelope metadata from a consumed Kafka message.
///
/// Fields are attached only when present on the wire: a negative partition
/// or offset, a missing key and an unavailable timestamp all stay absent.
fn build_metadata(message: &impl Message) -> Metadata {
    let mut builder =
        Metadata::builder().with(MetadataValue::SourceName(message.topic().to_owned()));
    if let Some(key) = message.key() {
        builder = builder.with(MetadataValue::SourceKey(key.to_vec()));
    }
    if message.partition() >= 0 {
        builder = builder.with(MetadataValue::Partition(message.partition()));
    }
    match message.timestamp() {
        Timestamp::CreateTime(millis) if millis >= 0 => {
            builder = builder
                .with(MetadataValue::Timestamp(millis))
                .with(MetadataValue::TimestampKind(TimestampKind::Create));
        }
        Timestamp::LogAppendTime(millis) if millis >= 0 => {
            builder = builder
                .with(MetadataValue::Timestamp(millis))
                .with(MetadataValue::TimestampKind(TimestampKind::LogAppend));
        }
        _ => {}
    }
    if message.offset() >= 0 {
        builder = builder.with(MetadataValue::Offset(message.offset()));
    }
    builder
        .with(MetadataValue::Headers(from_native(message.headers())))
        .build()
}

/// Kafka inbound adapter.
///
/// Wraps an already-configured [`StreamConsumer`]. The consumer must run
/// with `enable.auto.commit=false`: the committed cursor only advances when
/// an envelope is acknowledged, and an ack commits the consumer's *current*
/// position (librdkafka's batched-commit behavior), coalescing over every
/// delivered record of the assignment. No nack closure is bound — redelivery
/// is Kafka's restart-from-last-commit semantics.
///
/// Ackers share the consumer handle; invoke them from this source's
/// processing context.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
}

impl KafkaSource {
    /// Wrap an already-subscribed stream consumer.
    pub fn new(consumer: StreamConsumer) -> Self {
        Self {
            consumer: Arc::new(consumer),
        }
    }
}

#[async_trait]
impl Source<RawPayload> for KafkaSource {
    type Error = KafkaError;

    async fn envelopes(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope<RawPayload>, Self::Error>>, Self::Error> {
        let consumer = Arc::clone(&self.consumer);
        Ok(Box::pin(stream! {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = consumer.recv() => match received {
                        Ok(message) => {
                            let metadata = build_metadata(&message);
                            let payload = message.payload().unwrap_or(&[]).to_vec();
                            let commit_handle = Arc::clone(&consumer);
                            let acker = Acker::new(move || {
                                let consumer = Arc::clone(&commit_handle);
                                async move {
                                    consumer
                                        .commit_consumer_state(CommitMode::Async)
                                        .map_err(|e| AckError::rejected(Box::new(e)))
                                }
                            });
                            yield Ok(Envelope::from_parts(
                                RawPayload::from(payload),
                                metadata,
                                acker,
                            ));
                        }
                        Err(err) => yield Err(err),
                    }
                }
            }
        }))
    }
}

/// Kafka outbound adapter.
///
/// Publishes envelopes through a `FutureProducer`. The `DestinationName`,
/// `DestinationKey` and `OutboundHeaders` metadata overrides win over the
/// configured default topic; without a key override the record is sent
/// keyless.
#[derive(Clone)]
pub struct Kafka {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl Kafka {
    /// Create a new Kafka sender publishing to `topic` by default.
    ///
    /// Default timeout is 5 seconds.
    pub fn new(producer: FutureProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl<T> Sender<T> for Kafka
where
    T: ToBytes + Send + Sync,
{
    type Error = KafkaError;

    /// Send a message to Kafka.
    ///
    /// Uses the configured timeout for the send operation; a failed delivery
    /// report surfaces here and never settles the envelope's acker.
    async fn send(&mut self, envelope: Envelope<T>) -> Result<(), Self::Error> {
        let metadata = envelope.metadata();
        let topic = metadata.destination_name().unwrap_or(&self.topic);
        let payload = envelope.payload().to_bytes();

        let mut record = FutureRecord::<[u8], [u8]>::to(topic).payload(payload);
        if let Some(key) = metadata.destination_key() {
            record = record.key(key);
        }
        if let Some(headers) = metadata.outbound_headers() {
            record = record.headers(to_native(headers));
        }

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| e)?;

        Ok(())
    }
}
