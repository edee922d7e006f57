//! AMQP connector adapter.
//!
//! Inbound, [`AmqpSource`] consumes `lapin` deliveries and yields envelopes
//! whose ackers settle the delivery individually (`basic_ack`, or
//! `basic_nack` with requeue on negative acknowledgment — AMQP's native
//! per-message model, so no commit coalescing happens here). Outbound,
//! [`Amqp`] publishes envelopes to an exchange and awaits the publisher
//! confirm. Connection and channel construction stay with the caller.
//!
//! AMQP field tables are map-shaped: rendering the canonical header list
//! into a table collapses duplicate keys, last one wins. Translation back
//! preserves whatever the table holds, in its iteration order.

use std::sync::Arc;

use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::BasicProperties;
use tokio::sync::Mutex;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;

use crate::ack::{AckError, Acker};
use crate::headers::Header;
use crate::metadata::{Metadata, MetadataValue};
use crate::transport::{RawPayload, Sender, Source, ToBytes};
use crate::Envelope;

/// Translate a native field table into the canonical header list.
///
/// An absent table yields an empty list. Only byte-shaped values
/// (long strings, byte arrays) are translated; a value of any other type is
/// dropped with a warning rather than failing the message.
pub fn from_native(table: Option<&FieldTable>) -> Vec<Header> {
    let Some(table) = table else {
        return Vec::new();
    };
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(s) => Some(Header::new(key.as_str(), s.as_bytes().to_vec())),
            AMQPValue::ByteArray(a) => Some(Header::new(key.as_str(), a.as_slice().to_vec())),
            other => {
                tracing::warn!(
                    key = key.as_str(),
                    value_type = ?other,
                    "Dropping AMQP header with untranslatable value type",
                );
                None
            }
        })
        .collect()
}

/// Render the canonical header list into a native field table.
///
/// Field tables cannot hold duplicate keys; later entries win.
pub fn to_native(headers: &[Header]) -> FieldTable {
    let mut table = FieldTable::default();
    for header in headers {
        table.insert(
            ShortString::from(header.key.clone()),
            AMQPValue::LongString(header.value.clone().into()),
        );
    }
    table
}

fn build_metadata(delivery: &lapin::message::Delivery) -> Metadata {
    let mut builder = Metadata::builder()
        .with(MetadataValue::SourceName(
            delivery.routing_key.as_str().to_owned(),
        ))
        .with(MetadataValue::Redelivered(delivery.redelivered));
    if let Some(correlation_id) = delivery.properties.correlation_id() {
        builder = builder.with(MetadataValue::SourceKey(
            correlation_id.as_str().as_bytes().to_vec(),
        ));
    }
    if let Some(timestamp) = delivery.properties.timestamp() {
        // AMQP timestamps are epoch seconds.
        builder = builder.with(MetadataValue::Timestamp(*timestamp as i64 * 1000));
    }
    if delivery.delivery_tag > 0 {
        builder = builder.with(MetadataValue::Offset(delivery.delivery_tag as i64));
    }
    builder
        .with(MetadataValue::Headers(from_native(
            delivery.properties.headers().as_ref(),
        )))
        .build()
}

/// AMQP inbound adapter.
///
/// Wraps an already-created [`lapin::Consumer`]. Each envelope's acker
/// settles its own delivery: ack maps to `basic_ack`, nack to `basic_nack`
/// with requeue, leaving redelivery to the broker. Ackers share the
/// consumer's channel; invoke them from this source's processing context.
pub struct AmqpSource {
    consumer: lapin::Consumer,
}

impl AmqpSource {
    /// Wrap an already-subscribed consumer.
    pub fn new(consumer: lapin::Consumer) -> Self {
        Self { consumer }
    }
}

#[async_trait]
impl Source<RawPayload> for AmqpSource {
    type Error = lapin::Error;

    async fn envelopes(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope<RawPayload>, Self::Error>>, Self::Error> {
        let consumer = &mut self.consumer;
        Ok(Box::pin(stream! {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    delivered = consumer.next() => match delivered {
                        Some(Ok(delivery)) => {
                            let metadata = build_metadata(&delivery);
                            let payload = delivery.data.clone();
                            let settle = Arc::new(delivery.acker);
                            let ack_handle = Arc::clone(&settle);
                            let acker = Acker::with_nack(
                                move || {
                                    let settle = Arc::clone(&ack_handle);
                                    async move {
                                        settle
                                            .ack(BasicAckOptions::default())
                                            .await
                                            .map_err(|e| AckError::rejected(Box::new(e)))
                                    }
                                },
                                move |reason| {
                                    let settle = Arc::clone(&settle);
                                    async move {
                                        tracing::debug!(%reason, "Requeueing AMQP delivery");
                                        settle
                                            .nack(BasicNackOptions {
                                                multiple: false,
                                                requeue: true,
                                            })
                                            .await
                                            .map_err(|e| AckError::rejected(Box::new(e)))
                                    }
                                },
                            );
                            yield Ok(Envelope::from_parts(
                                RawPayload::from(payload),
                                metadata,
                                acker,
                            ));
                        }
                        Some(Err(err)) => yield Err(err),
                        None => break,
                    }
                }
            }
        }))
    }
}

/// AMQP outbound adapter.
///
/// Publishes envelopes to a single exchange using a shared
/// `lapin::Channel`. The `DestinationName` override selects the routing key;
/// `OutboundHeaders` are rendered into the message's field table.
///
/// The channel is wrapped in `Arc<Mutex<_>>` because:
/// - `lapin::Channel` is not `Sync`
/// - `Sender::send` is async and may be called concurrently
#[derive(Clone)]
pub struct Amqp {
    /// Shared AMQP channel used for publishing.
    channel: Arc<Mutex<lapin::Channel>>,
    /// Target exchange name.
    exchange: String,
    /// Default routing key when no destination override is present.
    routing_key: String,
}

impl Amqp {
    /// Create a sender publishing to `exchange` with `routing_key` by
    /// default.
    pub fn new(
        channel: lapin::Channel,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl<T> Sender<T> for Amqp
where
    T: ToBytes + Send + Sync,
{
    type Error = lapin::Error;

    /// Publish a message to the exchange.
    ///
    /// The call waits for both:
    /// - the publish to be sent
    /// - the broker confirmation (publisher confirms)
    async fn send(&mut self, envelope: Envelope<T>) -> Result<(), Self::Error> {
        let metadata = envelope.metadata();
        let routing_key = metadata.destination_name().unwrap_or(&self.routing_key);
        let properties = match metadata.outbound_headers() {
            Some(headers) => BasicProperties::default().with_headers(to_native(headers)),
            None => BasicProperties::default(),
        };

        let channel = self.channel.lock().await;
        channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                envelope.payload().to_bytes(),
                properties,
            )
            .await?
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_shaped_values_translate_and_others_are_dropped() {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from("hello"),
            AMQPValue::LongString(b"clement".to_vec().into()),
        );
        table.insert(
            ShortString::from("count"),
            AMQPValue::ByteArray(b"1".to_vec().into()),
        );
        table.insert(ShortString::from("flag"), AMQPValue::Boolean(true));

        let translated = from_native(Some(&table));
        assert_eq!(translated.len(), 2);
        assert!(translated.contains(&Header::new("hello", b"clement".to_vec())));
        assert!(translated.contains(&Header::new("count", b"1".to_vec())));
    }

    #[test]
    fn absent_table_yields_an_empty_list() {
        assert_eq!(from_native(None), Vec::<Header>::new());
    }

    #[test]
    fn rendering_collapses_duplicates_last_wins() {
        let headers = vec![
            Header::new("hello", b"clement".to_vec()),
            Header::new("hello", b"again".to_vec()),
        ];

        let table = to_native(&headers);
        let translated = from_native(Some(&table));
        assert_eq!(translated, vec![Header::new("hello", b"again".to_vec())]);
    }

    #[test]
    fn distinct_keys_round_trip_through_the_table() {
        let headers = vec![
            Header::new("a", b"1".to_vec()),
            Header::new("b", b"2".to_vec()),
        ];

        let mut translated = from_native(Some(&to_native(&headers)));
        translated.sort_by(|l, r| l.key.cmp(&r.key));
        assert_eq!(translated, headers);
    }
}
