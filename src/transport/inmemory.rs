use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use futures_core::stream::BoxStream;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::ack::{AckError, Acker};
use crate::headers;
use crate::metadata::{Metadata, MetadataValue};
use crate::transport::{RawPayload, Sender, Source, ToBytes};
use crate::Envelope;

/// A native record of the in-memory transport.
///
/// Field sentinels follow the wire conventions of batched-commit brokers:
/// a negative `partition`, `timestamp` or `offset` means "unknown" and is
/// translated into *absent* metadata, never into a sentinel entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryRecord {
    /// Record key, when the producer supplied one.
    pub key: Option<Vec<u8>>,
    /// Record payload bytes.
    pub payload: Vec<u8>,
    /// Partition index; negative when unknown.
    pub partition: i32,
    /// Epoch-millisecond timestamp; negative when unknown.
    pub timestamp: i64,
    /// Offset within the log; negative when unknown.
    pub offset: i64,
    /// Native headers, an ordered pair list.
    pub headers: Vec<(String, Vec<u8>)>,
}

impl InMemoryRecord {
    /// A record with the given payload and every optional field unknown.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            payload: payload.into(),
            partition: -1,
            timestamp: -1,
            offset: -1,
            headers: Vec::new(),
        }
    }

    /// Set the record key.
    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Place the record at a partition and offset.
    pub fn at(mut self, partition: i32, offset: i64) -> Self {
        self.partition = partition;
        self.offset = offset;
        self
    }

    /// Set the record timestamp, epoch milliseconds.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Append one native header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[derive(Default)]
struct LogState {
    records: Vec<InMemoryRecord>,
    delivered: usize,
    committed: Option<i64>,
    commits: usize,
    nacked: Vec<(i64, String)>,
    closed: bool,
}

struct LogInner {
    state: Mutex<LogState>,
    notify: Notify,
}

/// In-memory ordered log: the reference inbound adapter and test harness.
///
/// `InMemoryLog` models a single ordered source the way a batched-commit
/// broker partition behaves:
///
/// - Records are delivered to the stream in push order.
/// - Acknowledging a delivered record commits the log's *current* delivered
///   position, covering every earlier (and later already-delivered) record in
///   one effect — the coalesced-commit semantics a batched-commit adapter
///   must reproduce.
/// - The committed cursor never advances without an invoked ack.
/// - After [`close`](InMemoryLog::close), outstanding ackers report
///   [`AckError`] with the abandoned kind instead of silently dropping the
///   obligation; cancellation alone leaves issued ackers valid.
///
/// Ackers are handed out bound to this log and should be invoked from the
/// stream's processing context.
#[derive(Clone)]
pub struct InMemoryLog {
    name: String,
    inner: Arc<LogInner>,
}

impl InMemoryLog {
    /// Create an empty log named `name` (surfaces as `SourceName` metadata).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(LogInner {
                state: Mutex::new(LogState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Append a record to the log, waking any waiting stream.
    pub async fn push(&self, record: InMemoryRecord) {
        let mut state = self.inner.state.lock().await;
        state.records.push(record);
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Close the log: streams end after draining delivered records, and
    /// settling an outstanding acker reports abandonment.
    pub async fn close(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        drop(state);
        self.inner.notify.notify_waiters();
    }

    /// Highest offset covered by a commit, or `None` before the first one.
    pub async fn committed(&self) -> Option<i64> {
        self.inner.state.lock().await.committed
    }

    /// Number of commit effects performed against the log.
    pub async fn commits(&self) -> usize {
        self.inner.state.lock().await.commits
    }

    /// Negative acknowledgments received, as `(offset, reason)` pairs.
    pub async fn nacked(&self) -> Vec<(i64, String)> {
        self.inner.state.lock().await.nacked.clone()
    }

    fn build_metadata(&self, record: &InMemoryRecord) -> Metadata {
        let mut builder = Metadata::builder()
            .with(MetadataValue::SourceName(self.name.clone()));
        if let Some(key) = &record.key {
            builder = builder.with(MetadataValue::SourceKey(key.clone()));
        }
        if record.partition >= 0 {
            builder = builder.with(MetadataValue::Partition(record.partition));
        }
        if record.timestamp >= 0 {
            builder = builder.with(MetadataValue::Timestamp(record.timestamp));
        }
        if record.offset >= 0 {
            builder = builder.with(MetadataValue::Offset(record.offset));
        }
        builder
            .with(MetadataValue::Headers(headers::from_pairs(
                record.headers.iter().cloned(),
            )))
            .build()
    }

    fn build_acker(&self, offset: i64) -> Acker {
        let ack_inner = Arc::clone(&self.inner);
        let nack_inner = Arc::clone(&self.inner);
        Acker::with_nack(
            move || {
                let inner = Arc::clone(&ack_inner);
                async move {
                    let mut state = inner.state.lock().await;
                    if state.closed {
                        return Err(AckError::abandoned(
                            "log closed with the acknowledgment outstanding",
                        ));
                    }
                    // Coalesced commit: the current delivered position is
                    // committed, covering every delivered record at once.
                    let position = state
                        .records
                        .get(state.delivered.saturating_sub(1))
                        .map(|r| r.offset);
                    state.committed = state.committed.max(position);
                    state.commits += 1;
                    Ok(())
                }
            },
            move |reason| {
                let inner = Arc::clone(&nack_inner);
                async move {
                    let mut state = inner.state.lock().await;
                    state.nacked.push((offset, reason.to_string()));
                    Ok(())
                }
            },
        )
    }
}

#[async_trait::async_trait]
impl Source<RawPayload> for InMemoryLog {
    type Error = Infallible;

    async fn envelopes(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope<RawPayload>, Self::Error>>, Self::Error> {
        let log = self.clone();
        Ok(Box::pin(stream! {
            loop {
                let next = {
                    let mut state = log.inner.state.lock().await;
                    if state.delivered < state.records.len() {
                        let record = state.records[state.delivered].clone();
                        state.delivered += 1;
                        Some(Some(record))
                    } else if state.closed {
                        Some(None)
                    } else {
                        None
                    }
                };

                match next {
                    Some(Some(record)) => {
                        let metadata = log.build_metadata(&record);
                        let acker = log.build_acker(record.offset);
                        yield Ok(Envelope::from_parts(
                            RawPayload::from(record.payload),
                            metadata,
                            acker,
                        ));
                    }
                    Some(None) => break,
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = log.inner.notify.notified() => {}
                        }
                    }
                }
            }
        }))
    }
}

/// A record rendered by the [`InMemory`] sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecord {
    /// Resolved destination: the `DestinationName` override or the sender's
    /// default.
    pub destination: String,
    /// The `DestinationKey` override, when present.
    pub key: Option<Vec<u8>>,
    /// Native headers rendered from the `OutboundHeaders` override.
    pub headers: Vec<(String, Vec<u8>)>,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// In-memory outbound adapter for testing or local pipelines.
///
/// Renders envelopes into [`SentRecord`]s the way a broker sender renders
/// native records: the outbound metadata overrides win over the configured
/// defaults, and inbound metadata is never forwarded implicitly.
#[derive(Clone)]
pub struct InMemory {
    records: Arc<Mutex<Vec<SentRecord>>>,
    default_destination: String,
}

impl InMemory {
    /// Create a sender with the given default destination.
    pub fn new(default_destination: impl Into<String>) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            default_destination: default_destination.into(),
        }
    }

    /// All records rendered so far, in submission order.
    pub async fn sent_records(&self) -> Vec<SentRecord> {
        self.records.lock().await.clone()
    }
}

impl Default for InMemory {
    fn default() -> Self {
        Self::new("inmemory")
    }
}

#[async_trait::async_trait]
impl<T> Sender<T> for InMemory
where
    T: ToBytes + Send + Sync + 'static,
{
    type Error = std::io::Error;

    /// "Send" a message by rendering it into the in-memory record list.
    #[tracing::instrument(skip_all)]
    async fn send(&mut self, envelope: Envelope<T>) -> Result<(), Self::Error> {
        let metadata = envelope.metadata();
        let record = SentRecord {
            destination: metadata
                .destination_name()
                .unwrap_or(&self.default_destination)
                .to_owned(),
            key: metadata.destination_key().map(<[u8]>::to_vec),
            headers: headers::to_pairs(metadata.outbound_headers().unwrap_or(&[])),
            payload: envelope.payload().to_bytes().to_vec(),
        };

        tracing::info!(
            destination = %record.destination,
            bytes = record.payload.len(),
            "Message sent to in-memory transport",
        );
        self.records.lock().await.push(record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    async fn deliver(log: &mut InMemoryLog, n: usize) -> Vec<Envelope<RawPayload>> {
        let cancel = CancellationToken::new();
        let mut stream = log.envelopes(cancel).await.unwrap();
        let mut envelopes = Vec::with_capacity(n);
        for _ in 0..n {
            envelopes.push(stream.next().await.unwrap().unwrap());
        }
        envelopes
    }

    #[tokio::test]
    async fn present_fields_become_metadata_and_sentinels_stay_absent() {
        let mut log = InMemoryLog::new("orders");
        log.push(
            InMemoryRecord::new(b"a".to_vec())
                .with_key(b"42".to_vec())
                .at(3, 100)
                .with_timestamp(1_700_000_000_000),
        )
        .await;
        log.push(InMemoryRecord::new(b"b".to_vec())).await;

        let envelopes = deliver(&mut log, 2).await;

        let present = envelopes[0].metadata();
        assert_eq!(present.source_key(), Some(b"42".as_slice()));
        assert_eq!(present.partition(), Some(3));
        assert_eq!(present.offset(), Some(100));
        assert_eq!(present.timestamp(), Some(1_700_000_000_000));

        let absent = envelopes[1].metadata();
        assert_eq!(absent.source_key(), None);
        assert_eq!(absent.partition(), None);
        assert_eq!(absent.offset(), None);
        assert_eq!(absent.timestamp(), None);
        assert_eq!(absent.source_name(), Some("orders"));
    }

    #[tokio::test]
    async fn ack_commits_the_record_exactly_once() {
        let mut log = InMemoryLog::new("orders");
        log.push(
            InMemoryRecord::new(b"hello".to_vec())
                .with_key(b"42".to_vec())
                .at(3, 100),
        )
        .await;

        let envelopes = deliver(&mut log, 1).await;
        let envelope = &envelopes[0];
        assert_eq!(envelope.metadata().headers(), &[]);

        envelope.ack().await.unwrap();
        envelope.ack().await.unwrap();

        assert_eq!(log.committed().await, Some(100));
        assert_eq!(log.commits().await, 1);
    }

    #[tokio::test]
    async fn unacknowledged_records_never_advance_the_cursor() {
        let mut log = InMemoryLog::new("orders");
        for offset in 0..10 {
            log.push(InMemoryRecord::new(vec![offset as u8]).at(0, offset))
                .await;
        }

        // Manual strategy: processed but never acknowledged.
        let envelopes = deliver(&mut log, 10).await;
        assert_eq!(envelopes.len(), 10);

        assert_eq!(log.committed().await, None);
        assert_eq!(log.commits().await, 0);
    }

    #[tokio::test]
    async fn acking_an_old_record_coalesces_over_delivered_ones() {
        let mut log = InMemoryLog::new("orders");
        for offset in 0..3 {
            log.push(InMemoryRecord::new(vec![offset as u8]).at(0, offset))
                .await;
        }

        let envelopes = deliver(&mut log, 3).await;

        // Acking the first record commits the current delivered position,
        // covering the later delivered records too.
        envelopes[0].ack().await.unwrap();
        assert_eq!(log.committed().await, Some(2));
        assert_eq!(log.commits().await, 1);
    }

    #[tokio::test]
    async fn nack_is_recorded_and_never_commits() {
        let mut log = InMemoryLog::new("orders");
        log.push(InMemoryRecord::new(b"bad".to_vec()).at(0, 7)).await;

        let envelopes = deliver(&mut log, 1).await;
        envelopes[0].nack("deserialization failed").await.unwrap();

        assert_eq!(log.committed().await, None);
        let nacked = log.nacked().await;
        assert_eq!(nacked.len(), 1);
        assert_eq!(nacked[0].0, 7);
        assert!(nacked[0].1.contains("deserialization failed"));
    }

    #[tokio::test]
    async fn closing_reports_outstanding_obligations_as_abandoned() {
        let mut log = InMemoryLog::new("orders");
        log.push(InMemoryRecord::new(b"inflight".to_vec()).at(0, 0))
            .await;

        let envelopes = deliver(&mut log, 1).await;
        log.close().await;

        let err = envelopes[0].ack().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::ack::AckErrorKind::Abandoned(_)
        ));
        assert_eq!(log.committed().await, None);
    }

    #[tokio::test]
    async fn cancellation_stops_delivery_but_keeps_ackers_valid() {
        let mut log = InMemoryLog::new("orders");
        log.push(InMemoryRecord::new(b"a".to_vec()).at(0, 0)).await;

        let cancel = CancellationToken::new();
        let envelope = {
            let mut stream = log.envelopes(cancel.clone()).await.unwrap();
            let envelope = stream.next().await.unwrap().unwrap();
            cancel.cancel();
            assert!(stream.next().await.is_none());
            envelope
        };

        envelope.ack().await.unwrap();
        assert_eq!(log.committed().await, Some(0));
    }

    #[tokio::test]
    async fn sender_honors_outbound_overrides() {
        use crate::headers::Header;

        let mut sender = InMemory::new("fallback");
        sender
            .send(Envelope::new("payload".to_owned()))
            .await
            .unwrap();
        sender
            .send(
                Envelope::new("other".to_owned())
                    .with_metadata(MetadataValue::DestinationName("orders-out".to_owned()))
                    .with_metadata(MetadataValue::DestinationKey(b"42".to_vec()))
                    .with_metadata(MetadataValue::OutboundHeaders(vec![
                        Header::new("hello", "clement".as_bytes()),
                        Header::new("count", "1".as_bytes()),
                    ])),
            )
            .await
            .unwrap();

        let records = sender.sent_records().await;
        assert_eq!(records[0].destination, "fallback");
        assert_eq!(records[0].key, None);
        assert_eq!(records[0].headers, vec![]);

        assert_eq!(records[1].destination, "orders-out");
        assert_eq!(records[1].key, Some(b"42".to_vec()));
        assert_eq!(
            records[1].headers,
            vec![
                ("hello".to_owned(), b"clement".to_vec()),
                ("count".to_owned(), b"1".to_vec()),
            ]
        );
    }
}
