//! Producer-side channel handle: user code feeding envelopes into a
//! pipeline without touching a transport.
//!
//! [`channel`] returns an [`Emitter`] for pushing payloads (or whole
//! envelopes, to chain an existing acker) and an [`EmitterSource`]
//! implementing [`Source`] for the consuming pipeline. The bounded channel
//! is the backpressure seam: a full channel suspends the emitter until the
//! pipeline catches up.

use std::convert::Infallible;

use async_stream::stream;
use futures_core::stream::BoxStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::transport::Source;
use crate::Envelope;

/// Create a bounded emitter channel of the given capacity.
pub fn channel<T>(capacity: usize) -> (Emitter<T>, EmitterSource<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Emitter { tx }, EmitterSource { rx })
}

/// Sending half: hands payloads to the pipeline consuming the paired
/// [`EmitterSource`].
#[derive(Clone)]
pub struct Emitter<T> {
    tx: mpsc::Sender<Envelope<T>>,
}

impl<T> Emitter<T> {
    /// Emit a bare payload as a producer-originated envelope (empty
    /// metadata, no-op acker). Suspends while the channel is full.
    pub async fn send(&self, payload: T) -> Result<(), EmitterError> {
        self.send_envelope(Envelope::new(payload)).await
    }

    /// Emit a pre-built envelope, e.g. one derived from an inbound message
    /// to chain its acknowledgment. Suspends while the channel is full.
    pub async fn send_envelope(&self, envelope: Envelope<T>) -> Result<(), EmitterError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| EmitterError::closed())
    }
}

/// Error returned when emitting into a closed channel.
#[derive(Debug)]
pub struct EmitterError {
    context: SpanTrace,
}

impl EmitterError {
    fn closed() -> Self {
        Self {
            context: SpanTrace::capture(),
        }
    }
}

impl std::fmt::Display for EmitterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Emitter channel closed: the consuming source was dropped")?;
        self.context.fmt(f)
    }
}

impl std::error::Error for EmitterError {}

/// Receiving half: a [`Source`] yielding emitted envelopes in send order.
pub struct EmitterSource<T> {
    rx: mpsc::Receiver<Envelope<T>>,
}

#[async_trait::async_trait]
impl<T: Send> Source<T> for EmitterSource<T> {
    type Error = Infallible;

    async fn envelopes(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope<T>, Self::Error>>, Self::Error> {
        let rx = &mut self.rx;
        Ok(Box::pin(stream! {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    envelope = rx.recv() => match envelope {
                        Some(envelope) => yield Ok(envelope),
                        None => break,
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt as _;

    #[tokio::test]
    async fn emitted_payloads_arrive_in_order() {
        let (emitter, mut source) = channel(8);
        emitter.send("first".to_owned()).await.unwrap();
        emitter.send("second".to_owned()).await.unwrap();
        drop(emitter);

        let cancel = CancellationToken::new();
        let mut stream = source.envelopes(cancel).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.payload(), "first");
        assert_eq!(second.payload(), "second");
        // All emitters dropped: the stream ends.
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn sending_into_a_dropped_source_fails() {
        let (emitter, source) = channel::<u8>(1);
        drop(source);

        assert!(emitter.send(1).await.is_err());
    }

    #[tokio::test]
    async fn cancellation_stops_the_stream() {
        let (_emitter, mut source) = channel::<u8>(1);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = source.envelopes(cancel).await.unwrap();
        assert!(stream.next().await.is_none());
    }
}
