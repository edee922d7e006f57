//! Pipeline assembly: explicit channel construction and strategy-driven
//! acknowledgment.
//!
//! A [`Pipeline`] binds a named channel to a [`Source`] and an
//! acknowledgment [`Strategy`], then drives envelopes through a handler:
//!
//! - [`run`](Pipeline::run) is the terminal consumer — the handler fully
//!   processes each envelope.
//! - [`forward`](Pipeline::forward) is the processor shape — the handler may
//!   derive an outbound envelope, which is submitted through a
//!   [`Transport`]; the envelope's acker (shared with the inbound one when
//!   derived) is chained to fire only after submission succeeds, never on
//!   failure.
//!
//! Channels are assembled by direct construction (or from a
//! [`ChannelConfig`]); there is no discovery or implicit wiring. The loop
//! runs until the source ends, a fatal error occurs, or the
//! [`CancellationToken`] is triggered.
//!
//! Per-message handler failures are absorbed: under the automatic strategy
//! the envelope is nacked with the handler's error and the loop continues,
//! leaving redelivery to the transport. Source errors, submission errors and
//! settlement errors are fatal to the run.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::ack::{AckError, Strategy};
use crate::metadata::Metadata;
use crate::transport::{Source, Transport, TransportError};
use crate::Envelope;

/// Declarative description of one named channel.
///
/// Deserializable so channel wiring can live in configuration; the caller
/// still constructs the source and pipeline explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name, used in lifecycle hooks and logs.
    pub name: String,
    /// How the pipeline settles envelopes on behalf of the handler.
    pub strategy: Strategy,
    /// Buffer capacity for channel-backed sources (e.g. the emitter).
    #[serde(default = "ChannelConfig::default_capacity")]
    pub capacity: usize,
}

impl ChannelConfig {
    fn default_capacity() -> usize {
        16
    }
}

/// A named processing channel: source + acknowledgment strategy + hooks.
///
/// Generic parameters:
/// - `S`: Source implementation
/// - `HK`: Hook implementation for lifecycle events
pub struct Pipeline<S, HK = DefaultPipelineHook> {
    channel: String,
    source: S,
    strategy: Strategy,
    hook: HK,
}

impl<S> Pipeline<S, DefaultPipelineHook> {
    /// Bind a source to a named channel with the given strategy.
    pub fn new(channel: impl Into<String>, source: S, strategy: Strategy) -> Self {
        Self {
            channel: channel.into(),
            source,
            strategy,
            hook: DefaultPipelineHook,
        }
    }

    /// Bind a source using a [`ChannelConfig`] for name and strategy.
    pub fn from_config(config: &ChannelConfig, source: S) -> Self {
        Self::new(config.name.clone(), source, config.strategy)
    }
}

impl<S, HK> Pipeline<S, HK> {
    /// Replace the pipeline hook while keeping all other generics unchanged.
    ///
    /// This allows customizing behavior (logging, metrics, test signals)
    /// without rebuilding the pipeline.
    pub fn with_hook<HK2: PipelineHook>(self, hook: HK2) -> Pipeline<S, HK2> {
        Pipeline {
            channel: self.channel,
            source: self.source,
            strategy: self.strategy,
            hook,
        }
    }
}

impl<S, HK> Pipeline<S, HK>
where
    HK: PipelineHook,
{
    /// Run the pipeline as a terminal consumer.
    ///
    /// Each envelope is handed to `handler`. Under [`Strategy::Automatic`]
    /// the envelope is acknowledged when the handler returns `Ok` and
    /// negatively acknowledged with the handler's error otherwise; under
    /// [`Strategy::Manual`] and [`Strategy::None`] the pipeline never
    /// settles envelopes.
    #[tracing::instrument(skip_all, fields(channel = %self.channel))]
    pub async fn run<T, F, Fut>(
        mut self,
        mut handler: F,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>
    where
        S: Source<T> + Send,
        F: FnMut(Envelope<T>) -> Fut,
        Fut: Future<Output = Result<(), tower::BoxError>>,
    {
        self.hook.on_startup(&self.channel);
        let strategy = self.strategy;

        let mut stream = self
            .source
            .envelopes(cancel.clone())
            .await
            .map_err(|e| PipelineError::source(e.into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown(&self.channel);
                    break;
                }
                envelope = stream.next() => {
                    match envelope {
                        Some(Ok(envelope)) => {
                            self.hook.on_envelope(envelope.metadata());
                            let metadata = envelope.metadata().clone();
                            let acker = envelope.acker().clone();

                            match handler(envelope).await {
                                Ok(()) => {
                                    if strategy == Strategy::Automatic {
                                        acker.ack().await.map_err(PipelineError::ack)?;
                                        self.hook.on_settled(&metadata);
                                    }
                                }
                                Err(err) => {
                                    self.hook.on_handler_error(err.as_ref());
                                    if strategy == Strategy::Automatic {
                                        acker.nack(err).await.map_err(PipelineError::ack)?;
                                        self.hook.on_settled(&metadata);
                                    }
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let err = err.into();
                            self.hook.on_source_error(err.as_ref());
                            return Err(PipelineError::source(err));
                        }
                        None => {
                            self.hook.on_source_end(&self.channel);
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Run the pipeline as a processor feeding an outbound transport.
    ///
    /// `handler` may return a derived envelope (commonly via
    /// [`Envelope::with_payload`], preserving the inbound acker) or `None`
    /// to filter the message out. Returned envelopes are submitted through
    /// `transport`; under [`Strategy::Automatic`] the outbound envelope's
    /// acker is chained to fire only after submission succeeds, and a failed
    /// submission aborts the run without settling it.
    #[tracing::instrument(skip_all, fields(channel = %self.channel))]
    pub async fn forward<T, U, F, Fut, Svc>(
        mut self,
        mut handler: F,
        mut transport: Transport<Svc>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError>
    where
        S: Source<T> + Send,
        U: Send + 'static,
        F: FnMut(Envelope<T>) -> Fut,
        Fut: Future<Output = Result<Option<Envelope<U>>, tower::BoxError>>,
        Svc: Service<Envelope<U>> + Clone + Send + 'static,
        Svc::Future: Send + 'static,
        Svc::Error: Into<tower::BoxError>,
    {
        self.hook.on_startup(&self.channel);
        let strategy = self.strategy;

        let mut stream = self
            .source
            .envelopes(cancel.clone())
            .await
            .map_err(|e| PipelineError::source(e.into()))?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown(&self.channel);
                    break;
                }
                envelope = stream.next() => {
                    match envelope {
                        Some(Ok(envelope)) => {
                            self.hook.on_envelope(envelope.metadata());
                            let inbound_acker = envelope.acker().clone();
                            let inbound_metadata = envelope.metadata().clone();

                            match handler(envelope).await {
                                Ok(Some(outbound)) => {
                                    let chained = outbound.acker().clone();
                                    let metadata = outbound.metadata().clone();

                                    match transport.send(outbound).await {
                                        Ok(()) => {
                                            self.hook.on_delivered(&metadata);
                                            if strategy == Strategy::Automatic {
                                                chained.ack().await.map_err(PipelineError::ack)?;
                                                self.hook.on_settled(&metadata);
                                            }
                                        }
                                        Err(err) => {
                                            self.hook.on_transport_send_error(&err);
                                            return Err(PipelineError::transport(err));
                                        }
                                    }
                                }
                                Ok(None) => {
                                    if strategy == Strategy::Automatic {
                                        inbound_acker.ack().await.map_err(PipelineError::ack)?;
                                        self.hook.on_settled(&inbound_metadata);
                                    }
                                }
                                Err(err) => {
                                    self.hook.on_handler_error(err.as_ref());
                                    if strategy == Strategy::Automatic {
                                        inbound_acker
                                            .nack(err)
                                            .await
                                            .map_err(PipelineError::ack)?;
                                        self.hook.on_settled(&inbound_metadata);
                                    }
                                }
                            }
                        }
                        Some(Err(err)) => {
                            let err = err.into();
                            self.hook.on_source_error(err.as_ref());
                            return Err(PipelineError::source(err));
                        }
                        None => {
                            self.hook.on_source_end(&self.channel);
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Error returned when the pipeline loop fails.
#[derive(Debug)]
pub struct PipelineError {
    context: tracing_error::SpanTrace,
    kind: PipelineErrorKind,
}

impl PipelineError {
    fn source(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PipelineErrorKind::Source(error),
        }
    }

    fn transport(error: TransportError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PipelineErrorKind::Transport(error),
        }
    }

    fn ack(error: AckError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PipelineErrorKind::Ack(error),
        }
    }

    /// Classification of the failure.
    pub fn kind(&self) -> &PipelineErrorKind {
        &self.kind
    }
}

/// Classification of pipeline runtime errors.
#[derive(Debug)]
pub enum PipelineErrorKind {
    /// Errors originating from the inbound source.
    Source(tower::BoxError),
    /// Errors originating from the outbound transport.
    Transport(TransportError),
    /// Errors settling an envelope.
    Ack(AckError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PipelineErrorKind::Source(err) => writeln!(f, "Source error: {err}"),
            PipelineErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
            PipelineErrorKind::Ack(err) => writeln!(f, "Acknowledgment error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PipelineErrorKind::Source(err) => Some(err.as_ref()),
            PipelineErrorKind::Transport(err) => Some(err),
            PipelineErrorKind::Ack(err) => Some(err),
        }
    }
}

impl From<TransportError> for PipelineError {
    fn from(err: TransportError) -> Self {
        PipelineError::transport(err)
    }
}

/// Hook trait for observing pipeline lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait PipelineHook: Send + Sync {
    fn on_startup(&self, channel: &str);
    fn on_shutdown(&self, channel: &str);
    fn on_envelope(&self, metadata: &Metadata);
    fn on_handler_error(&self, error: &dyn std::error::Error);
    fn on_source_error(&self, error: &dyn std::error::Error);
    fn on_transport_send_error(&self, error: &dyn std::error::Error);
    fn on_delivered(&self, metadata: &Metadata);
    fn on_settled(&self, metadata: &Metadata);
    fn on_source_end(&self, channel: &str);
}

/// Default pipeline hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultPipelineHook;

impl PipelineHook for DefaultPipelineHook {
    fn on_startup(&self, channel: &str) {
        tracing::info!(channel, "Pipeline is starting up");
    }

    fn on_shutdown(&self, channel: &str) {
        tracing::info!(channel, "Pipeline is shutting down");
    }

    fn on_envelope(&self, metadata: &Metadata) {
        tracing::debug!(offset = metadata.offset(), "Envelope received");
    }

    fn on_handler_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Handler failed to process envelope");
    }

    fn on_source_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error receiving envelope");
    }

    fn on_transport_send_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Error submitting envelope");
    }

    fn on_delivered(&self, metadata: &Metadata) {
        tracing::info!(
            destination = metadata.destination_name(),
            "Envelope delivered successfully",
        );
    }

    fn on_settled(&self, metadata: &Metadata) {
        tracing::debug!(offset = metadata.offset(), "Envelope settled");
    }

    fn on_source_end(&self, channel: &str) {
        tracing::info!(channel, "Source stream ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::ack::Acker;
    use crate::emitter;
    use crate::metadata::MetadataValue;
    use crate::transport::{InMemory, InMemoryLog, InMemoryRecord, RawPayload, Sender};

    fn counting_acker(acks: Arc<AtomicUsize>, nacks: Arc<AtomicUsize>) -> Acker {
        Acker::with_nack(
            move || {
                let acks = acks.clone();
                async move {
                    acks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            move |_reason| {
                let nacks = nacks.clone();
                async move {
                    nacks.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
    }

    #[tokio::test]
    async fn automatic_strategy_acks_after_successful_handling() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));

        let (emitter, source) = emitter::channel(8);
        for n in 0..2 {
            emitter
                .send_envelope(
                    Envelope::new(n).with_acker(counting_acker(acks.clone(), nacks.clone())),
                )
                .await
                .unwrap();
        }
        drop(emitter);

        Pipeline::new("numbers", source, Strategy::Automatic)
            .run(
                |_envelope: Envelope<i32>| async move { Ok(()) },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 2);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn automatic_strategy_nacks_on_handler_failure_and_continues() {
        let acks = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));

        let (emitter, source) = emitter::channel(8);
        for n in 0..3 {
            emitter
                .send_envelope(
                    Envelope::new(n).with_acker(counting_acker(acks.clone(), nacks.clone())),
                )
                .await
                .unwrap();
        }
        drop(emitter);

        Pipeline::new("numbers", source, Strategy::Automatic)
            .run(
                |envelope: Envelope<i32>| async move {
                    if *envelope.payload() == 1 {
                        Err("odd one out".into())
                    } else {
                        Ok(())
                    }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 2);
        assert_eq!(nacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_strategy_never_advances_the_cursor() {
        let log = InMemoryLog::new("orders");
        for offset in 0..10 {
            log.push(InMemoryRecord::new(vec![offset as u8]).at(0, offset))
                .await;
        }
        log.close().await;

        let processed = Arc::new(AtomicUsize::new(0));
        let seen = processed.clone();
        Pipeline::new("orders", log.clone(), Strategy::Manual)
            .run(
                move |_envelope: Envelope<RawPayload>| {
                    let seen = seen.clone();
                    async move {
                        seen.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(processed.load(Ordering::SeqCst), 10);
        assert_eq!(log.committed().await, None);
        assert_eq!(log.commits().await, 0);
    }

    struct SettledSignal(tokio::sync::mpsc::UnboundedSender<()>);

    impl PipelineHook for SettledSignal {
        fn on_startup(&self, _channel: &str) {}
        fn on_shutdown(&self, _channel: &str) {}
        fn on_envelope(&self, _metadata: &Metadata) {}
        fn on_handler_error(&self, _error: &dyn std::error::Error) {}
        fn on_source_error(&self, _error: &dyn std::error::Error) {}
        fn on_transport_send_error(&self, _error: &dyn std::error::Error) {}
        fn on_delivered(&self, _metadata: &Metadata) {}
        fn on_settled(&self, _metadata: &Metadata) {
            let _ = self.0.send(());
        }
        fn on_source_end(&self, _channel: &str) {}
    }

    #[tokio::test]
    async fn forward_chains_the_inbound_ack_after_submission() {
        let log = InMemoryLog::new("orders");
        log.push(
            InMemoryRecord::new(b"42".to_vec())
                .at(3, 100)
                .with_header("hello", b"clement".to_vec())
                .with_header("count", b"1".to_vec()),
        )
        .await;

        let sender = InMemory::new("orders-out");
        let transport = Transport::new(sender.clone());
        let (settled_tx, mut settled_rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let log = log.clone();
            let cancel = cancel.clone();
            async move {
                Pipeline::new("orders", log, Strategy::Automatic)
                    .with_hook(SettledSignal(settled_tx))
                    .forward(
                        |envelope: Envelope<RawPayload>| async move {
                            let key = envelope.payload().as_bytes().to_vec();
                            let headers = envelope.metadata().headers().to_vec();
                            Ok(Some(
                                envelope
                                    .with_metadata(MetadataValue::DestinationKey(key))
                                    .with_metadata(MetadataValue::OutboundHeaders(headers)),
                            ))
                        },
                        transport,
                        cancel,
                    )
                    .await
            }
        });

        settled_rx.recv().await.unwrap();

        let records = sender.sent_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].destination, "orders-out");
        assert_eq!(records[0].key, Some(b"42".to_vec()));
        assert_eq!(
            records[0].headers,
            vec![
                ("hello".to_owned(), b"clement".to_vec()),
                ("count".to_owned(), b"1".to_vec()),
            ]
        );

        // The inbound obligation was settled through the derived envelope.
        assert_eq!(log.commits().await, 1);
        assert_eq!(log.committed().await, Some(100));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[derive(Clone)]
    struct FailingSender;

    #[async_trait::async_trait]
    impl<T: Send + 'static> Sender<T> for FailingSender {
        type Error = std::io::Error;

        async fn send(&mut self, _envelope: Envelope<T>) -> Result<(), Self::Error> {
            Err(std::io::Error::other("broker unavailable"))
        }
    }

    #[tokio::test]
    async fn failed_submission_is_fatal_and_never_chains_the_ack() {
        let log = InMemoryLog::new("orders");
        log.push(InMemoryRecord::new(b"a".to_vec()).at(0, 0)).await;

        let err = Pipeline::new("orders", log.clone(), Strategy::Automatic)
            .forward(
                |envelope: Envelope<RawPayload>| async move { Ok(Some(envelope)) },
                Transport::new(FailingSender),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err.kind(), PipelineErrorKind::Transport(_)));
        assert_eq!(log.commits().await, 0);
        assert_eq!(log.committed().await, None);
    }

    #[tokio::test]
    async fn forward_acks_filtered_messages() {
        let log = InMemoryLog::new("orders");
        log.push(InMemoryRecord::new(b"skip".to_vec()).at(0, 5)).await;

        let sender = InMemory::default();
        let (settled_tx, mut settled_rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let log = log.clone();
            let cancel = cancel.clone();
            let transport = Transport::new(sender.clone());
            async move {
                Pipeline::new("orders", log, Strategy::Automatic)
                    .with_hook(SettledSignal(settled_tx))
                    .forward(
                        |_envelope: Envelope<RawPayload>| async move {
                            Ok(None::<Envelope<RawPayload>>)
                        },
                        transport,
                        cancel,
                    )
                    .await
            }
        });

        settled_rx.recv().await.unwrap();
        assert!(sender.sent_records().await.is_empty());
        assert_eq!(log.committed().await, Some(5));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn channel_config_deserializes_with_default_capacity() {
        let config: ChannelConfig =
            serde_json::from_str(r#"{"name": "orders", "strategy": "manual"}"#).unwrap();
        assert_eq!(config.name, "orders");
        assert_eq!(config.strategy, Strategy::Manual);
        assert_eq!(config.capacity, 16);
    }
}
