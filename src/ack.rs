//! Acknowledgment protocol: the deferred completion capability carried by
//! every envelope, and the strategies a pipeline applies on behalf of its
//! handlers.
//!
//! ## The capability
//!
//! An [`Acker`] is a capability, not a value: it wraps a closure bound at
//! envelope-construction time to a specific consumption handle (a consumer
//! to commit on, a delivery to settle, a reply slot to fill). Invoking it a
//! second time must not produce a second transport-level completion — a
//! shared once-guard lets at most one settlement attempt proceed, across
//! every clone and derived envelope. Later calls resolve immediately with
//! `Ok(())` and no effect.
//!
//! The effect of a failed attempt stays failed: the result surfaces through
//! the returned future as an [`AckError`] and the acker never retries
//! internally. Retry, if any, belongs to the pipeline or to the closure the
//! adapter installed.
//!
//! ## Contract for adapters
//!
//! Whatever [`Strategy`] a stage selects, an adapter must uphold two rules
//! for each ordered source it consumes:
//!
//! - **No ghost acknowledgment.** The transport's cursor never advances past
//!   a record whose `ack` was not invoked. Delivering a record is not
//!   acknowledging it.
//! - **Coalescing is legal, reordering is not.** On a batched-commit
//!   transport, acking any delivered record may commit the source's current
//!   consumed position, thereby covering earlier *and later already
//!   delivered* records in one effect. A commit triggered by record N must
//!   never land before the effects of record N-1's commit when both were
//!   destined to be acknowledged; a single covering commit satisfies both.
//!
//! The consumption handle captured by an acker is not assumed safe for
//! unsynchronized concurrent invocation; invoke a source's ackers from that
//! source's own processing context.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

/// Future returned by acknowledgment and negative-acknowledgment calls.
///
/// Completes when the transport-level effect is durably recorded, or
/// immediately for transports with no durable completion concept.
pub type AckFuture = Pin<Box<dyn Future<Output = Result<(), AckError>> + Send>>;

/// How a processing stage settles the envelopes it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// The pipeline acks an envelope as soon as its handler returns
    /// successfully, and nacks it with the handler's error on failure.
    Automatic,
    /// The pipeline never settles envelopes; only user code holding the
    /// envelope (or an acker cloned from it) may. Required for at-least-once
    /// delivery to progress.
    Manual,
    /// Acknowledgment is suppressed entirely. For fire-and-forget sources.
    None,
}

/// Error produced when a settlement attempt cannot complete.
#[derive(Debug)]
pub struct AckError {
    context: SpanTrace,
    kind: AckErrorKind,
}

/// Why a settlement attempt failed.
#[derive(Debug)]
pub enum AckErrorKind {
    /// The transport refused the completion (commit rejected, channel gone).
    Rejected(tower::BoxError),
    /// The source was torn down while the obligation was still outstanding.
    Abandoned(String),
}

impl AckError {
    /// The transport refused the completion.
    pub fn rejected(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: AckErrorKind::Rejected(err),
        }
    }

    /// The obligation was abandoned before it could complete.
    pub fn abandoned(detail: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: AckErrorKind::Abandoned(detail.into()),
        }
    }

    /// The failure kind.
    pub fn kind(&self) -> &AckErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for AckError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AckErrorKind::Rejected(err) => writeln!(f, "Acknowledgment rejected: {err}"),
            AckErrorKind::Abandoned(detail) => {
                writeln!(f, "Acknowledgment abandoned: {detail}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for AckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            AckErrorKind::Rejected(err) => Some(err.as_ref()),
            AckErrorKind::Abandoned(_) => None,
        }
    }
}

struct AckerInner {
    settled: AtomicBool,
    ack: Box<dyn Fn() -> AckFuture + Send + Sync>,
    nack: Option<Box<dyn Fn(tower::BoxError) -> AckFuture + Send + Sync>>,
}

/// Shared, once-guarded settlement capability.
///
/// Cloning an `Acker` (directly or by deriving an envelope) shares the
/// guard: whichever clone settles first wins, every other call is a no-op.
/// This is what makes the manual chaining idiom safe — an outbound envelope
/// carrying its inbound envelope's acker can be acknowledged by the
/// transport adapter while an automatic stage acks the inbound one, and the
/// source still sees a single commit.
#[derive(Clone)]
pub struct Acker(Arc<AckerInner>);

impl Acker {
    /// An acker whose settlement has no transport effect.
    ///
    /// Used for producer-originated envelopes and fire-and-forget sources.
    pub fn noop() -> Self {
        Self::new(|| std::future::ready(Ok(())))
    }

    /// Bind an acknowledgment closure. Negative acknowledgment defaults to
    /// the transport-defined no-op (redelivery stays with the transport's
    /// timeout/retry policy).
    pub fn new<F, Fut>(ack: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AckError>> + Send + 'static,
    {
        Self(Arc::new(AckerInner {
            settled: AtomicBool::new(false),
            ack: Box::new(move || -> AckFuture { Box::pin(ack()) }),
            nack: None,
        }))
    }

    /// Bind both an acknowledgment and a negative-acknowledgment closure.
    pub fn with_nack<A, AFut, N, NFut>(ack: A, nack: N) -> Self
    where
        A: Fn() -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<(), AckError>> + Send + 'static,
        N: Fn(tower::BoxError) -> NFut + Send + Sync + 'static,
        NFut: Future<Output = Result<(), AckError>> + Send + 'static,
    {
        Self(Arc::new(AckerInner {
            settled: AtomicBool::new(false),
            ack: Box::new(move || -> AckFuture { Box::pin(ack()) }),
            nack: Some(Box::new(move |reason| -> AckFuture {
                Box::pin(nack(reason))
            })),
        }))
    }

    /// Acknowledge.
    ///
    /// The first call across all clones runs the bound closure and returns
    /// its outcome; later calls resolve immediately with `Ok(())` and no
    /// transport effect, regardless of whether the first attempt succeeded.
    pub async fn ack(&self) -> Result<(), AckError> {
        if self.0.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        (self.0.ack)().await
    }

    /// Negatively acknowledge with a failure reason.
    ///
    /// Settles the capability even when no negative closure was bound, so a
    /// later `ack` cannot commit a record whose processing already failed.
    pub async fn nack(&self, reason: impl Into<tower::BoxError>) -> Result<(), AckError> {
        if self.0.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match &self.0.nack {
            Some(nack) => nack(reason.into()).await,
            None => Ok(()),
        }
    }

    /// True once an ack or nack attempt has been made.
    pub fn is_settled(&self) -> bool {
        self.0.settled.load(Ordering::SeqCst)
    }
}

impl Default for Acker {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acker")
            .field("settled", &self.is_settled())
            .field("has_nack", &self.0.nack.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

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
    async fn second_ack_produces_no_second_effect() {
        let commits = Arc::new(AtomicUsize::new(0));
        let acker = counting_acker(commits.clone());

        acker.ack().await.unwrap();
        acker.ack().await.unwrap();

        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clones_share_the_settlement_guard() {
        let commits = Arc::new(AtomicUsize::new(0));
        let acker = counting_acker(commits.clone());
        let chained = acker.clone();

        chained.ack().await.unwrap();
        acker.ack().await.unwrap();

        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert!(acker.is_settled());
    }

    #[tokio::test]
    async fn nack_after_ack_is_a_no_op() {
        let commits = Arc::new(AtomicUsize::new(0));
        let nacks = Arc::new(AtomicUsize::new(0));
        let acker = {
            let commits = commits.clone();
            let nacks = nacks.clone();
            Acker::with_nack(
                move || {
                    let commits = commits.clone();
                    async move {
                        commits.fetch_add(1, Ordering::SeqCst);
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
        };

        acker.ack().await.unwrap();
        acker.nack("too late").await.unwrap();

        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(nacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn nack_without_closure_settles_and_blocks_later_ack() {
        let commits = Arc::new(AtomicUsize::new(0));
        let acker = counting_acker(commits.clone());

        acker.nack("boom").await.unwrap();
        acker.ack().await.unwrap();

        assert_eq!(commits.load(Ordering::SeqCst), 0);
        assert!(acker.is_settled());
    }

    #[tokio::test]
    async fn failed_attempt_surfaces_and_is_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let acker = {
            let attempts = attempts.clone();
            Acker::new(move || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(AckError::rejected("commit refused".into()))
                }
            })
        };

        let err = acker.ack().await.unwrap_err();
        assert!(matches!(err.kind(), AckErrorKind::Rejected(_)));

        // The attempt already proceeded; a retry never fires implicitly.
        acker.ack().await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
