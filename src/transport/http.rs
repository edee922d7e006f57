//! HTTP connector adapter.
//!
//! Inbound, [`HttpSource`] turns request/reply exchanges into envelopes:
//! whatever server glue the user runs pushes an [`HttpExchange`] per request
//! and holds the paired reply receiver; acknowledging the envelope
//! dispatches the success reply, negative acknowledgment the failure reply.
//! Server construction itself stays outside the crate.
//!
//! Outbound, [`Http`] submits payload bytes through an already-built
//! `reqwest` client, honoring the `DestinationName` (URL) and
//! `OutboundHeaders` overrides plus the `http.method` extension entry.

use std::sync::{Arc, Mutex, PoisonError};

use async_stream::stream;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ack::{AckError, Acker};
use crate::headers::Header;
use crate::metadata::{Metadata, MetadataValue};
use crate::transport::{RawPayload, Sender, Source, ToBytes};
use crate::Envelope;

/// Metadata extension entry naming the HTTP method.
pub const METHOD_EXTENSION: &str = "http.method";

/// Translate a native header map into the canonical list.
///
/// Duplicate names are preserved in the map's iteration order.
pub fn from_native(map: &HeaderMap) -> Vec<Header> {
    map.iter()
        .map(|(name, value)| Header::new(name.as_str(), value.as_bytes().to_vec()))
        .collect()
}

/// Render the canonical header list into a native header map.
///
/// Duplicate keys are appended, never collapsed. A header whose key or value
/// the native encoding cannot represent is dropped with a warning.
pub fn to_native(headers: &[Header]) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for header in headers {
        let name = HeaderName::from_bytes(header.key.as_bytes());
        let value = HeaderValue::from_bytes(&header.value);
        match (name, value) {
            (Ok(name), Ok(value)) => {
                map.append(name, value);
            }
            _ => {
                tracing::warn!(
                    key = %header.key,
                    "Dropping header the HTTP encoding cannot represent",
                );
            }
        }
    }
    map
}

/// Reply dispatched when an HTTP-sourced envelope is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpReply {
    /// The envelope was acknowledged; respond with success.
    Accepted,
    /// The envelope was negatively acknowledged with this reason.
    Failed(String),
}

/// One inbound request/reply exchange.
///
/// The server glue builds one per request and keeps the paired
/// [`oneshot::Receiver`] to render the response from the settled
/// [`HttpReply`].
#[derive(Debug)]
pub struct HttpExchange {
    /// Request method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body bytes.
    pub body: Vec<u8>,
    /// Reply slot the envelope's acker settles.
    pub reply: oneshot::Sender<HttpReply>,
}

impl HttpExchange {
    /// Build an exchange and the reply receiver the server side awaits.
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> (Self, oneshot::Receiver<HttpReply>) {
        let (reply, on_reply) = oneshot::channel();
        (
            Self {
                method: method.into(),
                path: path.into(),
                headers: HeaderMap::new(),
                body: body.into(),
                reply,
            },
            on_reply,
        )
    }
}

/// Create an exchange channel and the source consuming it.
///
/// `capacity` bounds the number of requests buffered ahead of the pipeline;
/// a full channel backpressures the server glue.
pub fn channel(capacity: usize) -> (mpsc::Sender<HttpExchange>, HttpSource) {
    let (tx, receiver) = mpsc::channel(capacity);
    (tx, HttpSource { receiver })
}

/// HTTP inbound adapter.
///
/// Yields one envelope per [`HttpExchange`] in arrival order. Acknowledgment
/// dispatches [`HttpReply::Accepted`] into the exchange's reply slot, nack
/// dispatches [`HttpReply::Failed`]; a torn-down reply receiver surfaces as
/// an abandoned-obligation [`AckError`] instead of a silent drop.
pub struct HttpSource {
    receiver: mpsc::Receiver<HttpExchange>,
}

fn build_metadata(exchange: &HttpExchange) -> Metadata {
    Metadata::builder()
        .with(MetadataValue::SourceName(exchange.path.clone()))
        .extension(METHOD_EXTENSION, serde_json::json!(exchange.method))
        .with(MetadataValue::Headers(from_native(&exchange.headers)))
        .build()
}

fn reply_acker(reply: oneshot::Sender<HttpReply>) -> Acker {
    let slot = Arc::new(Mutex::new(Some(reply)));
    let ack_slot = Arc::clone(&slot);
    Acker::with_nack(
        move || {
            let slot = Arc::clone(&ack_slot);
            async move { dispatch(&slot, HttpReply::Accepted) }
        },
        move |reason| {
            let slot = Arc::clone(&slot);
            async move { dispatch(&slot, HttpReply::Failed(reason.to_string())) }
        },
    )
}

fn dispatch(
    slot: &Mutex<Option<oneshot::Sender<HttpReply>>>,
    reply: HttpReply,
) -> Result<(), AckError> {
    let sender = slot
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match sender {
        Some(sender) => sender
            .send(reply)
            .map_err(|_| AckError::abandoned("reply receiver dropped before settlement")),
        None => Ok(()),
    }
}

#[async_trait]
impl Source<RawPayload> for HttpSource {
    type Error = std::convert::Infallible;

    async fn envelopes(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'_, Result<Envelope<RawPayload>, Self::Error>>, Self::Error> {
        let receiver = &mut self.receiver;
        Ok(Box::pin(stream! {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    exchange = receiver.recv() => match exchange {
                        Some(exchange) => {
                            let metadata = build_metadata(&exchange);
                            let body = exchange.body;
                            let acker = reply_acker(exchange.reply);
                            yield Ok(Envelope::from_parts(
                                RawPayload::from(body),
                                metadata,
                                acker,
                            ));
                        }
                        None => break,
                    }
                }
            }
        }))
    }
}

/// HTTP outbound adapter.
///
/// Submits envelope payload bytes through an already-built `reqwest` client.
/// The `DestinationName` override replaces the default URL, the
/// `http.method` extension the default `POST`, and `OutboundHeaders` are
/// rendered into the request's header map.
#[derive(Clone)]
pub struct Http {
    client: reqwest::Client,
    url: String,
}

impl Http {
    /// Create a sender posting to `url` by default.
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    fn method_of(metadata: &Metadata) -> Method {
        let Some(name) = metadata
            .extension(METHOD_EXTENSION)
            .and_then(serde_json::Value::as_str)
        else {
            return Method::POST;
        };
        match Method::from_bytes(name.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                tracing::warn!(method = name, "Ignoring unrepresentable HTTP method override");
                Method::POST
            }
        }
    }
}

#[async_trait]
impl<T> Sender<T> for Http
where
    T: ToBytes + Send + Sync,
{
    type Error = reqwest::Error;

    async fn send(&mut self, envelope: Envelope<T>) -> Result<(), Self::Error> {
        let metadata = envelope.metadata();
        let url = metadata.destination_name().unwrap_or(&self.url);
        let method = Self::method_of(metadata);
        let headers = to_native(metadata.outbound_headers().unwrap_or(&[]));

        self.client
            .request(method, url)
            .headers(headers)
            .body(envelope.payload().to_bytes().to_vec())
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}
