use crate::{Envelope, transport::RawPayload};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that serializes payloads to JSON.
///
/// This service converts any payload type `M` that implements
/// `serde::Serialize` into a `RawPayload` containing the serialized JSON
/// bytes before passing the envelope on to the inner service. Metadata and
/// the acknowledgment capability are carried over untouched, so a chained
/// ack still settles the original obligation.
#[derive(Clone)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, M> Service<Envelope<M>> for JsonService<T>
where
    M: serde::Serialize + Send + 'static,
    T: Service<Envelope<RawPayload>> + Clone + Send + 'static,
    <T as Service<Envelope<RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Envelope<M>) -> Self::Future {
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (payload, metadata, acker) = req.into_parts();
            let bytes = serde_json::to_vec(&payload).map_err(Box::new)?;
            let envelope = Envelope::from_parts(RawPayload::from(bytes), metadata, acker);

            inner.call(envelope).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
///
/// Wraps an existing service so that all outgoing payloads are serialized
/// to JSON automatically.
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::MetadataValue;
    use crate::transport::{InMemory, Transport};

    #[tokio::test]
    async fn serializes_payload_and_preserves_metadata() {
        let sender = InMemory::new("events");
        let mut transport = Transport::new(sender.clone()).layer(JsonLayer);

        let envelope = Envelope::new(serde_json::json!({"id": 42}))
            .with_metadata(MetadataValue::DestinationKey(b"42".to_vec()));
        transport.send(envelope).await.unwrap();

        let records = sender.sent_records().await;
        assert_eq!(records[0].destination, "events");
        assert_eq!(records[0].key, Some(b"42".to_vec()));
        assert_eq!(records[0].payload, br#"{"id":42}"#.to_vec());
    }
}
