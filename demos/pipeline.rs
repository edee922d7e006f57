use std::time::Duration;

use courier::emitter;
use courier::transport::layers::JsonLayer;
use courier::transport::{InMemory, Transport};
use courier::{Envelope, MetadataValue, Pipeline, Strategy};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Greeting {
    id: u32,
    message: String,
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    let cancel_handle = tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let (emitter, source) = emitter::channel::<Greeting>(16);

    let cancel_feeder = cancel.clone();
    let feeder_handle = tokio::spawn(async move {
        let mut id = 0;
        loop {
            let greeting = Greeting {
                id,
                message: "Hello".to_owned(),
            };
            if emitter.send(greeting).await.is_err() {
                break;
            }
            id += 1;
            tokio::time::sleep(Duration::from_millis(200)).await;
            if cancel_feeder.is_cancelled() {
                break;
            }
        }
    });

    let sender = InMemory::new("greetings-out");
    let transport = Transport::new(sender.clone()).layer(JsonLayer);

    let pipeline = Pipeline::new("greetings", source, Strategy::Automatic);
    let pipeline_handle = tokio::spawn(async move {
        pipeline
            .forward(
                |envelope: Envelope<Greeting>| async move {
                    let key = envelope.payload().id.to_be_bytes().to_vec();
                    Ok(Some(
                        envelope.with_metadata(MetadataValue::DestinationKey(key)),
                    ))
                },
                transport,
                cancel,
            )
            .await
            .unwrap();
    });

    let _ = tokio::try_join!(cancel_handle, feeder_handle, pipeline_handle);

    for record in sender.sent_records().await {
        println!(
            "{} key={:?} -> {}",
            record.destination,
            record.key,
            String::from_utf8_lossy(&record.payload),
        );
    }
}
