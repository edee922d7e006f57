#![doc = include_str!("../README.md")]

pub mod ack;
pub mod emitter;
pub mod envelope;
pub mod headers;
pub mod metadata;
pub mod pipeline;
pub mod transport;

#[doc(inline)]
pub use ack::{AckError, AckErrorKind, Acker, Strategy};

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use headers::Header;

#[doc(inline)]
pub use metadata::{Metadata, MetadataKind, MetadataValue};

#[doc(inline)]
pub use pipeline::{
    ChannelConfig, DefaultPipelineHook, Pipeline, PipelineError, PipelineErrorKind, PipelineHook,
};

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};
