//! Structured event system for pipeline observability.
//!
//! A [`Pipeline`](crate::pipeline::Pipeline) holds one "latest error" slot
//! plus a per-output error signal; this module is the typed seam those
//! signals are published through. Transport (forwarding events to a UI, a
//! metrics sink, a log aggregator) is a caller concern — this crate only
//! defines the event shape and the [`EventEmitter`] trait services publish
//! through.

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use crate::error::StreamError;
use crate::pipeline::OutputId;

/// Events a running pipeline publishes through its [`EventEmitter`].
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// An output's current operation failed. The output is knocked out of
    /// the streaming set unless the error kind forces a full pipeline
    /// release, in which case a `StreamingChanged { streaming: false }`
    /// follows.
    OutputErrored { output: OutputId, error: StreamError },

    /// An output transitioned between streaming and not-streaming.
    OutputStateChanged { output: OutputId, streaming: bool },

    /// The pipeline as a whole transitioned between streaming and not.
    StreamingChanged { streaming: bool },

    /// A requested compositor snapshot could not be produced.
    SnapshotFailed { error: StreamError },
}
