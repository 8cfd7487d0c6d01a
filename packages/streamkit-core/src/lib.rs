//! streamkit-core - the hard core of a live audio/video broadcasting pipeline.
//!
//! This crate acquires raw audio and video from device-local sources (behind
//! traits implemented elsewhere — see `streamkit-capture`), encodes each into
//! a compressed elementary stream, interleaves the encoded access units into
//! a container format, and delivers the resulting byte stream to a file or a
//! remote live-streaming endpoint.
//!
//! # Architecture
//!
//! - [`types`]: carrier types shared by every stage (`RawFrame`, `Frame`,
//!   `Packet`, `SourceConfig`, `CodecConfig`, `EndpointDescriptor`, ...)
//! - [`buffer_pool`]: recyclable byte-buffer allocator
//! - [`audio_input`]: audio source holder, effects, mute, fan-out
//! - [`compositor`]: GPU-style video texture fan-out with per-output transform
//! - [`encoder`]: codec wrapper state machine and CSD normalization
//! - [`regulator`]: periodic bitrate feedback loop
//! - [`mux`]: MPEG-TS, fragmented MP4 and FLV muxers
//! - [`sink`]: file/content/SRT/RTMP sinks
//! - [`endpoint`]: composite endpoint binding a muxer to one or more sinks
//! - [`pipeline`]: the orchestrator binding sources, encoders and endpoints
//! - [`error`]: centralized error taxonomy
//! - [`retry`]: exponential-backoff helper for sink reconnect attempts
//! - [`events`]: pipeline event / "latest error" observability seam
//! - [`runtime`]: task-spawning abstraction for async runtime independence
//! - [`bootstrap`]: composition root wiring a demo pipeline together
//!
//! # Abstraction traits
//!
//! - [`runtime::TaskSpawner`]: spawning background tasks
//! - [`events::EventEmitter`]: emitting pipeline events
//! - [`types::AudioSource`] / [`types::VideoSource`]: capture-side contracts
//!   implemented by `streamkit-capture` (and, in production, by
//!   platform-specific capture drivers outside this crate's scope)

#![warn(clippy::all)]

pub mod audio_input;
pub mod bootstrap;
pub mod buffer_pool;
pub mod compositor;
pub mod encoder;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod mux;
pub mod pipeline;
pub mod regulator;
pub mod retry;
pub mod runtime;
pub mod sink;
pub mod types;

pub use audio_input::AudioInput;
pub use bootstrap::{bootstrap_pipeline, BootstrappedPipeline};
pub use buffer_pool::{Buffer, BufferPool, BufferPoolConfig};
pub use compositor::{AspectRatioMode, Compositor, CompositorHandle, Rotation};
pub use encoder::{AudioEncoder, Encoder, EncoderState, VideoEncoder};
pub use endpoint::CompositeEndpoint;
pub use error::{ErrorKind, Outcome, StreamError, StreamResult};
pub use events::{EventEmitter, LoggingEventEmitter, NoopEventEmitter, PipelineEvent};
pub use mux::{flv::FlvMuxer, fmp4::FragmentedMp4Muxer, ts::TsMuxer, Muxer, MuxerKind};
pub use pipeline::{OutputId, OutputSpec, Pipeline, PipelineConfig};
pub use regulator::{BitrateRegulator, RegulatorConfig, SinkStats};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use sink::{sink_for_descriptor, ContentSink, FileSink, RtmpSink, Sink, SinkMetrics, SrtSink};
pub use types::{
    AudioCodec, CodecConfig, DynamicRangeProfile, EndpointDescriptor, Frame, MediaKind, Packet,
    PendingSnapshot, RawFrame, SourceConfig, StreamId, SurfaceInput, SurfaceOutput, VideoCodec,
};
