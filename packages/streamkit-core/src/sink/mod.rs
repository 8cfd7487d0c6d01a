//! Sinks: where a muxed byte stream ends up (spec §4.8, C8).
//!
//! A [`Sink`] only ever sees bytes a [`crate::mux::Muxer`] has already
//! produced — it has no codec or container awareness. Each concrete sink
//! matches one or more [`EndpointDescriptor`] tags; [`crate::endpoint::CompositeEndpoint`]
//! is responsible for picking the right one.

pub mod content;
pub mod file;
pub mod rtmp;
pub mod srt;

pub use content::ContentSink;
pub use file::FileSink;
pub use rtmp::RtmpSink;
pub use srt::SrtSink;

use crate::error::StreamResult;
use crate::types::{EndpointDescriptor, Packet};

/// Point-in-time throughput/backlog counters, polled by [`crate::regulator::BitrateRegulator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkMetrics {
    pub bytes_written: u64,
    pub queued_bytes: u64,
    pub dropped_frames: u64,
}

/// Picks the concrete [`Sink`] matching an [`EndpointDescriptor`]'s tag.
/// The sink still has to be opened against the descriptor before use.
pub fn sink_for_descriptor(descriptor: &EndpointDescriptor) -> Box<dyn Sink> {
    match descriptor {
        EndpointDescriptor::File { .. } => Box::new(FileSink::new()),
        EndpointDescriptor::Content { .. } => Box::new(ContentSink::new()),
        EndpointDescriptor::Srt { .. } => Box::new(SrtSink::new()),
        EndpointDescriptor::Rtmp { .. } => Box::new(RtmpSink::new()),
    }
}

/// A byte-stream destination: a file, a platform content URI, or a live
/// network endpoint (SRT, RTMP).
pub trait Sink: Send {
    /// Opens the underlying resource. Must be called before `start_stream`.
    fn open(&mut self, descriptor: &EndpointDescriptor) -> StreamResult<()>;
    /// Emits whatever the sink needs before the first `write` (a file
    /// handle and a live destination use this identically: neither has
    /// header bytes of its own, that's the muxer's job).
    fn start_stream(&mut self) -> StreamResult<()>;
    fn write(&mut self, packet: Packet) -> StreamResult<()>;
    fn stop_stream(&mut self) -> StreamResult<()>;
    fn close(&mut self);
    fn metrics(&self) -> SinkMetrics;
    fn is_opened(&self) -> bool;
}
