//! Container muxing: MPEG-TS, fragmented MP4, FLV (spec §4.6, C7).
//!
//! A [`Muxer`] is a pure function of its configuration and the frames handed
//! to it: given the same stream configs and the same ordered frame sequence,
//! it produces byte-identical output. That purity is what makes the muxers
//! unit-testable without a running pipeline — each one is exercised directly
//! with synthetic [`Frame`]s in its own test module.

pub mod flv;
pub mod fmp4;
pub mod ts;

use crate::error::StreamResult;
use crate::types::{CodecConfig, Frame, Packet, StreamId};

/// Binds elementary streams to a container format and turns encoded
/// [`Frame`]s into container-ready [`Packet`]s.
///
/// Implementations hold no I/O of their own — an [`crate::endpoint::CompositeEndpoint`]
/// owns the `Muxer` plus a [`crate::sink::Sink`] and wires one to the other.
pub trait Muxer: Send {
    /// Registers one elementary stream, returning a stable [`StreamId`] used
    /// by subsequent `write` calls. Rejects codecs the container can't
    /// carry with `ErrorKind::Unsupported`.
    fn add_stream(&mut self, config: &CodecConfig) -> StreamResult<StreamId>;

    /// Registers several streams atomically: if any fails, no stream from
    /// this batch is added (spec §9 multi-error aggregation: `start_stream`
    /// fan-out requires every sub-operation to succeed).
    fn add_streams(&mut self, configs: &[CodecConfig]) -> StreamResult<Vec<StreamId>> {
        let mut added = Vec::with_capacity(configs.len());
        for config in configs {
            match self.add_stream(config) {
                Ok(id) => added.push(id),
                Err(err) => {
                    for id in added {
                        self.remove_stream(id);
                    }
                    return Err(err);
                }
            }
        }
        Ok(added)
    }

    /// Drops a previously-added stream. No-op if `id` is unknown.
    fn remove_stream(&mut self, id: StreamId);

    /// Emits whatever header bytes the container needs before any frame
    /// data (PAT/PMT/SDT, `ftyp`+`moov`, FLV header+`onMetaData`).
    fn start_stream(&mut self) -> StreamResult<Vec<Packet>>;

    /// Encodes one access unit into container packets.
    fn write(&mut self, id: StreamId, frame: Frame) -> StreamResult<Vec<Packet>>;

    /// Emits trailer bytes, if the container format has any.
    fn stop_stream(&mut self) -> StreamResult<Vec<Packet>>;
}

/// The container family an output picks for its [`crate::endpoint::CompositeEndpoint`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxerKind {
    Ts,
    Fmp4,
    Flv,
}

impl MuxerKind {
    /// Builds a fresh muxer of this kind, with no streams added yet.
    pub fn build(self) -> Box<dyn Muxer> {
        match self {
            Self::Ts => Box::new(ts::TsMuxer::new()),
            Self::Fmp4 => Box::new(fmp4::FragmentedMp4Muxer::new()),
            Self::Flv => Box::new(flv::FlvMuxer::new()),
        }
    }
}

/// Monotonically allocates [`StreamId`]s for a single muxer instance.
#[derive(Debug, Default)]
pub(crate) struct StreamIdAllocator {
    next: u32,
}

impl StreamIdAllocator {
    pub fn next(&mut self) -> StreamId {
        let id = StreamId(self.next);
        self.next += 1;
        id
    }
}
