//! Codec wrapper state machine and CSD normalization (spec §4.4, C5).
//!
//! `Encoder` and its `AudioEncoder`/`VideoEncoder` specializations describe
//! the contract a platform codec wrapper (MediaCodec-, VideoToolbox- or
//! libopus/libaom-backed, depending on host) must satisfy. This crate ships
//! no real codec bindings — `streamkit-capture`'s synthetic encoders and any
//! production host supply the concrete implementations — but it does own
//! the state machine and the CSD (codec-specific data) extraction logic,
//! since both are encoder-agnostic.

use bytes::Bytes;

use crate::error::{StreamError, StreamResult};
use crate::types::{CodecConfig, Frame, RawFrame, VideoCodec};

/// Encoder lifecycle states (spec §4.4).
///
/// `Configured → Running → Stopped → (Configured | Released)`. `Released`
/// is terminal; every other state can also transition directly to
/// `Released` (spec §7: a `Fatal` error forces release from any state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderState {
    Configured,
    Running,
    Stopped,
    Released,
}

impl EncoderState {
    fn can_transition_to(self, next: EncoderState) -> bool {
        use EncoderState::*;
        match (self, next) {
            (_, Released) => true,
            (Configured, Running) => true,
            (Running, Stopped) => true,
            (Stopped, Configured) => true,
            _ => false,
        }
    }
}

/// Shared state-machine bookkeeping embedded in every encoder implementation.
#[derive(Debug, Clone, Copy)]
pub struct EncoderStateMachine {
    state: EncoderState,
}

impl EncoderStateMachine {
    pub fn new() -> Self {
        Self {
            state: EncoderState::Configured,
        }
    }

    pub fn state(&self) -> EncoderState {
        self.state
    }

    pub fn transition(&mut self, next: EncoderState) -> StreamResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(StreamError::config(format!(
                "invalid encoder transition {:?} -> {next:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    pub fn require(&self, expected: EncoderState) -> StreamResult<()> {
        if self.state != expected {
            return Err(StreamError::config(format!(
                "encoder must be {expected:?}, was {:?}",
                self.state
            )));
        }
        Ok(())
    }
}

impl Default for EncoderStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle shared by every codec wrapper.
pub trait Encoder: Send {
    fn state(&self) -> EncoderState;
    fn configure(&mut self, config: CodecConfig) -> StreamResult<()>;
    fn start(&mut self) -> StreamResult<()>;
    fn stop(&mut self) -> StreamResult<()>;
    fn release(&mut self);
}

/// An audio codec wrapper. Each call to `encode` consumes one `RawFrame` and
/// may yield zero or more encoded [`Frame`]s (codecs with internal framing,
/// like AAC's 1024-sample frames, buffer partial input).
pub trait AudioEncoder: Encoder {
    fn encode(&mut self, frame: RawFrame) -> StreamResult<Vec<Frame>>;
    /// Applies a new target bitrate to a running encoder. The regulator
    /// only reaches for this once video is already at its floor bitrate.
    fn set_bitrate(&mut self, bitrate_bps: u32) -> StreamResult<()>;
}

/// A video codec wrapper.
pub trait VideoEncoder: Encoder {
    fn encode(&mut self, frame: RawFrame, force_key_frame: bool) -> StreamResult<Vec<Frame>>;
    /// Requests that the next frame be a key frame (used by the bitrate
    /// regulator's step-down path and by late-joining sinks).
    fn request_key_frame(&mut self);
    /// Applies a new target bitrate to a running encoder (spec §4.5).
    fn set_bitrate(&mut self, bitrate_bps: u32) -> StreamResult<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// CSD normalization
// ─────────────────────────────────────────────────────────────────────────────

/// Splits an Annex-B byte stream (`00 00 00 01` or `00 00 01` start codes)
/// into individual NAL units, start codes stripped.
pub fn split_annexb_units(data: &[u8]) -> Vec<Bytes> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                starts.push((i, 3));
                i += 3;
                continue;
            }
            if i + 4 <= data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push((i, 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let mut units = Vec::with_capacity(starts.len());
    for (idx, &(start, code_len)) in starts.iter().enumerate() {
        let unit_start = start + code_len;
        let unit_end = starts
            .get(idx + 1)
            .map(|&(next_start, _)| next_start)
            .unwrap_or(data.len());
        if unit_end > unit_start {
            units.push(Bytes::copy_from_slice(&data[unit_start..unit_end]));
        }
    }
    units
}

/// The H.264/H.265 NAL unit types that carry parameter sets, used to
/// classify CSD units vs. slice data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NalKind {
    ParameterSet,
    Other,
}

fn classify_h264_nal(unit: &Bytes) -> NalKind {
    let Some(&header) = unit.first() else {
        return NalKind::Other;
    };
    match header & 0x1F {
        7 | 8 => NalKind::ParameterSet, // SPS, PPS
        _ => NalKind::Other,
    }
}

fn classify_h265_nal(unit: &Bytes) -> NalKind {
    let Some(&header) = unit.first() else {
        return NalKind::Other;
    };
    match (header >> 1) & 0x3F {
        32 | 33 | 34 => NalKind::ParameterSet, // VPS, SPS, PPS
        _ => NalKind::Other,
    }
}

/// Extracts parameter-set NAL units (SPS/PPS, plus VPS for H.265) from a raw
/// Annex-B CSD blob, in the order the encoder emitted them (spec §4.4: CSD
/// normalization — a muxer can rely on `csd` always containing a complete,
/// ready-to-prepend parameter set for the codec in question).
pub fn normalize_video_csd(codec: VideoCodec, raw_csd: &[u8]) -> Vec<Bytes> {
    let units = split_annexb_units(raw_csd);
    let classify = match codec {
        VideoCodec::H264 => classify_h264_nal,
        VideoCodec::H265 => classify_h265_nal,
        VideoCodec::Vp9 | VideoCodec::Av1 => {
            // These codecs carry no Annex-B parameter sets; CSD is an
            // opaque codec-private blob passed through unsplit.
            return if raw_csd.is_empty() {
                Vec::new()
            } else {
                vec![Bytes::copy_from_slice(raw_csd)]
            };
        }
    };
    units
        .into_iter()
        .filter(|unit| classify(unit) == NalKind::ParameterSet)
        .collect()
}

/// Strips any parameter-set NAL units from a slice payload, for encoders
/// that (redundantly) repeat SPS/PPS ahead of every key frame; muxers expect
/// slice data only in `Frame::data` and CSD exclusively in `Frame::csd`.
pub fn strip_csd_from_slice(codec: VideoCodec, data: &[u8]) -> Bytes {
    let classify = match codec {
        VideoCodec::H264 => classify_h264_nal,
        VideoCodec::H265 => classify_h265_nal,
        VideoCodec::Vp9 | VideoCodec::Av1 => return Bytes::copy_from_slice(data),
    };
    let units = split_annexb_units(data);
    let mut out = Vec::with_capacity(data.len());
    for unit in units {
        if classify(&unit) != NalKind::ParameterSet {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(&unit);
        }
    }
    Bytes::from(out)
}
