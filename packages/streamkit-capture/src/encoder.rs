//! Synthetic codec wrappers.
//!
//! This crate has no real libopus/libaom/MediaCodec bindings, so these
//! encoders don't compress anything — they wrap a source's raw bytes
//! straight into a [`Frame`], fabricating the minimal codec-specific data a
//! muxer needs to treat the stream as well-formed. Useful for exercising the
//! rest of the pipeline (bitrate regulation, muxing, sinks) without a real
//! codec dependency.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use streamkit_core::encoder::{
    AudioEncoder, Encoder, EncoderState, EncoderStateMachine, VideoEncoder as VideoEncoderTrait,
};
use streamkit_core::error::{StreamError, StreamResult};
use streamkit_core::types::{CodecConfig, Frame, MediaKind, RawFrame};

/// A fabricated AudioSpecificConfig-shaped CSD blob. Real decoders would
/// reject this; it exists purely so [`Frame::new`]'s CSD invariant (I2) is
/// satisfiable without a real AAC/Opus encoder.
const SYNTHETIC_AUDIO_CSD: [u8; 2] = [0x11, 0x90];

/// Wraps raw PCM straight through as an access unit per call.
pub struct PassthroughAudioEncoder {
    state: EncoderStateMachine,
    config: Option<CodecConfig>,
    bitrate_bps: u32,
}

impl PassthroughAudioEncoder {
    pub fn new() -> Self {
        Self {
            state: EncoderStateMachine::new(),
            config: None,
            bitrate_bps: 0,
        }
    }
}

impl Default for PassthroughAudioEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PassthroughAudioEncoder {
    fn state(&self) -> EncoderState {
        self.state.state()
    }

    fn configure(&mut self, config: CodecConfig) -> StreamResult<()> {
        if config.kind() != MediaKind::Audio {
            return Err(StreamError::config("PassthroughAudioEncoder requires an audio config"));
        }
        self.state.transition(EncoderState::Configured)?;
        self.bitrate_bps = config.bitrate_bps;
        self.config = Some(config);
        Ok(())
    }

    fn start(&mut self) -> StreamResult<()> {
        self.state.require(EncoderState::Configured)?;
        self.state.transition(EncoderState::Running)
    }

    fn stop(&mut self) -> StreamResult<()> {
        self.state.require(EncoderState::Running)?;
        self.state.transition(EncoderState::Stopped)
    }

    fn release(&mut self) {
        let _ = self.state.transition(EncoderState::Released);
        self.config = None;
    }
}

impl AudioEncoder for PassthroughAudioEncoder {
    fn encode(&mut self, frame: RawFrame) -> StreamResult<Vec<Frame>> {
        self.state.require(EncoderState::Running)?;
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| StreamError::config("encoder not configured"))?;

        let encoded = Frame::new(
            frame.data.clone(),
            frame.pts_us,
            None,
            true,
            vec![Bytes::from_static(&SYNTHETIC_AUDIO_CSD)],
            config.codec,
        )?;
        frame.close();
        Ok(vec![encoded])
    }

    fn set_bitrate(&mut self, bitrate_bps: u32) -> StreamResult<()> {
        self.bitrate_bps = bitrate_bps;
        Ok(())
    }
}

/// Fabricated Annex-B parameter sets, just distinctive enough to round-trip
/// through [`streamkit_core::encoder::normalize_video_csd`]'s NAL
/// classification in tests.
const SYNTHETIC_SPS: [u8; 4] = [0x67, 0x42, 0x00, 0x1f];
const SYNTHETIC_PPS: [u8; 2] = [0x68, 0xce];

/// Wraps raw RGBA straight through, tagging every `key_frame_interval`th
/// frame (default 30) as a key frame with fabricated CSD.
pub struct PassthroughVideoEncoder {
    state: EncoderStateMachine,
    config: Option<CodecConfig>,
    key_frame_interval: u32,
    frames_since_key: u32,
    force_key_frame: AtomicBool,
    bitrate_bps: u32,
}

impl PassthroughVideoEncoder {
    pub fn new(key_frame_interval: u32) -> Self {
        Self {
            state: EncoderStateMachine::new(),
            config: None,
            key_frame_interval: key_frame_interval.max(1),
            frames_since_key: 0,
            force_key_frame: AtomicBool::new(true),
            bitrate_bps: 0,
        }
    }
}

impl Default for PassthroughVideoEncoder {
    fn default() -> Self {
        Self::new(30)
    }
}

impl Encoder for PassthroughVideoEncoder {
    fn state(&self) -> EncoderState {
        self.state.state()
    }

    fn configure(&mut self, config: CodecConfig) -> StreamResult<()> {
        if config.kind() != MediaKind::Video {
            return Err(StreamError::config("PassthroughVideoEncoder requires a video config"));
        }
        self.state.transition(EncoderState::Configured)?;
        self.bitrate_bps = config.bitrate_bps;
        self.config = Some(config);
        Ok(())
    }

    fn start(&mut self) -> StreamResult<()> {
        self.state.require(EncoderState::Configured)?;
        self.frames_since_key = 0;
        self.force_key_frame.store(true, Ordering::Release);
        self.state.transition(EncoderState::Running)
    }

    fn stop(&mut self) -> StreamResult<()> {
        self.state.require(EncoderState::Running)?;
        self.state.transition(EncoderState::Stopped)
    }

    fn release(&mut self) {
        let _ = self.state.transition(EncoderState::Released);
        self.config = None;
    }
}

impl VideoEncoderTrait for PassthroughVideoEncoder {
    fn encode(&mut self, frame: RawFrame, force_key_frame: bool) -> StreamResult<Vec<Frame>> {
        self.state.require(EncoderState::Running)?;
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| StreamError::config("encoder not configured"))?;

        let requested = force_key_frame || self.force_key_frame.swap(false, Ordering::AcqRel);
        let is_key_frame = requested || self.frames_since_key >= self.key_frame_interval;
        self.frames_since_key = if is_key_frame { 0 } else { self.frames_since_key + 1 };

        let csd = if is_key_frame {
            vec![
                Bytes::from_static(&SYNTHETIC_SPS),
                Bytes::from_static(&SYNTHETIC_PPS),
            ]
        } else {
            Vec::new()
        };

        let encoded = Frame::new(
            frame.data.clone(),
            frame.pts_us,
            Some(frame.pts_us),
            is_key_frame,
            csd,
            config.codec,
        )?;
        frame.close();
        Ok(vec![encoded])
    }

    fn request_key_frame(&mut self) {
        self.force_key_frame.store(true, Ordering::Release);
    }

    fn set_bitrate(&mut self, bitrate_bps: u32) -> StreamResult<()> {
        self.bitrate_bps = bitrate_bps;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamkit_core::types::{
        AudioSourceConfig, ByteFormat, Codec as CodecEnum, DynamicRangeProfile, SourceConfig,
        VideoCodec, VideoSourceConfig,
    };

    fn audio_config() -> CodecConfig {
        CodecConfig {
            source: SourceConfig::Audio(AudioSourceConfig {
                sample_rate: 48_000,
                channels: 2,
                byte_format: ByteFormat::S16Le,
            }),
            codec: CodecEnum::Audio(streamkit_core::types::AudioCodec::Aac),
            bitrate_bps: 128_000,
            profile: None,
            level: None,
            key_frame_interval_us: None,
        }
    }

    fn video_config() -> CodecConfig {
        CodecConfig {
            source: SourceConfig::Video(VideoSourceConfig {
                width: 640,
                height: 480,
                fps: 30,
                dynamic_range: DynamicRangeProfile::Sdr,
            }),
            codec: CodecEnum::Video(VideoCodec::H264),
            bitrate_bps: 1_000_000,
            profile: None,
            level: None,
            key_frame_interval_us: None,
        }
    }

    #[test]
    fn audio_encode_requires_running_state() {
        let mut encoder = PassthroughAudioEncoder::new();
        encoder.configure(audio_config()).unwrap();
        let frame = RawFrame::new(Bytes::from_static(b"pcm"), 0, || {});
        let err = encoder.encode(frame).unwrap_err();
        assert_eq!(err.kind, streamkit_core::error::ErrorKind::Config);
    }

    #[test]
    fn audio_encode_produces_frame_with_csd() {
        let mut encoder = PassthroughAudioEncoder::new();
        encoder.configure(audio_config()).unwrap();
        encoder.start().unwrap();
        let frame = RawFrame::new(Bytes::from_static(b"pcm"), 1000, || {});
        let frames = encoder.encode(frame).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].csd.is_empty());
    }

    #[test]
    fn video_first_frame_is_always_a_key_frame() {
        let mut encoder = PassthroughVideoEncoder::new(30);
        encoder.configure(video_config()).unwrap();
        encoder.start().unwrap();
        let frame = RawFrame::new(Bytes::from_static(b"rgba"), 0, || {});
        let frames = encoder.encode(frame, false).unwrap();
        assert!(frames[0].is_key_frame);
        assert!(!frames[0].csd.is_empty());
    }

    #[test]
    fn video_key_frame_interval_is_honored() {
        let mut encoder = PassthroughVideoEncoder::new(2);
        encoder.configure(video_config()).unwrap();
        encoder.start().unwrap();

        let key_flags: Vec<bool> = (0..5)
            .map(|i| {
                let frame = RawFrame::new(Bytes::from_static(b"rgba"), i, || {});
                encoder.encode(frame, false).unwrap()[0].is_key_frame
            })
            .collect();
        assert_eq!(key_flags, vec![true, false, true, false, true]);
    }

    #[test]
    fn request_key_frame_forces_next_encode() {
        let mut encoder = PassthroughVideoEncoder::new(30);
        encoder.configure(video_config()).unwrap();
        encoder.start().unwrap();
        let _ = encoder
            .encode(RawFrame::new(Bytes::from_static(b"rgba"), 0, || {}), false)
            .unwrap();
        encoder.request_key_frame();
        let frames = encoder
            .encode(RawFrame::new(Bytes::from_static(b"rgba"), 1, || {}), false)
            .unwrap();
        assert!(frames[0].is_key_frame);
    }
}
