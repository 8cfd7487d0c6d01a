//! Sine-wave synthetic audio source.

use std::f64::consts::PI;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use streamkit_core::buffer_pool::BufferPool;
use streamkit_core::error::{StreamError, StreamResult};
use streamkit_core::types::{AudioSource, AudioSourceConfig, ByteFormat, RawFrame};

/// Default chunk duration a [`SineWaveSource`] hands back per
/// `get_audio_frame` call. Matches the ~20ms capture period common to real
/// microphone drivers.
const DEFAULT_CHUNK_MS: u32 = 20;

/// Pull-mode audio source producing a continuous sine tone.
///
/// Only [`ByteFormat::S16Le`] is supported (real-world microphone drivers
/// typically negotiate down to this anyway); `configure` rejects anything
/// else.
pub struct SineWaveSource {
    frequency_hz: f64,
    chunk_ms: u32,
    config: Option<AudioSourceConfig>,
    phase: f64,
    pts_us: i64,
    started: bool,
}

impl SineWaveSource {
    pub fn new(frequency_hz: f64) -> Self {
        Self {
            frequency_hz,
            chunk_ms: DEFAULT_CHUNK_MS,
            config: None,
            phase: 0.0,
            pts_us: 0,
            started: false,
        }
    }

    pub fn with_chunk_duration_ms(mut self, chunk_ms: u32) -> Self {
        self.chunk_ms = chunk_ms;
        self
    }

    fn frames_per_chunk(&self, config: &AudioSourceConfig) -> usize {
        (config.sample_rate as u64 * self.chunk_ms as u64 / 1000) as usize
    }
}

impl AudioSource for SineWaveSource {
    fn configure(&mut self, config: AudioSourceConfig) -> StreamResult<()> {
        if config.byte_format != ByteFormat::S16Le {
            return Err(StreamError::unsupported(
                "SineWaveSource only produces S16LE samples",
            ));
        }
        self.config = Some(config);
        Ok(())
    }

    fn start_stream(&mut self) -> StreamResult<()> {
        if self.config.is_none() {
            return Err(StreamError::config("SineWaveSource has no config"));
        }
        self.started = true;
        self.phase = 0.0;
        self.pts_us = 0;
        Ok(())
    }

    fn stop_stream(&mut self) -> StreamResult<()> {
        self.started = false;
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.config = None;
    }

    /// Blocks for one chunk period, then hands back a freshly-rendered sine
    /// wave chunk. Real microphone drivers block the pump task the same
    /// way, waiting on hardware capture completion instead of a timer.
    fn get_audio_frame(&mut self, pool: &BufferPool) -> StreamResult<RawFrame> {
        if !self.started {
            return Err(StreamError::closed("SineWaveSource is not streaming"));
        }
        let config = self
            .config
            .ok_or_else(|| StreamError::config("SineWaveSource has no config"))?;

        thread::sleep(Duration::from_millis(self.chunk_ms as u64));

        let channels = config.channels as usize;
        let frame_count = self.frames_per_chunk(&config);
        let bytes_per_sample = ByteFormat::S16Le.bytes_per_sample() as usize;
        let mut buffer = pool.get(frame_count * channels * bytes_per_sample);

        let phase_step = 2.0 * PI * self.frequency_hz / config.sample_rate as f64;
        {
            let data = buffer.as_mut_slice();
            for frame in 0..frame_count {
                let sample = (self.phase.sin() * i16::MAX as f64 * 0.25) as i16;
                self.phase += phase_step;
                let sample_bytes = sample.to_le_bytes();
                for channel in 0..channels {
                    let offset = (frame * channels + channel) * bytes_per_sample;
                    data[offset..offset + bytes_per_sample.min(2)]
                        .copy_from_slice(&sample_bytes[..bytes_per_sample.min(2)]);
                }
            }
        }
        self.phase %= 2.0 * PI;

        let pts = self.pts_us;
        self.pts_us += self.chunk_ms as i64 * 1000;

        // `pool` is only borrowed for this call, so the buffer can't be
        // handed back through it once the frame closes; it's simply
        // deallocated then (Buffer's drop contract, not a leak).
        let data = Bytes::copy_from_slice(buffer.as_slice());
        Ok(RawFrame::new(data, pts, || {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamkit_core::buffer_pool::BufferPoolConfig;

    fn config() -> AudioSourceConfig {
        AudioSourceConfig {
            sample_rate: 48_000,
            channels: 1,
            byte_format: ByteFormat::S16Le,
        }
    }

    #[test]
    fn configure_rejects_non_s16le_format() {
        let mut source = SineWaveSource::new(440.0);
        let mut bad = config();
        bad.byte_format = ByteFormat::F32Le;
        let err = source.configure(bad).unwrap_err();
        assert_eq!(err.kind, streamkit_core::error::ErrorKind::Unsupported);
    }

    #[test]
    fn get_audio_frame_requires_started_stream() {
        let mut source = SineWaveSource::new(440.0);
        source.configure(config()).unwrap();
        let pool = BufferPool::new(BufferPoolConfig::default());
        let err = source.get_audio_frame(&pool).unwrap_err();
        assert_eq!(err.kind, streamkit_core::error::ErrorKind::Closed);
    }

    #[test]
    fn frames_advance_pts_by_chunk_duration() {
        let mut source = SineWaveSource::new(440.0).with_chunk_duration_ms(5);
        source.configure(config()).unwrap();
        source.start_stream().unwrap();
        let pool = BufferPool::new(BufferPoolConfig::default());

        let first = source.get_audio_frame(&pool).unwrap();
        let second = source.get_audio_frame(&pool).unwrap();
        assert_eq!(second.pts_us - first.pts_us, 5_000);
        first.close();
        second.close();
    }

    #[test]
    fn produces_non_silent_samples() {
        let mut source = SineWaveSource::new(440.0).with_chunk_duration_ms(20);
        source.configure(config()).unwrap();
        source.start_stream().unwrap();
        let pool = BufferPool::new(BufferPoolConfig::default());

        let frame = source.get_audio_frame(&pool).unwrap();
        assert!(frame.data.iter().any(|&b| b != 0));
        frame.close();
    }
}
