//! Audio source holder: effects, mute, and frame fan-out (spec §4.2, C3).
//!
//! `AudioInput` owns at most one active [`AudioSource`] at a time and
//! mediates between it and however many encoder pumps are currently
//! consuming frames. Sources operate in one of two modes:
//!
//! - **pull**: the pump task calls [`AudioInput::get_audio_frame`]
//!   directly, which blocks on the underlying source.
//! - **push**: the source runs its own capture thread and calls
//!   [`AudioInput::queue_audio_frame`] whenever it has produced a frame;
//!   `AudioInput` duplicates it (spec §4.2's shared close-counter) across
//!   every registered consumer channel.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use tokio::sync::mpsc;

use crate::buffer_pool::{Buffer, BufferPool};
use crate::error::{StreamError, StreamResult};
use crate::types::{AudioSource, AudioSourceConfig, RawFrame};

/// Audio post-processing effects a source may be asked to apply.
///
/// Kept as a set rather than individual booleans so new effects can be
/// added without changing `AudioInput`'s method signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AudioEffect {
    NoiseSuppression,
    EchoCancellation,
    AutoGainControl,
}

/// How frames reach this input's consumers.
enum Mode {
    /// No source bound yet.
    Idle,
    /// Consumers call `get_audio_frame` and the source is polled directly.
    Pull(Box<dyn AudioSource>),
    /// The source pushes frames via `queue_audio_frame` from its own thread;
    /// this input fans each one out to `consumers`.
    Push(Box<dyn AudioSource>),
}

/// Owns the active audio source and coordinates effects/mute/fan-out.
pub struct AudioInput {
    mode: Mode,
    config: Option<AudioSourceConfig>,
    effects: BTreeSet<AudioEffect>,
    muted: AtomicBool,
    streaming: AtomicBool,
    consumers: HashMap<u64, mpsc::Sender<RawFrame>>,
    next_consumer_id: AtomicU64,
}

impl AudioInput {
    pub fn new() -> Self {
        Self {
            mode: Mode::Idle,
            config: None,
            effects: BTreeSet::new(),
            muted: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            consumers: HashMap::new(),
            next_consumer_id: AtomicU64::new(0),
        }
    }

    /// Swaps in a new source. Rejected while streaming (spec §4.2: sources
    /// may only be replaced between `stopStream`/`startStream` cycles).
    pub fn set_source(&mut self, source: Box<dyn AudioSource>, push_mode: bool) -> StreamResult<()> {
        if self.streaming.load(Ordering::Acquire) {
            return Err(StreamError::config(
                "cannot replace audio source while streaming",
            ));
        }
        self.mode = if push_mode {
            Mode::Push(source)
        } else {
            Mode::Pull(source)
        };
        Ok(())
    }

    pub fn set_source_config(&mut self, config: AudioSourceConfig) -> StreamResult<()> {
        if self.streaming.load(Ordering::Acquire) {
            self.configure_active(config)?;
        }
        self.config = Some(config);
        Ok(())
    }

    fn configure_active(&mut self, config: AudioSourceConfig) -> StreamResult<()> {
        match &mut self.mode {
            Mode::Idle => Err(StreamError::config("no audio source bound")),
            Mode::Pull(source) | Mode::Push(source) => source.configure(config),
        }
    }

    pub fn set_effects(&mut self, effects: BTreeSet<AudioEffect>) {
        self.effects = effects;
    }

    pub fn effects(&self) -> &BTreeSet<AudioEffect> {
        &self.effects
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Registers a consumer channel for push-mode fan-out. Returns a stable
    /// id (for [`AudioInput::remove_consumer`]) and the receiving half for
    /// the caller's encoder pump to poll.
    pub fn add_consumer(&mut self, buffer: usize) -> (u64, mpsc::Receiver<RawFrame>) {
        let (tx, rx) = mpsc::channel(buffer);
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        self.consumers.insert(id, tx);
        (id, rx)
    }

    /// Unregisters a consumer added via [`AudioInput::add_consumer`]. No-op
    /// if `id` is unknown (e.g. already removed by a prior `remove_output`).
    pub fn remove_consumer(&mut self, id: u64) {
        self.consumers.remove(&id);
    }

    pub fn start_stream(&mut self) -> StreamResult<()> {
        let config = self
            .config
            .ok_or_else(|| StreamError::config("audio source has no config"))?;
        match &mut self.mode {
            Mode::Idle => return Err(StreamError::config("no audio source bound")),
            Mode::Pull(source) | Mode::Push(source) => {
                source.configure(config)?;
                source.start_stream()?;
            }
        }
        self.streaming.store(true, Ordering::Release);
        Ok(())
    }

    pub fn stop_stream(&mut self) -> StreamResult<()> {
        self.streaming.store(false, Ordering::Release);
        match &mut self.mode {
            Mode::Idle => Ok(()),
            Mode::Pull(source) | Mode::Push(source) => source.stop_stream(),
        }
    }

    pub fn release(&mut self) {
        self.streaming.store(false, Ordering::Release);
        match &mut self.mode {
            Mode::Idle => {}
            Mode::Pull(source) | Mode::Push(source) => source.release(),
        }
        self.mode = Mode::Idle;
        self.consumers.clear();
    }

    /// Pulls the next frame directly from a pull-mode source. Muted frames
    /// are zeroed in place rather than suppressed, so downstream pacing
    /// (timestamps, key-frame cadence) is unaffected by mute state.
    pub fn get_audio_frame(&mut self, pool: &BufferPool) -> StreamResult<RawFrame> {
        let frame = match &mut self.mode {
            Mode::Pull(source) => source.get_audio_frame(pool)?,
            Mode::Push(_) => {
                return Err(StreamError::config(
                    "get_audio_frame called on a push-mode source",
                ))
            }
            Mode::Idle => return Err(StreamError::config("no audio source bound")),
        };
        Ok(self.apply_mute(frame, pool))
    }

    /// Called by a push-mode source's own capture thread with one captured
    /// buffer; fans it out to every registered consumer (spec §4.2 shared
    /// close-counter — the buffer returns to `pool` once every consumer has
    /// closed its copy).
    pub fn queue_audio_frame(&self, data: Bytes, pts_us: i64, buffer: Buffer, pool: Arc<BufferPool>) {
        if self.consumers.is_empty() {
            pool.put(buffer);
            return;
        }
        let muted = self.muted.load(Ordering::Acquire);
        let data = if muted {
            Bytes::from(vec![0u8; data.len()])
        } else {
            data
        };
        // `data` is already decoupled from `buffer`'s lifetime (RawFrame::fan_out
        // re-copies into the returned frames), so silence substitution above is
        // free to swap it without touching the pooled allocation.
        let frames = RawFrame::fan_out_with_data(data, pts_us, buffer, pool, self.consumers.len());
        for (frame, consumer) in frames.into_iter().zip(self.consumers.values()) {
            if consumer.try_send(frame).is_err() {
                warn!("audio consumer channel full or closed, dropping frame");
            }
        }
    }

    /// Whether any push-mode consumer is currently registered.
    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    /// Replaces a captured frame's contents with silence in place, keeping
    /// its original close callback so the pooled buffer is still released
    /// through the normal path.
    fn apply_mute(&self, frame: RawFrame, _pool: &BufferPool) -> RawFrame {
        if !self.muted.load(Ordering::Acquire) {
            return frame;
        }
        frame.with_silenced_data()
    }
}

impl Default for AudioInput {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer_pool::BufferPoolConfig;
    use crate::error::ErrorKind;
    use crate::types::ByteFormat;

    struct FakeSource {
        configured: bool,
        started: bool,
    }

    impl AudioSource for FakeSource {
        fn configure(&mut self, _config: AudioSourceConfig) -> StreamResult<()> {
            self.configured = true;
            Ok(())
        }
        fn start_stream(&mut self) -> StreamResult<()> {
            if !self.configured {
                return Err(StreamError::config("not configured"));
            }
            self.started = true;
            Ok(())
        }
        fn stop_stream(&mut self) -> StreamResult<()> {
            self.started = false;
            Ok(())
        }
        fn release(&mut self) {}
        fn get_audio_frame(&mut self, pool: &BufferPool) -> StreamResult<RawFrame> {
            let buffer = pool.get(4);
            Ok(RawFrame::from_buffer(buffer, 0, Arc::new(BufferPool::new(BufferPoolConfig::default()))))
        }
    }

    fn test_config() -> AudioSourceConfig {
        AudioSourceConfig {
            sample_rate: 48_000,
            channels: 2,
            byte_format: ByteFormat::S16Le,
        }
    }

    #[test]
    fn start_stream_requires_config() {
        let mut input = AudioInput::new();
        input
            .set_source(Box::new(FakeSource { configured: false, started: false }), false)
            .unwrap();
        let err = input.start_stream().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn start_stream_configures_then_starts_source() {
        let mut input = AudioInput::new();
        input
            .set_source(Box::new(FakeSource { configured: false, started: false }), false)
            .unwrap();
        input.set_source_config(test_config()).unwrap();
        input.start_stream().unwrap();
    }

    #[test]
    fn set_source_rejected_while_streaming() {
        let mut input = AudioInput::new();
        input
            .set_source(Box::new(FakeSource { configured: false, started: false }), false)
            .unwrap();
        input.set_source_config(test_config()).unwrap();
        input.start_stream().unwrap();

        let err = input
            .set_source(Box::new(FakeSource { configured: false, started: false }), false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Config);
    }

    #[test]
    fn mute_zeroes_frame_contents() {
        let mut input = AudioInput::new();
        input
            .set_source(Box::new(FakeSource { configured: false, started: false }), false)
            .unwrap();
        input.set_source_config(test_config()).unwrap();
        input.start_stream().unwrap();
        input.set_muted(true);

        let pool = BufferPool::new(BufferPoolConfig::default());
        let frame = input.get_audio_frame(&pool).unwrap();
        assert!(frame.data.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn queue_audio_frame_fans_out_to_every_consumer() {
        let mut input = AudioInput::new();
        let (_id_a, mut rx_a) = input.add_consumer(4);
        let (_id_b, mut rx_b) = input.add_consumer(4);

        let pool = Arc::new(BufferPool::new(BufferPoolConfig::default()));
        let buffer = pool.get(3);
        input.queue_audio_frame(Bytes::from_static(b"abc"), 0, buffer, Arc::clone(&pool));

        let frame_a = rx_a.recv().await.unwrap();
        let frame_b = rx_b.recv().await.unwrap();
        assert_eq!(&frame_a.data[..], b"abc");
        assert_eq!(&frame_b.data[..], b"abc");
        frame_a.close();
        frame_b.close();
        assert_eq!(pool.idle_count(), 1);
    }
}
