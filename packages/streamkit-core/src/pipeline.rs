//! Pipeline orchestrator: binds sources, encoders and endpoints (spec §4.7, C10).
//!
//! `Pipeline` is the most intricate control component in the crate. It owns
//! at most one audio input and one video input, a set of outputs (each an
//! `(audio? encoder, video? encoder, endpoint)` tuple per spec §4.7), and
//! reacts to outputs starting/stopping by starting/stopping the shared
//! inputs (spec I4, I5). Per-output data pumping runs on dedicated OS
//! threads (one per active media track per output) rather than async
//! tasks, mirroring the thread-per-hardware-resource model of spec §5 — the
//! muxer/sink trait methods this crate ships are synchronous, so a thread
//! *is* the suspension point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::buffer_pool::{BufferPool, BufferPoolConfig};
use crate::compositor::Compositor;
use crate::encoder::{AudioEncoder, VideoEncoder};
use crate::endpoint::CompositeEndpoint;
use crate::error::{combine_errors, ErrorKind, Outcome, StreamError, StreamResult};
use crate::events::{EventEmitter, PipelineEvent};
use crate::types::{
    AspectRatioMode, AudioSource, AudioSourceConfig, CodecConfig, MediaKind, Rotation,
    SurfaceInput, SurfaceOutput, VideoSource, VideoSourceConfig,
};

use crate::audio_input::AudioInput;

/// Stable identifier for an output, handed out by [`Pipeline::add_output`]
/// and valid until the matching [`Pipeline::remove_output`] (spec §9: arena
/// + typed index, replacing the source repo's identity-keyed map).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub(crate) u64);

impl OutputId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Tuning knobs for a [`Pipeline`] instance.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub buffer_pool: BufferPoolConfig,
    /// Bounded channel capacity between a push-mode audio source and each
    /// output's encoder pump (spec §9: back-pressure turns a slow sink
    /// into an encoder stall, not unbounded memory growth).
    pub audio_consumer_channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_pool: BufferPoolConfig::default(),
            audio_consumer_channel_capacity: 16,
        }
    }
}

/// Per-output audio track: its declared source requirement, codec config
/// and the (caller-supplied) codec wrapper that will encode it.
pub struct AudioOutputSpec {
    pub source_config: AudioSourceConfig,
    pub codec_config: CodecConfig,
    pub encoder: Box<dyn AudioEncoder>,
}

/// Per-output compositor render target (spec §3.1 `SurfaceOutput`, minus
/// the id, which `Pipeline` assigns).
#[derive(Debug, Clone, Copy)]
pub struct SurfaceSpec {
    pub target_width: u32,
    pub target_height: u32,
    pub aspect_ratio_mode: AspectRatioMode,
    pub mirror: bool,
}

/// Per-output video track.
pub struct VideoOutputSpec {
    pub source_config: VideoSourceConfig,
    pub codec_config: CodecConfig,
    pub encoder: Box<dyn VideoEncoder>,
    pub surface: SurfaceSpec,
}

/// Everything needed to wire one output: which tracks it carries and where
/// they go. The `endpoint` (muxer + sinks) is supplied separately to
/// [`Pipeline::add_output`] since its sinks must already be open.
#[derive(Default)]
pub struct OutputSpec {
    pub audio: Option<AudioOutputSpec>,
    pub video: Option<VideoOutputSpec>,
}

struct AudioInputState {
    input: AudioInput,
    /// Mirrors whatever was last passed to `set_audio_source`/`AudioInput`,
    /// since `AudioInput` doesn't expose a getter for its negotiated config
    /// and I6 keeps this in lock-step (no reconfiguration while streaming).
    declared_config: AudioSourceConfig,
    streaming: bool,
}

struct VideoInputState {
    source: Box<dyn VideoSource>,
    device_id: Option<String>,
    config: Option<VideoSourceConfig>,
    producer_id: u64,
    streaming: bool,
}

struct OutputEntry {
    audio_stream_id: Option<crate::types::StreamId>,
    video_stream_id: Option<crate::types::StreamId>,
    /// Kept so [`Pipeline::set_output_audio_bitrate`] (the regulator's
    /// integration point) can reach the encoder that the pump thread also
    /// holds a clone of.
    audio_encoder: Option<Arc<Mutex<Box<dyn AudioEncoder>>>>,
    /// Kept so [`Pipeline::set_output_video_bitrate`] (the regulator's
    /// integration point) can reach the encoder that the pump
    /// thread also holds a clone of.
    video_encoder: Option<Arc<Mutex<Box<dyn VideoEncoder>>>>,
    endpoint: Arc<Mutex<CompositeEndpoint>>,
    streaming: Arc<AtomicBool>,
    audio_consumer_id: Option<u64>,
    surface_id: Option<u64>,
    threads: Vec<JoinHandle<()>>,
}

struct PipelineInner {
    audio: Mutex<Option<AudioInputState>>,
    video: Mutex<Option<VideoInputState>>,
    compositor: Mutex<Option<Compositor>>,
    outputs: Mutex<HashMap<OutputId, OutputEntry>>,
    next_output_id: AtomicU64,
    next_producer_id: AtomicU64,
    streaming: AtomicBool,
    released: AtomicBool,
    latest_error: Mutex<Option<StreamError>>,
    emitter: Arc<dyn EventEmitter>,
    buffer_pool: Arc<BufferPool>,
    config: PipelineConfig,
}

/// The orchestrator binding sources, encoders and endpoints (spec §4.7).
///
/// Cheap to clone: internally an `Arc` around the shared mutable state, so
/// background pump threads can hold a handle back to it for error
/// reporting without the caller juggling lifetimes.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, emitter: Arc<dyn EventEmitter>) -> Self {
        let buffer_pool = Arc::new(BufferPool::new(config.buffer_pool));
        Self {
            inner: Arc::new(PipelineInner {
                audio: Mutex::new(None),
                video: Mutex::new(None),
                compositor: Mutex::new(None),
                outputs: Mutex::new(HashMap::new()),
                next_output_id: AtomicU64::new(0),
                next_producer_id: AtomicU64::new(0),
                streaming: AtomicBool::new(false),
                released: AtomicBool::new(false),
                latest_error: Mutex::new(None),
                emitter,
                buffer_pool,
                config,
            }),
        }
    }

    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.inner.buffer_pool)
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::Acquire)
    }

    /// The single observable "latest error" stream per pipeline (spec §7).
    pub fn latest_error(&self) -> Option<StreamError> {
        self.inner.latest_error.lock().clone()
    }

    fn require_not_released(&self) -> StreamResult<()> {
        if self.inner.released.load(Ordering::Acquire) {
            return Err(StreamError::closed("pipeline has been released"));
        }
        Ok(())
    }

    // ── Source management (spec §4.2, §4.7) ──────────────────────────────

    /// Binds a new audio source. Rejected while any audio output is
    /// streaming (I6 forbids reconfiguration while streaming, and a source
    /// swap is handled the same way as a reconfiguration here). The
    /// previous source, if any, is stopped and released before the new one
    /// takes over (spec §4.7: "previous source is stopped before new
    /// source is started").
    pub fn set_audio_source(
        &self,
        mut source: Box<dyn AudioSource>,
        config: AudioSourceConfig,
    ) -> StreamResult<()> {
        self.require_not_released()?;
        let mut slot = self.inner.audio.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.streaming {
                return Err(StreamError::config(
                    "cannot replace audio source while streaming",
                ));
            }
        }
        if let Some(mut existing) = slot.take() {
            existing.input.release();
        }
        source.configure(config)?;
        let mut input = AudioInput::new();
        input.set_source(source, true)?;
        input.set_source_config(config)?;
        *slot = Some(AudioInputState {
            input,
            declared_config: config,
            streaming: false,
        });
        Ok(())
    }

    /// Binds a new video source (spec I7: at most one owning source
    /// instance per physical device — refused if the new source claims
    /// the same device id as the still-held previous source *and* that
    /// swap would violate exclusivity; here we simply refuse same-device
    /// swaps outright since this crate has no separate preview-consumer
    /// concept to defer release for).
    pub fn set_video_source(
        &self,
        mut source: Box<dyn VideoSource>,
        config: VideoSourceConfig,
    ) -> StreamResult<()> {
        self.require_not_released()?;
        let new_device_id = source.device_id().map(|s| s.to_string());
        let mut slot = self.inner.video.lock();
        if let Some(existing) = slot.as_ref() {
            if existing.streaming {
                return Err(StreamError::config(
                    "cannot replace video source while streaming",
                ));
            }
            if existing.device_id.is_some() && existing.device_id == new_device_id {
                return Err(StreamError::config(
                    "new video source claims the same exclusive device (I7)",
                ));
            }
        }
        if let Some(mut existing) = slot.take() {
            existing.source.release();
        }
        source.configure(config)?;
        let producer_id = self.inner.next_producer_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(VideoInputState {
            source,
            device_id: new_device_id,
            config: Some(config),
            producer_id,
            streaming: false,
        });
        Ok(())
    }

    fn ensure_compositor(&self) -> StreamResult<()> {
        let mut slot = self.inner.compositor.lock();
        if slot.is_none() {
            *slot = Some(Compositor::start());
        }
        Ok(())
    }

    /// Starts the compositor if it isn't already running and returns a
    /// handle a [`VideoSource`] can use to submit frames from its own
    /// capture thread. Call this before [`Pipeline::set_video_source`] so
    /// the source can be constructed with somewhere to push frames.
    pub fn compositor_handle(&self) -> crate::compositor::CompositorHandle {
        self.ensure_compositor()
            .expect("ensure_compositor never fails");
        self.inner
            .compositor
            .lock()
            .as_ref()
            .expect("compositor just ensured")
            .handle()
    }

    // ── Outputs (spec §4.7) ───────────────────────────────────────────────

    /// Adds a new output: validates media-config compatibility against the
    /// bound input(s) (spec §4.7), registers consumer channels / compositor
    /// surfaces, and spawns its encoder pump threads. The output starts
    /// not-streaming; call [`Pipeline::start_stream`] to activate it.
    pub fn add_output(
        &self,
        endpoint: CompositeEndpoint,
        spec: OutputSpec,
    ) -> StreamResult<OutputId> {
        self.require_not_released()?;
        if spec.audio.is_none() && spec.video.is_none() {
            return Err(StreamError::config("output has neither audio nor video"));
        }

        if let Some(audio) = &spec.audio {
            let bound = self.inner.audio.lock();
            match bound.as_ref() {
                Some(state) if state.declared_config.compatible_with(&audio.source_config) => {}
                Some(_) => {
                    return Err(StreamError::config(
                        "output's audio source config is incompatible with the bound input",
                    ))
                }
                None => return Err(StreamError::config("no audio source bound for audio output")),
            }
        }
        if let Some(video) = &spec.video {
            let bound = self.inner.video.lock();
            match bound.as_ref().and_then(|s| s.config) {
                Some(current) if current.compatible_with(&video.source_config) => {}
                Some(_) => {
                    return Err(StreamError::config(
                        "output's video source config is incompatible with the bound input",
                    ))
                }
                None => return Err(StreamError::config("no video source bound for video output")),
            }
        }

        let endpoint = Arc::new(Mutex::new(endpoint));
        let audio_stream_id = match &spec.audio {
            Some(audio) => Some(endpoint.lock().add_stream(&audio.codec_config)?),
            None => None,
        };
        let video_stream_id = match &spec.video {
            Some(video) => Some(endpoint.lock().add_stream(&video.codec_config)?),
            None => None,
        };

        let output_id = OutputId(self.inner.next_output_id.fetch_add(1, Ordering::Relaxed));
        let streaming = Arc::new(AtomicBool::new(false));

        let mut entry = OutputEntry {
            audio_stream_id,
            video_stream_id,
            audio_encoder: None,
            video_encoder: None,
            endpoint: Arc::clone(&endpoint),
            streaming: Arc::clone(&streaming),
            audio_consumer_id: None,
            surface_id: None,
            threads: Vec::new(),
        };

        if let Some(audio) = spec.audio {
            let encoder = Arc::new(Mutex::new(audio.encoder));
            entry.audio_encoder = Some(Arc::clone(&encoder));
            let (consumer_id, rx) = {
                let mut bound = self.inner.audio.lock();
                let state = bound.as_mut().expect("checked above");
                state
                    .input
                    .add_consumer(self.inner.config.audio_consumer_channel_capacity)
            };
            entry.audio_consumer_id = Some(consumer_id);
            let handle = spawn_audio_pump(
                rx,
                encoder,
                Arc::clone(&endpoint),
                audio_stream_id.expect("audio stream id set above"),
                Arc::clone(&streaming),
                output_id,
                Arc::clone(&self.inner),
            );
            entry.threads.push(handle);
        }

        if let Some(video) = spec.video {
            self.ensure_compositor()?;
            let encoder = Arc::new(Mutex::new(video.encoder));
            entry.video_encoder = Some(Arc::clone(&encoder));

            let mut surface = SurfaceOutput::new(
                output_id.0,
                video.surface.target_width,
                video.surface.target_height,
            );
            surface.aspect_ratio_mode = video.surface.aspect_ratio_mode;
            surface.mirror = video.surface.mirror;
            entry.surface_id = Some(output_id.0);

            let (tx, rx) = std::sync::mpsc::channel();
            self.inner
                .compositor
                .lock()
                .as_ref()
                .expect("ensured above")
                .register_output(surface, tx);

            let handle = spawn_video_pump(
                rx,
                encoder,
                Arc::clone(&endpoint),
                video_stream_id.expect("video stream id set above"),
                Arc::clone(&streaming),
                output_id,
                Arc::clone(&self.inner),
            );
            entry.threads.push(handle);
        }

        self.inner.outputs.lock().insert(output_id, entry);
        Ok(output_id)
    }

    /// Stops and detaches an output, releasing its compositor surface and
    /// consumer channel.
    pub fn remove_output(&self, output: OutputId) -> StreamResult<()> {
        let entry = self.inner.outputs.lock().remove(&output);
        let Some(entry) = entry else {
            return Ok(());
        };
        entry.streaming.store(false, Ordering::Release);
        if let Some(consumer_id) = entry.audio_consumer_id {
            if let Some(state) = self.inner.audio.lock().as_mut() {
                state.input.remove_consumer(consumer_id);
            }
        }
        if let Some(surface_id) = entry.surface_id {
            if let Some(compositor) = self.inner.compositor.lock().as_ref() {
                compositor.remove_output(surface_id);
            }
        }
        entry.endpoint.lock().close();
        self.check_inputs_after_output_change();
        Ok(())
    }

    /// Starts every connected output (spec §4.7). Aggregates failures into
    /// a multi-error; a failing output is reverted rather than left
    /// half-started (spec §4.7: "If compatibility fails, `start_stream` is
    /// rejected and the output reverts") — mirrors `Muxer::add_streams`'
    /// rollback-on-partial-failure pattern, one level up the stack.
    pub fn start_stream(&self) -> StreamResult<()> {
        self.require_not_released()?;
        let output_ids: Vec<OutputId> = self.inner.outputs.lock().keys().copied().collect();
        let mut started = Vec::with_capacity(output_ids.len());
        let mut results = Vec::with_capacity(output_ids.len());
        for id in output_ids {
            let result = self.start_output(id);
            if result.is_ok() {
                started.push(id);
            }
            results.push(result);
        }
        match Outcome::from_results(results, true) {
            Outcome::Ok(_) => {
                self.start_bound_inputs()?;
                self.set_streaming(true);
                Ok(())
            }
            Outcome::SingleError(e) => {
                self.rollback_started_outputs(&started);
                Err(e)
            }
            Outcome::Multi(errs) => {
                self.rollback_started_outputs(&started);
                Err(combine_errors(errs))
            }
        }
    }

    /// Stops every output in `ids` that `start_stream` already started
    /// before a sibling output failed, so a partial failure never leaves
    /// some outputs streaming while `start_stream` itself reports an error.
    fn rollback_started_outputs(&self, ids: &[OutputId]) {
        for &id in ids {
            let _ = self.stop_output(id);
        }
    }

    fn start_output(&self, id: OutputId) -> StreamResult<()> {
        let entry_endpoint = {
            let outputs = self.inner.outputs.lock();
            outputs.get(&id).map(|e| Arc::clone(&e.endpoint))
        };
        let Some(endpoint) = entry_endpoint else {
            return Ok(());
        };
        endpoint.lock().start_stream()?;

        let outputs = self.inner.outputs.lock();
        if let Some(entry) = outputs.get(&id) {
            entry.streaming.store(true, Ordering::Release);
            if let Some(compositor) = self.inner.compositor.lock().as_ref() {
                if let Some(surface_id) = entry.surface_id {
                    compositor.set_output_streaming(surface_id, true);
                }
            }
        }
        drop(outputs);
        self.inner.emitter.emit(PipelineEvent::OutputStateChanged {
            output: id,
            streaming: true,
        });
        Ok(())
    }

    fn start_bound_inputs(&self) -> StreamResult<()> {
        {
            let mut slot = self.inner.audio.lock();
            if let Some(state) = slot.as_mut() {
                if !state.streaming {
                    state.input.start_stream()?;
                    state.streaming = true;
                }
            }
        }
        {
            let mut video = self.inner.video.lock();
            if let Some(state) = video.as_mut() {
                if !state.streaming {
                    let surface = SurfaceInput {
                        producer_id: state.producer_id,
                        timestamp_offset_ns: 0,
                    };
                    if let Some(compositor) = self.inner.compositor.lock().as_ref() {
                        compositor.register_input(surface);
                    }
                    state.source.start_stream(surface)?;
                    state.streaming = true;
                }
            }
        }
        Ok(())
    }

    /// Stops inputs first (so no more frames are produced), then every
    /// output (spec §4.7).
    pub fn stop_stream(&self) -> StreamResult<()> {
        self.require_not_released()?;
        {
            let mut slot = self.inner.audio.lock();
            if let Some(state) = slot.as_mut() {
                state.input.stop_stream()?;
                state.streaming = false;
            }
        }
        {
            let mut slot = self.inner.video.lock();
            if let Some(state) = slot.as_mut() {
                state.source.stop_stream()?;
                state.streaming = false;
            }
        }

        let output_ids: Vec<OutputId> = self.inner.outputs.lock().keys().copied().collect();
        let mut results = Vec::with_capacity(output_ids.len());
        for id in output_ids {
            results.push(self.stop_output(id));
        }
        self.set_streaming(false);
        match Outcome::from_results(results, false) {
            Outcome::Ok(_) => Ok(()),
            Outcome::SingleError(e) => Err(e),
            Outcome::Multi(errs) => Err(combine_errors(errs)),
        }
    }

    fn stop_output(&self, id: OutputId) -> StreamResult<()> {
        let endpoint = {
            let outputs = self.inner.outputs.lock();
            outputs.get(&id).map(|e| Arc::clone(&e.endpoint))
        };
        let Some(endpoint) = endpoint else {
            return Ok(());
        };
        let result = endpoint.lock().stop_stream();

        let outputs = self.inner.outputs.lock();
        if let Some(entry) = outputs.get(&id) {
            entry.streaming.store(false, Ordering::Release);
            if let Some(compositor) = self.inner.compositor.lock().as_ref() {
                if let Some(surface_id) = entry.surface_id {
                    compositor.set_output_streaming(surface_id, false);
                }
            }
        }
        drop(outputs);
        self.inner.emitter.emit(PipelineEvent::OutputStateChanged {
            output: id,
            streaming: false,
        });
        result
    }

    /// Forwards a rotation change to every video-surface output (spec
    /// §4.7). The compositor picks up the new transform on its next frame.
    pub fn set_target_rotation(&self, rotation: Rotation) {
        let outputs = self.inner.outputs.lock();
        if let Some(compositor) = self.inner.compositor.lock().as_ref() {
            for entry in outputs.values() {
                if let Some(surface_id) = entry.surface_id {
                    compositor.set_target_rotation(surface_id, rotation);
                }
            }
        }
    }

    /// Pushes a new target bitrate into an output's running video encoder.
    /// The integration point a [`crate::regulator::BitrateRegulator`] tick
    /// calls into.
    pub fn set_output_video_bitrate(&self, output: OutputId, bitrate_bps: u32) -> StreamResult<()> {
        let outputs = self.inner.outputs.lock();
        let entry = outputs
            .get(&output)
            .ok_or_else(|| StreamError::config("no such output"))?;
        let encoder = entry
            .video_encoder
            .as_ref()
            .ok_or_else(|| StreamError::config("output has no video track"))?;
        encoder.lock().set_bitrate(bitrate_bps)
    }

    /// Pushes a new target bitrate into an output's running audio encoder.
    pub fn set_output_audio_bitrate(&self, output: OutputId, bitrate_bps: u32) -> StreamResult<()> {
        let outputs = self.inner.outputs.lock();
        let entry = outputs
            .get(&output)
            .ok_or_else(|| StreamError::config("no such output"))?;
        let encoder = entry
            .audio_encoder
            .as_ref()
            .ok_or_else(|| StreamError::config("output has no audio track"))?;
        encoder.lock().set_bitrate(bitrate_bps)
    }

    /// Per-sink metrics for one output's endpoint, in sink-add order. Feeds
    /// a [`crate::regulator::BitrateRegulator`]'s congestion polling.
    pub fn output_sink_metrics(&self, output: OutputId) -> StreamResult<Vec<crate::sink::SinkMetrics>> {
        let outputs = self.inner.outputs.lock();
        let entry = outputs
            .get(&output)
            .ok_or_else(|| StreamError::config("no such output"))?;
        Ok(entry.endpoint.lock().sink_metrics())
    }

    pub fn request_snapshot(
        &self,
        output: OutputId,
        rotation: Rotation,
    ) -> StreamResult<tokio::sync::oneshot::Receiver<StreamResult<crate::types::Snapshot>>> {
        let outputs = self.inner.outputs.lock();
        let entry = outputs
            .get(&output)
            .ok_or_else(|| StreamError::config("no such output"))?;
        let surface_id = entry
            .surface_id
            .ok_or_else(|| StreamError::config("output has no video surface"))?;
        let compositor = self.inner.compositor.lock();
        let compositor = compositor
            .as_ref()
            .ok_or_else(|| StreamError::config("compositor not running"))?;
        Ok(compositor.request_snapshot(surface_id, rotation))
    }

    /// Fully releases inputs and every output. Subsequent calls are no-ops
    /// (spec §8.2: `release` is idempotent).
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let output_ids: Vec<OutputId> = self.inner.outputs.lock().keys().copied().collect();
        for id in output_ids {
            let _ = self.remove_output(id);
        }
        if let Some(mut state) = self.inner.audio.lock().take() {
            state.input.release();
        }
        if let Some(mut state) = self.inner.video.lock().take() {
            state.source.release();
        }
        if let Some(mut compositor) = self.inner.compositor.lock().take() {
            compositor.release();
        }
        self.set_streaming(false);
        *self.inner.latest_error.lock() = None;
    }

    fn set_streaming(&self, streaming: bool) {
        let previous = self.inner.streaming.swap(streaming, Ordering::AcqRel);
        if previous != streaming {
            self.inner
                .emitter
                .emit(PipelineEvent::StreamingChanged { streaming });
        }
    }

    /// Spec I4/I5 reactive behavior: after an output stops, if no other
    /// output of that media kind is still streaming, stop the
    /// corresponding input; if every input is stopped, the pipeline's
    /// streaming flag falls to false.
    fn check_inputs_after_output_change(&self) {
        let (any_audio, any_video) = {
            let outputs = self.inner.outputs.lock();
            (
                outputs
                    .values()
                    .any(|e| e.audio_stream_id.is_some() && e.streaming.load(Ordering::Acquire)),
                outputs
                    .values()
                    .any(|e| e.video_stream_id.is_some() && e.streaming.load(Ordering::Acquire)),
            )
        };
        if !any_audio {
            if let Some(state) = self.inner.audio.lock().as_mut() {
                if state.streaming {
                    let _ = state.input.stop_stream();
                    state.streaming = false;
                }
            }
        }
        if !any_video {
            if let Some(state) = self.inner.video.lock().as_mut() {
                if state.streaming {
                    let _ = state.source.stop_stream();
                    state.streaming = false;
                }
            }
        }
        if !any_audio && !any_video {
            self.set_streaming(false);
        }
    }
}

/// Reports an error raised by an output's pump thread (spec §7
/// propagation policy): publishes it on the pipeline's error channel, and
/// — for non-fatal `Closed`/`Io` errors once the endpoint has actually
/// closed — knocks the output out of the streaming set and, if no sibling
/// output of the same media kind remains streaming, stops the shared
/// input (I4, I5). A `Fatal` error is surfaced for the caller to react to
/// by calling [`Pipeline::release`] (spec §7: "Fatal bubbles to the
/// caller and forces release" — the caller, not the background thread
/// that detected it, performs the teardown, since the detecting thread
/// may itself be one `release` would need to join).
fn report_output_error(
    inner: &Arc<PipelineInner>,
    output: OutputId,
    _kind: MediaKind,
    error: StreamError,
) {
    inner.emitter.emit(PipelineEvent::OutputErrored {
        output,
        error: error.clone(),
    });
    *inner.latest_error.lock() = Some(error.clone());

    if error.kind == ErrorKind::Fatal {
        return;
    }
    if !matches!(error.kind, ErrorKind::Closed | ErrorKind::Io) {
        return;
    }

    let endpoint_closed = {
        let outputs = inner.outputs.lock();
        match outputs.get(&output) {
            Some(entry) => !entry.endpoint.lock().is_opened(),
            None => return,
        }
    };
    if !endpoint_closed {
        return;
    }

    let was_streaming = {
        let outputs = inner.outputs.lock();
        match outputs.get(&output) {
            Some(entry) => entry.streaming.swap(false, Ordering::AcqRel),
            None => false,
        }
    };
    if was_streaming {
        inner.emitter.emit(PipelineEvent::OutputStateChanged {
            output,
            streaming: false,
        });
    }

    let (any_audio, any_video) = {
        let outputs = inner.outputs.lock();
        (
            outputs
                .values()
                .any(|e| e.audio_stream_id.is_some() && e.streaming.load(Ordering::Acquire)),
            outputs
                .values()
                .any(|e| e.video_stream_id.is_some() && e.streaming.load(Ordering::Acquire)),
        )
    };
    if !any_audio {
        if let Some(state) = inner.audio.lock().as_mut() {
            if state.streaming {
                let _ = state.input.stop_stream();
                state.streaming = false;
            }
        }
    }
    if !any_video {
        if let Some(state) = inner.video.lock().as_mut() {
            if state.streaming {
                let _ = state.source.stop_stream();
                state.streaming = false;
            }
        }
    }
    if !any_audio && !any_video {
        let previous = inner.streaming.swap(false, Ordering::AcqRel);
        if previous {
            inner
                .emitter
                .emit(PipelineEvent::StreamingChanged { streaming: false });
        }
    }
}

fn spawn_audio_pump(
    mut rx: tokio::sync::mpsc::Receiver<crate::types::RawFrame>,
    encoder: Arc<Mutex<Box<dyn AudioEncoder>>>,
    endpoint: Arc<Mutex<CompositeEndpoint>>,
    stream_id: crate::types::StreamId,
    streaming: Arc<AtomicBool>,
    output_id: OutputId,
    inner: Arc<PipelineInner>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("streamkit-audio-out-{}", output_id.0))
        .spawn(move || {
            while let Some(frame) = rx.blocking_recv() {
                if !streaming.load(Ordering::Acquire) {
                    frame.close();
                    continue;
                }
                let encoded = encoder.lock().encode(frame);
                match encoded {
                    Ok(frames) => {
                        for f in frames {
                            if let Err(err) = endpoint.lock().write(stream_id, f) {
                                report_output_error(&inner, output_id, MediaKind::Audio, err);
                            }
                        }
                    }
                    Err(err) => report_output_error(&inner, output_id, MediaKind::Audio, err),
                }
            }
        })
        .expect("failed to spawn audio output pump thread")
}

fn spawn_video_pump(
    rx: std::sync::mpsc::Receiver<crate::types::RawFrame>,
    encoder: Arc<Mutex<Box<dyn VideoEncoder>>>,
    endpoint: Arc<Mutex<CompositeEndpoint>>,
    stream_id: crate::types::StreamId,
    streaming: Arc<AtomicBool>,
    output_id: OutputId,
    inner: Arc<PipelineInner>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("streamkit-video-out-{}", output_id.0))
        .spawn(move || {
            for frame in rx.iter() {
                if !streaming.load(Ordering::Acquire) {
                    frame.close();
                    continue;
                }
                let encoded = encoder.lock().encode(frame, false);
                match encoded {
                    Ok(frames) => {
                        for f in frames {
                            if let Err(err) = endpoint.lock().write(stream_id, f) {
                                report_output_error(&inner, output_id, MediaKind::Video, err);
                            }
                        }
                    }
                    Err(err) => report_output_error(&inner, output_id, MediaKind::Video, err),
                }
            }
        })
        .expect("failed to spawn video output pump thread")
}
