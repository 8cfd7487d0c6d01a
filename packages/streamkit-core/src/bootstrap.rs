//! Composition root wiring a [`Pipeline`], its [`BitrateRegulator`] and a
//! [`TaskSpawner`] together.
//!
//! This module doesn't construct any capture sources or codec wrappers
//! itself — those live in `streamkit-capture` (synthetic) or a
//! platform-specific crate (real), both of which depend on this crate
//! rather than the other way around. What's bootstrapped here is the
//! orchestration plumbing every host needs regardless of which sources and
//! encoders it plugs in: the pipeline, the bitrate feedback loop, and the
//! runtime handle that drives it.

use std::collections::HashMap;
use std::sync::Arc;

use crate::events::EventEmitter;
use crate::pipeline::{OutputId, Pipeline, PipelineConfig};
use crate::regulator::{BitrateRegulator, BitrateTargets, RegulatorConfig, SinkStats};
use crate::runtime::TokioSpawner;

/// Tuning knobs for [`bootstrap_pipeline`].
pub struct BootstrapConfig {
    pub pipeline: PipelineConfig,
    pub regulator: RegulatorConfig,
    pub initial_video_bitrate_bps: u32,
    pub initial_audio_bitrate_bps: u32,
    pub emitter: Arc<dyn EventEmitter>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            regulator: RegulatorConfig::default(),
            initial_video_bitrate_bps: 2_000_000,
            initial_audio_bitrate_bps: 128_000,
            emitter: Arc::new(crate::events::NoopEventEmitter),
        }
    }
}

/// Container for the services wired during bootstrap: the orchestrator
/// itself, its bitrate regulator, and the spawner driving the regulator's
/// tick loop.
#[derive(Clone)]
pub struct BootstrappedPipeline {
    pub pipeline: Pipeline,
    pub regulator: Arc<BitrateRegulator>,
    pub spawner: TokioSpawner,
}

impl BootstrappedPipeline {
    /// Starts the regulator's periodic tick loop, aggregating sink metrics
    /// across `outputs` and pushing the resulting targets back into each
    /// output's encoders via [`Pipeline::set_output_video_bitrate`] /
    /// [`Pipeline::set_output_audio_bitrate`]. An output missing a given
    /// track is silently skipped for that track.
    ///
    /// Must be called from within a Tokio runtime — the regulator's tick
    /// loop is a spawned task rather than a dedicated thread, since unlike
    /// the compositor or a capture source it has no hardware affinity to
    /// justify one.
    pub fn start_regulation(&self, outputs: Vec<OutputId>) {
        let mut previous_bytes: HashMap<OutputId, u64> =
            outputs.iter().map(|id| (*id, 0)).collect();

        let poll_pipeline = self.pipeline.clone();
        let poll_outputs = outputs.clone();
        let poll_stats = move || {
            let mut stats = SinkStats::default();
            let mut dropped_total = 0u64;
            for &id in &poll_outputs {
                let Ok(metrics) = poll_pipeline.output_sink_metrics(id) else {
                    continue;
                };
                let written: u64 = metrics.iter().map(|m| m.bytes_written).sum();
                let queued: u64 = metrics.iter().map(|m| m.queued_bytes).sum();
                let dropped: u64 = metrics.iter().map(|m| m.dropped_frames).sum();
                let last = previous_bytes.entry(id).or_insert(0);
                stats.bytes_sent_since_last_tick += written.saturating_sub(*last);
                *last = written;
                stats.queued_bytes += queued;
                dropped_total += dropped;
            }
            // SinkMetrics carries no packet count, only a dropped-frame
            // tally, so a single dropped frame this tick is treated as
            // full loss; sinks currently report drops all-or-nothing
            // (see SrtSink::write), which keeps this from being noisy.
            stats.packet_loss_percent = if dropped_total > 0 { 100.0 } else { 0.0 };
            stats
        };

        let apply_pipeline = self.pipeline.clone();
        let on_targets = move |targets: BitrateTargets| {
            for &id in &outputs {
                if let Err(err) = apply_pipeline.set_output_video_bitrate(id, targets.video_bitrate_bps) {
                    log::debug!("output {id:?} skipped for video bitrate regulation: {err}");
                }
                if let Err(err) = apply_pipeline.set_output_audio_bitrate(id, targets.audio_bitrate_bps) {
                    log::debug!("output {id:?} skipped for audio bitrate regulation: {err}");
                }
            }
        };

        Arc::clone(&self.regulator).spawn_loop(&self.spawner, poll_stats, on_targets);
    }
}

/// Wires a fresh [`Pipeline`] to a [`BitrateRegulator`] and a
/// [`TokioSpawner`] bound to the calling task's runtime.
///
/// # Panics
///
/// Panics if called outside of a Tokio runtime context (see
/// [`TokioSpawner::current`]).
pub fn bootstrap_pipeline(config: BootstrapConfig) -> BootstrappedPipeline {
    let pipeline = Pipeline::new(config.pipeline, config.emitter);
    let regulator = Arc::new(BitrateRegulator::new(
        config.regulator,
        config.initial_video_bitrate_bps,
        config.initial_audio_bitrate_bps,
    ));
    let spawner = TokioSpawner::current();
    BootstrappedPipeline {
        pipeline,
        regulator,
        spawner,
    }
}
