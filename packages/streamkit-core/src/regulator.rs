//! Periodic bitrate feedback loop (spec §4.8, C6).
//!
//! Every tick the regulator estimates link congestion from sink statistics
//! and decides whether to step bitrates down, up, or leave them alone.
//! Congestion is `max(buffer_drain_seconds, loss_ratio)` (spec §4.8): the
//! first term is how many seconds of queued data the sink is sitting on
//! relative to how fast it's actually draining, the second is observed
//! packet loss against a configured threshold. `congestion > 1` steps the
//! video bitrate down by [`RegulatorConfig::step_down_factor`] (floor
//! clamped); only once video has bottomed out does a further congested
//! tick touch audio. `congestion < 0.5` for two consecutive windows steps
//! both back up by [`RegulatorConfig::step_up_factor`] (ceiling clamped).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::runtime::TaskSpawner;

/// Sink-observed throughput for one tick, used to decide congestion (spec
/// §4.8: "bytes sent, RTT, packet loss, sink buffer occupancy").
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkStats {
    /// Bytes still queued at the sink (SRT send buffer, socket write
    /// buffer, ...), not yet confirmed flushed to the wire.
    pub queued_bytes: u64,
    /// Bytes the sink actually drained to the wire since the last tick.
    pub bytes_sent_since_last_tick: u64,
    /// Percentage (0-100) of packets lost since the last tick. Sinks with
    /// no loss telemetry of their own (file, content) report 0; `SrtSink`
    /// derives this from failed `send` calls.
    pub packet_loss_percent: f64,
}

/// Tuning knobs for [`BitrateRegulator`].
#[derive(Debug, Clone, Copy)]
pub struct RegulatorConfig {
    pub tick_interval: Duration,
    pub video_min_bitrate_bps: u32,
    pub video_max_bitrate_bps: u32,
    pub audio_min_bitrate_bps: u32,
    pub audio_max_bitrate_bps: u32,
    /// Packet-loss percentage at which the loss term of the congestion
    /// formula reaches 1.0 (spec §4.8 "configured-loss-threshold").
    pub loss_threshold_percent: f64,
    /// Multiplicative factor applied to a bitrate on a congested tick.
    pub step_down_factor: f64,
    /// Multiplicative factor applied to a bitrate after two consecutive
    /// uncongested ticks.
    pub step_up_factor: f64,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            video_min_bitrate_bps: 300_000,
            video_max_bitrate_bps: 6_000_000,
            audio_min_bitrate_bps: 32_000,
            audio_max_bitrate_bps: 160_000,
            loss_threshold_percent: 25.0,
            step_down_factor: 0.8,
            step_up_factor: 1.1,
        }
    }
}

/// Outcome of one regulator tick, handed to the caller so it can push the
/// new targets into the running encoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateTargets {
    pub video_bitrate_bps: u32,
    pub audio_bitrate_bps: u32,
}

/// Holds the current video/audio bitrate targets and recomputes them from
/// [`SinkStats`] on each tick.
pub struct BitrateRegulator {
    config: RegulatorConfig,
    video_bitrate_bps: AtomicU32,
    audio_bitrate_bps: AtomicU32,
    /// Count of consecutive ticks with congestion < 0.5 (spec §4.8: a
    /// step-up only fires once this reaches 2).
    low_congestion_streak: Mutex<u32>,
}

impl BitrateRegulator {
    pub fn new(config: RegulatorConfig, initial_video_bps: u32, initial_audio_bps: u32) -> Self {
        Self {
            video_bitrate_bps: AtomicU32::new(
                initial_video_bps.clamp(config.video_min_bitrate_bps, config.video_max_bitrate_bps),
            ),
            audio_bitrate_bps: AtomicU32::new(
                initial_audio_bps.clamp(config.audio_min_bitrate_bps, config.audio_max_bitrate_bps),
            ),
            low_congestion_streak: Mutex::new(0),
            config,
        }
    }

    pub fn current_targets(&self) -> BitrateTargets {
        BitrateTargets {
            video_bitrate_bps: self.video_bitrate_bps.load(Ordering::Acquire),
            audio_bitrate_bps: self.audio_bitrate_bps.load(Ordering::Acquire),
        }
    }

    /// `max(sink-buffer-bytes / send-bandwidth, packet-loss% / threshold%)`
    /// (spec §4.8). Bandwidth is estimated from this tick's observed
    /// throughput; with no throughput sample yet, the buffer term is
    /// treated as non-congesting rather than divide-by-zero-congested.
    fn congestion(&self, stats: &SinkStats) -> f64 {
        let tick_secs = self.config.tick_interval.as_secs_f64().max(f64::EPSILON);
        let bandwidth_bps = stats.bytes_sent_since_last_tick as f64 / tick_secs;
        let buffer_term = if bandwidth_bps > 0.0 {
            stats.queued_bytes as f64 / bandwidth_bps
        } else if stats.queued_bytes > 0 {
            f64::INFINITY
        } else {
            0.0
        };
        let loss_term = stats.packet_loss_percent / self.config.loss_threshold_percent.max(f64::EPSILON);
        buffer_term.max(loss_term)
    }

    /// Recomputes bitrate targets from one tick's stats and stores them.
    /// Returns the new targets (whether or not they changed).
    pub fn tick(&self, stats: &SinkStats) -> BitrateTargets {
        let congestion = self.congestion(stats);
        let video_before = self.video_bitrate_bps.load(Ordering::Acquire);

        let step_up = if congestion < 0.5 {
            let mut streak = self.low_congestion_streak.lock();
            *streak += 1;
            if *streak >= 2 {
                *streak = 0;
                true
            } else {
                false
            }
        } else {
            *self.low_congestion_streak.lock() = 0;
            false
        };
        let step_down = congestion > 1.0;

        let video_after = if step_down {
            scale(
                video_before,
                self.config.step_down_factor,
                self.config.video_min_bitrate_bps,
                self.config.video_max_bitrate_bps,
            )
        } else if step_up {
            scale(
                video_before,
                self.config.step_up_factor,
                self.config.video_min_bitrate_bps,
                self.config.video_max_bitrate_bps,
            )
        } else {
            video_before
        };
        self.video_bitrate_bps.store(video_after, Ordering::Release);

        // Audio only moves down once video has bottomed out (spec §4.8);
        // it always rides back up alongside video on sustained headroom.
        let audio_before = self.audio_bitrate_bps.load(Ordering::Acquire);
        let audio_after = if step_down && video_after <= self.config.video_min_bitrate_bps {
            scale(
                audio_before,
                self.config.step_down_factor,
                self.config.audio_min_bitrate_bps,
                self.config.audio_max_bitrate_bps,
            )
        } else if step_up {
            scale(
                audio_before,
                self.config.step_up_factor,
                self.config.audio_min_bitrate_bps,
                self.config.audio_max_bitrate_bps,
            )
        } else {
            audio_before
        };
        self.audio_bitrate_bps.store(audio_after, Ordering::Release);

        BitrateTargets {
            video_bitrate_bps: video_after,
            audio_bitrate_bps: audio_after,
        }
    }

    /// Spawns the periodic tick loop on `spawner`. `poll_stats` is called
    /// once per tick to gather current sink stats; `on_targets` receives
    /// the resulting targets, typically forwarding them to the running
    /// encoders via `VideoEncoder::set_bitrate`/`AudioEncoder::set_bitrate`.
    pub fn spawn_loop(
        self: Arc<Self>,
        spawner: &dyn TaskSpawner,
        mut poll_stats: impl FnMut() -> SinkStats + Send + 'static,
        mut on_targets: impl FnMut(BitrateTargets) + Send + 'static,
    ) {
        let interval = self.config.tick_interval;
        spawner.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let stats = poll_stats();
                let targets = self.tick(&stats);
                on_targets(targets);
            }
        });
    }
}

fn scale(current: u32, factor: f64, min: u32, max: u32) -> u32 {
    let next = (current as f64 * factor).round() as i64;
    next.clamp(min as i64, max as i64) as u32
}
