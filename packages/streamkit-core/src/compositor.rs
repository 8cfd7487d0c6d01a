//! Video compositor: texture fan-out and per-output transform (spec §4.3, C4).
//!
//! Real GPU compositors run their draw calls on a dedicated thread because
//! the underlying graphics context is thread-affine; this module follows
//! that shape with a plain software compositor (nearest-neighbor scale +
//! axis-swap rotation over RGBA8 buffers) so the actor/lifecycle contract
//! can be exercised without a GPU driver dependency. `TsMuxer`-style crates
//! aside, the pixel math itself is pure and unit-testable without the actor.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

pub use crate::types::{AspectRatioMode, Rotation};
use crate::types::{PendingSnapshot, RawFrame, Snapshot, SurfaceInput, SurfaceOutput};

struct InputState {
    latest: Option<(i64, Bytes, u32, u32)>,
}

struct OutputState {
    surface: SurfaceOutput,
    sink: Option<std::sync::mpsc::Sender<RawFrame>>,
    pending_snapshot: Option<PendingSnapshot>,
}

enum Command {
    RegisterInput(SurfaceInput),
    RegisterOutput(SurfaceOutput, std::sync::mpsc::Sender<RawFrame>),
    RemoveOutput(u64),
    SetTargetRotation(u64, Rotation),
    SetOutputStreaming(u64, bool),
    SubmitFrame {
        producer_id: u64,
        pts_us: i64,
        width: u32,
        height: u32,
        rgba: Bytes,
    },
    RequestSnapshot(u64, PendingSnapshot),
    Release,
}

/// Handle to the compositor's dedicated actor thread.
///
/// Every method enqueues a command and returns immediately; the actor
/// thread applies commands in order, which is what gives frame arrival
/// and release a total order across concurrently-registered inputs and
/// outputs (spec §5).
pub struct Compositor {
    tx: Sender<Command>,
    handle: Option<JoinHandle<()>>,
}

impl Compositor {
    pub fn start() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = std::thread::Builder::new()
            .name("streamkit-compositor".into())
            .spawn(move || run_actor(rx))
            .expect("failed to spawn compositor thread");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    pub fn register_input(&self, input: SurfaceInput) {
        let _ = self.tx.send(Command::RegisterInput(input));
    }

    /// A cheap, `Clone`-able handle a [`crate::types::VideoSource`] can hold
    /// onto (typically from its own capture thread) to push frames without
    /// needing the actor's join handle or lifecycle methods.
    pub fn handle(&self) -> CompositorHandle {
        CompositorHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn register_output(&self, output: SurfaceOutput, sink: std::sync::mpsc::Sender<RawFrame>) {
        let _ = self.tx.send(Command::RegisterOutput(output, sink));
    }

    pub fn remove_output(&self, output_id: u64) {
        let _ = self.tx.send(Command::RemoveOutput(output_id));
    }

    pub fn set_target_rotation(&self, output_id: u64, rotation: Rotation) {
        let _ = self.tx.send(Command::SetTargetRotation(output_id, rotation));
    }

    pub fn set_output_streaming(&self, output_id: u64, streaming: bool) {
        let _ = self
            .tx
            .send(Command::SetOutputStreaming(output_id, streaming));
    }

    /// Delivers one newly-arrived producer frame (spec §4.3 frame arrival
    /// contract). `rgba` must be `width * height * 4` bytes, row-major,
    /// top-to-bottom.
    pub fn submit_frame(&self, producer_id: u64, pts_us: i64, width: u32, height: u32, rgba: Bytes) {
        let _ = self.tx.send(Command::SubmitFrame {
            producer_id,
            pts_us,
            width,
            height,
            rgba,
        });
    }

    /// Requests a still capture of `output_id` at the next render pass
    /// (spec §4.3 step 4). The returned receiver resolves once that pass
    /// completes, or with a `Cancelled` error if the compositor is released
    /// first.
    pub fn request_snapshot(
        &self,
        output_id: u64,
        rotation: Rotation,
    ) -> tokio::sync::oneshot::Receiver<crate::error::StreamResult<Snapshot>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let pending = PendingSnapshot {
            rotation,
            completion: tx,
        };
        let _ = self.tx.send(Command::RequestSnapshot(output_id, pending));
        rx
    }

    /// Tears the compositor down (spec §4.3 release contract): in-flight
    /// commands already queued are drained, pending snapshots are failed
    /// with `Cancelled`, then the actor thread exits.
    pub fn release(&mut self) {
        let _ = self.tx.send(Command::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Compositor {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.release();
        }
    }
}

/// A lightweight sender-only handle to a running [`Compositor`]. Video
/// sources registered via [`crate::pipeline::Pipeline::set_video_source`]
/// use this to submit captured frames from whatever thread produces them.
#[derive(Clone)]
pub struct CompositorHandle {
    tx: Sender<Command>,
}

impl CompositorHandle {
    /// See [`Compositor::submit_frame`].
    pub fn submit_frame(&self, producer_id: u64, pts_us: i64, width: u32, height: u32, rgba: Bytes) {
        let _ = self.tx.send(Command::SubmitFrame {
            producer_id,
            pts_us,
            width,
            height,
            rgba,
        });
    }
}

fn run_actor(rx: Receiver<Command>) {
    let mut inputs: HashMap<u64, InputState> = HashMap::new();
    let mut outputs: HashMap<u64, OutputState> = HashMap::new();

    for command in rx.iter() {
        match command {
            Command::RegisterInput(input) => {
                inputs.insert(input.producer_id, InputState { latest: None });
            }
            Command::RegisterOutput(surface, sink) => {
                let id = surface.id;
                outputs.insert(
                    id,
                    OutputState {
                        surface,
                        sink: Some(sink),
                        pending_snapshot: None,
                    },
                );
            }
            Command::RemoveOutput(id) => {
                // Deferred teardown (spec §4.3 release contract): drop the
                // sink first so no further composed frames are delivered,
                // then fail any snapshot still waiting on this output.
                if let Some(mut state) = outputs.remove(&id) {
                    state.sink = None;
                    fail_pending_snapshot(&mut state, "output removed");
                }
            }
            Command::SetTargetRotation(id, rotation) => {
                if let Some(state) = outputs.get_mut(&id) {
                    state.surface.rotation = rotation;
                }
            }
            Command::SetOutputStreaming(id, streaming) => {
                if let Some(state) = outputs.get_mut(&id) {
                    state.surface.set_streaming(streaming);
                }
            }
            Command::SubmitFrame {
                producer_id,
                pts_us,
                width,
                height,
                rgba,
            } => {
                // Step 1: overwrite any not-yet-consumed previous frame.
                if let Some(input) = inputs.get_mut(&producer_id) {
                    input.latest = Some((pts_us, rgba.clone(), width, height));
                } else {
                    debug!("frame for unregistered producer {producer_id}, ignoring");
                    continue;
                }

                // Steps 2-3: render every streaming output bound to this
                // producer and deliver the composed frame downstream.
                for state in outputs.values_mut() {
                    if !state.surface.is_streaming() {
                        continue;
                    }
                    let composed = compose_frame(&state.surface, width, height, &rgba);
                    if let Some(sink) = &state.sink {
                        let frame = RawFrame::new(composed, pts_us, || {});
                        if sink.send(frame).is_err() {
                            warn!("compositor output {} sink disconnected", state.surface.id);
                        }
                    }

                    // Step 4: complete any snapshot pending on this pass.
                    complete_pending_snapshot(state, width, height, &rgba);
                }
            }
            Command::RequestSnapshot(id, pending) => {
                match outputs.get_mut(&id) {
                    Some(state) if state.surface.is_streaming() => {
                        state.pending_snapshot = Some(pending);
                    }
                    // A non-streaming output will never render another pass
                    // to complete this against, so reject it outright
                    // rather than leave the caller waiting forever.
                    Some(_) => {
                        let _ = pending
                            .completion
                            .send(Err(crate::error::StreamError::unsupported(
                                "output is not streaming, no frame to snapshot",
                            )));
                    }
                    None => {
                        let _ = pending
                            .completion
                            .send(Err(crate::error::StreamError::unsupported(
                                "no such compositor output",
                            )));
                    }
                }
            }
            Command::Release => {
                for state in outputs.values_mut() {
                    fail_pending_snapshot(state, "compositor released");
                }
                break;
            }
        }
    }
}

fn fail_pending_snapshot(state: &mut OutputState, reason: &str) {
    if let Some(pending) = state.pending_snapshot.take() {
        let _ = pending
            .completion
            .send(Err(crate::error::StreamError::cancelled(reason)));
    }
}

fn complete_pending_snapshot(state: &mut OutputState, src_w: u32, src_h: u32, rgba: &Bytes) {
    let Some(pending) = state.pending_snapshot.take() else {
        return;
    };
    let rotated = apply_rotation(rgba, src_w, src_h, pending.rotation);
    let (width, height) = if pending.rotation.swaps_axes() {
        (src_h, src_w)
    } else {
        (src_w, src_h)
    };
    let _ = pending.completion.send(Ok(Snapshot {
        width,
        height,
        rgba: rotated,
    }));
}

/// Renders one producer frame onto an output surface: rotate, then scale to
/// the output's target dimensions according to its aspect ratio mode.
///
/// Pure function, independent of the actor, so it can be unit tested
/// directly without spinning up a compositor thread.
fn compose_frame(output: &SurfaceOutput, src_w: u32, src_h: u32, rgba: &Bytes) -> Bytes {
    let rotated = apply_rotation(rgba, src_w, src_h, output.rotation);
    let (rot_w, rot_h) = if output.rotation.swaps_axes() {
        (src_h, src_w)
    } else {
        (src_w, src_h)
    };
    scale(
        &rotated,
        rot_w,
        rot_h,
        output.target_width,
        output.target_height,
        output.aspect_ratio_mode,
    )
}

fn apply_rotation(rgba: &Bytes, width: u32, height: u32, rotation: Rotation) -> Bytes {
    if matches!(rotation, Rotation::Deg0) {
        return rgba.clone();
    }
    let (w, h) = (width as usize, height as usize);
    let mut out = vec![0u8; rgba.len()];
    for y in 0..h {
        for x in 0..w {
            let src = (y * w + x) * 4;
            let (dx, dy, dw) = match rotation {
                Rotation::Deg90 => (h - 1 - y, x, h),
                Rotation::Deg180 => (w - 1 - x, h - 1 - y, w),
                Rotation::Deg270 => (y, w - 1 - x, h),
                Rotation::Deg0 => unreachable!(),
            };
            let dst = (dy * dw + dx) * 4;
            out[dst..dst + 4].copy_from_slice(&rgba[src..src + 4]);
        }
    }
    Bytes::from(out)
}

/// Nearest-neighbor scale from `(src_w, src_h)` to `(dst_w, dst_h)`.
///
/// `Stretch` fills the whole target ignoring aspect ratio. `Preserve` and
/// `Crop` both compute a uniform scale factor; `Preserve` letterboxes the
/// remainder with black, `Crop` overscans and clips.
fn scale(
    rgba: &Bytes,
    src_w: u32,
    src_h: u32,
    dst_w: u32,
    dst_h: u32,
    mode: AspectRatioMode,
) -> Bytes {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return Bytes::from(vec![0u8; (dst_w as usize) * (dst_h as usize) * 4]);
    }

    let mut out = vec![0u8; (dst_w as usize) * (dst_h as usize) * 4];
    let (scale_x, scale_y, offset_x, offset_y) = match mode {
        AspectRatioMode::Stretch => (
            src_w as f64 / dst_w as f64,
            src_h as f64 / dst_h as f64,
            0.0,
            0.0,
        ),
        AspectRatioMode::Preserve | AspectRatioMode::Crop => {
            let src_ratio = src_w as f64 / src_h as f64;
            let dst_ratio = dst_w as f64 / dst_h as f64;
            let fit_wider = match mode {
                AspectRatioMode::Preserve => src_ratio > dst_ratio,
                AspectRatioMode::Crop => src_ratio < dst_ratio,
                AspectRatioMode::Stretch => unreachable!(),
            };
            if fit_wider {
                let scale = src_w as f64 / dst_w as f64;
                let visible_h = dst_h as f64 * scale;
                (scale, scale, 0.0, (src_h as f64 - visible_h) / 2.0)
            } else {
                let scale = src_h as f64 / dst_h as f64;
                let visible_w = dst_w as f64 * scale;
                (scale, scale, (src_w as f64 - visible_w) / 2.0, 0.0)
            }
        }
    };

    for dy in 0..dst_h {
        for dx in 0..dst_w {
            let sx = (dx as f64 * scale_x + offset_x).floor() as i64;
            let sy = (dy as f64 * scale_y + offset_y).floor() as i64;
            if sx < 0 || sy < 0 || sx as u32 >= src_w || sy as u32 >= src_h {
                continue; // letterbox: leave transparent black
            }
            let src = (sy as usize * src_w as usize + sx as usize) * 4;
            let dst = (dy as usize * dst_w as usize + dx as usize) * 4;
            out[dst..dst + 4].copy_from_slice(&rgba[src..src + 4]);
        }
    }
    Bytes::from(out)
}
