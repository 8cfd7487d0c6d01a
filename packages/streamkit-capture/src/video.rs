//! Solid-color synthetic video source.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;

use streamkit_core::compositor::CompositorHandle;
use streamkit_core::error::{StreamError, StreamResult};
use streamkit_core::types::{SurfaceInput, VideoSource, VideoSourceConfig};

/// Video source that draws a flat RGBA color at a fixed resolution/fps,
/// pushing frames onto its assigned compositor input from a dedicated
/// capture thread — the same shape a real camera HAL or screen-capture
/// source would use (configure → start_stream(surface) spawns the capture
/// thread → stop_stream joins it).
pub struct SolidColorSource {
    compositor: CompositorHandle,
    color: [u8; 4],
    config: Option<VideoSourceConfig>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SolidColorSource {
    pub fn new(compositor: CompositorHandle, color: [u8; 4]) -> Self {
        Self {
            compositor,
            color,
            config: None,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    fn frame_bytes(config: &VideoSourceConfig, color: [u8; 4]) -> Bytes {
        let mut pixels = Vec::with_capacity(config.width as usize * config.height as usize * 4);
        for _ in 0..(config.width as usize * config.height as usize) {
            pixels.extend_from_slice(&color);
        }
        Bytes::from(pixels)
    }
}

impl VideoSource for SolidColorSource {
    fn configure(&mut self, config: VideoSourceConfig) -> StreamResult<()> {
        if config.width == 0 || config.height == 0 {
            return Err(StreamError::config("SolidColorSource needs a non-zero resolution"));
        }
        self.config = Some(config);
        Ok(())
    }

    fn start_stream(&mut self, surface: SurfaceInput) -> StreamResult<()> {
        let config = self
            .config
            .ok_or_else(|| StreamError::config("SolidColorSource has no config"))?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let compositor = self.compositor.clone();
        let color = self.color;
        let running = Arc::clone(&self.running);
        let frame = Self::frame_bytes(&config, color);
        let frame_interval = Duration::from_micros(1_000_000 / config.fps.max(1) as u64);

        self.thread = Some(
            thread::Builder::new()
                .name("streamkit-solid-color-source".into())
                .spawn(move || {
                    let mut pts_us: i64 = surface.timestamp_offset_ns / 1_000;
                    while running.load(Ordering::Acquire) {
                        compositor.submit_frame(
                            surface.producer_id,
                            pts_us,
                            config.width,
                            config.height,
                            frame.clone(),
                        );
                        pts_us += frame_interval.as_micros() as i64;
                        thread::sleep(frame_interval);
                    }
                })
                .expect("failed to spawn solid-color capture thread"),
        );
        Ok(())
    }

    fn stop_stream(&mut self) -> StreamResult<()> {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn release(&mut self) {
        let _ = self.stop_stream();
        self.config = None;
    }

    /// A synthetic source claims no physical device, so it is never subject
    /// to the exclusive-device check the orchestrator applies to real
    /// camera sources.
    fn device_id(&self) -> Option<&str> {
        None
    }
}

impl Drop for SolidColorSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}
