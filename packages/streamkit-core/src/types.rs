//! Core carrier types shared by every pipeline stage (spec §3).
//!
//! [`RawFrame`] flows from a source into the compositor/encoder, [`Frame`]
//! flows from an encoder into a muxer, and [`Packet`] flows from a muxer into
//! a sink. All three are cheap to clone (backed by [`bytes::Bytes`]) but each
//! has its own ownership/lifecycle discipline documented on the type.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::buffer_pool::{Buffer, BufferPool};
use crate::error::{StreamError, StreamResult};

// ─────────────────────────────────────────────────────────────────────────────
// RawFrame (I1)
// ─────────────────────────────────────────────────────────────────────────────

struct RawFrameInner {
    closed: AtomicBool,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// One capture period of raw samples or one raw video frame.
///
/// Produced by a source, owned by exactly one consumer at a time, and must
/// be [`close`](RawFrame::close)d exactly once — a second call is a no-op
/// (spec I1). Cloning a `RawFrame` is intentionally not supported directly;
/// use [`RawFrame::fan_out`] to hand the same underlying buffer to several
/// consumers with reference-counted release.
pub struct RawFrame {
    pub data: Bytes,
    /// Presentation timestamp in microseconds, monotonic per spec I3.
    pub pts_us: i64,
    inner: Arc<RawFrameInner>,
}

impl RawFrame {
    /// Creates a frame that owns a single buffer, returning it to `pool` on close.
    pub fn from_buffer(buffer: Buffer, pts_us: i64, pool: Arc<BufferPool>) -> Self {
        let data = Bytes::copy_from_slice(buffer.as_slice());
        Self::new(data, pts_us, move || pool.put(buffer))
    }

    /// Creates a frame with an arbitrary close callback (test/synthetic sources).
    pub fn new(data: Bytes, pts_us: i64, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self {
            data,
            pts_us,
            inner: Arc::new(RawFrameInner {
                closed: AtomicBool::new(false),
                on_close: Mutex::new(Some(Box::new(on_close))),
            }),
        }
    }

    /// Fans a single captured buffer out to `n` consumers (spec §4.2).
    ///
    /// Each returned frame is independently closeable; the underlying buffer
    /// is returned to `pool` only once all `n` copies have been closed.
    pub fn fan_out(buffer: Buffer, pts_us: i64, pool: Arc<BufferPool>, n: usize) -> Vec<RawFrame> {
        assert!(n > 0, "fan_out requires at least one consumer");
        let data = Bytes::copy_from_slice(buffer.as_slice());
        let remaining = Arc::new(AtomicUsize::new(n));
        let shared_buffer = Arc::new(Mutex::new(Some(buffer)));

        (0..n)
            .map(|_| {
                let remaining = Arc::clone(&remaining);
                let shared_buffer = Arc::clone(&shared_buffer);
                let pool = Arc::clone(&pool);
                Self::new(data.clone(), pts_us, move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(buffer) = shared_buffer.lock().unwrap().take() {
                            pool.put(buffer);
                        }
                    }
                })
            })
            .collect()
    }

    /// Fans a frame whose contents are already decoupled from the pool
    /// buffer (e.g. after mixing or muting) out to `n` consumers, releasing
    /// `buffer` back to `pool` once every copy has closed.
    pub fn fan_out_with_data(
        data: Bytes,
        pts_us: i64,
        buffer: Buffer,
        pool: Arc<BufferPool>,
        n: usize,
    ) -> Vec<RawFrame> {
        assert!(n > 0, "fan_out_with_data requires at least one consumer");
        let remaining = Arc::new(AtomicUsize::new(n));
        let shared_buffer = Arc::new(Mutex::new(Some(buffer)));

        (0..n)
            .map(|_| {
                let remaining = Arc::clone(&remaining);
                let shared_buffer = Arc::clone(&shared_buffer);
                let pool = Arc::clone(&pool);
                Self::new(data.clone(), pts_us, move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(buffer) = shared_buffer.lock().unwrap().take() {
                            pool.put(buffer);
                        }
                    }
                })
            })
            .collect()
    }

    /// Returns a frame with the same close callback but zeroed contents
    /// (used by mute, spec §4.2 — mute zeroes in place rather than
    /// suppressing, so downstream pacing is unaffected).
    pub fn with_silenced_data(self) -> Self {
        let silence = Bytes::from(vec![0u8; self.data.len()]);
        Self {
            data: silence,
            pts_us: self.pts_us,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Closes the frame, running the release callback at most once (I1).
    pub fn close(&self) {
        if self
            .inner
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(f) = self.inner.on_close.lock().unwrap().take() {
                f();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        // Only the last surviving `Arc` handle actually runs close-on-drop;
        // explicit `close()` calls from the consumer are the common path.
        if Arc::strong_count(&self.inner) == 1 {
            self.close();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Media kind, codecs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AudioCodec {
    Aac,
    Opus,
}

impl AudioCodec {
    pub const fn mime(&self) -> &'static str {
        match self {
            Self::Aac => "audio/mp4a-latm",
            Self::Opus => "audio/opus",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    pub const fn mime(&self) -> &'static str {
        match self {
            Self::H264 => "video/avc",
            Self::H265 => "video/hevc",
            Self::Vp9 => "video/x-vnd.on2.vp9",
            Self::Av1 => "video/av01",
        }
    }

    /// Whether this codec is supported by the given muxer family (used by
    /// muxers to reject `add_stream` with `Unsupported`).
    pub const fn supported_by_ts(&self) -> bool {
        matches!(self, Self::H264 | Self::H265)
    }

    pub const fn supported_by_flv(&self) -> bool {
        matches!(self, Self::H264 | Self::H265 | Self::Vp9 | Self::Av1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Audio(AudioCodec),
    Video(VideoCodec),
}

impl Codec {
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    pub const fn mime(&self) -> &'static str {
        match self {
            Self::Audio(c) => c.mime(),
            Self::Video(c) => c.mime(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frame (encoded access unit) — I2
// ─────────────────────────────────────────────────────────────────────────────

/// An encoded access unit handed from an encoder to a muxer.
///
/// Invariant (I2): for video key frames and every audio frame, `csd` is
/// non-empty; for video non-key frames, `csd` is empty. Use
/// [`Frame::new`] which enforces this rather than constructing the struct
/// literal directly.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub pts_us: i64,
    pub dts_us: Option<i64>,
    pub is_key_frame: bool,
    pub csd: Vec<Bytes>,
    pub codec: Codec,
}

impl Frame {
    pub fn new(
        data: Bytes,
        pts_us: i64,
        dts_us: Option<i64>,
        is_key_frame: bool,
        csd: Vec<Bytes>,
        codec: Codec,
    ) -> StreamResult<Self> {
        let needs_csd = match codec.kind() {
            MediaKind::Audio => true,
            MediaKind::Video => is_key_frame,
        };
        if needs_csd && csd.is_empty() {
            return Err(StreamError::protocol(
                "frame requires non-empty codec-specific data (I2)",
            ));
        }
        if codec.kind() == MediaKind::Video && !is_key_frame && !csd.is_empty() {
            return Err(StreamError::protocol(
                "non-key video frame must not carry codec-specific data (I2)",
            ));
        }
        Ok(Self {
            data,
            pts_us,
            dts_us,
            is_key_frame,
            csd,
            codec,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Packet (muxed container bytes)
// ─────────────────────────────────────────────────────────────────────────────

/// Container-ready bytes produced by a muxer and consumed by a sink.
#[derive(Debug, Clone)]
pub struct Packet {
    pub data: Bytes,
    pub is_first_of_frame: bool,
    pub is_last_of_frame: bool,
    pub timestamp_us: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// StreamId
// ─────────────────────────────────────────────────────────────────────────────

/// Stable identifier for a stream added to an endpoint, stable until `stopStream`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dynamic range profile
// ─────────────────────────────────────────────────────────────────────────────

/// Color-space/transfer-function pairing, collapsed to the three profiles the
/// pipeline distinguishes (spec §3.1). HDR strictly covers SDR; HDR10
/// strictly covers HLG10 (spec §4.7 covering rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DynamicRangeProfile {
    #[default]
    Sdr,
    Hlg10,
    Hdr10,
}

impl DynamicRangeProfile {
    pub const fn is_hdr(&self) -> bool {
        !matches!(self, Self::Sdr)
    }

    /// Whether `self` covers (is at least as capable as) `other`.
    pub const fn covers(&self, other: &Self) -> bool {
        match (self, other) {
            (a, b) if matches!((a, b), (Self::Sdr, Self::Sdr))
                || matches!((a, b), (Self::Hlg10, Self::Hlg10))
                || matches!((a, b), (Self::Hdr10, Self::Hdr10)) =>
            {
                true
            }
            (Self::Hlg10, Self::Sdr) | (Self::Hdr10, Self::Sdr) | (Self::Hdr10, Self::Hlg10) => {
                true
            }
            _ => false,
        }
    }

    /// The strictest profile covering both `a` and `b`.
    pub fn join(a: Self, b: Self) -> Self {
        if a.covers(&b) {
            a
        } else if b.covers(&a) {
            b
        } else {
            // Neither covers the other (SDR vs HLG10 pairing never reaches
            // here since HLG10 covers SDR) — fall back to the strictest
            // known profile.
            Self::Hdr10
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source config / codec config (§3.1, §4.7 join)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ByteFormat {
    U8,
    S16Le,
    S24Le,
    F32Le,
}

impl ByteFormat {
    pub const fn bytes_per_sample(&self) -> u8 {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S24Le => 3,
            Self::F32Le => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSourceConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub byte_format: ByteFormat,
}

impl AudioSourceConfig {
    /// Joins `self` with `other`, taking the maximum channel count, maximum
    /// sample rate and widest byte format (spec §4.7 covering rule).
    pub fn join(self, other: Self) -> Self {
        Self {
            sample_rate: self.sample_rate.max(other.sample_rate),
            channels: self.channels.max(other.channels),
            byte_format: self.byte_format.max(other.byte_format),
        }
    }

    /// Equality used by the orchestrator's compatibility check (spec §4.7):
    /// channel/sample/byte format equality, ignoring nothing else.
    pub fn compatible_with(&self, other: &Self) -> bool {
        self == other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoSourceConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub dynamic_range: DynamicRangeProfile,
}

impl VideoSourceConfig {
    /// Joins `self` with `other`: maximum resolution by pixel count, maximum
    /// fps, strictest dynamic-range profile (spec §4.7 covering rule).
    pub fn join(self, other: Self) -> Self {
        let (width, height) = if self.width as u64 * self.height as u64
            >= other.width as u64 * other.height as u64
        {
            (self.width, self.height)
        } else {
            (other.width, other.height)
        };
        Self {
            width,
            height,
            fps: self.fps.max(other.fps),
            dynamic_range: DynamicRangeProfile::join(self.dynamic_range, other.dynamic_range),
        }
    }

    /// Compatibility check used by the orchestrator (spec §4.7): fps and
    /// dynamic-range must match; resolution need not (the compositor scales).
    pub fn compatible_with(&self, other: &Self) -> bool {
        self.fps == other.fps && self.dynamic_range == other.dynamic_range
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceConfig {
    Audio(AudioSourceConfig),
    Video(VideoSourceConfig),
}

impl SourceConfig {
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    /// Joins two configs of the same media kind (spec §4.7). Panics if the
    /// kinds differ — callers only ever join configs of like outputs.
    pub fn join(self, other: Self) -> Self {
        match (self, other) {
            (Self::Audio(a), Self::Audio(b)) => Self::Audio(a.join(b)),
            (Self::Video(a), Self::Video(b)) => Self::Video(a.join(b)),
            _ => panic!("cannot join audio and video source configs"),
        }
    }

    pub fn compatible_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Audio(a), Self::Audio(b)) => a.compatible_with(b),
            (Self::Video(a), Self::Video(b)) => a.compatible_with(b),
            _ => false,
        }
    }
}

/// A `SourceConfig` plus mime, target bitrate, profile/level, key-frame interval.
#[derive(Debug, Clone, PartialEq)]
pub struct CodecConfig {
    pub source: SourceConfig,
    pub codec: Codec,
    pub bitrate_bps: u32,
    pub profile: Option<String>,
    pub level: Option<String>,
    pub key_frame_interval_us: Option<i64>,
}

impl CodecConfig {
    pub fn kind(&self) -> MediaKind {
        self.source.kind()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compositor-facing surface types (§3.1, §4.3)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspectRatioMode {
    Preserve,
    Stretch,
    Crop,
}

/// Rotation quantised to {0, 90, 180, 270}; arbitrary integers round to the
/// nearest multiple of 90 (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Self {
        let normalized = degrees.rem_euclid(360);
        let rounded = ((normalized as f64 / 90.0).round() as i32 * 90).rem_euclid(360);
        match rounded {
            90 => Self::Deg90,
            180 => Self::Deg180,
            270 => Self::Deg270,
            _ => Self::Deg0,
        }
    }

    pub const fn degrees(&self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Whether this rotation swaps width/height when applied to an image.
    pub const fn swaps_axes(&self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

/// A producer surface handle + its monotonic timestamp offset in nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceInput {
    pub producer_id: u64,
    pub timestamp_offset_ns: i64,
}

/// Per-output render target: target resolution, transform, and the
/// streaming flag the compositor consults before drawing (spec §4.3 step 3).
#[derive(Clone)]
pub struct SurfaceOutput {
    pub id: u64,
    pub target_width: u32,
    pub target_height: u32,
    pub rotation: Rotation,
    pub aspect_ratio_mode: AspectRatioMode,
    pub mirror: bool,
    is_streaming: Arc<AtomicBool>,
}

impl SurfaceOutput {
    pub fn new(id: u64, target_width: u32, target_height: u32) -> Self {
        Self {
            id,
            target_width,
            target_height,
            rotation: Rotation::Deg0,
            aspect_ratio_mode: AspectRatioMode::Preserve,
            mirror: false,
            is_streaming: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming.load(Ordering::Acquire)
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.is_streaming.store(streaming, Ordering::Release);
    }

    /// The output's rotated dimensions (swaps width/height at 90/270).
    pub fn rotated_dimensions(&self) -> (u32, u32) {
        if self.rotation.swaps_axes() {
            (self.target_height, self.target_width)
        } else {
            (self.target_width, self.target_height)
        }
    }
}

/// A pending snapshot request: rotation plus the channel its completion is
/// delivered on (spec §4.3 step 4).
pub struct PendingSnapshot {
    pub rotation: Rotation,
    pub completion: tokio::sync::oneshot::Sender<StreamResult<Snapshot>>,
}

/// A captured still image, RGBA8, row-major, top-to-bottom.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub width: u32,
    pub height: u32,
    pub rgba: Bytes,
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint descriptor (§3.1, §6.5)
// ─────────────────────────────────────────────────────────────────────────────

/// Parsed sink target. Scheme determines the sink variant (spec §6.5).
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointDescriptor {
    File {
        path: String,
    },
    Content {
        uri: String,
    },
    Srt {
        host: String,
        port: u16,
        stream_id: Option<String>,
        passphrase: Option<String>,
        latency_ms: Option<u32>,
        connection_timeout_ms: Option<u32>,
    },
    Rtmp {
        url: String,
    },
}

impl EndpointDescriptor {
    /// Parses a URL-like string into the matching variant (spec §6.5).
    ///
    /// `file://` or an empty scheme (bare path) maps to `File`; `content://`
    /// maps to `Content`; `srt://` maps to `Srt`; any of
    /// `rtmp(s|t|ts)://` maps to `Rtmp`.
    pub fn parse(input: &str) -> StreamResult<Self> {
        if let Some(rest) = input.strip_prefix("file://") {
            return Ok(Self::File {
                path: rest.to_string(),
            });
        }
        if let Some(rest) = input.strip_prefix("content://") {
            return Ok(Self::Content {
                uri: format!("content://{rest}"),
            });
        }
        if let Some(rest) = input.strip_prefix("srt://") {
            return Self::parse_srt(rest);
        }
        if input.starts_with("rtmp://")
            || input.starts_with("rtmps://")
            || input.starts_with("rtmpt://")
            || input.starts_with("rtmpts://")
        {
            return Ok(Self::Rtmp {
                url: input.to_string(),
            });
        }
        if !input.contains("://") {
            return Ok(Self::File {
                path: input.to_string(),
            });
        }
        Err(StreamError::config(format!(
            "unrecognized endpoint scheme: {input}"
        )))
    }

    fn parse_srt(rest: &str) -> StreamResult<Self> {
        let (authority, query) = match rest.split_once('?') {
            Some((a, q)) => (a, Some(q)),
            None => (rest, None),
        };
        let (host, port_str) = authority
            .rsplit_once(':')
            .ok_or_else(|| StreamError::config("srt endpoint missing port"))?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| StreamError::config("srt endpoint has invalid port"))?;

        let mut stream_id = None;
        let mut passphrase = None;
        let mut latency_ms = None;
        let mut connection_timeout_ms = None;

        if let Some(query) = query {
            for pair in query.split('&') {
                let Some((key, value)) = pair.split_once('=') else {
                    continue;
                };
                match key {
                    "streamid" => stream_id = Some(value.to_string()),
                    "passphrase" => passphrase = Some(value.to_string()),
                    "latency" => latency_ms = value.parse().ok(),
                    "timeout" => connection_timeout_ms = value.parse().ok(),
                    _ => {}
                }
            }
        }

        Ok(Self::Srt {
            host: host.to_string(),
            port,
            stream_id,
            passphrase,
            latency_ms,
            connection_timeout_ms,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capture-side contracts (§6.1), implemented by `streamkit-capture`
// ─────────────────────────────────────────────────────────────────────────────

/// A pull-mode or push-mode audio producer.
///
/// Implementations live outside this crate (see `streamkit-capture`'s
/// synthetic sources, and in production a platform microphone driver).
/// `configure` is called before `start_stream` and whenever the negotiated
/// [`AudioSourceConfig`] changes; the source must accept any config it
/// previously advertised support for.
pub trait AudioSource: Send {
    fn configure(&mut self, config: AudioSourceConfig) -> StreamResult<()>;
    fn start_stream(&mut self) -> StreamResult<()>;
    fn stop_stream(&mut self) -> StreamResult<()>;
    /// Releases any held hardware/OS resources. Idempotent.
    fn release(&mut self);
    /// Pulls the next frame's worth of samples, blocking the caller's pump
    /// task until one is available or the source stops.
    fn get_audio_frame(&mut self, pool: &BufferPool) -> StreamResult<RawFrame>;
}

/// A video producer that draws into compositor-provided input surfaces.
///
/// Unlike [`AudioSource`], a `VideoSource` does not hand frames to the
/// caller directly — it is handed a [`SurfaceInput`] handle by the
/// compositor and pushes frames onto that surface via whatever
/// platform-specific mechanism it implements (camera HAL, screen capture,
/// ...). This trait only covers the lifecycle and device-arbitration parts
/// of the contract (spec I7: at most one active source per physical
/// device).
pub trait VideoSource: Send {
    fn configure(&mut self, config: VideoSourceConfig) -> StreamResult<()>;
    fn start_stream(&mut self, surface: SurfaceInput) -> StreamResult<()>;
    fn stop_stream(&mut self) -> StreamResult<()>;
    fn release(&mut self);
    /// Identifies the physical device this source binds to, for the
    /// exclusive-access check in spec I7. `None` means a virtual/synthetic
    /// source not subject to device arbitration.
    fn device_id(&self) -> Option<&str>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn raw_frame_close_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let frame = RawFrame::new(Bytes::from_static(b"pcm"), 0, move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        frame.close();
        frame.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn frame_fan_out_releases_buffer_once_all_closed() {
        let pool = Arc::new(BufferPool::new(BufferPoolConfigForTest::default()));
        let buffer = pool.get(16);
        let frames = RawFrame::fan_out(buffer, 0, Arc::clone(&pool), 3);
        assert_eq!(frames.len(), 3);
        assert_eq!(pool.idle_count(), 0);
        frames[0].close();
        frames[1].close();
        assert_eq!(pool.idle_count(), 0, "buffer must not return early");
        frames[2].close();
        assert_eq!(pool.idle_count(), 1);
    }

    // Local alias so this test module doesn't need to know BufferPoolConfig's
    // full field set if it grows; keeps this file focused on RawFrame.
    type BufferPoolConfigForTest = crate::buffer_pool::BufferPoolConfig;

    #[test]
    fn frame_rejects_missing_csd_on_audio() {
        let err = Frame::new(
            Bytes::new(),
            0,
            None,
            true,
            vec![],
            Codec::Audio(AudioCodec::Aac),
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn frame_rejects_csd_on_non_key_video() {
        let err = Frame::new(
            Bytes::new(),
            0,
            None,
            false,
            vec![Bytes::from_static(b"sps")],
            Codec::Video(VideoCodec::H264),
        )
        .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn frame_accepts_key_video_with_csd() {
        let frame = Frame::new(
            Bytes::from_static(b"idr"),
            0,
            None,
            true,
            vec![Bytes::from_static(b"sps")],
            Codec::Video(VideoCodec::H264),
        )
        .unwrap();
        assert!(frame.is_key_frame);
    }

    #[test]
    fn dynamic_range_hdr10_covers_hlg10_and_sdr() {
        assert!(DynamicRangeProfile::Hdr10.covers(&DynamicRangeProfile::Hlg10));
        assert!(DynamicRangeProfile::Hdr10.covers(&DynamicRangeProfile::Sdr));
        assert!(!DynamicRangeProfile::Hlg10.covers(&DynamicRangeProfile::Hdr10));
    }

    #[test]
    fn audio_source_config_join_takes_max_of_each_field() {
        let a = AudioSourceConfig {
            sample_rate: 44100,
            channels: 2,
            byte_format: ByteFormat::S16Le,
        };
        let b = AudioSourceConfig {
            sample_rate: 48000,
            channels: 6,
            byte_format: ByteFormat::F32Le,
        };
        let joined = a.join(b);
        assert_eq!(joined.sample_rate, 48000);
        assert_eq!(joined.channels, 6);
        assert_eq!(joined.byte_format, ByteFormat::F32Le);
    }

    #[test]
    fn video_source_config_join_takes_max_resolution_by_pixels() {
        let a = VideoSourceConfig {
            width: 1920,
            height: 1080,
            fps: 30,
            dynamic_range: DynamicRangeProfile::Sdr,
        };
        let b = VideoSourceConfig {
            width: 1280,
            height: 720,
            fps: 60,
            dynamic_range: DynamicRangeProfile::Hdr10,
        };
        let joined = a.join(b);
        assert_eq!((joined.width, joined.height), (1920, 1080));
        assert_eq!(joined.fps, 60);
        assert_eq!(joined.dynamic_range, DynamicRangeProfile::Hdr10);
    }

    #[test]
    fn rotation_rounds_to_nearest_90() {
        assert_eq!(Rotation::from_degrees(44), Rotation::Deg0);
        assert_eq!(Rotation::from_degrees(46), Rotation::Deg90);
        assert_eq!(Rotation::from_degrees(359), Rotation::Deg0);
        assert_eq!(Rotation::from_degrees(181), Rotation::Deg180);
    }

    #[test]
    fn endpoint_descriptor_parses_each_scheme() {
        assert_eq!(
            EndpointDescriptor::parse("file:///tmp/out.mp4").unwrap(),
            EndpointDescriptor::File {
                path: "/tmp/out.mp4".to_string()
            }
        );
        assert_eq!(
            EndpointDescriptor::parse("/tmp/out.mp4").unwrap(),
            EndpointDescriptor::File {
                path: "/tmp/out.mp4".to_string()
            }
        );
        match EndpointDescriptor::parse("srt://host:9000?streamid=abc&latency=200").unwrap() {
            EndpointDescriptor::Srt {
                host,
                port,
                stream_id,
                latency_ms,
                ..
            } => {
                assert_eq!(host, "host");
                assert_eq!(port, 9000);
                assert_eq!(stream_id.as_deref(), Some("abc"));
                assert_eq!(latency_ms, Some(200));
            }
            other => panic!("expected Srt, got {other:?}"),
        }
        assert!(matches!(
            EndpointDescriptor::parse("rtmp://example.com/live").unwrap(),
            EndpointDescriptor::Rtmp { .. }
        ));
        assert!(matches!(
            EndpointDescriptor::parse("rtmps://example.com/live").unwrap(),
            EndpointDescriptor::Rtmp { .. }
        ));
    }

    #[test]
    fn endpoint_descriptor_rejects_unknown_scheme() {
        assert!(EndpointDescriptor::parse("ftp://example.com").is_err());
    }
}
