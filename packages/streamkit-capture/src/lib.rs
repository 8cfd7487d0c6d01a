//! Synthetic capture sources and codec wrappers implementing
//! `streamkit_core`'s `AudioSource`/`VideoSource` and
//! `AudioEncoder`/`VideoEncoder` traits.
//!
//! Real capture (a microphone driver, a camera HAL, screen capture) and real
//! codecs (libopus, libaom, a platform MediaCodec) live outside this crate,
//! on whatever platform hosts the pipeline. What's here is deliberately
//! platform-independent: a sine-wave tone generator, a solid-color frame
//! generator, and passthrough encoders that fabricate just enough
//! codec-specific data to keep a muxer happy — useful for integration tests,
//! demos, and as a concrete example of what a `streamkit_core` source/encoder
//! implementation looks like.

#![warn(clippy::all)]

pub mod audio;
pub mod encoder;
pub mod video;

pub use audio::SineWaveSource;
pub use encoder::{PassthroughAudioEncoder, PassthroughVideoEncoder};
pub use video::SolidColorSource;
