//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use streamkit_core::buffer_pool::BufferPoolConfig;
use streamkit_core::pipeline::PipelineConfig;
use streamkit_core::regulator::RegulatorConfig;
use streamkit_core::types::{AudioCodec, VideoCodec};

/// Container family an output muxes into; mirrors
/// [`streamkit_core::mux::MuxerKind`] but stays `serde`-friendly for YAML.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MuxerKind {
    Ts,
    Fmp4,
    Flv,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSourceSettings {
    pub enabled: bool,
    pub frequency_hz: f64,
    pub sample_rate: u32,
    pub channels: u16,
    pub codec: AudioCodecSetting,
    pub bitrate_bps: u32,
}

impl Default for AudioSourceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            frequency_hz: 440.0,
            sample_rate: 48_000,
            channels: 2,
            codec: AudioCodecSetting::Aac,
            bitrate_bps: 128_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodecSetting {
    Aac,
    Opus,
}

impl From<AudioCodecSetting> for AudioCodec {
    fn from(value: AudioCodecSetting) -> Self {
        match value {
            AudioCodecSetting::Aac => AudioCodec::Aac,
            AudioCodecSetting::Opus => AudioCodec::Opus,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VideoSourceSettings {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub codec: VideoCodecSetting,
    pub bitrate_bps: u32,
    pub color: [u8; 4],
}

impl Default for VideoSourceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            width: 1280,
            height: 720,
            fps: 30,
            codec: VideoCodecSetting::H264,
            bitrate_bps: 2_000_000,
            color: [0, 120, 200, 255],
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodecSetting {
    H264,
    H265,
    Vp9,
    Av1,
}

impl From<VideoCodecSetting> for VideoCodec {
    fn from(value: VideoCodecSetting) -> Self {
        match value {
            VideoCodecSetting::H264 => VideoCodec::H264,
            VideoCodecSetting::H265 => VideoCodec::H265,
            VideoCodecSetting::Vp9 => VideoCodec::Vp9,
            VideoCodecSetting::Av1 => VideoCodec::Av1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub muxer: MuxerKind,
    /// Endpoint URL, parsed with [`streamkit_core::types::EndpointDescriptor::parse`]
    /// (`file://`, `content://`, `srt://`, `rtmp(s|t|ts)://`, or a bare path).
    pub endpoint: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            muxer: MuxerKind::Fmp4,
            endpoint: "out.mp4".to_string(),
        }
    }
}

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub audio: AudioSourceSettings,
    pub video: VideoSourceSettings,
    pub outputs: Vec<OutputSettings>,
    /// Soft cap on idle buffers retained per capacity class (spec §4.1).
    /// Override: `STREAMKIT_MAX_IDLE_BUFFERS_PER_CLASS`
    pub max_idle_buffers_per_class: usize,
    /// How often the bitrate regulator re-evaluates congestion, in
    /// milliseconds (spec §4.5 default 500ms).
    /// Override: `STREAMKIT_REGULATOR_TICK_MS`
    pub regulator_tick_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            audio: AudioSourceSettings::default(),
            video: VideoSourceSettings::default(),
            outputs: vec![OutputSettings::default()],
            max_idle_buffers_per_class: BufferPoolConfig::default().max_idle_per_class,
            regulator_tick_ms: RegulatorConfig::default().tick_interval.as_millis() as u64,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STREAMKIT_MAX_IDLE_BUFFERS_PER_CLASS") {
            if let Ok(n) = val.parse() {
                self.max_idle_buffers_per_class = n;
            }
        }
        if let Ok(val) = std::env::var("STREAMKIT_REGULATOR_TICK_MS") {
            if let Ok(ms) = val.parse() {
                self.regulator_tick_ms = ms;
            }
        }
    }

    pub fn to_pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            buffer_pool: BufferPoolConfig {
                max_idle_per_class: self.max_idle_buffers_per_class,
                ..BufferPoolConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    pub fn to_regulator_config(&self) -> RegulatorConfig {
        RegulatorConfig {
            tick_interval: std::time::Duration::from_millis(self.regulator_tick_ms),
            ..RegulatorConfig::default()
        }
    }
}

/// Path a data/config directory override would live under, mirrored from
/// the `--config` CLI flag so `main` doesn't need a second lookup path.
pub fn default_config_search_path() -> Option<PathBuf> {
    std::env::var_os("STREAMKIT_CONFIG").map(PathBuf::from)
}
