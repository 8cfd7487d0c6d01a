//! streamkit-server - Standalone headless runner for a streamkit pipeline.
//!
//! Wires a synthetic audio/video source through an encoder and muxer into
//! one or more sinks (file, SRT, RTMP, content URI), then drives the
//! bitrate regulator until shutdown.

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use streamkit_capture::{PassthroughAudioEncoder, PassthroughVideoEncoder, SineWaveSource, SolidColorSource};
use streamkit_core::bootstrap::{bootstrap_pipeline, BootstrapConfig};
use streamkit_core::endpoint::CompositeEndpoint;
use streamkit_core::events::LoggingEventEmitter;
use streamkit_core::mux::flv::FlvMuxer;
use streamkit_core::mux::fmp4::FragmentedMp4Muxer;
use streamkit_core::mux::ts::TsMuxer;
use streamkit_core::mux::Muxer;
use streamkit_core::pipeline::{AudioOutputSpec, OutputSpec, SurfaceSpec, VideoOutputSpec};
use streamkit_core::sink::sink_for_descriptor;
use streamkit_core::types::{
    AspectRatioMode, AudioSourceConfig, ByteFormat, Codec, CodecConfig, DynamicRangeProfile,
    EndpointDescriptor, SourceConfig, VideoSourceConfig,
};
use tokio::signal;

use crate::config::{MuxerKind, OutputSettings, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "streamkit-server")]
#[command(author, version, about = "Headless streamkit capture-to-sink pipeline", long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "STREAMKIT_LOG_LEVEL")]
    log_level: log::LevelFilter,
}

fn build_muxer(kind: MuxerKind) -> Box<dyn Muxer> {
    match kind {
        MuxerKind::Ts => Box::new(TsMuxer::new()),
        MuxerKind::Fmp4 => Box::new(FragmentedMp4Muxer::new()),
        MuxerKind::Flv => Box::new(FlvMuxer::new()),
    }
}

fn build_endpoint(output: &OutputSettings) -> Result<CompositeEndpoint> {
    let descriptor = EndpointDescriptor::parse(&output.endpoint)
        .with_context(|| format!("invalid output endpoint: {}", output.endpoint))?;
    let mut endpoint = CompositeEndpoint::new(build_muxer(output.muxer));
    let sink = sink_for_descriptor(&descriptor);
    endpoint
        .add_sink(sink, &descriptor)
        .with_context(|| format!("failed to open sink for {}", output.endpoint))?;
    Ok(endpoint)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("streamkit-server v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.or_else(config::default_config_search_path);
    let server_config = ServerConfig::load(config_path.as_deref()).context("failed to load configuration")?;

    let bootstrapped = bootstrap_pipeline(BootstrapConfig {
        pipeline: server_config.to_pipeline_config(),
        regulator: server_config.to_regulator_config(),
        initial_video_bitrate_bps: server_config.video.bitrate_bps,
        initial_audio_bitrate_bps: server_config.audio.bitrate_bps,
        emitter: Arc::new(LoggingEventEmitter),
    });

    let audio_source_config = AudioSourceConfig {
        sample_rate: server_config.audio.sample_rate,
        channels: server_config.audio.channels,
        byte_format: ByteFormat::S16Le,
    };
    if server_config.audio.enabled {
        bootstrapped
            .pipeline
            .set_audio_source(
                Box::new(SineWaveSource::new(server_config.audio.frequency_hz)),
                audio_source_config,
            )
            .context("failed to bind audio source")?;
    }

    let video_source_config = VideoSourceConfig {
        width: server_config.video.width,
        height: server_config.video.height,
        fps: server_config.video.fps,
        dynamic_range: DynamicRangeProfile::Sdr,
    };
    if server_config.video.enabled {
        let handle = bootstrapped.pipeline.compositor_handle();
        bootstrapped
            .pipeline
            .set_video_source(
                Box::new(SolidColorSource::new(handle, server_config.video.color)),
                video_source_config,
            )
            .context("failed to bind video source")?;
    }

    let mut output_ids = Vec::new();
    for output_settings in &server_config.outputs {
        let endpoint = build_endpoint(output_settings)?;

        let audio = server_config.audio.enabled.then(|| AudioOutputSpec {
            source_config: audio_source_config,
            codec_config: CodecConfig {
                source: SourceConfig::Audio(audio_source_config),
                codec: Codec::Audio(server_config.audio.codec.into()),
                bitrate_bps: server_config.audio.bitrate_bps,
                profile: None,
                level: None,
                key_frame_interval_us: None,
            },
            encoder: Box::new(PassthroughAudioEncoder::new()),
        });

        let video = server_config.video.enabled.then(|| VideoOutputSpec {
            source_config: video_source_config,
            codec_config: CodecConfig {
                source: SourceConfig::Video(video_source_config),
                codec: Codec::Video(server_config.video.codec.into()),
                bitrate_bps: server_config.video.bitrate_bps,
                profile: None,
                level: None,
                key_frame_interval_us: Some(2_000_000),
            },
            encoder: Box::new(PassthroughVideoEncoder::new(60)),
            surface: SurfaceSpec {
                target_width: server_config.video.width,
                target_height: server_config.video.height,
                aspect_ratio_mode: AspectRatioMode::Preserve,
                mirror: false,
            },
        });

        let output_id = bootstrapped
            .pipeline
            .add_output(endpoint, OutputSpec { audio, video })
            .with_context(|| format!("failed to add output {}", output_settings.endpoint))?;
        log::info!("output {:?} bound to {}", output_id, output_settings.endpoint);
        output_ids.push(output_id);
    }

    bootstrapped.pipeline.start_stream().context("failed to start stream")?;
    bootstrapped.start_regulation(output_ids);
    log::info!("streamkit server running, press ctrl-c to stop");

    shutdown_signal().await;

    log::info!("shutdown signal received, cleaning up...");
    bootstrapped.pipeline.stop_stream().context("failed to stop stream")?;
    bootstrapped.pipeline.release();
    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
