//! End-to-end scenario tests exercising encoder → mux → sink together,
//! matching the concrete scenarios worked through during design (mic to an
//! MP4 file, camera to an MPEG-TS/SRT sink, and the bitrate regulator's
//! step-down behavior under sustained loss).

use std::io::Read;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tempfile::tempdir;

use streamkit_capture::{PassthroughAudioEncoder, PassthroughVideoEncoder, SolidColorSource};
use streamkit_core::compositor::{Compositor, Rotation};
use streamkit_core::encoder::{AudioEncoder, Encoder, VideoEncoder};
use streamkit_core::endpoint::CompositeEndpoint;
use streamkit_core::error::StreamError;
use streamkit_core::events::{EventEmitter, PipelineEvent};
use streamkit_core::mux::fmp4::FragmentedMp4Muxer;
use streamkit_core::mux::ts::TsMuxer;
use streamkit_core::pipeline::{OutputSpec, Pipeline, PipelineConfig, SurfaceSpec, VideoOutputSpec};
use streamkit_core::regulator::{BitrateRegulator, RegulatorConfig, SinkStats};
use streamkit_core::sink::{FileSink, Sink, SinkMetrics, SrtSink};
use streamkit_core::types::{
    AspectRatioMode, AudioCodec, AudioSourceConfig, ByteFormat, Codec, CodecConfig,
    DynamicRangeProfile, EndpointDescriptor, Packet, RawFrame, SourceConfig, SurfaceOutput,
    VideoCodec, VideoSourceConfig,
};

fn silent_pcm_chunk(sample_rate: u32, channels: u16, seconds: u32) -> Bytes {
    let samples = sample_rate as usize * seconds as usize;
    let mut buf = BytesMut::with_capacity(samples * channels as usize * 2);
    for i in 0..samples {
        // A cheap integer-only stand-in for a 1kHz tone: no floating point,
        // but non-constant so the frame isn't silence.
        let sample = ((i % 48) as i16 - 24) * 500;
        for _ in 0..channels {
            buf.extend_from_slice(&sample.to_le_bytes());
        }
    }
    buf.freeze()
}

fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// S1 — microphone to AAC to an MP4 file, 5 seconds, 48kHz stereo, 128kbps.
#[test]
fn s1_microphone_aac_to_mp4_file_produces_five_fragments() {
    let sample_rate = 48_000u32;
    let channels = 2u16;

    let source_config = AudioSourceConfig {
        sample_rate,
        channels,
        byte_format: ByteFormat::S16Le,
    };
    let codec_config = CodecConfig {
        source: SourceConfig::Audio(source_config),
        codec: Codec::Audio(AudioCodec::Aac),
        bitrate_bps: 128_000,
        profile: None,
        level: None,
        key_frame_interval_us: None,
    };

    let mut encoder = PassthroughAudioEncoder::new();
    encoder.configure(codec_config.clone()).unwrap();
    encoder.start().unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("mic.mp4");

    let mut endpoint = CompositeEndpoint::new(Box::new(FragmentedMp4Muxer::new()));
    let descriptor = EndpointDescriptor::File {
        path: path.to_string_lossy().to_string(),
    };
    endpoint.add_sink(Box::new(FileSink::new()), &descriptor).unwrap();
    let stream_id = endpoint.add_stream(&codec_config).unwrap();
    endpoint.start_stream().unwrap();

    // Five one-second chunks: exactly 240,000 samples at 48kHz (spec §8.3 S1).
    for second in 0..5i64 {
        let pts_us = second * 1_000_000;
        let data = silent_pcm_chunk(sample_rate, channels, 1);
        let raw = RawFrame::new(data, pts_us, || {});
        let encoded = encoder.encode(raw).unwrap();
        for frame in encoded {
            endpoint.write(stream_id, frame).unwrap();
        }
    }
    endpoint.stop_stream().unwrap();
    endpoint.close();

    let mut file_bytes = Vec::new();
    std::fs::File::open(&path).unwrap().read_to_end(&mut file_bytes).unwrap();

    assert_eq!(&file_bytes[4..8], b"ftyp", "file must start with an ftyp box");
    assert_eq!(
        count_occurrences(&file_bytes, b"moof"),
        5,
        "one moof per 1s fragment over 5s of audio"
    );
    assert_eq!(count_occurrences(&file_bytes, b"mdat"), 5);

    let metrics = endpoint.sink_metrics();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].bytes_written, file_bytes.len() as u64);
}

/// S2 — camera to H.264 to MPEG-TS to SRT, 3 seconds, 1280x720@30, 2Mbps.
#[test]
fn s2_camera_h264_mpegts_to_srt_delivers_every_frame() {
    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener.set_read_timeout(Some(std::time::Duration::from_secs(2))).unwrap();
    let port = listener.local_addr().unwrap().port();

    let source_config = VideoSourceConfig {
        width: 1280,
        height: 720,
        fps: 30,
        dynamic_range: DynamicRangeProfile::Sdr,
    };
    let codec_config = CodecConfig {
        source: SourceConfig::Video(source_config),
        codec: Codec::Video(VideoCodec::H264),
        bitrate_bps: 2_000_000,
        profile: None,
        level: None,
        key_frame_interval_us: Some(2_000_000),
    };

    let mut encoder = PassthroughVideoEncoder::new(30);
    encoder.configure(codec_config.clone()).unwrap();
    encoder.start().unwrap();

    let mut endpoint = CompositeEndpoint::new(Box::new(TsMuxer::new()));
    let descriptor = EndpointDescriptor::Srt {
        host: "127.0.0.1".to_string(),
        port,
        stream_id: None,
        passphrase: None,
        latency_ms: None,
        connection_timeout_ms: None,
    };
    endpoint.add_sink(Box::new(SrtSink::new()), &descriptor).unwrap();
    let stream_id = endpoint.add_stream(&codec_config).unwrap();
    endpoint.start_stream().unwrap();

    let frame_interval_us = 1_000_000 / 30;
    let mut encoded_count = 0;
    for i in 0..90i64 {
        let pts_us = i * frame_interval_us;
        let raw = RawFrame::new(Bytes::from_static(b"rgba-frame"), pts_us, || {});
        let encoded = encoder.encode(raw, false).unwrap();
        encoded_count += encoded.len();
        for frame in encoded {
            endpoint.write(stream_id, frame).unwrap();
        }
    }
    endpoint.stop_stream().unwrap();

    assert_eq!(encoded_count, 90, "all 90 frames must be encoded");

    let mut total_received = 0usize;
    let mut buf = [0u8; 4096];
    while let Ok(n) = listener.recv(&mut buf) {
        assert_eq!(n % 188, 0, "every SRT datagram is a whole number of TS packets");
        for chunk in buf[..n].chunks(188) {
            assert_eq!(chunk[0], 0x47, "every TS packet starts with the sync byte");
        }
        total_received += n;
    }

    let metrics = endpoint.sink_metrics();
    assert_eq!(metrics.len(), 1);
    assert_eq!(
        metrics[0].bytes_written as usize, total_received,
        "sink's reported byte count matches what the receiver actually got"
    );
    assert!(total_received > 0);
}

/// S6 — bitrate regulator step-down: one video output at 2Mbps with
/// sustained 50% loss steps to 1.6Mbps, then 1.28Mbps, never below the
/// configured minimum.
#[test]
fn s6_regulator_steps_video_bitrate_down_under_sustained_loss() {
    let config = RegulatorConfig::default();
    let min = config.video_min_bitrate_bps;
    let regulator = BitrateRegulator::new(config, 2_000_000, 128_000);

    let lossy_stats = SinkStats {
        queued_bytes: 0,
        bytes_sent_since_last_tick: 0,
        packet_loss_percent: 50.0,
    };

    let after_first = regulator.tick(&lossy_stats);
    assert_eq!(after_first.video_bitrate_bps, 1_600_000);

    let after_second = regulator.tick(&lossy_stats);
    assert_eq!(after_second.video_bitrate_bps, 1_280_000);

    assert!(regulator.current_targets().video_bitrate_bps >= min);
}

fn solid_640x480_with_corner_markers() -> Bytes {
    let (w, h) = (640usize, 480usize);
    let mut buf = vec![0u8; w * h * 4];
    for px in buf.chunks_mut(4) {
        px.copy_from_slice(&[10, 20, 30, 255]);
    }
    // Top-left corner: red.
    buf[0..4].copy_from_slice(&[255, 0, 0, 255]);
    // Bottom-left corner (first column, last row): green.
    let bottom_left = ((h - 1) * w) * 4;
    buf[bottom_left..bottom_left + 4].copy_from_slice(&[0, 255, 0, 255]);
    Bytes::from(buf)
}

/// S3 — one 640x480 producer feeding two compositor outputs; a snapshot on
/// one is rotated 90 degrees while the other keeps receiving composed
/// frames untouched by the pending snapshot.
#[test]
fn s3_snapshot_rotates_90_degrees_while_sibling_output_keeps_streaming() {
    let compositor = Compositor::start();
    compositor.register_input(streamkit_core::types::SurfaceInput {
        producer_id: 0,
        timestamp_offset_ns: 0,
    });

    let (file_tx, file_rx) = std::sync::mpsc::channel();
    let file_output = SurfaceOutput::new(1, 640, 480);
    file_output.set_streaming(true);
    compositor.register_output(file_output, file_tx);

    let (preview_tx, _preview_rx) = std::sync::mpsc::channel();
    let preview_output = SurfaceOutput::new(2, 640, 480);
    preview_output.set_streaming(true);
    compositor.register_output(preview_output, preview_tx);

    let frame = solid_640x480_with_corner_markers();
    let snapshot_rx = compositor.request_snapshot(2, Rotation::Deg90);
    compositor.submit_frame(0, 0, 640, 480, frame.clone());

    let snapshot = futures::executor::block_on(snapshot_rx).unwrap().unwrap();
    // Axes swap at 90 degrees: a 640x480 source yields a 480x640 still.
    assert_eq!(snapshot.width, 480);
    assert_eq!(snapshot.height, 640);
    // Clockwise rotation: the original top-left pixel lands in the top-right
    // corner, the original bottom-left pixel lands in the top-left corner
    // (mirrors `apply_rotation`'s own 2x1 unit test, scaled up).
    assert_eq!(&snapshot.rgba[0..4], &[0, 255, 0, 255], "bottom-left marker rotates to top-left");
    let top_right = (snapshot.width as usize - 1) * 4;
    assert_eq!(
        &snapshot.rgba[top_right..top_right + 4],
        &[255, 0, 0, 255],
        "top-left marker rotates to top-right"
    );

    // The file-like output never had a snapshot pending against it and must
    // keep receiving composed frames, unaffected by its sibling's request.
    file_rx.recv_timeout(Duration::from_secs(1)).expect("first composed frame");
    compositor.submit_frame(0, 1_000_000, 640, 480, frame);
    let second = file_rx.recv_timeout(Duration::from_secs(1)).expect("second composed frame");
    assert_eq!(second.data.len(), 640 * 480 * 4);

    drop(compositor);
}

/// A minimal [`Sink`] whose `write` can be made to fail after a configured
/// number of successful writes, simulating a sink whose transport drops
/// mid-stream (spec §8.3 S5). `opened`/`writes` are shared so the test can
/// observe state the sink's owning [`CompositeEndpoint`] has taken by value.
struct ProbeSink {
    opened: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
    fail_after: Option<usize>,
}

impl Sink for ProbeSink {
    fn open(&mut self, _descriptor: &EndpointDescriptor) -> streamkit_core::error::StreamResult<()> {
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    fn start_stream(&mut self) -> streamkit_core::error::StreamResult<()> {
        Ok(())
    }

    fn write(&mut self, _packet: Packet) -> streamkit_core::error::StreamResult<()> {
        let count = self.writes.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(limit) = self.fail_after {
            if count > limit {
                self.opened.store(false, Ordering::Release);
                return Err(StreamError::closed("connection reset"));
            }
        }
        Ok(())
    }

    fn stop_stream(&mut self) -> streamkit_core::error::StreamResult<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.opened.store(false, Ordering::Release);
    }

    fn metrics(&self) -> SinkMetrics {
        SinkMetrics {
            bytes_written: self.writes.load(Ordering::Acquire) as u64,
            queued_bytes: 0,
            dropped_frames: 0,
        }
    }

    fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct RecordingEventEmitter {
    events: std::sync::Mutex<Vec<PipelineEvent>>,
}

impl RecordingEventEmitter {
    fn snapshot(&self) -> Vec<PipelineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventEmitter for RecordingEventEmitter {
    fn emit(&self, event: PipelineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn video_codec_config(width: u32, height: u32, fps: u32) -> CodecConfig {
    CodecConfig {
        source: SourceConfig::Video(VideoSourceConfig {
            width,
            height,
            fps,
            dynamic_range: DynamicRangeProfile::Sdr,
        }),
        codec: Codec::Video(VideoCodec::H264),
        bitrate_bps: 1_000_000,
        profile: None,
        level: None,
        key_frame_interval_us: None,
    }
}

fn video_output_spec(width: u32, height: u32, fps: u32) -> VideoOutputSpec {
    VideoOutputSpec {
        source_config: VideoSourceConfig {
            width,
            height,
            fps,
            dynamic_range: DynamicRangeProfile::Sdr,
        },
        codec_config: video_codec_config(width, height, fps),
        encoder: Box::new(PassthroughVideoEncoder::new(fps)),
        surface: SurfaceSpec {
            target_width: width,
            target_height: height,
            aspect_ratio_mode: AspectRatioMode::Stretch,
            mirror: false,
        },
    }
}

/// S4 — swapping the bound video source rebuilds the compositor's producer
/// registration while the pipeline isn't streaming, and is refused outright
/// (I6) once it is, leaving the already-bound source undisturbed.
#[test]
fn s4_video_source_swap_rebuilds_input_before_streaming_and_is_rejected_during_streaming() {
    let emitter = Arc::new(RecordingEventEmitter::default());
    let pipeline = Pipeline::new(PipelineConfig::default(), emitter);

    let first = SolidColorSource::new(pipeline.compositor_handle(), [200, 0, 0, 255]);
    pipeline
        .set_video_source(Box::new(first), VideoSourceConfig {
            width: 640,
            height: 480,
            fps: 10,
            dynamic_range: DynamicRangeProfile::Sdr,
        })
        .unwrap();

    // Swapping to a source with a different resolution succeeds while the
    // pipeline is only in preview (not yet streaming) — the old source is
    // released and a fresh producer identity is registered for the new one.
    let second = SolidColorSource::new(pipeline.compositor_handle(), [0, 0, 200, 255]);
    pipeline
        .set_video_source(Box::new(second), VideoSourceConfig {
            width: 1280,
            height: 720,
            fps: 10,
            dynamic_range: DynamicRangeProfile::Sdr,
        })
        .unwrap();

    let writes = Arc::new(AtomicUsize::new(0));
    let opened = Arc::new(AtomicBool::new(false));
    let mut endpoint = CompositeEndpoint::new(Box::new(TsMuxer::new()));
    endpoint
        .add_sink(
            Box::new(ProbeSink {
                opened: Arc::clone(&opened),
                writes: Arc::clone(&writes),
                fail_after: None,
            }),
            &EndpointDescriptor::File { path: "discard".into() },
        )
        .unwrap();

    let output = pipeline
        .add_output(endpoint, OutputSpec {
            audio: None,
            video: Some(video_output_spec(1280, 720, 10)),
        })
        .unwrap();

    pipeline.start_stream().unwrap();
    std::thread::sleep(Duration::from_millis(250));
    assert!(writes.load(Ordering::Acquire) > 0, "the post-swap source must actually stream frames");

    // A second swap while streaming must be refused (I6) and must not
    // disturb the output already in flight.
    let third = SolidColorSource::new(pipeline.compositor_handle(), [0, 200, 0, 255]);
    let err = pipeline
        .set_video_source(Box::new(third), VideoSourceConfig {
            width: 320,
            height: 240,
            fps: 10,
            dynamic_range: DynamicRangeProfile::Sdr,
        })
        .unwrap_err();
    assert_eq!(err.kind, streamkit_core::error::ErrorKind::Config);
    assert!(pipeline.is_streaming());

    let writes_at_rejection = writes.load(Ordering::Acquire);
    std::thread::sleep(Duration::from_millis(250));
    assert!(
        writes.load(Ordering::Acquire) > writes_at_rejection,
        "the bound source keeps streaming uninterrupted after a rejected swap"
    );

    let _ = output;
    pipeline.release();
}

/// S5 — an SRT-shaped sink whose transport drops mid-stream must be knocked
/// out of the streaming set without disturbing a sibling output, and
/// `release` must complete cleanly afterward.
#[test]
fn s5_sink_closed_mid_stream_stops_only_that_output() {
    let emitter = Arc::new(RecordingEventEmitter::default());
    let pipeline = Pipeline::new(PipelineConfig::default(), Arc::clone(&emitter) as Arc<dyn EventEmitter>);

    let source = SolidColorSource::new(pipeline.compositor_handle(), [80, 80, 80, 255]);
    pipeline
        .set_video_source(Box::new(source), VideoSourceConfig {
            width: 320,
            height: 240,
            fps: 20,
            dynamic_range: DynamicRangeProfile::Sdr,
        })
        .unwrap();

    let flaky_opened = Arc::new(AtomicBool::new(false));
    let flaky_writes = Arc::new(AtomicUsize::new(0));
    let mut flaky_endpoint = CompositeEndpoint::new(Box::new(TsMuxer::new()));
    flaky_endpoint
        .add_sink(
            Box::new(ProbeSink {
                opened: Arc::clone(&flaky_opened),
                writes: Arc::clone(&flaky_writes),
                fail_after: Some(3),
            }),
            &EndpointDescriptor::Srt {
                host: "127.0.0.1".into(),
                port: 0,
                stream_id: None,
                passphrase: None,
                latency_ms: None,
                connection_timeout_ms: None,
            },
        )
        .unwrap();
    let flaky_output = pipeline
        .add_output(flaky_endpoint, OutputSpec {
            audio: None,
            video: Some(video_output_spec(320, 240, 20)),
        })
        .unwrap();

    let stable_writes = Arc::new(AtomicUsize::new(0));
    let stable_opened = Arc::new(AtomicBool::new(false));
    let mut stable_endpoint = CompositeEndpoint::new(Box::new(TsMuxer::new()));
    stable_endpoint
        .add_sink(
            Box::new(ProbeSink {
                opened: Arc::clone(&stable_opened),
                writes: Arc::clone(&stable_writes),
                fail_after: None,
            }),
            &EndpointDescriptor::File { path: "discard".into() },
        )
        .unwrap();
    let stable_output = pipeline
        .add_output(stable_endpoint, OutputSpec {
            audio: None,
            video: Some(video_output_spec(320, 240, 20)),
        })
        .unwrap();

    pipeline.start_stream().unwrap();

    // Give the flaky sink enough writes to cross its failure threshold, then
    // let the error propagate through the output pump thread.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while flaky_opened.load(Ordering::Acquire) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    // The pump thread only flips the output's own streaming flag after
    // `report_output_error` runs; give it a moment to catch up.
    std::thread::sleep(Duration::from_millis(100));

    assert!(!flaky_opened.load(Ordering::Acquire), "flaky sink must transition to closed");
    assert!(pipeline.is_streaming(), "a sibling output still streams");

    let events = emitter.snapshot();
    let errored_flaky = events.iter().any(|e| matches!(
        e,
        PipelineEvent::OutputErrored { output, .. } if *output == flaky_output
    ));
    assert!(errored_flaky, "pipeline must report an OutputErrored event for the flaky output");
    let flaky_stopped = events.iter().any(|e| matches!(
        e,
        PipelineEvent::OutputStateChanged { output, streaming: false } if *output == flaky_output
    ));
    assert!(flaky_stopped, "the flaky output's streaming flag must flip to false");
    let stable_untouched = !events.iter().any(|e| matches!(
        e,
        PipelineEvent::OutputStateChanged { output, streaming: false } if *output == stable_output
    ));
    assert!(stable_untouched, "the stable output must not be knocked out by its sibling's failure");

    let stable_writes_before_release = stable_writes.load(Ordering::Acquire);
    assert!(stable_writes_before_release > 0, "the stable output kept streaming");

    pipeline.release();
}
