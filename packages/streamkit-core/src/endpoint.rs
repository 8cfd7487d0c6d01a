//! Composite endpoint: pairs a muxer with one or more sinks (spec §4.6, C9).
//!
//! A [`CompositeEndpoint`] is the only thing downstream of an encoder that
//! knows both "how to pack frames into a container" and "where the bytes
//! go". It owns exactly one [`Muxer`] and fans every packet the muxer
//! produces out to every currently-opened [`Sink`] ("combine-endpoint" in
//! spec terms). Fan-out is best-effort: one sink failing is logged and does
//! not stop delivery to the others; the call only fails if every sink
//! failed (spec §4.6, §9 multi-error aggregation).

use log::warn;

use crate::error::{combine_errors, StreamResult};
use crate::mux::Muxer;
use crate::retry::with_retry;
use crate::sink::Sink;
use crate::types::{CodecConfig, EndpointDescriptor, Frame, Packet, StreamId};

/// Binds one [`Muxer`] to one or more [`Sink`]s.
pub struct CompositeEndpoint {
    muxer: Box<dyn Muxer>,
    sinks: Vec<Box<dyn Sink>>,
}

impl CompositeEndpoint {
    pub fn new(muxer: Box<dyn Muxer>) -> Self {
        Self {
            muxer,
            sinks: Vec::new(),
        }
    }

    /// Opens `sink` against `descriptor` and adds it to the fan-out set.
    /// Rejects with `Unsupported` if `descriptor` doesn't match the sink
    /// (spec §4.6: `open` fails when the descriptor's tag doesn't match).
    /// A transient failure (e.g. connection refused) is retried with
    /// backoff (spec §4, C11) before giving up.
    pub fn add_sink(
        &mut self,
        mut sink: Box<dyn Sink>,
        descriptor: &EndpointDescriptor,
    ) -> StreamResult<()> {
        with_retry("sink open", || sink.open(descriptor))?;
        self.sinks.push(sink);
        Ok(())
    }

    pub fn add_stream(&mut self, config: &CodecConfig) -> StreamResult<StreamId> {
        self.muxer.add_stream(config)
    }

    pub fn add_streams(&mut self, configs: &[CodecConfig]) -> StreamResult<Vec<StreamId>> {
        self.muxer.add_streams(configs)
    }

    pub fn remove_stream(&mut self, id: StreamId) {
        self.muxer.remove_stream(id);
    }

    /// Starts every opened sink, then emits the muxer's header packets
    /// (spec §4.5: PAT/PMT/SDT, `ftyp`+`moov`, FLV header+`onMetaData`).
    /// Every sink must start successfully — this mirrors `start_stream`'s
    /// fan-out requiring all sub-operations to succeed (spec §9).
    pub fn start_stream(&mut self) -> StreamResult<()> {
        let results: Vec<StreamResult<()>> =
            self.sinks.iter_mut().map(|s| s.start_stream()).collect();
        fold_fanout(results, true)?;
        let packets = self.muxer.start_stream()?;
        self.dispatch(packets)
    }

    /// Serializes one access unit and fans the resulting packets out to
    /// every opened sink.
    pub fn write(&mut self, id: StreamId, frame: Frame) -> StreamResult<()> {
        let packets = self.muxer.write(id, frame)?;
        self.dispatch(packets)
    }

    /// Flushes trailer bytes (if any) and stops every sink. Idempotent at
    /// the sink level; succeeds as long as at least one sink stopped
    /// cleanly (or there were none).
    pub fn stop_stream(&mut self) -> StreamResult<()> {
        let packets = self.muxer.stop_stream()?;
        self.dispatch(packets)?;
        let results: Vec<StreamResult<()>> =
            self.sinks.iter_mut().map(|s| s.stop_stream()).collect();
        fold_fanout(results, false)
    }

    pub fn close(&mut self) {
        for sink in &mut self.sinks {
            sink.close();
        }
    }

    /// Per-sink metrics snapshot (spec §4.6 `metrics`), in add order.
    pub fn sink_metrics(&self) -> Vec<crate::sink::SinkMetrics> {
        self.sinks.iter().map(|s| s.metrics()).collect()
    }

    /// Whether any sink in the fan-out set is currently open.
    pub fn is_opened(&self) -> bool {
        self.sinks.iter().any(|s| s.is_opened())
    }

    fn dispatch(&mut self, packets: Vec<Packet>) -> StreamResult<()> {
        for packet in packets {
            let results: Vec<StreamResult<()>> = self
                .sinks
                .iter_mut()
                .filter(|s| s.is_opened())
                .map(|s| s.write(packet.clone()))
                .collect();
            fold_fanout(results, false)?;
        }
        Ok(())
    }
}

/// Reduces a batch of sub-operation results into a single `StreamResult`,
/// logging every individual failure along the way (spec §4.6: "failure of
/// one is logged and does not abort the others").
fn fold_fanout(results: Vec<StreamResult<()>>, require_all: bool) -> StreamResult<()> {
    use crate::error::Outcome;

    let errs_preview: Vec<&crate::error::StreamError> =
        results.iter().filter_map(|r| r.as_ref().err()).collect();
    for err in &errs_preview {
        warn!("endpoint sink operation failed: {err}");
    }

    match Outcome::from_results(results, require_all) {
        Outcome::Ok(_) => Ok(()),
        Outcome::SingleError(e) => Err(e),
        Outcome::Multi(errs) => Err(combine_errors(errs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StreamError};
    use crate::types::{AudioSourceConfig, ByteFormat, Codec, SourceConfig};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        opened: bool,
        writes: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Sink for CountingSink {
        fn open(&mut self, _descriptor: &EndpointDescriptor) -> StreamResult<()> {
            self.opened = true;
            Ok(())
        }
        fn start_stream(&mut self) -> StreamResult<()> {
            Ok(())
        }
        fn write(&mut self, _packet: Packet) -> StreamResult<()> {
            if self.fail {
                return Err(StreamError::closed("sink gone"));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn stop_stream(&mut self) -> StreamResult<()> {
            Ok(())
        }
        fn close(&mut self) {
            self.opened = false;
        }
        fn metrics(&self) -> crate::sink::SinkMetrics {
            crate::sink::SinkMetrics::default()
        }
        fn is_opened(&self) -> bool {
            self.opened
        }
    }

    struct StubMuxer;
    impl Muxer for StubMuxer {
        fn add_stream(&mut self, _config: &CodecConfig) -> StreamResult<StreamId> {
            Ok(StreamId(0))
        }
        fn remove_stream(&mut self, _id: StreamId) {}
        fn start_stream(&mut self) -> StreamResult<Vec<Packet>> {
            Ok(vec![])
        }
        fn write(&mut self, _id: StreamId, frame: Frame) -> StreamResult<Vec<Packet>> {
            Ok(vec![Packet {
                data: frame.data,
                is_first_of_frame: true,
                is_last_of_frame: true,
                timestamp_us: frame.pts_us,
            }])
        }
        fn stop_stream(&mut self) -> StreamResult<Vec<Packet>> {
            Ok(vec![])
        }
    }

    fn audio_codec_config() -> CodecConfig {
        CodecConfig {
            source: SourceConfig::Audio(AudioSourceConfig {
                sample_rate: 48_000,
                channels: 2,
                byte_format: ByteFormat::S16Le,
            }),
            codec: Codec::Audio(crate::types::AudioCodec::Aac),
            bitrate_bps: 128_000,
            profile: None,
            level: None,
            key_frame_interval_us: None,
        }
    }

    #[test]
    fn write_fans_out_to_every_opened_sink() {
        let mut endpoint = CompositeEndpoint::new(Box::new(StubMuxer));
        let writes_a = Arc::new(AtomicUsize::new(0));
        let writes_b = Arc::new(AtomicUsize::new(0));
        endpoint
            .add_sink(
                Box::new(CountingSink {
                    opened: false,
                    writes: Arc::clone(&writes_a),
                    fail: false,
                }),
                &EndpointDescriptor::File { path: "a".into() },
            )
            .unwrap();
        endpoint
            .add_sink(
                Box::new(CountingSink {
                    opened: false,
                    writes: Arc::clone(&writes_b),
                    fail: false,
                }),
                &EndpointDescriptor::File { path: "b".into() },
            )
            .unwrap();

        let id = endpoint.add_stream(&audio_codec_config()).unwrap();
        endpoint.start_stream().unwrap();
        endpoint
            .write(
                id,
                Frame::new(
                    Bytes::from_static(b"x"),
                    0,
                    None,
                    true,
                    vec![Bytes::from_static(b"csd")],
                    Codec::Audio(crate::types::AudioCodec::Aac),
                )
                .unwrap(),
            )
            .unwrap();

        assert_eq!(writes_a.load(Ordering::SeqCst), 1);
        assert_eq!(writes_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_succeeds_if_at_least_one_sink_accepts() {
        let mut endpoint = CompositeEndpoint::new(Box::new(StubMuxer));
        let writes = Arc::new(AtomicUsize::new(0));
        endpoint
            .add_sink(
                Box::new(CountingSink {
                    opened: false,
                    writes: Arc::clone(&writes),
                    fail: true,
                }),
                &EndpointDescriptor::File { path: "a".into() },
            )
            .unwrap();
        endpoint
            .add_sink(
                Box::new(CountingSink {
                    opened: false,
                    writes: Arc::clone(&writes),
                    fail: false,
                }),
                &EndpointDescriptor::File { path: "b".into() },
            )
            .unwrap();

        let id = endpoint.add_stream(&audio_codec_config()).unwrap();
        endpoint.start_stream().unwrap();
        endpoint
            .write(
                id,
                Frame::new(
                    Bytes::from_static(b"x"),
                    0,
                    None,
                    true,
                    vec![Bytes::from_static(b"csd")],
                    Codec::Audio(crate::types::AudioCodec::Aac),
                )
                .unwrap(),
            )
            .unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_fails_when_every_sink_fails() {
        let mut endpoint = CompositeEndpoint::new(Box::new(StubMuxer));
        let writes = Arc::new(AtomicUsize::new(0));
        endpoint
            .add_sink(
                Box::new(CountingSink {
                    opened: false,
                    writes: Arc::clone(&writes),
                    fail: true,
                }),
                &EndpointDescriptor::File { path: "a".into() },
            )
            .unwrap();

        let id = endpoint.add_stream(&audio_codec_config()).unwrap();
        endpoint.start_stream().unwrap();
        let err = endpoint
            .write(
                id,
                Frame::new(
                    Bytes::from_static(b"x"),
                    0,
                    None,
                    true,
                    vec![Bytes::from_static(b"csd")],
                    Codec::Audio(crate::types::AudioCodec::Aac),
                )
                .unwrap(),
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Closed);
    }

    #[test]
    fn add_sink_propagates_open_rejection() {
        struct RejectingSink;
        impl Sink for RejectingSink {
            fn open(&mut self, _descriptor: &EndpointDescriptor) -> StreamResult<()> {
                Err(StreamError::unsupported("nope"))
            }
            fn start_stream(&mut self) -> StreamResult<()> {
                Ok(())
            }
            fn write(&mut self, _packet: Packet) -> StreamResult<()> {
                Ok(())
            }
            fn stop_stream(&mut self) -> StreamResult<()> {
                Ok(())
            }
            fn close(&mut self) {}
            fn metrics(&self) -> crate::sink::SinkMetrics {
                crate::sink::SinkMetrics::default()
            }
            fn is_opened(&self) -> bool {
                false
            }
        }

        let mut endpoint = CompositeEndpoint::new(Box::new(StubMuxer));
        let err = endpoint
            .add_sink(Box::new(RejectingSink), &EndpointDescriptor::File { path: "a".into() })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
    }
}
