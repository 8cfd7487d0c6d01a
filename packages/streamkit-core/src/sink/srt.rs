//! SRT sink (spec §4.8).
//!
//! This crate has no SRT handshake/retransmission implementation (no crate
//! in the pack ships one) — `open` establishes a plain UDP socket connected
//! to the descriptor's host:port and `write` sends each packet's bytes
//! as-is. Real SRT framing, ARQ and encryption are a transport-layer
//! concern outside this crate's scope; a production host is expected to
//! swap this sink for one backed by `libsrt` bindings.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{StreamError, StreamResult};
use crate::types::{EndpointDescriptor, Packet};

use super::{Sink, SinkMetrics};

pub struct SrtSink {
    socket: Option<UdpSocket>,
    bytes_written: AtomicU64,
    dropped_frames: AtomicU64,
}

impl SrtSink {
    pub fn new() -> Self {
        Self {
            socket: None,
            bytes_written: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }
}

impl Default for SrtSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for SrtSink {
    fn open(&mut self, descriptor: &EndpointDescriptor) -> StreamResult<()> {
        let EndpointDescriptor::Srt {
            host,
            port,
            connection_timeout_ms,
            ..
        } = descriptor
        else {
            return Err(StreamError::unsupported("SrtSink requires an Srt descriptor"));
        };

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        if let Some(timeout_ms) = connection_timeout_ms {
            socket.set_write_timeout(Some(Duration::from_millis(*timeout_ms as u64)))?;
        }
        socket.connect((host.as_str(), *port))?;
        self.socket = Some(socket);
        Ok(())
    }

    fn start_stream(&mut self) -> StreamResult<()> {
        if self.socket.is_none() {
            return Err(StreamError::config("SrtSink is not open"));
        }
        Ok(())
    }

    fn write(&mut self, packet: Packet) -> StreamResult<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| StreamError::closed("SrtSink is not open"))?;
        match socket.send(&packet.data) {
            Ok(n) => {
                self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(StreamError::from(err))
            }
        }
    }

    fn stop_stream(&mut self) -> StreamResult<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.socket = None;
    }

    fn metrics(&self) -> SinkMetrics {
        SinkMetrics {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            queued_bytes: 0,
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }

    fn is_opened(&self) -> bool {
        self.socket.is_some()
    }
}
