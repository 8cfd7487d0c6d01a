//! RTMP sink (spec §4.8).
//!
//! No RTMP handshake/chunking crate exists in the pack, so this sink opens
//! a plain TCP connection to the URL's host:port and writes the muxer's
//! FLV byte stream straight through. A conforming RTMP server expects the
//! C0/C1/C2 handshake and chunked `Invoke`/`Video`/`Audio` messages before
//! accepting payload — that handshake is out of scope here; a production
//! host is expected to swap this sink for one backed by a real RTMP client.

use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{StreamError, StreamResult};
use crate::types::{EndpointDescriptor, Packet};

use super::{Sink, SinkMetrics};

const DEFAULT_RTMP_PORT: u16 = 1935;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RtmpSink {
    stream: Option<TcpStream>,
    bytes_written: AtomicU64,
    dropped_frames: AtomicU64,
}

impl RtmpSink {
    pub fn new() -> Self {
        Self {
            stream: None,
            bytes_written: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Extracts `host` and `port` from an `rtmp(s|t|ts)://host[:port]/...` URL.
    fn host_port(url: &str) -> StreamResult<(String, u16)> {
        let without_scheme = url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(url);
        let authority = without_scheme
            .split_once('/')
            .map(|(authority, _)| authority)
            .unwrap_or(without_scheme);
        if authority.is_empty() {
            return Err(StreamError::config("RTMP url has no host"));
        }
        match authority.split_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| StreamError::config("RTMP url has an invalid port"))?;
                Ok((host.to_string(), port))
            }
            None => Ok((authority.to_string(), DEFAULT_RTMP_PORT)),
        }
    }
}

impl Default for RtmpSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for RtmpSink {
    fn open(&mut self, descriptor: &EndpointDescriptor) -> StreamResult<()> {
        let EndpointDescriptor::Rtmp { url } = descriptor else {
            return Err(StreamError::unsupported("RtmpSink requires an Rtmp descriptor"));
        };
        let (host, port) = Self::host_port(url)?;
        let addr = std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), port))?
            .next()
            .ok_or_else(|| StreamError::config("RTMP host did not resolve to an address"))?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        self.stream = Some(stream);
        Ok(())
    }

    fn start_stream(&mut self) -> StreamResult<()> {
        if self.stream.is_none() {
            return Err(StreamError::config("RtmpSink is not open"));
        }
        Ok(())
    }

    fn write(&mut self, packet: Packet) -> StreamResult<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| StreamError::closed("RtmpSink is not open"))?;
        match stream.write_all(&packet.data) {
            Ok(()) => {
                self.bytes_written
                    .fetch_add(packet.data.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                Err(StreamError::from(err))
            }
        }
    }

    fn stop_stream(&mut self) -> StreamResult<()> {
        if let Some(stream) = self.stream.as_mut() {
            stream.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }

    fn metrics(&self) -> SinkMetrics {
        SinkMetrics {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            queued_bytes: 0,
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }

    fn is_opened(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parses_explicit_port() {
        assert_eq!(
            RtmpSink::host_port("rtmp://example.com:1936/live/stream").unwrap(),
            ("example.com".to_string(), 1936)
        );
    }

    #[test]
    fn host_port_defaults_to_1935() {
        assert_eq!(
            RtmpSink::host_port("rtmp://example.com/live").unwrap(),
            ("example.com".to_string(), DEFAULT_RTMP_PORT)
        );
    }

    #[test]
    fn open_rejects_non_rtmp_descriptor() {
        let mut sink = RtmpSink::new();
        let err = sink
            .open(&EndpointDescriptor::File {
                path: "/tmp/x".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Unsupported);
    }
}
