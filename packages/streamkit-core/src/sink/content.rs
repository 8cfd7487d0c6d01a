//! Content-URI sink: writes to a platform-resolved content location (spec §4.8).
//!
//! On a real host a `content://` URI is resolved by a platform content
//! provider; this crate has no such provider, so it resolves the URI's path
//! component against the local filesystem and otherwise behaves exactly
//! like [`super::FileSink`].

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{StreamError, StreamResult};
use crate::types::{EndpointDescriptor, Packet};

use super::{Sink, SinkMetrics};

pub struct ContentSink {
    writer: Option<BufWriter<File>>,
    bytes_written: AtomicU64,
}

impl ContentSink {
    pub fn new() -> Self {
        Self {
            writer: None,
            bytes_written: AtomicU64::new(0),
        }
    }

    fn resolve_path(uri: &str) -> String {
        uri.strip_prefix("content://").unwrap_or(uri).to_string()
    }
}

impl Default for ContentSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for ContentSink {
    fn open(&mut self, descriptor: &EndpointDescriptor) -> StreamResult<()> {
        let EndpointDescriptor::Content { uri } = descriptor else {
            return Err(StreamError::unsupported("ContentSink requires a Content descriptor"));
        };
        let file = File::create(Self::resolve_path(uri))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn start_stream(&mut self) -> StreamResult<()> {
        if self.writer.is_none() {
            return Err(StreamError::config("ContentSink is not open"));
        }
        Ok(())
    }

    fn write(&mut self, packet: Packet) -> StreamResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StreamError::closed("ContentSink is not open"))?;
        writer.write_all(&packet.data)?;
        self.bytes_written
            .fetch_add(packet.data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn stop_stream(&mut self) -> StreamResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }

    fn metrics(&self) -> SinkMetrics {
        SinkMetrics {
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            queued_bytes: 0,
            dropped_frames: 0,
        }
    }

    fn is_opened(&self) -> bool {
        self.writer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_path_strips_scheme() {
        assert_eq!(
            ContentSink::resolve_path("content:///tmp/out.mp4"),
            "/tmp/out.mp4"
        );
    }

    #[test]
    fn open_rejects_non_content_descriptor() {
        let mut sink = ContentSink::new();
        let err = sink
            .open(&EndpointDescriptor::File {
                path: "/tmp/x".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Unsupported);
    }
}
