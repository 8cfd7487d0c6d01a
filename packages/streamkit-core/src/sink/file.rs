//! File sink: writes a muxed byte stream to local disk (spec §4.8).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{StreamError, StreamResult};
use crate::types::{EndpointDescriptor, Packet};

use super::{Sink, SinkMetrics};

/// Writes packets to a local file, matching [`EndpointDescriptor::File`].
pub struct FileSink {
    writer: Option<BufWriter<File>>,
    bytes_written: AtomicU64,
}

impl FileSink {
    pub fn new() -> Self {
        Self {
            writer: None,
            bytes_written: AtomicU64::new(0),
        }
    }
}

impl Default for FileSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for FileSink {
    fn open(&mut self, descriptor: &EndpointDescriptor) -> StreamResult<()> {
        let EndpointDescriptor::File { path } = descriptor else {
            return Err(StreamError::unsupported("FileSink requires a File descriptor"));
        };
        let file = File::create(path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn start_stream(&mut self) -> StreamResult<()> {
        if self.writer.is_none() {
            return Err(StreamError::config("FileSink is not open"));
        }
        Ok(())
    }

    fn write(&mut self, packet: Packet) -> StreamResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StreamError::closed("FileSink is not open"))?;
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
            queued_bytes: 0, // synchronous writer has no internal queue
            dropped_frames: 0,
        }
    }

    fn is_opened(&self) -> bool {
        self.writer.is_some()
    }
}
