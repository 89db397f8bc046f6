//! Frame mirror.
//!
//! `FrameWriter` re-publishes canonical frames to a transport destination as packed
//! RGB with a `video/x-raw-rgb` descriptor, so any reader of this crate (or any other
//! shmdata consumer) can subscribe to the converted stream.

use std::sync::Arc;
use std::time::Instant;

use crate::caps::rgb_descriptor;
use crate::error::TransportError;
use crate::frame::CanonicalFrame;
use crate::transport::TransportWriter;

pub struct FrameWriter {
    writer: Arc<dyn TransportWriter>,
    destination: String,
    geometry: Option<(u32, u32)>,
    descriptor: String,
    started_at: Instant,
    frames_written: u64,
}

impl FrameWriter {
    pub fn new(writer: Arc<dyn TransportWriter>, destination: &str) -> Self {
        Self {
            writer,
            destination: destination.to_string(),
            geometry: None,
            descriptor: String::new(),
            started_at: Instant::now(),
            frames_written: 0,
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Descriptor attached to the last written frame; empty before the first write.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Write one frame. A geometry change re-initializes the output descriptor.
    pub fn write(&mut self, frame: &CanonicalFrame) -> Result<(), TransportError> {
        let geometry = (frame.width(), frame.height());
        if geometry.0 == 0 || geometry.1 == 0 {
            return Err(TransportError::Write {
                destination: self.destination.clone(),
                reason: "empty frame".to_string(),
            });
        }
        if self.geometry != Some(geometry) {
            self.descriptor = rgb_descriptor(geometry.0, geometry.1);
            self.geometry = Some(geometry);
            log::info!(
                "FrameWriter: {} now {}x{}",
                self.destination,
                geometry.0,
                geometry.1
            );
        }
        let timestamp = self.started_at.elapsed().as_nanos() as u64;
        self.writer
            .write(&self.destination, &self.descriptor, frame.as_bytes(), timestamp)?;
        self.frames_written += 1;
        Ok(())
    }
}
