//! Synthetic frame feed for the in-memory transport.
//!
//! Produces a moving test pattern in RGB24 or I420 with a matching descriptor, so the
//! full ingestion path can run without a shared-memory producer. The scene shifts
//! every 50 frames.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::MemoryTransport;
use crate::caps::{i420_descriptor, rgb_descriptor};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticFormat {
    #[default]
    Rgb24,
    I420,
}

impl std::str::FromStr for SyntheticFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rgb" | "rgb24" => Ok(SyntheticFormat::Rgb24),
            "i420" | "yuv" => Ok(SyntheticFormat::I420),
            other => Err(format!(
                "unknown synthetic format '{}'; expected rgb24 or i420",
                other
            )),
        }
    }
}

pub struct SyntheticFeed {
    source: String,
    width: u32,
    height: u32,
    format: SyntheticFormat,
    descriptor: String,
    frame_count: u64,
    scene_state: u8,
    started_at: Instant,
}

impl SyntheticFeed {
    pub fn new(source: &str, width: u32, height: u32, format: SyntheticFormat) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("synthetic feed needs non-zero dimensions"));
        }
        if format == SyntheticFormat::I420 && (width % 2 != 0 || height % 2 != 0) {
            return Err(anyhow!(
                "synthetic I420 feed needs even dimensions, got {}x{}",
                width,
                height
            ));
        }
        let descriptor = match format {
            SyntheticFormat::Rgb24 => rgb_descriptor(width, height),
            SyntheticFormat::I420 => i420_descriptor(width, height),
        };
        Ok(Self {
            source: source.to_string(),
            width,
            height,
            format,
            descriptor,
            frame_count: 0,
            scene_state: 0,
            started_at: Instant::now(),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn frames_generated(&self) -> u64 {
        self.frame_count
    }

    /// Next buffer and its timestamp in nanoseconds since the feed started.
    pub fn next_buffer(&mut self) -> (Vec<u8>, u64) {
        self.frame_count += 1;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let pixels = match self.format {
            SyntheticFormat::Rgb24 => self.rgb_pattern(),
            SyntheticFormat::I420 => self.i420_pattern(),
        };
        let timestamp = self.started_at.elapsed().as_nanos() as u64;
        (pixels, timestamp)
    }

    /// Generate one buffer and push it. Returns how many subscribers received it.
    pub fn push_next(&mut self, transport: &MemoryTransport) -> usize {
        let (pixels, timestamp) = self.next_buffer();
        transport.push(&self.source, &self.descriptor, pixels, timestamp)
    }

    fn rgb_pattern(&self) -> Vec<u8> {
        let len = self.width as usize * self.height as usize * 3;
        let shift = self.frame_count + self.scene_state as u64;
        (0..len)
            .map(|i| ((i as u64 + shift) % 256) as u8)
            .collect()
    }

    fn i420_pattern(&self) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let chroma_len = w * h / 4;
        let mut pixels = Vec::with_capacity(w * h + chroma_len * 2);
        for y in 0..h {
            for x in 0..w {
                pixels.push((((x + y) as u64 + self.frame_count) % 256) as u8);
            }
        }
        let tint = self.scene_state.wrapping_mul(16);
        pixels.extend(std::iter::repeat(128u8.wrapping_add(tint)).take(chroma_len));
        pixels.extend(std::iter::repeat(128u8.wrapping_sub(tint)).take(chroma_len));
        pixels
    }

    /// Run the feed on its own thread at `fps` until the handle is stopped or dropped.
    pub fn spawn(mut self, transport: Arc<MemoryTransport>, fps: u32) -> FeedHandle {
        let interval = frame_interval(fps);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let join = std::thread::spawn(move || {
            log::info!(
                "SyntheticFeed: producing {:?} {}x{} on {}",
                self.format,
                self.width,
                self.height,
                self.source
            );
            while !stop_thread.load(Ordering::SeqCst) {
                self.push_next(&transport);
                std::thread::sleep(interval);
            }
            self.frame_count
        });
        FeedHandle {
            stop,
            join: Some(join),
        }
    }
}

const MIN_FRAME_INTERVAL: Duration = Duration::from_micros(1);

/// Time between frames at `fps`. Zero is treated as 1 fps.
fn frame_interval(fps: u32) -> Duration {
    (Duration::from_secs(1) / fps.max(1)).max(MIN_FRAME_INTERVAL)
}

/// Running synthetic feed. Stops on `stop()` or drop.
pub struct FeedHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<u64>>,
}

impl FeedHandle {
    /// Stop the feed and return how many frames it produced.
    pub fn stop(mut self) -> u64 {
        self.shutdown()
    }

    fn shutdown(&mut self) -> u64 {
        self.stop.store(true, Ordering::SeqCst);
        match self.join.take() {
            Some(join) => join.join().unwrap_or_else(|_| {
                log::warn!("SyntheticFeed: producer thread panicked");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::parse;
    use crate::layout::{resolve, PixelLayout};

    #[test]
    fn rgb_feed_matches_its_descriptor() -> Result<()> {
        let mut feed = SyntheticFeed::new("cam", 8, 4, SyntheticFormat::Rgb24)?;
        let layout = resolve(&parse(feed.descriptor())?).expect("supported");
        assert!(matches!(layout, PixelLayout::Packed24Rgb { .. }));
        let (pixels, _) = feed.next_buffer();
        assert_eq!(pixels.len(), layout.source_len()?);
        Ok(())
    }

    #[test]
    fn i420_feed_matches_its_descriptor() -> Result<()> {
        let mut feed = SyntheticFeed::new("cam", 8, 4, SyntheticFormat::I420)?;
        let layout = resolve(&parse(feed.descriptor())?).expect("supported");
        assert!(matches!(layout, PixelLayout::Planar420Yuv { .. }));
        let (pixels, _) = feed.next_buffer();
        assert_eq!(pixels.len(), layout.source_len()?);
        Ok(())
    }

    #[test]
    fn frames_change_over_time() -> Result<()> {
        let mut feed = SyntheticFeed::new("cam", 4, 2, SyntheticFormat::Rgb24)?;
        let (first, _) = feed.next_buffer();
        let (second, _) = feed.next_buffer();
        assert_ne!(first, second);
        assert_eq!(feed.frames_generated(), 2);
        Ok(())
    }

    #[test]
    fn odd_i420_feed_is_rejected() {
        assert!(SyntheticFeed::new("cam", 3, 2, SyntheticFormat::I420).is_err());
        assert!(SyntheticFeed::new("cam", 0, 2, SyntheticFormat::Rgb24).is_err());
    }

    #[test]
    fn frame_interval_never_reaches_zero() {
        assert_eq!(frame_interval(0), Duration::from_secs(1));
        assert_eq!(frame_interval(25), Duration::from_millis(40));
        assert_eq!(frame_interval(4_000), Duration::from_micros(250));
        assert_eq!(frame_interval(u32::MAX), MIN_FRAME_INTERVAL);
    }

    #[test]
    fn spawned_feed_stops() -> Result<()> {
        let transport = Arc::new(MemoryTransport::new());
        let handle = SyntheticFeed::new("cam", 2, 2, SyntheticFormat::Rgb24)?.spawn(transport, 200);
        std::thread::sleep(Duration::from_millis(30));
        assert!(handle.stop() > 0);
        Ok(())
    }
}
