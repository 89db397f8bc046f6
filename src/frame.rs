//! Frame types.
//!
//! - `RawFrame`: borrowed view of one transport buffer plus its resolved layout.
//!   It cannot outlive the callback invocation that received the buffer.
//! - `CanonicalFrame`: owned RGB8 image, 3 channels, always exactly
//!   `width * height * 3` bytes.

use crate::error::ConvertError;
use crate::layout::PixelLayout;

/// Channels in every canonical frame.
pub const CANONICAL_CHANNELS: u32 = 3;

// ----------------------------------------------------------------------------
// RawFrame: one delivered buffer, borrowed
// ----------------------------------------------------------------------------

/// Raw bytes as delivered by the transport. Borrowed from the buffer lease, so the
/// borrow checker keeps it inside the callback that owns the lease.
#[derive(Clone, Copy, Debug)]
pub struct RawFrame<'a> {
    pub bytes: &'a [u8],
    pub layout: PixelLayout,
    pub timestamp: u64,
}

impl<'a> RawFrame<'a> {
    pub fn new(bytes: &'a [u8], layout: PixelLayout, timestamp: u64) -> Self {
        Self {
            bytes,
            layout,
            timestamp,
        }
    }
}

// ----------------------------------------------------------------------------
// CanonicalFrame: normalized RGB8 output
// ----------------------------------------------------------------------------

/// RGB8 frame. The pixel buffer is private so its length always matches the geometry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalFrame {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    timestamp: u64,
}

impl CanonicalFrame {
    /// Black frame of the given size.
    pub fn new(width: u32, height: u32) -> Result<Self, ConvertError> {
        let len = rgb_len(width, height)?;
        Ok(Self {
            pixels: vec![0u8; len],
            width,
            height,
            timestamp: 0,
        })
    }

    /// Wrap packed RGB8 bytes. The length must match the geometry exactly.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self, ConvertError> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(ConvertError::ShortBuffer {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self {
            pixels,
            width,
            height,
            timestamp: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        CANONICAL_CHANNELS
    }

    /// Timestamp of the transport buffer this frame was converted from.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        let rgb = self.pixels.get(offset..offset + 3)?;
        Some([rgb[0], rgb[1], rgb[2]])
    }

    /// Pixel channels as 0..1 samples.
    pub fn normalized(&self, x: u32, y: u32) -> Option<[f32; 3]> {
        self.pixel(x, y)
            .map(|rgb| rgb.map(|channel| f32::from(channel) / 255.0))
    }

    /// Re-shape this frame for `layout`, reusing the allocation. Contents are
    /// unspecified until the caller overwrites every byte.
    pub(crate) fn reshape(&mut self, layout: &PixelLayout, timestamp: u64) -> Result<(), ConvertError> {
        let len = layout.output_len()?;
        self.pixels.resize(len, 0);
        self.width = layout.width();
        self.height = layout.height();
        self.timestamp = timestamp;
        Ok(())
    }

    pub(crate) fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }
}

impl Default for CanonicalFrame {
    fn default() -> Self {
        Self {
            pixels: Vec::new(),
            width: 0,
            height: 0,
            timestamp: 0,
        }
    }
}

/// Quantize a 0..1 sample to 8 bits.
pub(crate) fn quantize(sample: f32) -> u8 {
    (sample * 255.0).round().clamp(0.0, 255.0) as u8
}

fn rgb_len(width: u32, height: u32) -> Result<usize, ConvertError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|count| count.checked_mul(3))
        .ok_or(ConvertError::Overflow { width, height })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
