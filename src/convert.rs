//! Raw buffer to canonical RGB8 conversion.
//!
//! Every length is checked against the delivered buffer before the first byte of
//! output is written, so a refused conversion leaves the destination untouched and
//! a short buffer is never read past its end.

use serde::{Deserialize, Serialize};

use crate::error::ConvertError;
use crate::frame::{quantize, CanonicalFrame, RawFrame};
use crate::layout::{PixelLayout, PlaneGeometry};

/// How chroma samples are addressed in a 4:2:0 frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChromaAddressing {
    /// `(y * width) / 4 + x / 2`, clamped to the last sample of the plane.
    #[default]
    Legacy,
    /// `(y / 2) * (width / 2) + x / 2`.
    Standard,
}

impl ChromaAddressing {
    #[inline]
    fn index(self, x: usize, y: usize, width: usize, plane_len: usize) -> usize {
        match self {
            ChromaAddressing::Legacy => ((y * width) / 4 + x / 2).min(plane_len - 1),
            ChromaAddressing::Standard => (y / 2) * (width / 2) + x / 2,
        }
    }
}

impl std::str::FromStr for ChromaAddressing {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(ChromaAddressing::Legacy),
            "standard" => Ok(ChromaAddressing::Standard),
            other => Err(format!(
                "unknown chroma addressing '{}'; expected legacy or standard",
                other
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FrameConverter {
    chroma: ChromaAddressing,
}

impl FrameConverter {
    pub fn new(chroma: ChromaAddressing) -> Self {
        Self { chroma }
    }

    pub fn chroma(&self) -> ChromaAddressing {
        self.chroma
    }

    /// Convert into a freshly allocated frame.
    pub fn convert(&self, raw: &RawFrame<'_>) -> Result<CanonicalFrame, ConvertError> {
        let mut frame = CanonicalFrame::default();
        self.convert_into(raw, &mut frame)?;
        Ok(frame)
    }

    /// Convert into `out`, reusing its allocation. On error `out` is unchanged.
    pub fn convert_into(&self, raw: &RawFrame<'_>, out: &mut CanonicalFrame) -> Result<(), ConvertError> {
        match raw.layout {
            PixelLayout::Packed24Rgb { .. } => {
                let len = raw.layout.output_len()?;
                let source = checked_prefix(raw.bytes, len)?;
                out.reshape(&raw.layout, raw.timestamp)?;
                out.pixels_mut().copy_from_slice(source);
            }
            PixelLayout::Planar420Yuv { width, height } => {
                if width.get() % 2 != 0 || height.get() % 2 != 0 {
                    return Err(ConvertError::OddDimensions {
                        width: width.get(),
                        height: height.get(),
                    });
                }
                let planes = raw.layout.planes()?;
                let source = checked_prefix(raw.bytes, planes.total_len())?;
                out.reshape(&raw.layout, raw.timestamp)?;
                self.i420_to_rgb(source, &planes, width.get() as usize, out.pixels_mut());
            }
        }
        Ok(())
    }

    fn i420_to_rgb(&self, source: &[u8], planes: &PlaneGeometry, width: usize, rgb: &mut [u8]) {
        let luma = &source[..planes.luma_len];
        let u_plane = &source[planes.u_offset..planes.u_offset + planes.chroma_len];
        let v_plane = &source[planes.v_offset..planes.v_offset + planes.chroma_len];

        for (row, out_row) in rgb.chunks_exact_mut(width * 3).enumerate() {
            for (col, out) in out_row.chunks_exact_mut(3).enumerate() {
                let chroma = self.chroma.index(col, row, width, planes.chroma_len);
                let y = f32::from(luma[row * width + col]);
                let u = f32::from(u_plane[chroma]) - 128.0;
                let v = f32::from(v_plane[chroma]) - 128.0;

                out[0] = quantize((y + 1.4 * v) / 255.0);
                out[1] = quantize((y - 0.343 * u - 0.711 * v) / 255.0);
                out[2] = quantize((y + 1.765 * u) / 255.0);
            }
        }
    }
}

fn checked_prefix(bytes: &[u8], len: usize) -> Result<&[u8], ConvertError> {
    bytes.get(..len).ok_or(ConvertError::ShortBuffer {
        expected: len,
        actual: bytes.len(),
    })
}
