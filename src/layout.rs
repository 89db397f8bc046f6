//! Pixel layout resolution.
//!
//! Decides whether a parsed `StreamFormat` is something this crate can convert, and
//! if so derives its geometry. The decision table is ordered; the first match wins:
//!
//! 1. rgb family at 24 bpp -> `Packed24Rgb`
//! 2. yuv family with the `I420` tag -> `Planar420Yuv` (bpp is forced to 12)
//! 3. everything else -> unsupported
//!
//! RGB channel masks are accepted but do not select a channel order; all packed RGB is
//! treated as R, G, B in byte order.

use serde::Serialize;
use std::num::NonZeroU32;

use crate::caps::{MediaFamily, StreamFormat};
use crate::error::{ConvertError, Unsupported};

/// The only 4:2:0 subsampling tag currently supported.
pub const I420_FOURCC: &str = "I420";

pub const PACKED_RGB_BPP: u32 = 24;
pub const PLANAR_420_BPP: u32 = 12;

/// A validated, supported layout. Dimensions are non-zero by construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "layout", rename_all = "snake_case")]
pub enum PixelLayout {
    Packed24Rgb {
        width: NonZeroU32,
        height: NonZeroU32,
    },
    Planar420Yuv {
        width: NonZeroU32,
        height: NonZeroU32,
    },
}

/// Byte ranges of the three 4:2:0 planes inside a source buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneGeometry {
    pub luma_len: usize,
    pub chroma_len: usize,
    pub u_offset: usize,
    pub v_offset: usize,
}

impl PlaneGeometry {
    pub fn total_len(&self) -> usize {
        self.v_offset + self.chroma_len
    }
}

impl PixelLayout {
    pub fn width(&self) -> u32 {
        match self {
            PixelLayout::Packed24Rgb { width, .. } | PixelLayout::Planar420Yuv { width, .. } => {
                width.get()
            }
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            PixelLayout::Packed24Rgb { height, .. } | PixelLayout::Planar420Yuv { height, .. } => {
                height.get()
            }
        }
    }

    pub fn bits_per_pixel(&self) -> u32 {
        match self {
            PixelLayout::Packed24Rgb { .. } => PACKED_RGB_BPP,
            PixelLayout::Planar420Yuv { .. } => PLANAR_420_BPP,
        }
    }

    fn pixel_count(&self) -> Result<usize, ConvertError> {
        (self.width() as usize)
            .checked_mul(self.height() as usize)
            .ok_or(ConvertError::Overflow {
                width: self.width(),
                height: self.height(),
            })
    }

    /// Bytes of canonical RGB8 output: `width * height * 3`.
    pub fn output_len(&self) -> Result<usize, ConvertError> {
        self.pixel_count()?
            .checked_mul(3)
            .ok_or(ConvertError::Overflow {
                width: self.width(),
                height: self.height(),
            })
    }

    /// Bytes the source buffer must hold: `width * height * bpp / 8`.
    pub fn source_len(&self) -> Result<usize, ConvertError> {
        match self {
            PixelLayout::Packed24Rgb { .. } => self.output_len(),
            PixelLayout::Planar420Yuv { .. } => Ok(self.planes()?.total_len()),
        }
    }

    /// Plane offsets for 4:2:0 input: Y at 0, U at `w*h`, V at `w*h*5/4`.
    pub fn planes(&self) -> Result<PlaneGeometry, ConvertError> {
        let luma_len = self.pixel_count()?;
        let chroma_len = luma_len / 4;
        luma_len
            .checked_add(chroma_len * 2)
            .ok_or(ConvertError::Overflow {
                width: self.width(),
                height: self.height(),
            })?;
        Ok(PlaneGeometry {
            luma_len,
            chroma_len,
            u_offset: luma_len,
            v_offset: luma_len + chroma_len,
        })
    }
}

/// Resolve a format to a supported layout. `None` means: drop this buffer.
pub fn resolve(format: &StreamFormat) -> Option<PixelLayout> {
    classify(format).ok()
}

/// Like `resolve`, but says why a format is unsupported.
pub fn classify(format: &StreamFormat) -> Result<PixelLayout, Unsupported> {
    match &format.family {
        MediaFamily::Rgb => {
            if format.bits_per_pixel != Some(PACKED_RGB_BPP) {
                return Err(Unsupported::Depth(format.bits_per_pixel));
            }
            let (width, height) = dimensions(format)?;
            Ok(PixelLayout::Packed24Rgb { width, height })
        }
        MediaFamily::Yuv => {
            match format.fourcc.as_deref() {
                Some(I420_FOURCC) => {}
                Some(other) => return Err(Unsupported::Fourcc(other.to_string())),
                None => return Err(Unsupported::MissingFourcc),
            }
            let (width, height) = dimensions(format)?;
            if width.get() % 2 != 0 || height.get() % 2 != 0 {
                return Err(Unsupported::OddDimensions {
                    width: width.get(),
                    height: height.get(),
                });
            }
            Ok(PixelLayout::Planar420Yuv { width, height })
        }
        MediaFamily::Other(name) => Err(Unsupported::Family(name.clone())),
    }
}

fn dimensions(format: &StreamFormat) -> Result<(NonZeroU32, NonZeroU32), Unsupported> {
    let (Some(width), Some(height)) = (format.width, format.height) else {
        return Err(Unsupported::MissingDimension);
    };
    match (NonZeroU32::new(width), NonZeroU32::new(height)) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(Unsupported::ZeroDimension { width, height }),
    }
}
