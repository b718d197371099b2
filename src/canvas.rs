use image::RgbaImage;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::error::{CompositeError, CompositeResult};

/// One pixel in storage order: blue, green, red, alpha.
pub type Bgra = [u8; 4];

pub const CHANNELS: usize = 4;

/// Maximum pixel count for a single buffer (~256 megapixels).
const MAX_PIXELS: u64 = 256_000_000;

// ============================================================================
// RESAMPLING
// ============================================================================

/// Interpolation used when a buffer is resized to the canvas dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResampleFilter {
    Nearest,
    Bilinear,
    #[default]
    Bicubic,
    Lanczos,
}

impl ResampleFilter {
    pub fn all() -> &'static [ResampleFilter] {
        &[
            ResampleFilter::Nearest,
            ResampleFilter::Bilinear,
            ResampleFilter::Bicubic,
            ResampleFilter::Lanczos,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResampleFilter::Nearest => "nearest",
            ResampleFilter::Bilinear => "bilinear",
            ResampleFilter::Bicubic => "bicubic",
            ResampleFilter::Lanczos => "lanczos",
        }
    }

    /// Parse a filter name; unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "nearest" => Some(ResampleFilter::Nearest),
            "bilinear" | "linear" | "triangle" => Some(ResampleFilter::Bilinear),
            "bicubic" | "cubic" | "catmullrom" => Some(ResampleFilter::Bicubic),
            "lanczos" | "lanczos3" => Some(ResampleFilter::Lanczos),
            _ => None,
        }
    }

    fn filter_type(self) -> FilterType {
        match self {
            ResampleFilter::Nearest => FilterType::Nearest,
            ResampleFilter::Bilinear => FilterType::Triangle,
            ResampleFilter::Bicubic => FilterType::CatmullRom,
            ResampleFilter::Lanczos => FilterType::Lanczos3,
        }
    }
}

/// Channel layout of raw input handed to [`PixelBuffer::from_raw`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelLayout {
    /// 3 bytes per pixel; promoted to BGRA with full opacity.
    Bgr,
    Bgra,
}

impl ChannelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ChannelLayout::Bgr => 3,
            ChannelLayout::Bgra => 4,
        }
    }
}

// ============================================================================
// PIXEL BUFFER – flat BGRA8 raster
// ============================================================================

/// Rectangular 4-channel (B,G,R,A) 8-bit raster, row-major, tightly packed.
///
/// Dimensions are fixed for the buffer's lifetime and always non-zero.
/// `clone()` is a deep copy, which is what layer snapshots rely on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl PixelBuffer {
    // ---- construction -------------------------------------------------------

    /// Fully transparent (all-zero) buffer.
    pub fn create_blank(width: u32, height: u32) -> CompositeResult<Self> {
        check_dimensions(width, height)?;
        let len = width as usize * height as usize * CHANNELS;
        Ok(Self { width, height, data: vec![0; len] })
    }

    /// Buffer with every pixel set to `color`.
    pub fn new_filled(width: u32, height: u32, color: Bgra) -> CompositeResult<Self> {
        let mut buf = Self::create_blank(width, height)?;
        if color != [0, 0, 0, 0] {
            buf.fill(color);
        }
        Ok(buf)
    }

    /// Import a raw byte slice. `Bgr` input gets an opaque alpha channel.
    pub fn from_raw(
        width: u32,
        height: u32,
        layout: ChannelLayout,
        data: &[u8],
    ) -> CompositeResult<Self> {
        check_dimensions(width, height)?;
        let pixel_count = width as usize * height as usize;
        let expected = pixel_count * layout.bytes_per_pixel();
        if data.len() != expected {
            return Err(CompositeError::InvalidImage(format!(
                "expected {} bytes for {}×{} {:?}, got {}",
                expected, width, height, layout, data.len()
            )));
        }
        let data = match layout {
            ChannelLayout::Bgra => data.to_vec(),
            ChannelLayout::Bgr => {
                let mut out = Vec::with_capacity(pixel_count * CHANNELS);
                for px in data.chunks_exact(3) {
                    out.extend_from_slice(&[px[0], px[1], px[2], 255]);
                }
                out
            }
        };
        Ok(Self { width, height, data })
    }

    /// Take ownership of an already-packed BGRA vector.
    pub fn from_bgra_vec(width: u32, height: u32, data: Vec<u8>) -> CompositeResult<Self> {
        check_dimensions(width, height)?;
        let expected = width as usize * height as usize * CHANNELS;
        if data.len() != expected {
            return Err(CompositeError::InvalidImage(format!(
                "expected {} BGRA bytes for {}×{}, got {}",
                expected, width, height, data.len()
            )));
        }
        Ok(Self { width, height, data })
    }

    /// Import from an `image` crate RGBA buffer (R and B are swapped).
    pub fn from_rgba_image(src: &RgbaImage) -> CompositeResult<Self> {
        check_dimensions(src.width(), src.height())?;
        let mut data = src.as_raw().clone();
        for px in data.chunks_exact_mut(CHANNELS) {
            px.swap(0, 2);
        }
        Ok(Self { width: src.width(), height: src.height(), data })
    }

    /// Export to an `image` crate RGBA buffer.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut raw = self.data.clone();
        for px in raw.chunks_exact_mut(CHANNELS) {
            px.swap(0, 2);
        }
        // Length always matches width*height*4, so from_raw cannot fail here.
        RgbaImage::from_raw(self.width, self.height, raw)
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    // ---- resampling ---------------------------------------------------------

    /// Return a copy resampled to `width × height`.
    pub fn resize_to(&self, width: u32, height: u32, filter: ResampleFilter) -> CompositeResult<Self> {
        check_dimensions(width, height)?;
        if width == self.width && height == self.height {
            return Ok(self.clone());
        }
        // Channel order is irrelevant to the resampler, so the BGRA bytes go
        // through an RgbaImage untouched.
        let src = RgbaImage::from_raw(self.width, self.height, self.data.clone())
            .ok_or_else(|| CompositeError::InvalidImage("corrupt source buffer".into()))?;
        let resized = image::imageops::resize(&src, width, height, filter.filter_type());
        Self::from_bgra_vec(width, height, resized.into_raw())
    }

    // ---- pixel access -------------------------------------------------------

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * CHANNELS
    }

    /// Pixel at (x, y). Panics if out of bounds, like slice indexing.
    #[inline]
    pub fn pixel(&self, x: u32, y: u32) -> Bgra {
        let o = self.offset(x, y);
        [self.data[o], self.data[o + 1], self.data[o + 2], self.data[o + 3]]
    }

    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Bgra) {
        let o = self.offset(x, y);
        self.data[o..o + CHANNELS].copy_from_slice(&pixel);
    }

    #[inline]
    pub fn alpha(&self, x: u32, y: u32) -> u8 {
        self.data[self.offset(x, y) + 3]
    }

    pub fn fill(&mut self, color: Bgra) {
        for px in self.data.chunks_exact_mut(CHANNELS) {
            px.copy_from_slice(&color);
        }
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// True when every alpha sample is zero.
    pub fn is_fully_transparent(&self) -> bool {
        self.data.chunks_exact(CHANNELS).all(|px| px[3] == 0)
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn as_raw_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.data
    }

    pub fn width(&self) -> u32 { self.width }

    pub fn height(&self) -> u32 { self.height }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Bytes of pixel data owned by this buffer.
    pub fn memory_bytes(&self) -> usize {
        self.data.len()
    }
}

fn check_dimensions(width: u32, height: u32) -> CompositeResult<()> {
    if width == 0 || height == 0 {
        return Err(CompositeError::InvalidImage(format!(
            "zero-sized buffer {}×{}",
            width, height
        )));
    }
    if (width as u64) * (height as u64) > MAX_PIXELS {
        return Err(CompositeError::InvalidImage(format!(
            "dimensions {}×{} exceed 256M pixels",
            width, height
        )));
    }
    Ok(())
}
