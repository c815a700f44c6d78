//! Decoded frames.
//!
//! - `Frame`: owned RGB8 image handed from a `FrameSource` to a pipeline.
//!
//! Frames live for a single pipeline iteration. The only way pixels leave the
//! process is as a JPEG snapshot attached to an alert.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::Region;

/// Colour of the diagnostic overlay drawn around detected regions.
pub const OVERLAY_COLOR: [u8; 3] = [0, 255, 0];

/// JPEG quality used for alert snapshots.
pub const SNAPSHOT_JPEG_QUALITY: u8 = 80;

/// Owned RGB frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    /// Wrap a packed RGB8 buffer. The length must be exactly `width * height * 3`.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| anyhow!("frame size {}x{} overflows", width, height))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "pixel buffer is {} bytes, {}x{} RGB8 needs {}",
                pixels.len(),
                width,
                height,
                expected
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{} RGB8", width, height))?;
        Ok(Self { image })
    }

    /// A zero-sized frame, as produced by a source that decoded nothing.
    pub fn empty() -> Self {
        Self {
            image: RgbImage::new(0, 0),
        }
    }

    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, Rgb(rgb)),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Packed RGB8 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0 || self.image.as_raw().is_empty()
    }

    /// Paint a solid block. Used by synthetic sources to stage a scene.
    pub fn fill_region(&mut self, region: &Region, rgb: [u8; 3]) {
        if let Some(rect) = to_rect(region) {
            draw_filled_rect_mut(&mut self.image, rect, Rgb(rgb));
        }
    }

    /// Draw the diagnostic overlay around a detected region.
    pub fn annotate(&mut self, region: &Region) {
        if let Some(rect) = to_rect(region) {
            draw_hollow_rect_mut(&mut self.image, rect, Rgb(OVERLAY_COLOR));
        }
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        if self.is_empty() {
            return Err(anyhow!("cannot encode an empty frame"));
        }
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, quality)
            .encode(
                self.image.as_raw(),
                self.image.width(),
                self.image.height(),
                ExtendedColorType::Rgb8,
            )
            .context("encode frame as JPEG")?;
        Ok(buf)
    }

    #[cfg(test)]
    pub(crate) fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        self.image.get_pixel_checked(x, y).map(|p| p.0)
    }
}

fn to_rect(region: &Region) -> Option<Rect> {
    if region.width <= 0 || region.height <= 0 {
        return None;
    }
    Some(Rect::at(region.x, region.y).of_size(region.width as u32, region.height as u32))
}
