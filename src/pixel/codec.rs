//! Conversion between packed buffers, channel orders and pixel grids.
//!
//! All functions here are pure: they never touch the engine and never mutate
//! their input.

use image::{RgbImage, RgbaImage};

use crate::error::{Result, SdError};

use super::buffer::{ChannelOrder, PixelBuffer};

/// Swaps channel positions 0 and 2 of every 3-byte pixel group.
fn swap_outer_channels(bytes: &mut [u8]) {
    for px in bytes.chunks_exact_mut(3) {
        px.swap(0, 2);
    }
}

/// Reverses the channel order of a buffer without alpha (RGB <-> BGR).
///
/// The middle channel is untouched; applying this twice yields the original.
pub fn reverse_channel_order(buffer: &PixelBuffer) -> Result<PixelBuffer> {
    if buffer.has_alpha() {
        return Err(SdError::invalid_argument(
            "channel reversal is only defined for 3-channel buffers",
        ));
    }
    let mut bytes = buffer.bytes().to_vec();
    swap_outer_channels(&mut bytes);
    Ok(buffer.with_bytes(buffer.channel_order().reversed(), bytes))
}

/// Returns `buffer` in the requested channel order, reversing only if needed.
pub fn to_channel_order(buffer: &PixelBuffer, order: ChannelOrder) -> Result<PixelBuffer> {
    if buffer.channel_order() == order {
        Ok(buffer.clone())
    } else {
        reverse_channel_order(buffer)
    }
}

/// Interleaved sample layout of a [`PixelGrid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GridLayout {
    Rgb,
    Bgr,
    /// Red, green, blue, then alpha.
    Rgba,
    /// Alpha first, then blue, green, red.
    Abgr,
}

impl GridLayout {
    /// Bytes per pixel.
    pub fn stride(&self) -> usize {
        match self {
            GridLayout::Rgb | GridLayout::Bgr => 3,
            GridLayout::Rgba | GridLayout::Abgr => 4,
        }
    }

    /// Offsets of red, green and blue inside one pixel.
    fn color_offsets(&self) -> (usize, usize, usize) {
        match self {
            GridLayout::Rgb | GridLayout::Rgba => (0, 1, 2),
            GridLayout::Bgr => (2, 1, 0),
            // Alpha leads, so every color starts one byte later.
            GridLayout::Abgr => (3, 2, 1),
        }
    }

    /// Offset of the alpha sample, if the layout carries one.
    fn alpha_offset(&self) -> Option<usize> {
        match self {
            GridLayout::Rgba => Some(3),
            GridLayout::Abgr => Some(0),
            GridLayout::Rgb | GridLayout::Bgr => None,
        }
    }
}

/// A width x height grid of pixels in some interleaved layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGrid {
    width: u32,
    height: u32,
    layout: GridLayout,
    samples: Vec<u8>,
}

impl PixelGrid {
    /// Creates a grid, validating that `samples` covers every pixel exactly.
    pub fn new(width: u32, height: u32, layout: GridLayout, samples: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * layout.stride();
        if samples.len() != expected {
            return Err(SdError::invalid_argument(format!(
                "{:?} grid of {}x{} needs {} samples, got {}",
                layout,
                width,
                height,
                expected,
                samples.len()
            )));
        }
        Ok(Self {
            width,
            height,
            layout,
            samples,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn layout(&self) -> GridLayout {
        self.layout
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    /// Returns pixel `(x, y)` as `[r, g, b, a]`; layouts without alpha are opaque.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let stride = self.layout.stride();
        let base = (y as usize * self.width as usize + x as usize) * stride;
        let px = &self.samples[base..base + stride];
        let (r, g, b) = self.layout.color_offsets();
        let a = self.layout.alpha_offset().map_or(0xFF, |i| px[i]);
        Some([px[r], px[g], px[b], a])
    }

    /// Converts the grid into an RGBA image.
    pub fn to_rgba_image(&self) -> RgbaImage {
        RgbaImage::from_fn(self.width, self.height, |x, y| {
            // Coordinates come from the image's own bounds.
            image::Rgba(self.pixel(x, y).unwrap_or([0, 0, 0, 0xFF]))
        })
    }
}

impl From<RgbaImage> for PixelGrid {
    fn from(image: RgbaImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            layout: GridLayout::Rgba,
            samples: image.into_raw(),
        }
    }
}

impl From<RgbImage> for PixelGrid {
    fn from(image: RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            layout: GridLayout::Rgb,
            samples: image.into_raw(),
        }
    }
}

/// Interprets a packed buffer as a grid of opaque RGBA pixels.
///
/// Pixel `(x, y)` reads its color bytes from offset `stride * (y * width + x)`;
/// the middle byte is always green, and the outer bytes follow the buffer's
/// declared channel order. Any alpha byte in the buffer is ignored.
pub fn to_pixel_grid(buffer: &PixelBuffer) -> PixelGrid {
    let stride = buffer.channels();
    let (r, b) = match buffer.channel_order() {
        ChannelOrder::Rgb => (0, 2),
        ChannelOrder::Bgr => (2, 0),
    };

    let mut samples = Vec::with_capacity(buffer.width() as usize * buffer.height() as usize * 4);
    for px in buffer.bytes().chunks_exact(stride) {
        samples.extend_from_slice(&[px[r], px[1], px[b], 0xFF]);
    }

    PixelGrid {
        width: buffer.width(),
        height: buffer.height(),
        layout: GridLayout::Rgba,
        samples,
    }
}

/// Packs a grid into a BGR buffer without alpha, dropping any alpha samples.
pub fn from_pixel_grid(grid: &PixelGrid) -> PixelBuffer {
    let stride = grid.layout.stride();
    let (r, g, b) = grid.layout.color_offsets();

    let mut bytes = Vec::with_capacity(grid.width as usize * grid.height as usize * 3);
    for px in grid.samples.chunks_exact(stride) {
        bytes.extend_from_slice(&[px[b], px[g], px[r]]);
    }

    PixelBuffer::from_parts(grid.width, grid.height, ChannelOrder::Bgr, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn three_channel_buffer() -> impl Strategy<Value = PixelBuffer> {
        (1u32..12, 1u32..12, any::<bool>()).prop_flat_map(|(w, h, bgr)| {
            proptest::collection::vec(any::<u8>(), (w * h * 3) as usize).prop_map(move |bytes| {
                let order = if bgr { ChannelOrder::Bgr } else { ChannelOrder::Rgb };
                PixelBuffer::new(w, h, order, false, bytes).unwrap()
            })
        })
    }

    proptest! {
        #[test]
        fn reversal_is_an_involution(buf in three_channel_buffer()) {
            let twice = reverse_channel_order(&reverse_channel_order(&buf).unwrap()).unwrap();
            prop_assert_eq!(twice, buf);
        }

        #[test]
        fn bgr_grid_round_trip(buf in three_channel_buffer()) {
            let bgr = to_channel_order(&buf, ChannelOrder::Bgr).unwrap();
            let back = from_pixel_grid(&to_pixel_grid(&bgr));
            prop_assert_eq!(back, bgr);
        }
    }

    #[test]
    fn reversal_swaps_outer_channels_only() {
        let buf = PixelBuffer::rgb(2, 1, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let rev = reverse_channel_order(&buf).unwrap();
        assert_eq!(rev.bytes(), &[3, 2, 1, 6, 5, 4]);
        assert_eq!(rev.channel_order(), ChannelOrder::Bgr);
    }

    #[test]
    fn reversal_rejects_alpha() {
        let buf = PixelBuffer::new(1, 1, ChannelOrder::Rgb, true, vec![1, 2, 3, 4]).unwrap();
        assert!(reverse_channel_order(&buf).is_err());
    }

    #[test]
    fn grid_maps_declared_order() {
        let bgr = PixelBuffer::bgr(2, 1, vec![10, 20, 30, 40, 50, 60]).unwrap();
        let grid = to_pixel_grid(&bgr);
        assert_eq!(grid.pixel(0, 0), Some([30, 20, 10, 0xFF]));
        assert_eq!(grid.pixel(1, 0), Some([60, 50, 40, 0xFF]));
        assert_eq!(grid.pixel(2, 0), None);

        let rgb = PixelBuffer::rgb(1, 1, vec![10, 20, 30]).unwrap();
        assert_eq!(to_pixel_grid(&rgb).pixel(0, 0), Some([10, 20, 30, 0xFF]));
    }

    #[test]
    fn grid_is_row_major() {
        // 2x2: pixel (x, y) starts at 3 * (y * 2 + x)
        let bytes: Vec<u8> = (0..12).collect();
        let grid = to_pixel_grid(&PixelBuffer::rgb(2, 2, bytes).unwrap());
        assert_eq!(grid.pixel(0, 1), Some([6, 7, 8, 0xFF]));
        assert_eq!(grid.pixel(1, 1), Some([9, 10, 11, 0xFF]));
    }

    #[test]
    fn alpha_first_grid_drops_leading_alpha() {
        // ABGR: a, b, g, r
        let grid = PixelGrid::new(1, 2, GridLayout::Abgr, vec![0x80, 1, 2, 3, 0x40, 4, 5, 6]).unwrap();
        let buf = from_pixel_grid(&grid);
        assert!(!buf.has_alpha());
        assert_eq!(buf.channel_order(), ChannelOrder::Bgr);
        assert_eq!(buf.bytes(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(grid.pixel(0, 0), Some([3, 2, 1, 0x80]));
    }

    #[test]
    fn rgba_image_round_trip_through_grid() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, image::Rgba([1, 2, 3, 4]));
        img.put_pixel(1, 0, image::Rgba([5, 6, 7, 8]));
        let grid = PixelGrid::from(img.clone());
        assert_eq!(grid.to_rgba_image(), img);
        assert_eq!(from_pixel_grid(&grid).bytes(), &[3, 2, 1, 7, 6, 5]);
    }

    #[test]
    fn grid_length_validated() {
        assert!(PixelGrid::new(2, 2, GridLayout::Rgba, vec![0; 15]).is_err());
        assert!(PixelGrid::new(2, 2, GridLayout::Bgr, vec![0; 12]).is_ok());
    }
}
