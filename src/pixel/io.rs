//! Image file reading and writing for pixel buffers.
//!
//! Encoding is delegated to the `image` crate; the format follows the file
//! extension (PNG when there is none).

use std::path::Path;

use image::{DynamicImage, ImageFormat, RgbImage, RgbaImage};

use crate::error::{Result, SdError};

use super::buffer::{ChannelOrder, PixelBuffer};
use super::codec::to_channel_order;

/// JPEG quality used when the output path ends in .jpg/.jpeg.
pub const JPEG_QUALITY: u8 = 90;

/// Writes a pixel buffer to an image file.
///
/// # Example
///
/// ```ignore
/// use sd_bridge::pixel::{save_image, PixelBuffer};
///
/// let buffer = PixelBuffer::rgb(1, 1, vec![255, 0, 0])?;
/// save_image(&buffer, Path::new("/tmp/red.png"))?;
/// ```
pub fn save_image(buffer: &PixelBuffer, path: &Path) -> Result<()> {
    let image = to_dynamic_image(buffer)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    let written = match extension.as_deref() {
        Some("jpg") | Some("jpeg") => {
            let mut output = std::fs::File::create(path).map_err(|e| {
                SdError::image_io(format!("Failed to create {}", path.display()), e)
            })?;
            let encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY);
            // JPEG has no alpha channel.
            DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)
        }
        Some(_) => image.save(path),
        None => image.save_with_format(path, ImageFormat::Png),
    };

    written.map_err(|e| SdError::image_io(format!("Failed to write {}", path.display()), e))
}

/// Reads an image file into an RGB buffer without alpha.
pub fn load_image(path: &Path) -> Result<PixelBuffer> {
    let image = image::open(path)
        .map_err(|e| SdError::image_io(format!("Failed to read {}", path.display()), e))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    PixelBuffer::rgb(width, height, image.into_raw())
}

/// Converts a buffer to an `image` crate image in RGB(A) order.
pub fn to_dynamic_image(buffer: &PixelBuffer) -> Result<DynamicImage> {
    let (width, height) = (buffer.width(), buffer.height());

    if buffer.has_alpha() {
        let mut bytes = buffer.bytes().to_vec();
        if buffer.channel_order() == ChannelOrder::Bgr {
            for px in bytes.chunks_exact_mut(4) {
                px.swap(0, 2);
            }
        }
        return RgbaImage::from_raw(width, height, bytes)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| SdError::invalid_argument("pixel buffer does not match its size"));
    }

    let rgb = to_channel_order(buffer, ChannelOrder::Rgb)?;
    RgbImage::from_raw(width, height, rgb.into_bytes())
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| SdError::invalid_argument("pixel buffer does not match its size"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use tempfile::tempdir;

    #[test]
    fn png_round_trip_preserves_pixels() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.png");

        let buffer = PixelBuffer::rgb(2, 1, vec![255, 0, 0, 0, 0, 255]).unwrap();
        save_image(&buffer, &path).unwrap();

        let loaded = load_image(&path).unwrap();
        assert_eq!(loaded, buffer);
    }

    #[test]
    fn bgr_buffers_are_written_as_rgb() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bgr.png");

        let bgr = PixelBuffer::bgr(1, 1, vec![0, 0, 255]).unwrap();
        save_image(&bgr, &path).unwrap();

        assert_eq!(load_image(&path).unwrap().bytes(), &[255, 0, 0]);
    }

    #[test]
    fn jpeg_output_is_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.jpg");
        let buffer = PixelBuffer::rgb(8, 8, vec![128; 8 * 8 * 3]).unwrap();
        save_image(&buffer, &path).unwrap();
        assert!(path.exists());
        assert_eq!(load_image(&path).unwrap().width(), 8);
    }

    #[test]
    fn missing_file_is_image_io_error() {
        let dir = tempdir().unwrap();
        let err = load_image(&dir.path().join("absent.png")).unwrap_err();
        assert_eq!(err.code, ErrorCode::ImageIo);
    }
}
