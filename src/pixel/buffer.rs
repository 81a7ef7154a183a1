//! Packed interleaved pixel buffers.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};

/// Byte order of the color channels inside one pixel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl ChannelOrder {
    /// Returns the opposite channel order.
    pub fn reversed(&self) -> Self {
        match self {
            ChannelOrder::Rgb => ChannelOrder::Bgr,
            ChannelOrder::Bgr => ChannelOrder::Rgb,
        }
    }

    /// Returns the string representation of the order.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOrder::Rgb => "rgb",
            ChannelOrder::Bgr => "bgr",
        }
    }
}

impl std::fmt::Display for ChannelOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Row-major pixel bytes without row padding.
///
/// Invariant: `bytes.len() == width * height * (3 or 4 with alpha)`. The alpha
/// byte, when present, trails the three color bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    channel_order: ChannelOrder,
    has_alpha: bool,
    bytes: Vec<u8>,
}

impl PixelBuffer {
    /// Creates a buffer, validating the length invariant.
    pub fn new(
        width: u32,
        height: u32,
        channel_order: ChannelOrder,
        has_alpha: bool,
        bytes: Vec<u8>,
    ) -> Result<Self> {
        let channels = if has_alpha { 4 } else { 3 };
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(channels))
            .ok_or_else(|| {
                SdError::invalid_argument(format!("image size {}x{} overflows", width, height))
            })?;
        if bytes.len() != expected {
            return Err(SdError::invalid_argument(format!(
                "pixel buffer of {}x{}x{} needs {} bytes, got {}",
                width,
                height,
                channels,
                expected,
                bytes.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channel_order,
            has_alpha,
            bytes,
        })
    }

    /// Creates a three-channel buffer without alpha.
    pub fn rgb(width: u32, height: u32, bytes: Vec<u8>) -> Result<Self> {
        Self::new(width, height, ChannelOrder::Rgb, false, bytes)
    }

    /// Creates a three-channel BGR buffer without alpha.
    pub fn bgr(width: u32, height: u32, bytes: Vec<u8>) -> Result<Self> {
        Self::new(width, height, ChannelOrder::Bgr, false, bytes)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.channel_order
    }

    pub fn has_alpha(&self) -> bool {
        self.has_alpha
    }

    /// Bytes per pixel (3, or 4 with alpha).
    pub fn channels(&self) -> usize {
        if self.has_alpha {
            4
        } else {
            3
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns true for a zero-sized image.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consumes the buffer, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Builds a 3-channel buffer whose length the caller already guarantees.
    pub(crate) fn from_parts(
        width: u32,
        height: u32,
        channel_order: ChannelOrder,
        bytes: Vec<u8>,
    ) -> Self {
        debug_assert_eq!(bytes.len(), width as usize * height as usize * 3);
        Self {
            width,
            height,
            channel_order,
            has_alpha: false,
            bytes,
        }
    }

    /// Same dimensions and alpha with replaced bytes and order.
    pub(crate) fn with_bytes(&self, channel_order: ChannelOrder, bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len(), self.bytes.len());
        Self {
            width: self.width,
            height: self.height,
            channel_order,
            has_alpha: self.has_alpha,
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn length_invariant_enforced() {
        assert!(PixelBuffer::rgb(2, 2, vec![0; 12]).is_ok());
        assert!(PixelBuffer::new(2, 2, ChannelOrder::Bgr, true, vec![0; 16]).is_ok());

        let err = PixelBuffer::rgb(2, 2, vec![0; 11]).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        assert!(PixelBuffer::new(2, 2, ChannelOrder::Rgb, true, vec![0; 12]).is_err());
    }

    #[test]
    fn accessors() {
        let buf = PixelBuffer::bgr(3, 1, vec![1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(buf.width(), 3);
        assert_eq!(buf.height(), 1);
        assert_eq!(buf.channels(), 3);
        assert_eq!(buf.channel_order(), ChannelOrder::Bgr);
        assert_eq!(buf.len(), 9);
        assert!(!buf.is_empty());
    }

    #[test]
    fn channel_order_reversal() {
        assert_eq!(ChannelOrder::Rgb.reversed(), ChannelOrder::Bgr);
        assert_eq!(ChannelOrder::Bgr.reversed().reversed(), ChannelOrder::Bgr);
    }
}
