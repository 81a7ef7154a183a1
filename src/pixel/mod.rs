//! Pixel buffers and the pixel codec.
//!
//! - [`PixelBuffer`](buffer::PixelBuffer): packed row-major 3/4-channel bytes
//! - [`codec`]: channel reversal and grid conversion
//! - [`io`]: image file encoding through the `image` crate

pub mod buffer;
pub mod codec;
pub mod io;

// Re-export commonly used items
pub use buffer::{ChannelOrder, PixelBuffer};
pub use codec::{
    from_pixel_grid, reverse_channel_order, to_channel_order, to_pixel_grid, GridLayout,
    PixelGrid,
};
pub use io::{load_image, save_image};
