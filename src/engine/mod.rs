//! Native engine call boundary and the owning engine handle.
//!
//! - [`Engine`]: the operations a loaded engine module exposes
//! - [`RawContext`]: a move-only opaque native context pointer
//! - [`EngineHandle`](handle::EngineHandle): safe single-owner wrapper
//! - [`request`]: request records and default substitution
//! - [`params`]: closed integer enums understood by the engine

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

use crate::config::EngineConfig;
use crate::logging::LogLevel;
use crate::pixel::{ChannelOrder, PixelBuffer};

pub mod handle;
pub mod params;
pub mod request;

#[cfg(test)]
pub(crate) mod mock;

// Re-export commonly used types
pub use handle::{EngineHandle, HandleState};
pub use params::{RngKind, SampleMethod, Schedule, WeightType};
pub use request::{GenerationResult, Img2ImgParams, Img2ImgRequest, Txt2ImgParams, Txt2ImgRequest};

/// Channel order of every image crossing the engine boundary.
pub const ENGINE_CHANNEL_ORDER: ChannelOrder = ChannelOrder::Rgb;

/// Opaque pointer to a native engine context.
///
/// Deliberately neither `Clone` nor `Copy`: releasing a context consumes the
/// value, so the same context cannot be released twice.
pub struct RawContext(NonNull<c_void>);

// SAFETY: the engine does not tie contexts to the creating thread; moving a
// context between threads is fine as long as only one owner uses it.
unsafe impl Send for RawContext {}

impl RawContext {
    /// Takes ownership of a context pointer returned by the engine.
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be a live context produced by the engine this value will be
    /// handed back to, and no other owner may release it.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(RawContext)
    }

    /// Returns the pointer for passing across the boundary.
    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Gives up ownership, returning the pointer.
    pub fn into_raw(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

impl fmt::Debug for RawContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawContext({:p})", self.0)
    }
}

/// One image returned by the engine, copied out of native memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<u8>,
}

impl RawImage {
    /// Converts to a pixel buffer in the engine's channel order.
    pub fn into_pixel_buffer(self) -> crate::error::Result<PixelBuffer> {
        let has_alpha = match self.channels {
            3 => false,
            4 => true,
            other => {
                return Err(crate::error::SdError::generation_failed(format!(
                    "engine returned an image with {} channels",
                    other
                )))
            }
        };
        PixelBuffer::new(self.width, self.height, ENGINE_CHANNEL_ORDER, has_alpha, self.data)
            .map_err(|e| crate::error::SdError::generation_failed(e.message))
    }
}

/// Operations exported by a loaded engine module.
///
/// Implementations perform the native calls only; argument validation and
/// state tracking belong to [`EngineHandle`].
pub trait Engine: Send + Sync {
    /// Creates a context seeded with `config`; `None` if construction failed.
    fn new_context(&self, config: &EngineConfig) -> Option<RawContext>;

    /// Releases a context.
    fn free_context(&self, context: RawContext);

    /// Loads model weights into a context; `false` on failure.
    fn load_from_file(
        &self,
        context: &RawContext,
        model_path: &str,
        vae_path: &str,
        weight_type: WeightType,
        schedule: Schedule,
    ) -> bool;

    /// Generates `request.batch_count` images from text; `None` on failure.
    fn txt2img(&self, context: &RawContext, request: &Txt2ImgRequest) -> Option<Vec<RawImage>>;

    /// Generates images from a source image in engine channel order.
    fn img2img(
        &self,
        context: &RawContext,
        source: &PixelBuffer,
        request: &Img2ImgRequest,
    ) -> Option<Vec<RawImage>>;

    /// Sets native log verbosity.
    fn set_log_level(&self, level: LogLevel);

    /// Enables or disables forwarding of native log lines to the process sink.
    fn set_log_callback(&self, enabled: bool);
}

impl fmt::Debug for dyn Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Engine")
    }
}
