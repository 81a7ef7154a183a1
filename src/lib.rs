//! sd-bridge: native bridge to the stable-diffusion inference engine.
//!
//! This library loads the platform's engine module once per process, wraps
//! engine contexts in owning handles, and converts between packed pixel
//! buffers and images.
//!
//! # Modules
//!
//! - [`native`]: platform resolution, bundled module extraction and loading
//! - [`engine`]: the engine call boundary, [`EngineHandle`] and request records
//! - [`pixel`]: pixel buffers, channel order conversion and image files
//! - [`logging`]: forwarding of native log lines
//! - [`config`]: loader and engine configuration
//! - [`error`]: error types and codes ([`SdError`], [`ErrorCode`])
//!
//! # Example
//!
//! ```rust,ignore
//! use sd_bridge::{
//!     config::EngineConfig,
//!     engine::{EngineHandle, Txt2ImgParams},
//!     native,
//! };
//!
//! let engine = native::ensure_loaded()?;
//! let mut handle = EngineHandle::create(engine, &EngineConfig::default())?;
//! handle.load_weights("/models/sd-v1-4.ckpt", None, None, None)?;
//!
//! let result = handle.txt2img(&Txt2ImgParams::new("a lovely cat"))?;
//! assert_eq!(result.images.len(), 1);
//! ```

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod native;
pub mod pixel;

// Re-export commonly used types at crate root for convenience
pub use config::{BridgeConfig, EngineConfig, LoaderConfig};
pub use engine::{EngineHandle, HandleState};
pub use error::{ErrorCode, Result, SdError};
pub use pixel::{ChannelOrder, PixelBuffer};
