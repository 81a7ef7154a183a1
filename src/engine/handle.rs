//! Single-owner handle around a native engine context.
//!
//! An [`EngineHandle`] is either `Ready` (it owns a live context) or `Closed`.
//! Closing releases the context exactly once; every later operation except
//! `close` fails with `HANDLE_CLOSED` without reaching the engine. Dropping a
//! handle closes it, so the context is released on every exit path.
//!
//! Handles are `Send` but not `Sync`, and every engine call takes `&mut self`:
//! concurrent use of one handle is ruled out by the borrow checker rather than
//! by an internal lock.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::{ModelLoadAttempt, Result, SdError};
use crate::pixel::{to_channel_order, PixelBuffer};

use super::params::{Schedule, WeightType};
use super::request::{GenerationResult, Img2ImgParams, Img2ImgRequest, Txt2ImgParams, Txt2ImgRequest};
use super::{Engine, RawContext, RawImage, ENGINE_CHANNEL_ORDER};

/// Lifecycle state of an engine handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Owns a live native context.
    Ready,
    /// The context was released; terminal.
    Closed,
}

/// Owner of one native engine context.
pub struct EngineHandle {
    engine: Arc<dyn Engine>,
    context: Option<RawContext>,
}

impl EngineHandle {
    /// Creates a new context on a loaded engine.
    ///
    /// Fails with `ENGINE_INIT_FAILED` instead of returning a handle without a
    /// valid context.
    pub fn create(engine: Arc<dyn Engine>, config: &EngineConfig) -> Result<Self> {
        let context = engine.new_context(config).ok_or_else(|| {
            SdError::engine_init_failed(format!(
                "engine returned a null context (threads: {}, rng: {})",
                config.threads, config.rng
            ))
        })?;
        tracing::debug!(?context, "engine context created");
        Ok(Self {
            engine,
            context: Some(context),
        })
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> HandleState {
        if self.context.is_some() {
            HandleState::Ready
        } else {
            HandleState::Closed
        }
    }

    /// Returns true once the handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.context.is_none()
    }

    /// Returns the live context or a `HANDLE_CLOSED` error naming `operation`.
    fn context(&self, operation: &str) -> Result<&RawContext> {
        self.context
            .as_ref()
            .ok_or_else(|| SdError::handle_closed(operation))
    }

    /// Loads model weights (.ckpt, .safetensors or .gguf).
    ///
    /// `vae_path`, `weight_type` and `schedule` default to "", the file's own
    /// precision and the model's default schedule. A `false` answer from the
    /// engine becomes `MODEL_LOAD_FAILED` carrying the attempted parameters;
    /// the handle stays `Ready` so the caller may retry.
    pub fn load_weights(
        &mut self,
        model_path: &str,
        vae_path: Option<&str>,
        weight_type: Option<WeightType>,
        schedule: Option<Schedule>,
    ) -> Result<()> {
        let context = self.context("load_weights")?;
        if model_path.trim().is_empty() {
            return Err(SdError::blank_argument("model_path"));
        }

        let vae_path = vae_path.unwrap_or("");
        let weight_type = weight_type.unwrap_or_default();
        let schedule = schedule.unwrap_or_default();

        tracing::info!(model_path, vae_path, "loading model weights");
        let loaded = self
            .engine
            .load_from_file(context, model_path, vae_path, weight_type, schedule);

        if loaded {
            Ok(())
        } else {
            Err(SdError::model_load_failed(ModelLoadAttempt {
                model_path: model_path.to_string(),
                vae_path: vae_path.to_string(),
                weight_type: weight_type.code(),
                schedule: schedule.code(),
            }))
        }
    }

    /// Generates images from a fully defaulted text request.
    ///
    /// Returns one buffer per batch member in the engine's channel order.
    pub fn generate_from_text(&mut self, request: &Txt2ImgRequest) -> Result<Vec<PixelBuffer>> {
        let context = self.context("generate_from_text")?;
        if request.prompt.trim().is_empty() {
            return Err(SdError::blank_argument("prompt"));
        }
        check_size(request.width, request.height)?;
        if request.batch_count == 0 {
            return Err(SdError::invalid_argument("batch_count must be at least 1"));
        }
        check_native_int("batch_count", request.batch_count)?;
        check_native_int("sample_steps", request.sample_steps)?;

        tracing::info!(
            width = request.width,
            height = request.height,
            steps = request.sample_steps,
            seed = request.seed,
            batch = request.batch_count,
            "txt2img"
        );
        let images = self
            .engine
            .txt2img(context, request)
            .ok_or_else(|| SdError::generation_failed("txt2img returned no images"))?;

        collect_images(images, request.batch_count as usize)
    }

    /// Generates images from a source image and a fully defaulted request.
    ///
    /// `source` must already be in the engine's channel order without alpha;
    /// use [`to_channel_order`] or [`EngineHandle::img2img`] to convert.
    pub fn generate_from_image(
        &mut self,
        source: &PixelBuffer,
        request: &Img2ImgRequest,
    ) -> Result<Vec<PixelBuffer>> {
        let context = self.context("generate_from_image")?;
        if request.prompt.trim().is_empty() {
            return Err(SdError::blank_argument("prompt"));
        }
        check_size(request.width, request.height)?;
        check_native_int("sample_steps", request.sample_steps)?;
        if source.is_empty() {
            return Err(SdError::invalid_argument("source image is empty"));
        }
        if source.has_alpha() || source.channel_order() != ENGINE_CHANNEL_ORDER {
            return Err(SdError::invalid_argument(format!(
                "source image must be 3-channel {}, got {}{}",
                ENGINE_CHANNEL_ORDER,
                source.channel_order(),
                if source.has_alpha() { " with alpha" } else { "" }
            )));
        }

        tracing::info!(
            width = request.width,
            height = request.height,
            strength = request.strength,
            seed = request.seed,
            "img2img"
        );
        let images = self
            .engine
            .img2img(context, source, request)
            .ok_or_else(|| SdError::generation_failed("img2img returned no images"))?;

        collect_images(images, 1)
    }

    /// Applies defaults, generates, and returns images with the used parameters.
    pub fn txt2img(&mut self, params: &Txt2ImgParams) -> Result<GenerationResult<Txt2ImgRequest>> {
        let request = params.resolve();
        let images = self.generate_from_text(&request)?;
        Ok(GenerationResult {
            params: request,
            images,
        })
    }

    /// Converts `source` to engine order, applies defaults and generates.
    pub fn img2img(
        &mut self,
        source: &PixelBuffer,
        params: &Img2ImgParams,
    ) -> Result<GenerationResult<Img2ImgRequest>> {
        self.context("img2img")?;
        let source = to_channel_order(source, ENGINE_CHANNEL_ORDER)?;
        let request = params.resolve(Some(&source));
        let images = self.generate_from_image(&source, &request)?;
        Ok(GenerationResult {
            params: request,
            images,
        })
    }

    /// Releases the native context. Later calls are no-ops.
    pub fn close(&mut self) {
        if let Some(context) = self.context.take() {
            tracing::debug!(?context, "releasing engine context");
            self.engine.free_context(context);
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("state", &self.state())
            .field("context", &self.context)
            .finish()
    }
}

/// Largest size or count the engine takes (a C `int`).
const MAX_NATIVE_INT: u32 = i32::MAX as u32;

fn check_size(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(SdError::invalid_argument(format!(
            "image size must be positive, got {}x{}",
            width, height
        )));
    }
    check_native_int("width", width)?;
    check_native_int("height", height)
}

fn check_native_int(name: &str, value: u32) -> Result<()> {
    if value > MAX_NATIVE_INT {
        return Err(SdError::invalid_argument(format!(
            "{} must be at most {}, got {}",
            name, MAX_NATIVE_INT, value
        )));
    }
    Ok(())
}

fn collect_images(images: Vec<RawImage>, expected: usize) -> Result<Vec<PixelBuffer>> {
    if images.len() != expected {
        return Err(SdError::generation_failed(format!(
            "expected {} images, engine returned {}",
            expected,
            images.len()
        )));
    }
    images.into_iter().map(RawImage::into_pixel_buffer).collect()
}
