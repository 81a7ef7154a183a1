//! Generation request records and default substitution.
//!
//! Callers fill in whatever they care about; `resolve()` substitutes the
//! engine defaults for everything else so the engine never sees unset fields.

use serde::{Deserialize, Serialize};

use crate::pixel::PixelBuffer;

use super::params::SampleMethod;

/// Default output width in pixels.
pub const DEFAULT_WIDTH: u32 = 512;
/// Default output height in pixels.
pub const DEFAULT_HEIGHT: u32 = 512;
/// Default classifier-free guidance scale.
pub const DEFAULT_CFG_SCALE: f32 = 7.0;
/// Default number of sampling steps.
pub const DEFAULT_SAMPLE_STEPS: u32 = 20;
/// Default seed.
pub const DEFAULT_SEED: i64 = 42;
/// Default number of images per text-to-image call.
pub const DEFAULT_BATCH_COUNT: u32 = 1;
/// Default img2img denoising strength.
pub const DEFAULT_STRENGTH: f32 = 0.75;

/// Text-to-image parameters as supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Txt2ImgParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub cfg_scale: Option<f32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_method: Option<SampleMethod>,
    pub sample_steps: Option<u32>,
    pub seed: Option<i64>,
    pub batch_count: Option<u32>,
}

impl Txt2ImgParams {
    /// Creates parameters with only the prompt set.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Sets the output size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Sets the number of images to generate.
    pub fn with_batch_count(mut self, batch_count: u32) -> Self {
        self.batch_count = Some(batch_count);
        self
    }

    /// Sets the seed.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Substitutes defaults for every unset field.
    pub fn resolve(&self) -> Txt2ImgRequest {
        Txt2ImgRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone().unwrap_or_default(),
            cfg_scale: self.cfg_scale.unwrap_or(DEFAULT_CFG_SCALE),
            width: self.width.unwrap_or(DEFAULT_WIDTH),
            height: self.height.unwrap_or(DEFAULT_HEIGHT),
            sample_method: self.sample_method.unwrap_or_default(),
            sample_steps: self.sample_steps.unwrap_or(DEFAULT_SAMPLE_STEPS),
            seed: self.seed.unwrap_or(DEFAULT_SEED),
            batch_count: self.batch_count.unwrap_or(DEFAULT_BATCH_COUNT),
        }
    }
}

/// Fully defaulted text-to-image request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Txt2ImgRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub sample_method: SampleMethod,
    pub sample_steps: u32,
    pub seed: i64,
    pub batch_count: u32,
}

impl Default for Txt2ImgRequest {
    fn default() -> Self {
        Txt2ImgParams::default().resolve()
    }
}

/// Image-to-image parameters as supplied by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Img2ImgParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub cfg_scale: Option<f32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sample_method: Option<SampleMethod>,
    pub sample_steps: Option<u32>,
    pub strength: Option<f32>,
    pub seed: Option<i64>,
}

impl Img2ImgParams {
    /// Creates parameters with only the prompt set.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Substitutes defaults for every unset field.
    ///
    /// The output size defaults to the source image size when one is given,
    /// and to 512x512 otherwise.
    pub fn resolve(&self, source: Option<&PixelBuffer>) -> Img2ImgRequest {
        Img2ImgRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone().unwrap_or_default(),
            cfg_scale: self.cfg_scale.unwrap_or(DEFAULT_CFG_SCALE),
            width: self
                .width
                .or_else(|| source.map(|s| s.width()))
                .unwrap_or(DEFAULT_WIDTH),
            height: self
                .height
                .or_else(|| source.map(|s| s.height()))
                .unwrap_or(DEFAULT_HEIGHT),
            sample_method: self.sample_method.unwrap_or_default(),
            sample_steps: self.sample_steps.unwrap_or(DEFAULT_SAMPLE_STEPS),
            strength: self.strength.unwrap_or(DEFAULT_STRENGTH),
            seed: self.seed.unwrap_or(DEFAULT_SEED),
        }
    }
}

/// Fully defaulted image-to-image request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Img2ImgRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub sample_method: SampleMethod,
    pub sample_steps: u32,
    pub strength: f32,
    pub seed: i64,
}

impl Default for Img2ImgRequest {
    fn default() -> Self {
        Img2ImgParams::default().resolve(None)
    }
}

/// Generated images together with the request that produced them.
#[derive(Debug, Clone)]
pub struct GenerationResult<P> {
    pub params: P,
    pub images: Vec<PixelBuffer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txt2img_defaults() {
        let req = Txt2ImgParams::new("a lovely cat").resolve();
        assert_eq!(req.prompt, "a lovely cat");
        assert_eq!(req.negative_prompt, "");
        assert_eq!(req.cfg_scale, 7.0);
        assert_eq!((req.width, req.height), (512, 512));
        assert_eq!(req.sample_method, SampleMethod::EulerA);
        assert_eq!(req.sample_steps, 20);
        assert_eq!(req.seed, 42);
        assert_eq!(req.batch_count, 1);
    }

    #[test]
    fn txt2img_overrides_survive() {
        let req = Txt2ImgParams::new("x")
            .with_size(768, 640)
            .with_batch_count(3)
            .with_seed(-1)
            .resolve();
        assert_eq!((req.width, req.height), (768, 640));
        assert_eq!(req.batch_count, 3);
        assert_eq!(req.seed, -1);
    }

    #[test]
    fn img2img_size_follows_source() {
        let source = PixelBuffer::rgb(64, 32, vec![0; 64 * 32 * 3]).unwrap();
        let req = Img2ImgParams::new("x").resolve(Some(&source));
        assert_eq!((req.width, req.height), (64, 32));
        assert_eq!(req.strength, 0.75);

        let req = Img2ImgParams::new("x").resolve(None);
        assert_eq!((req.width, req.height), (512, 512));
    }
}
