//! CLI argument parser for the standalone generator.
//!
//! Runs text-to-image by default and image-to-image when `--init-img` is
//! given.

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::config::{default_model_dir, EngineConfig};
use crate::engine::{Img2ImgParams, RngKind, SampleMethod, Schedule, Txt2ImgParams, WeightType};

/// Default output file when `--output` is not given.
pub const DEFAULT_OUTPUT: &str = "output.png";

/// sd-bridge: stable diffusion image generation through the native engine
#[derive(Parser, Debug)]
#[command(name = "sd-bridge")]
#[command(about = "Generate images with the stable-diffusion native engine")]
#[command(version)]
pub struct Cli {
    /// Text prompt describing the image
    #[arg(short, long)]
    pub prompt: String,

    /// What the image should not contain
    #[arg(short, long)]
    pub negative_prompt: Option<String>,

    /// Model weights (.ckpt, .safetensors or .gguf); bare names are looked
    /// up in the default model directory
    #[arg(short, long)]
    pub model: PathBuf,

    /// Standalone VAE weights
    #[arg(long)]
    pub vae: Option<PathBuf>,

    /// Tiny autoencoder weights for fast decoding
    #[arg(long)]
    pub taesd: Option<PathBuf>,

    /// Directory containing LoRA weights
    #[arg(long)]
    pub lora_model_dir: Option<PathBuf>,

    /// Weight precision to convert to (f32, f16, q4_0, q8_0, ...)
    #[arg(long)]
    pub weight_type: Option<WeightType>,

    /// Denoiser sigma schedule (default, discrete, karras)
    #[arg(long)]
    pub schedule: Option<Schedule>,

    /// Source image for image-to-image generation
    #[arg(short, long)]
    pub init_img: Option<PathBuf>,

    /// Noise strength for image-to-image (0.0 keeps the source, 1.0 replaces it)
    #[arg(long, value_parser = parse_strength)]
    pub strength: Option<f32>,

    /// Classifier-free guidance scale
    #[arg(long)]
    pub cfg_scale: Option<f32>,

    /// Output width in pixels
    #[arg(short = 'W', long)]
    pub width: Option<u32>,

    /// Output height in pixels
    #[arg(short = 'H', long)]
    pub height: Option<u32>,

    /// Sampling method (euler_a, euler, heun, dpm2, dpm++2s_a, dpm++2m, dpm++2mv2, lcm)
    #[arg(long)]
    pub sampling_method: Option<SampleMethod>,

    /// Number of sampling steps
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub steps: Option<u32>,

    /// Random seed; negative values pick a random seed
    #[arg(short, long, allow_negative_numbers = true)]
    pub seed: Option<i64>,

    /// Number of images to generate (text-to-image only)
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub batch_count: Option<u32>,

    /// Engine worker threads; -1 uses the physical core count
    #[arg(short, long, allow_negative_numbers = true)]
    pub threads: Option<i32>,

    /// Random number generator for the initial noise
    #[arg(long)]
    pub rng: Option<RngKind>,

    /// Decode the latent in tiles to reduce memory use
    #[arg(long)]
    pub vae_tiling: bool,

    /// Output image path; the format follows the extension
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log debug output, including native engine messages
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_strength(s: &str) -> Result<f32, String> {
    let value: f32 = s.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("strength must be within 0.0..=1.0, got {}", value))
    }
}

impl Cli {
    /// Parses command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Returns the effective model path.
    ///
    /// A relative path that does not exist is resolved against the default
    /// model directory.
    pub fn model_path(&self) -> PathBuf {
        resolve_model_path(&self.model, &default_model_dir())
    }

    /// Returns the effective output path.
    ///
    /// Defaults to "output.png" in the current directory if not specified.
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT))
    }

    /// Returns one output path per generated image.
    pub fn output_paths(&self, count: usize) -> Vec<PathBuf> {
        numbered_paths(&self.output_path(), count)
    }

    /// Applies the engine flags given on the command line over `base`.
    pub fn engine_config(&self, base: &EngineConfig) -> EngineConfig {
        let mut config = base.clone();
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(rng) = self.rng {
            config.rng = rng;
        }
        if let Some(ref taesd) = self.taesd {
            config.taesd_path = taesd.display().to_string();
        }
        if let Some(ref dir) = self.lora_model_dir {
            config.lora_model_dir = dir.display().to_string();
        }
        if self.vae_tiling {
            config.vae_tiling = true;
        }
        config
    }

    /// Builds text-to-image parameters from the arguments.
    pub fn txt2img_params(&self) -> Txt2ImgParams {
        Txt2ImgParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            cfg_scale: self.cfg_scale,
            width: self.width,
            height: self.height,
            sample_method: self.sampling_method,
            sample_steps: self.steps,
            seed: self.seed,
            batch_count: self.batch_count,
        }
    }

    /// Builds image-to-image parameters from the arguments.
    pub fn img2img_params(&self) -> Img2ImgParams {
        Img2ImgParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            cfg_scale: self.cfg_scale,
            width: self.width,
            height: self.height,
            sample_method: self.sampling_method,
            sample_steps: self.steps,
            strength: self.strength,
            seed: self.seed,
        }
    }
}

fn resolve_model_path(model: &Path, model_dir: &Path) -> PathBuf {
    if model.is_relative() && !model.exists() {
        model_dir.join(model)
    } else {
        model.to_path_buf()
    }
}

/// `out.png` stays as is for one image and becomes `out-0.png`, `out-1.png`,
/// ... for several.
fn numbered_paths(base: &Path, count: usize) -> Vec<PathBuf> {
    if count <= 1 {
        return vec![base.to_path_buf()];
    }
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let extension = base.extension().map(|e| e.to_string_lossy().into_owned());
    (0..count)
        .map(|index| {
            let name = match &extension {
                Some(ext) => format!("{}-{}.{}", stem, index, ext),
                None => format!("{}-{}", stem, index),
            };
            base.with_file_name(name)
        })
        .collect()
}
