//! Bridge configuration.
//!
//! Holds the module loader settings and the settings every new engine
//! context is seeded with. Values come from defaults, a JSON file, or
//! `SD_BRIDGE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::RngKind;
use crate::error::{ErrorCode, Result, SdError};

/// Base name of the engine module, without platform prefix or suffix.
pub const DEFAULT_LIBRARY_NAME: &str = "stable-diffusion";

/// Extraction directories older than this are purged at startup on platforms
/// that lock loaded modules.
pub const DEFAULT_STALE_AFTER_SECS: u64 = 60 * 60;

/// How the loader makes the engine module available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadStrategy {
    /// Try the system search path first, extract the bundled copy on a miss.
    #[default]
    Shared,

    /// Always extract the bundled copy and load it by absolute path.
    Local,
}

impl LoadStrategy {
    /// Returns the string representation of the strategy.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadStrategy::Shared => "shared",
            LoadStrategy::Local => "local",
        }
    }

    /// Parses a strategy from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "shared" | "system" => Some(LoadStrategy::Shared),
            "local" | "bundled" => Some(LoadStrategy::Local),
            _ => None,
        }
    }
}

impl std::fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Native module loader settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Module base name looked up on the system search path.
    pub library_name: String,

    /// Directory holding the bundled `lib/<os>/<arch>/` module tree.
    /// If None, uses the platform-specific default data location.
    pub bundle_dir: Option<PathBuf>,

    /// Parent of the extraction directories.
    /// If None, uses the system temp directory.
    pub temp_root: Option<PathBuf>,

    pub strategy: LoadStrategy,

    /// Minimum age before a leftover extraction directory is purged.
    /// Zero purges every leftover regardless of age.
    pub stale_after_secs: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            library_name: DEFAULT_LIBRARY_NAME.to_string(),
            bundle_dir: None,
            temp_root: None,
            strategy: LoadStrategy::Shared,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
        }
    }
}

impl LoaderConfig {
    /// Returns the effective bundle directory, using platform defaults if not specified.
    pub fn effective_bundle_dir(&self) -> PathBuf {
        self.bundle_dir.clone().unwrap_or_else(default_bundle_dir)
    }

    /// Returns the effective extraction parent directory.
    pub fn effective_temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Settings a new engine context is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads; -1 lets the engine pick from the physical core count.
    pub threads: i32,

    /// Load only the VAE decoder.
    pub vae_decode_only: bool,

    /// Tiny autoencoder weights; empty for none.
    pub taesd_path: String,

    /// ESRGAN upscaler weights; empty for none.
    pub esrgan_path: String,

    /// Release parameter memory after each generation.
    pub free_params_immediately: bool,

    /// Decode the latent in tiles to save memory.
    pub vae_tiling: bool,

    /// Directory searched for LoRA weights; empty for none.
    pub lora_model_dir: String,

    pub rng: RngKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: -1,
            vae_decode_only: false,
            taesd_path: String::new(),
            esrgan_path: String::new(),
            free_params_immediately: false,
            vae_tiling: false,
            lora_model_dir: String::new(),
            rng: RngKind::StdDefault,
        }
    }
}

/// Complete configuration for the bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub loader: LoaderConfig,
    pub engine: EngineConfig,
}

impl BridgeConfig {
    /// Creates a BridgeConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a BridgeConfig from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `SD_BRIDGE_LIBRARY` - Module base name
    /// - `SD_BRIDGE_BUNDLE_DIR` - Bundled module tree
    /// - `SD_BRIDGE_TEMP_DIR` - Parent of extraction directories
    /// - `SD_BRIDGE_LOAD_STRATEGY` - shared or local
    /// - `SD_BRIDGE_THREADS` - Engine thread count (-1 or 1..=256)
    /// - `SD_BRIDGE_RNG` - std_default or cuda
    /// - `SD_BRIDGE_LORA_DIR` - LoRA weights directory
    ///
    /// Falls back to defaults for unset or invalid variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(name) = var("SD_BRIDGE_LIBRARY") {
            if !name.trim().is_empty() {
                config.loader.library_name = name;
            }
        }

        if let Some(path) = var("SD_BRIDGE_BUNDLE_DIR") {
            config.loader.bundle_dir = Some(PathBuf::from(path));
        }

        if let Some(path) = var("SD_BRIDGE_TEMP_DIR") {
            config.loader.temp_root = Some(PathBuf::from(path));
        }

        if let Some(strategy) = var("SD_BRIDGE_LOAD_STRATEGY").and_then(|s| LoadStrategy::parse(&s)) {
            config.loader.strategy = strategy;
        }

        if let Some(threads_str) = var("SD_BRIDGE_THREADS") {
            if let Ok(threads) = threads_str.trim().parse::<i32>() {
                if threads == -1 || (1..=256).contains(&threads) {
                    config.engine.threads = threads;
                }
            }
        }

        if let Some(rng) = var("SD_BRIDGE_RNG").and_then(|s| RngKind::parse(&s)) {
            config.engine.rng = rng;
        }

        if let Some(dir) = var("SD_BRIDGE_LORA_DIR") {
            config.engine.lora_model_dir = dir;
        }

        config
    }

    /// Reads a JSON configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SdError::with_source(
                ErrorCode::InvalidArgument,
                format!("Failed to read config {}", path.display()),
                e,
            )
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            SdError::with_source(
                ErrorCode::InvalidArgument,
                format!("Invalid config {}", path.display()),
                e,
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        let threads = self.engine.threads;
        if threads == 0 || threads < -1 {
            return Err(SdError::invalid_argument(format!(
                "threads must be -1 or positive, got {}",
                threads
            )));
        }
        if threads > 256 {
            return Err(SdError::invalid_argument(format!(
                "threads too high: {} (max 256)",
                threads
            )));
        }
        if self.loader.library_name.trim().is_empty() {
            return Err(SdError::blank_argument("library_name"));
        }
        Ok(())
    }
}

/// Returns the platform-specific default bundle location.
///
/// Uses the `directories` crate to find appropriate locations:
/// - macOS: ~/Library/Application Support/sd-bridge
/// - Linux: ~/.local/share/sd-bridge
/// - Windows: C:\Users\<user>\AppData\Roaming\sd-bridge\data
fn default_bundle_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "sd-bridge") {
        proj_dirs.data_dir().to_path_buf()
    } else {
        // Fallback to current directory
        PathBuf::from("./sd-bridge")
    }
}

/// Returns the platform-specific default model directory used by the CLI.
pub fn default_model_dir() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "sd-bridge") {
        proj_dirs.cache_dir().join("models")
    } else {
        PathBuf::from("./models")
    }
}
