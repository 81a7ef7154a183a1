//! sd-bridge: generate images with the stable-diffusion native engine.
//!
//! Loads the engine module (extracting the bundled copy if needed), creates
//! one engine context, loads the model and writes one image file per result.

use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use sd_bridge::cli::Cli;
use sd_bridge::config::BridgeConfig;
use sd_bridge::engine::EngineHandle;
use sd_bridge::logging::{self, LogLevel};
use sd_bridge::native;
use sd_bridge::pixel::{load_image, save_image};

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    if let Err(err) = run(&cli) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Installs the stderr subscriber. `SD_BRIDGE_LOG` overrides the level.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("SD_BRIDGE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = match cli.config {
        Some(ref path) => BridgeConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BridgeConfig::from_env(),
    };
    config.engine = cli.engine_config(&config.engine);
    config.validate().context("invalid configuration")?;

    native::configure_global(config.loader.clone());
    let engine = native::ensure_loaded().context("loading the native engine module")?;

    logging::set_log_sink(engine.as_ref(), Some(logging::tracing_sink()));
    logging::set_log_level(
        engine.as_ref(),
        if cli.verbose { LogLevel::Debug } else { LogLevel::Info },
    );

    let mut handle = EngineHandle::create(engine.clone(), &config.engine)
        .context("creating the engine context")?;

    let model_path = cli.model_path();
    let vae_path = cli.vae.as_ref().map(|p| p.to_string_lossy().into_owned());
    tracing::info!(model = %model_path.display(), "loading model");
    handle
        .load_weights(
            &model_path.to_string_lossy(),
            vae_path.as_deref(),
            cli.weight_type,
            cli.schedule,
        )
        .with_context(|| format!("loading model {}", model_path.display()))?;

    let start_time = Instant::now();
    let images = match cli.init_img {
        Some(ref init_img) => {
            let source = load_image(init_img)
                .with_context(|| format!("reading init image {}", init_img.display()))?;
            let result = handle.img2img(&source, &cli.img2img_params())?;
            tracing::info!(
                width = result.params.width,
                height = result.params.height,
                strength = result.params.strength,
                seed = result.params.seed,
                "img2img complete"
            );
            result.images
        }
        None => {
            let result = handle.txt2img(&cli.txt2img_params())?;
            tracing::info!(
                width = result.params.width,
                height = result.params.height,
                seed = result.params.seed,
                batch = result.params.batch_count,
                "txt2img complete"
            );
            result.images
        }
    };
    tracing::info!("generation took {:.2}s", start_time.elapsed().as_secs_f32());

    for (image, path) in images.iter().zip(cli.output_paths(images.len())) {
        save_image(image, &path).with_context(|| format!("writing {}", path.display()))?;
        tracing::info!("saved {}", path.display());
    }

    handle.close();
    logging::set_log_sink(engine.as_ref(), None);
    Ok(())
}
