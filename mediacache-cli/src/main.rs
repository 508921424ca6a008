mod capture;
mod cli;
mod config;
mod error;
mod host;
mod logging;

use std::time::Duration;

use clap::Parser;
use tracing::{debug, error};
use url::Url;

use crate::{
    capture::CaptureOptions,
    cli::{Args, Commands},
    config::AppConfig,
    error::AppError,
    logging::init_logging,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before clap reads its `env` fallbacks
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref())?;

    let log_dir = args.log_dir.clone().or_else(|| config.log_dir.clone());
    let _guard = init_logging(
        &config.log_filter,
        args.verbose,
        args.quiet,
        log_dir.as_deref(),
    )?;
    debug!(?config, "Configuration loaded");

    if let Err(e) = execute(args, config).await {
        error!("Application error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

async fn execute(args: Args, config: AppConfig) -> Result<(), AppError> {
    match args.command {
        Commands::Config => {
            println!("{}", config.show()?);
        }
        Commands::Run {
            tracks,
            output_dir,
            downloads_dir,
            page_url,
            page_title,
            chunk_size,
            chunk_interval_ms,
            control,
        } => {
            let page_url = page_url
                .map(|url| Url::parse(&url))
                .transpose()
                .map_err(|e| AppError::InvalidInput(format!("page url: {e}")))?;
            let page_title = page_title.unwrap_or_else(|| {
                tracks
                    .first()
                    .and_then(|t| t.path.file_stem())
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "mediacache".to_owned())
            });
            let chunk_size = chunk_size.unwrap_or(config.chunk_size);
            if chunk_size == 0 {
                return Err(AppError::InvalidInput("chunk size must be positive".into()));
            }

            let options = CaptureOptions {
                tracks,
                output_dir: output_dir.or(config.output_dir.clone()),
                downloads_dir: downloads_dir.unwrap_or(config.downloads_dir.clone()),
                page_url,
                page_title,
                chunk_size,
                chunk_interval: Duration::from_millis(
                    chunk_interval_ms.unwrap_or(config.chunk_interval_ms),
                ),
                capture: config.capture_config(),
                preferences: config.preferences,
            };
            capture::run(options, control).await?;
        }
    }
    Ok(())
}
