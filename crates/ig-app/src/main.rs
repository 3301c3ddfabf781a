use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ig_app::Generator;
use ig_app::generator::backend::SdWebUiBackend;
use ig_core::config::GeneratorConfig;
use ig_core::random::SecureRandom;

/// Generate a batch of images for one genre, or the daily plan.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Genre to generate, or `daily` for the configured daily plan.
    genre: String,

    /// Number of images to generate.
    #[arg(default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    count: u64,

    /// Path to the generator configuration.
    #[arg(short, long, default_value = "config/generator.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ig_app=info,ig_core=info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = GeneratorConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let backend = SdWebUiBackend::new(&config.backend).context("creating backend client")?;
    let generator = Generator::new(config, Arc::new(backend), Arc::new(SecureRandom::new()))
        .context("setting up generator")?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing dispatched items");
            on_signal.cancel();
        }
    });

    if args.genre == "daily" {
        let runs = generator.run_daily(cancel).await?;
        let succeeded: u64 = runs.iter().map(|r| r.succeeded).sum();
        let failed: u64 = runs.iter().map(|r| r.failed).sum();
        let skipped: u64 = runs.iter().map(|r| r.skipped).sum();
        info!(batches = runs.len(), succeeded, failed, skipped, "Daily generation done");
    } else {
        let run = generator.run_batch(&args.genre, args.count, cancel).await?;
        info!(
            run_id = %run.id,
            succeeded = run.succeeded,
            failed = run.failed,
            skipped = run.skipped,
            aborted = run.aborted,
            "Generation done"
        );
    }
    Ok(())
}
