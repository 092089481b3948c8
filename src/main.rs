//! CLI entry point launching the Vanish removal pipeline.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = vanish::config::CliArgs::parse();
    let config = match vanish::config::AppConfig::load(cli).await {
        Ok(config) => config,
        Err(error) => return report(error),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight chunks");
            on_interrupt.cancel();
        }
    });

    match vanish::run(config, cancel).await {
        Ok(summary) => {
            tracing::info!(
                frames = summary.frames,
                chunks = summary.chunks,
                retries = summary.retries,
                output = %summary.output_path.display(),
                "object removed"
            );
            ExitCode::SUCCESS
        }
        Err(error) => report(error),
    }
}

fn report(error: vanish::PipelineError) -> ExitCode {
    match error.affected_range() {
        Some(range) => tracing::error!(error = %error, frames = %range, "pipeline execution failed"),
        None => tracing::error!(error = %error, "pipeline execution failed"),
    }
    ExitCode::from(error.exit_code())
}
