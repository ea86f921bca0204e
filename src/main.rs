//! quant-variant-server: lazy per-variant LLM serving plus the setup pipeline.
//!
//! `serve` (default) exposes the model API over HTTP, `setup` produces every
//! variant artifact in the foreground, and `describe` loads one variant and
//! prints what it resolved to.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use quant_variant_server::cache::VariantCache;
use quant_variant_server::config::{Cli, Command, Config};
use quant_variant_server::inference::coordinator::InferenceCoordinator;
use quant_variant_server::inference::llama_ffi::LlamaLoader;
use quant_variant_server::metrics::ServiceMetrics;
use quant_variant_server::pipeline::{HfHubFetcher, ProcessRunner, SetupJob, SetupPipeline};
use quant_variant_server::server::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "quant_variant_server=debug,tower_http=debug"
    } else {
        "quant_variant_server=info,tower_http=info"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("quant-variant-server v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load(&cli.config)?);
    info!(
        model_dir = %config.model.model_dir.display(),
        source = %config.model.source_repo,
        threads = config.runtime.threads,
        context_size = config.runtime.context_size,
        "Configuration loaded"
    );

    let metrics = ServiceMetrics::new().context("registering metrics")?;

    match cli.command.clone().unwrap_or(Command::Serve { listen: None }) {
        Command::Serve { listen } => serve(config, metrics, listen).await,
        Command::Setup => setup(config, metrics).await,
        Command::Describe { model_type } => describe(config, metrics, &model_type).await,
    }
}

fn coordinator(config: &Config, metrics: &ServiceMetrics) -> InferenceCoordinator {
    let cache = VariantCache::new(config, Arc::new(LlamaLoader)).with_metrics(metrics.clone());
    InferenceCoordinator::new(Arc::new(cache), config.sampling.clone())
        .with_max_concurrent(config.server.max_concurrent_requests)
        .with_metrics(metrics.clone())
}

fn setup_pipeline(config: &Arc<Config>) -> SetupPipeline {
    SetupPipeline::new(
        config.clone(),
        Arc::new(ProcessRunner),
        Arc::new(HfHubFetcher::default()),
    )
}

async fn serve(
    config: Arc<Config>,
    metrics: ServiceMetrics,
    listen: Option<String>,
) -> anyhow::Result<ExitCode> {
    let state = Arc::new(AppState {
        coordinator: coordinator(&config, &metrics),
        setup_job: SetupJob::new(setup_pipeline(&config)).with_metrics(metrics.clone()),
        metrics,
        config: config.clone(),
        start_time: Instant::now(),
    });

    let app = build_router(state);

    let listen_addr = listen.unwrap_or_else(|| config.server.listen.clone());
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("binding {listen_addr}"))?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;
    Ok(ExitCode::SUCCESS)
}

async fn setup(config: Arc<Config>, metrics: ServiceMetrics) -> anyhow::Result<ExitCode> {
    let job = SetupJob::new(setup_pipeline(&config)).with_metrics(metrics);
    let Some(run) = job.run_now().await else {
        anyhow::bail!("a setup run is already in progress");
    };

    println!("{}", serde_json::to_string_pretty(&run)?);
    match run.into_result() {
        Ok(run) => {
            for (variant, path) in &run.artifacts {
                info!(%variant, path = %path.display(), "Artifact ready");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("{e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn describe(
    config: Arc<Config>,
    metrics: ServiceMetrics,
    model_type: &str,
) -> anyhow::Result<ExitCode> {
    match coordinator(&config, &metrics).describe(model_type).await {
        Ok(desc) => {
            println!("{}", serde_json::to_string_pretty(&desc)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(model_type, "{e}");
            Ok(ExitCode::FAILURE)
        }
    }
}
