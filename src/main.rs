//! # Pulumi Catalog Entry Point
//!
//! Loads configuration, builds one entity provider per configured Pulumi
//! organization, connects each to the in-memory catalog and serves the status API
//! until interrupted. With `--once` every provider refreshes a single time and
//! the process exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pulumi_catalog::{
    catalog::InMemoryCatalog,
    config::{ConfigLoader, ConfigReader},
    provider::{ProviderDeps, build_providers},
    pulumi::PulumiClient,
    scheduler::{OneShotTaskRunner, RetryPolicy, TaskScheduler},
    server::{AppState, run_server},
    telemetry::init_tracing,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "pulumi-catalog", version, about = "Synchronize Pulumi stacks into a software catalog")]
struct Cli {
    /// Provider configuration document; overrides PULUMI_CATALOG_CONFIG_PATH.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Refresh every provider once and exit instead of running the scheduler.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new().load()?;
    if let Some(path) = cli.config {
        config.config_path = path.display().to_string();
    }

    init_tracing(&config)?;
    info!(profile = %config.profile, config_path = %config.config_path, "Loaded configuration");
    if let Ok(redacted_json) = config.redacted_json() {
        debug!(config = %redacted_json, "Effective configuration");
    }

    let document = ConfigReader::from_path(&config.config_path)?;
    let catalog = InMemoryCatalog::new();
    let http_client = PulumiClient::http_client(config.http_timeout())?;

    if cli.once {
        let runner = OneShotTaskRunner::with_timeout(Duration::from_secs(
            config.scheduler.default_timeout_seconds,
        ));
        let providers = build_providers(
            &document,
            ProviderDeps {
                schedule: Some(Arc::new(runner)),
                http_client: Some(http_client),
                ..ProviderDeps::default()
            },
        )?;

        let mut failures = 0usize;
        for provider in &providers {
            if let Err(err) = provider
                .connect(catalog.connection(provider.provider_name()))
                .await
            {
                error!(provider = %provider.provider_name(), error = %err, "Refresh failed");
                failures += 1;
            }
        }

        info!(
            providers = providers.len(),
            entities = catalog.len(),
            "One-shot refresh finished"
        );
        if failures > 0 {
            return Err(format!("{failures} provider(s) failed to refresh").into());
        }
        return Ok(());
    }

    let scheduler = TaskScheduler::new(RetryPolicy::from_config(&config.retry_policy));
    let providers = build_providers(
        &document,
        ProviderDeps {
            scheduler: Some(scheduler.clone()),
            default_schedule: config.scheduler.default_schedule(),
            http_client: Some(http_client),
            ..ProviderDeps::default()
        },
    )?;
    if providers.is_empty() {
        warn!("No Pulumi providers configured under catalog.providers.pulumi");
    }

    for provider in &providers {
        provider
            .connect(catalog.connection(provider.provider_name()))
            .await?;
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                signal_token.cancel();
            }
            Err(err) => error!(error = %err, "Failed to listen for shutdown signal"),
        }
    });

    let state = AppState {
        catalog,
        providers: Arc::new(providers),
    };
    let served = run_server(&config, state, shutdown.clone()).await;

    shutdown.cancel();
    scheduler.shutdown().await;
    served
}
