use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use marquee_core::provider::{LanguageModel, ResponseGenerator};
use marquee_engine::{
    CatalogFixture, Catalogs, IntentParser, MemoryContextStore, ModelGateway, ModelResponder, RequestResolver,
    TemplateResponder,
};
use marquee_llm::{HttpModel, Resilience};
use marquee_server::settings::{load_settings, load_settings_from_path};

/// Conversational media-request service.
#[derive(Debug, Parser)]
#[command(name = "marquee", version)]
struct Cli {
    /// Settings file (defaults to ~/.marquee/settings.json).
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Port to listen on, overriding settings and environment.
    #[arg(long)]
    port: Option<u16>,
    /// JSON fixture `{"movies": [...], "series": [...]}` seeding the catalogs.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Default log level (RUST_LOG still wins).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => load_settings_from_path(path),
        None => load_settings(),
    }
    .context("failed to load settings")?;
    if let Some(port) = cli.port {
        settings.server.port = port;
    }
    if let Some(level) = cli.log_level {
        settings.telemetry.log_level = level;
    }

    let telemetry = marquee_telemetry::init_telemetry(&settings.telemetry);
    let metrics = telemetry.metrics();
    tracing::info!(model = %settings.model.model, "Starting Marquee");

    let fixture = match &cli.catalog {
        Some(path) => CatalogFixture::load(path).with_context(|| format!("failed to load {}", path.display()))?,
        None => CatalogFixture::default(),
    };
    let (movies, series) = fixture.into_catalogs();

    let resilience = Arc::new(Resilience::new(settings.breaker.clone()).with_metrics(Arc::clone(&metrics)));
    let model: Arc<dyn LanguageModel> = Arc::new(HttpModel::new(&settings.model).context("failed to build model client")?);
    let gateway = ModelGateway::new(model, Arc::clone(&resilience), settings.model_retry.clone());

    let responder: Arc<dyn ResponseGenerator> = if settings.model.api_key.is_some() {
        Arc::new(ModelResponder::new(gateway.clone()))
    } else {
        tracing::warn!("no model API key configured, replies use fixed templates");
        Arc::new(TemplateResponder)
    };

    let resolver = RequestResolver::new(
        IntentParser::new(gateway),
        Arc::new(MemoryContextStore::from_config(&settings.context)),
        Catalogs::new(Arc::new(movies), Arc::new(series)),
        resilience,
        responder,
    )
    .with_catalog_policy(settings.catalog_retry.clone())
    .with_per_user_sequencing(settings.server.per_user_sequencing)
    .with_metrics(Arc::clone(&metrics));

    let handle = marquee_server::start(
        &settings.server,
        Arc::new(resolver),
        metrics,
        settings.context.sweep_interval(),
    )
    .await
    .context("failed to start server")?;

    tracing::info!(port = handle.port, "Marquee server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
