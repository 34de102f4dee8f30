use advisory_orchestrator::{api::start_server, config::OrchestratorConfig, orchestrator::Orchestrator};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ADVISORY_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::from_env()?;

    info!("🚀 Advisory Orchestrator - API Server");
    info!("📍 Port: {}", config.api_port);
    match &config.capability_api_base_url {
        Some(url) => info!("📡 Capability service: {}", url),
        None => info!("📦 Offline capability providers"),
    }

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);

    info!("✅ Orchestrator initialized");

    start_server(orchestrator, config.api_port).await?;

    Ok(())
}
