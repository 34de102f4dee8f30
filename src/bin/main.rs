use advisory_orchestrator::{
    config::OrchestratorConfig,
    models::{AdvisoryRequest, UserProfile},
    orchestrator::Orchestrator,
    OrchestrationError,
};
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn load_profile(path: Option<String>) -> Result<UserProfile, OrchestrationError> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|e| {
                OrchestrationError::InvalidInput(format!("profile file {} is malformed: {}", path, e))
            })
        }
        None => Ok(UserProfile::demo()),
    }
}

async fn run() -> Result<(), OrchestrationError> {
    let config = OrchestratorConfig::from_env()?;
    let profile = load_profile(std::env::args().nth(1))?;

    info!(
        profile = %profile.name,
        tickers = %config.tickers.join(","),
        "Advisory orchestrator starting"
    );

    let orchestrator = Orchestrator::from_config(&config)?;
    let result = orchestrator.run(AdvisoryRequest::new(profile)).await?;

    info!(audit_id = %result.audit_id, "Advisory run successful");
    println!("{}", serde_json::to_string_pretty(&result.report)?);

    Ok(())
}

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenv::dotenv().ok();

    // Logs go to stderr; stdout carries only the report
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("ADVISORY_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        let kind = e.kind();
        match (e.stage(), e.capability()) {
            (Some(stage), Some(capability)) => eprintln!(
                "{} (stage '{}', capability '{}'): {}",
                kind, stage, capability, e
            ),
            _ => eprintln!("{}: {}", kind, e),
        }
        process::exit(kind.exit_code());
    }
}
