use financial_triage_orchestrator::{
    agent::Orchestrator, api::start_server, config::OrchestratorConfig,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::from_env()?;
    if config.reasoning.api_key.is_none() {
        warn!("GEMINI_API_KEY not set, using the rule-based reasoner");
    }

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("Financial Triage Orchestrator - API Server");
    info!("Port: {}", api_port);

    let orchestrator = Arc::new(Orchestrator::from_config(config)?);

    info!("Orchestrator initialized");

    start_server(orchestrator, api_port).await?;

    Ok(())
}
