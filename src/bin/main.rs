use financial_triage_orchestrator::{agent::Orchestrator, config::OrchestratorConfig, Question};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SAMPLE_QUESTIONS: &[&str] = &[
    "What is Gross Profit in the year ending 2024?",
    "What is adjusted EBITDA for the year ending in 2024?",
    "Determine the EV/Sales ratio for 2024.",
    "What is market debt to equity ratio?",
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Financial Triage Orchestrator starting");

    let config = OrchestratorConfig::from_env()?;
    info!(provider = ?config.reasoning.provider, "Configuration loaded");

    let orchestrator = Orchestrator::from_config(config)?;

    let questions: Vec<Question> = match std::env::args().nth(1) {
        Some(text) => vec![Question::new(text)],
        None => SAMPLE_QUESTIONS.iter().map(|q| Question::new(*q)).collect(),
    };

    for outcome in orchestrator.run_batch(questions).await {
        match outcome {
            Ok(result) => {
                println!("\n=== {} ===", result.question);
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            Err(e) => eprintln!("Orchestration failed: {}", e),
        }
    }

    Ok(())
}
