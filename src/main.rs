/// bpmnway: token-based BPMN process engine
///
/// Main entry point. Loads configuration from the environment and starts the
/// HTTP server:
/// - Models at /model/*
/// - Instances at /instance/*
/// - Event log at /events
/// - Health check at /healthz

use bpmnway::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
