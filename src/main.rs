/// flowpilot: lightweight workflow automation engine
///
/// Main entry point. Loads configuration from the environment and serves the
/// HTTP API until Ctrl-C:
/// - Workflow management API at /api/workflows/*
/// - Webhook triggers at /webhook/{workflow_id}
/// - Execution history at /api/logs
/// - Health check at /healthz

use flowpilot::{config::Config, server::start_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (FLOWPILOT_* environment variables over defaults)
    let config = Config::default();

    start_server(config).await
}
