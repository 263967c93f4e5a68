//! Voice-bot gateway
//!
//! Registers SIP agents with a carrier, answers their inbound calls and
//! bridges the RTP audio of each call to a bot backend over WebSocket.
//! Agents are started and supervised through a small HTTP control API.

mod models;
mod server;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("voice_bot_gateway=info".parse()?))
        .init();

    let config = server::GatewayConfig::from_env();
    tracing::info!(
        "Starting voice-bot gateway (agent configs in {})",
        config.agent_config_dir.display()
    );

    server::run_server(config).await
}
