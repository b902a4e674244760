#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use dotenv::dotenv;
use poem_mcpserver::McpServer;
use ssh_tunnel::tunnel::McpTunnelCommands;
use ssh_tunnel::tunnel::registry::TUNNELS;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Stdout carries the protocol; logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let served = poem_mcpserver::stdio::stdio(McpServer::new().tools(McpTunnelCommands)).await;
    TUNNELS.close_all().await;
    served?;
    Ok(())
}
