#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::path::PathBuf;

use dotenv::dotenv;
use poem::{EndpointExt, Route, Server, listener::TcpListener, middleware::Tracing};
use poem_mcpserver::{McpServer, streamable_http};
use ssh_tunnel::tunnel::config::{PRESETS_ENV_VAR, load_presets};
use ssh_tunnel::tunnel::registry::TUNNELS;
use ssh_tunnel::tunnel::{McpTunnelCommands, TunnelOptions};
use tracing::{error, info, warn};

/// Open every tunnel listed in the presets file, if one is configured.
async fn open_presets() {
    let Ok(path) = std::env::var(PRESETS_ENV_VAR) else {
        return;
    };
    let path = PathBuf::from(path);

    let presets = match load_presets(&path) {
        Ok(presets) => presets,
        Err(e) => {
            error!("Skipping tunnel presets: {}", e);
            return;
        }
    };

    info!("Opening {} preset tunnel(s) from {}", presets.len(), path.display());
    for settings in &presets {
        let options = TunnelOptions::resolve(None, None, None, None);
        match TUNNELS.open(settings, options).await {
            Ok(opened) => info!(
                "Preset tunnel {} -> {} listening on {}",
                opened.session.id(),
                opened.session.remote(),
                opened.session.local_addr()
            ),
            Err(e) => warn!(
                "Preset tunnel {}@{} -> {} failed: {}",
                settings.bastion_user,
                settings.bastion(),
                settings.remote(),
                e
            ),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let mcp_port: u16 = std::env::var("MCP_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);
    let mcp_addr = format!("0.0.0.0:{}", mcp_port);

    open_presets().await;

    info!("Starting MCP server on {}", mcp_addr);
    let app = Route::new()
        .at(
            "/",
            streamable_http::endpoint(|_| McpServer::new().tools(McpTunnelCommands)),
        )
        .with(Tracing);

    info!("Use the ssh_tunnel_open command to forward a local port through a bastion");

    let served = Server::new(TcpListener::bind(mcp_addr))
        .name("SSH Tunnel MCP Server")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutdown requested");
            },
            None,
        )
        .await;

    TUNNELS.close_all().await;
    served?;
    Ok(())
}
