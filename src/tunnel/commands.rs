//! MCP tunnel tools.
//!
//! - `ssh_tunnel_open`: Open (or reuse) a local forward through a bastion
//! - `ssh_tunnel_list`: List registered tunnels and their state
//! - `ssh_tunnel_close`: Shut a tunnel down and release its local port

use poem_mcpserver::{Tools, content::Text, tool::StructuredContent};
use tracing::{error, info};

use super::config::{DEFAULT_BASTION_PORT, TunnelOptions, TunnelSettings};
use super::error::TunnelError;
use super::registry::{OpenedTunnel, TUNNELS};
use super::types::{TunnelInfo, TunnelListResponse, TunnelOpenResponse};

/// MCP tunnel tool implementation.
pub struct McpTunnelCommands;

#[Tools]
impl McpTunnelCommands {
    /// Open a local port forward to `remote_host:remote_port` through an SSH bastion.
    ///
    /// Returns the local address to connect to. Opening the same
    /// bastion/remote/user again returns the tunnel that is already open.
    /// A private key takes precedence over a password when both are given.
    /// Without `bastion_host_key` the bastion's identity is NOT verified.
    #[allow(clippy::too_many_arguments)]
    async fn ssh_tunnel_open(
        &self,
        /// Bastion hostname or IP address
        bastion_host: String,
        /// Bastion SSH port (default: 22)
        bastion_port: Option<u16>,
        /// Username on the bastion
        bastion_user: String,
        /// Bastion public key, as an OpenSSH line, a base64 blob or a known_hosts entry (recommended)
        bastion_host_key: Option<String>,
        /// Password for the bastion user (ignored when a private key is given)
        bastion_password: Option<String>,
        /// Private key text in OpenSSH or PEM format (unencrypted)
        bastion_private_key: Option<String>,
        /// Destination host as resolved by the bastion
        remote_host: String,
        /// Destination port
        remote_port: u16,
        /// Connection timeout in seconds (default: 30, env: SSH_TUNNEL_CONNECT_TIMEOUT)
        connect_timeout_secs: Option<u64>,
        /// Maximum retry attempts for transient connection failures (default: 3, env: SSH_TUNNEL_MAX_RETRIES)
        max_retries: Option<u32>,
        /// Initial delay between retries in milliseconds, uses exponential backoff (default: 1000, env: SSH_TUNNEL_RETRY_DELAY_MS)
        retry_delay_ms: Option<u64>,
        /// Fail the whole tunnel when the remote cannot be reached for one client (default: false, env: SSH_TUNNEL_STRICT)
        strict: Option<bool>,
    ) -> Result<StructuredContent<TunnelOpenResponse>, String> {
        let settings = TunnelSettings {
            bastion_host,
            bastion_port: bastion_port.unwrap_or(DEFAULT_BASTION_PORT),
            bastion_user,
            bastion_host_key,
            bastion_password,
            bastion_private_key,
            remote_host,
            remote_port,
        };
        let options = TunnelOptions::resolve(connect_timeout_secs, max_retries, retry_delay_ms, strict);

        match TUNNELS.open(&settings, options).await {
            Ok(opened) => Ok(StructuredContent(open_response(&opened))),
            Err(e) => {
                error!("Failed to open tunnel {:?}: {}", settings, e);
                Err(tool_error(&e))
            }
        }
    }

    /// List all registered tunnels with their state.
    ///
    /// Tunnels that failed stay listed with a `failed: <reason>` state until
    /// closed or reopened.
    async fn ssh_tunnel_list(&self) -> StructuredContent<TunnelListResponse> {
        StructuredContent(list_response())
    }

    /// Close a tunnel: stop accepting, drop every forwarded connection and
    /// disconnect from the bastion.
    async fn ssh_tunnel_close(
        &self,
        /// Tunnel ID returned by ssh_tunnel_open
        tunnel_id: String,
    ) -> Result<Text<String>, String> {
        info!("Closing tunnel {}", tunnel_id);

        match TUNNELS.close(&tunnel_id).await {
            Some(state) => Ok(Text(format!("Tunnel {} closed ({})", tunnel_id, state))),
            None => Err(format!("No tunnel with ID: {}", tunnel_id)),
        }
    }
}

fn open_response(opened: &OpenedTunnel) -> TunnelOpenResponse {
    let session = &opened.session;
    let message = if opened.reused {
        format!(
            "Reused tunnel {} -> {} via {}@{}. Use tunnel_id '{}' to close it.",
            session.local_addr(),
            session.remote(),
            session.user(),
            session.bastion(),
            session.id()
        )
    } else {
        let retry_part = if session.retry_attempts() > 0 {
            format!(" after {} retry attempt(s)", session.retry_attempts())
        } else {
            String::new()
        };
        format!(
            "Forwarding {} -> {} via {}@{}{}. Use tunnel_id '{}' to close it.",
            session.local_addr(),
            session.remote(),
            session.user(),
            session.bastion(),
            retry_part,
            session.id()
        )
    };

    TunnelOpenResponse {
        tunnel_id: session.id().to_string(),
        local_host: session.local_host(),
        local_port: session.local_port(),
        local_address: session.local_addr().to_string(),
        bastion_address: session.bastion().to_string(),
        remote_address: session.remote().to_string(),
        username: session.user().to_string(),
        auth_method: session.auth_method().to_string(),
        host_key_verified: session.host_key_verified(),
        warning: session.warning().map(str::to_string),
        reused: opened.reused,
        retry_attempts: session.retry_attempts(),
        message,
    }
}

fn list_response() -> TunnelListResponse {
    let tunnels: Vec<TunnelInfo> = TUNNELS
        .list()
        .iter()
        .map(|session| TunnelInfo::from(session.as_ref()))
        .collect();
    let count = tunnels.len();
    TunnelListResponse { tunnels, count }
}

fn tool_error(e: &TunnelError) -> String {
    format!("[{}] {}", e.stage(), e)
}
