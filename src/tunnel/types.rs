//! Serializable response types for the MCP tunnel tools.
//!
//! All types implement `Serialize`, `Deserialize`, and `JsonSchema` for
//! MCP protocol compatibility.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::session::TunnelSession;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TunnelOpenResponse {
    /// Stable identity of the tunnel (SHA-256 of bastion, remote and user)
    pub tunnel_id: String,
    pub local_host: String,
    pub local_port: u16,
    /// Address local clients connect to, e.g. "127.0.0.1:49152"
    pub local_address: String,
    pub bastion_address: String,
    pub remote_address: String,
    pub username: String,
    /// "publickey" or "password"
    pub auth_method: String,
    /// Whether the bastion host key was checked against a pinned key
    pub host_key_verified: bool,
    /// Security warning, present when the host key is not verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// The tunnel was already open and has been returned unchanged
    pub reused: bool,
    /// Number of retry attempts needed to reach the bastion
    pub retry_attempts: u32,
    pub message: String,
}

/// Tunnel metadata for listing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub local_address: String,
    pub bastion_address: String,
    pub remote_address: String,
    pub username: String,
    pub auth_method: String,
    pub host_key_verified: bool,
    /// Lifecycle state, e.g. "forwarding" or "failed: <reason>"
    pub state: String,
    /// RFC3339 timestamp
    pub opened_at: String,
}

impl From<&TunnelSession> for TunnelInfo {
    fn from(session: &TunnelSession) -> Self {
        Self {
            tunnel_id: session.id().to_string(),
            local_address: session.local_addr().to_string(),
            bastion_address: session.bastion().to_string(),
            remote_address: session.remote().to_string(),
            username: session.user().to_string(),
            auth_method: session.auth_method().to_string(),
            host_key_verified: session.host_key_verified(),
            state: session.state().to_string(),
            opened_at: session.opened_at().to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TunnelListResponse {
    /// Registered tunnels, oldest first
    pub tunnels: Vec<TunnelInfo>,
    /// Total number of tunnels
    pub count: usize,
}
