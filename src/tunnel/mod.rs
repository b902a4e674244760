//! SSH bastion tunnel engine and its MCP tools.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Tunnel settings, validation and env var resolution
//! - `error`: Error taxonomy and retry classification
//! - `auth`: Credential resolution (private key over password)
//! - `host_key`: Bastion host key pinning
//! - `handler`: russh client handler enforcing the host key policy
//! - `port`: Ephemeral local port allocation
//! - `identity`: Stable tunnel identity string
//! - `client`: Bastion connection and authentication with retry
//! - `forward`: Accept loop and `direct-tcpip` relaying
//! - `session`: Tunnel lifecycle state machine
//! - `registry`: Process-wide map of open tunnels
//! - `types`: Serializable response types for MCP tools
//! - `commands`: MCP tool implementations

pub mod auth;
pub(crate) mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod forward;
pub mod handler;
pub mod host_key;
pub mod identity;
pub mod port;
pub mod registry;
pub mod session;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;

pub use commands::McpTunnelCommands;
pub use config::{TunnelConfig, TunnelOptions, TunnelSettings};
pub use error::TunnelError;
pub use session::{TunnelSession, TunnelState};
