//! Stable tunnel identity.
//!
//! The identity is the lowercase hex SHA-256 digest of the bastion address,
//! the remote address and the bastion user, concatenated in that order. It is
//! an opaque handle for the registry and the MCP tools, not a credential.

use sha2::{Digest, Sha256};

use super::config::Endpoint;

/// Compute the identity of the tunnel `user@bastion -> remote`.
pub fn tunnel_id(bastion: &Endpoint, remote: &Endpoint, user: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bastion.to_string().as_bytes());
    hasher.update(remote.to_string().as_bytes());
    hasher.update(user.as_bytes());
    format!("{:x}", hasher.finalize())
}
