//! russh client handler for the bastion connection.
//!
//! The handler enforces the configured [`HostKeyPolicy`] during the
//! transport handshake. Rejecting the key makes russh abort the connection
//! with [`russh::Error::UnknownKey`]; the fingerprint of the key the bastion
//! actually presented is kept so the caller can build a precise
//! [`TunnelError::HostKeyMismatch`](super::error::TunnelError::HostKeyMismatch).

use std::sync::{Arc, OnceLock};

use russh::{client, keys};
use tracing::{debug, warn};

use super::host_key::{HostKeyPolicy, fingerprint};

/// Client handler that checks the bastion's host key against a policy.
pub struct TunnelClientHandler {
    policy: Arc<HostKeyPolicy>,
    presented: Arc<OnceLock<String>>,
}

impl TunnelClientHandler {
    pub fn new(policy: Arc<HostKeyPolicy>) -> Self {
        Self {
            policy,
            presented: Arc::new(OnceLock::new()),
        }
    }

    /// Shared slot receiving the fingerprint of the presented host key.
    pub(crate) fn presented_key(&self) -> Arc<OnceLock<String>> {
        self.presented.clone()
    }
}

impl client::Handler for TunnelClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = fingerprint(server_public_key);
        let accepted = self.policy.verify(server_public_key);

        if accepted {
            debug!("Bastion presented host key {}", presented);
        } else {
            warn!(
                "Bastion presented host key {} but {} is pinned",
                presented,
                self.policy.expected_fingerprint().unwrap_or_default()
            );
        }

        let _ = self.presented.set(presented);
        Ok(accepted)
    }
}
