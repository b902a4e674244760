//! Private key SSH authentication.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::tunnel::error::TunnelError;
use crate::tunnel::handler::TunnelClientHandler;

use super::traits::AuthStrategy;

/// Private key authentication strategy.
///
/// Holds an already parsed, passphrase-less private key supplied inline as
/// OpenSSH or PEM text.
#[derive(Clone)]
pub struct KeyAuth {
    key: Arc<keys::PrivateKey>,
}

impl KeyAuth {
    /// Parse private key text into a signer.
    pub fn parse(key_text: &str) -> Result<Self, TunnelError> {
        let key = keys::decode_secret_key(key_text, None).map_err(|e| {
            TunnelError::Credential(format!("error parsing bastion private key: {}", e))
        })?;
        Ok(Self { key: Arc::new(key) })
    }

    /// Algorithm name of the key, e.g. `ssh-ed25519`.
    pub fn algorithm(&self) -> String {
        self.key.algorithm().as_str().to_string()
    }

    /// SHA-256 fingerprint of the matching public key.
    pub fn fingerprint(&self) -> String {
        self.key
            .public_key()
            .fingerprint(keys::HashAlg::Sha256)
            .to_string()
    }
}

impl fmt::Debug for KeyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyAuth")
            .field("algorithm", &self.algorithm())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<TunnelClientHandler>,
        username: &str,
    ) -> Result<bool, russh::Error> {
        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "publickey"
    }
}
