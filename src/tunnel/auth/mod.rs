//! Bastion authentication.
//!
//! Strategies implement [`AuthStrategy`] so the connection code never needs
//! to know which credential it is presenting. [`AuthMethod::resolve`] picks
//! exactly one of them from the configured values:
//!
//! 1. A non-empty private key always wins, even when a password is also set.
//!    A key that fails to parse is a [`TunnelError::Credential`]; there is no
//!    fallback to the password.
//! 2. Otherwise a non-empty password is used.
//! 3. Otherwise resolution fails with [`TunnelError::Configuration`].
//!
//! Raw secrets are never logged.

mod key;
mod password;
mod traits;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

use super::config::non_empty;
use super::error::TunnelError;
use super::handler::TunnelClientHandler;

/// The single credential presented to the bastion.
#[derive(Debug)]
pub enum AuthMethod {
    PublicKey(KeyAuth),
    Password(PasswordAuth),
}

impl AuthMethod {
    /// Select and construct the authentication method.
    pub fn resolve(
        password: Option<&str>,
        private_key: Option<&str>,
    ) -> Result<Self, TunnelError> {
        if let Some(key_text) = non_empty(private_key) {
            let key = KeyAuth::parse(key_text.trim())?;
            debug!(
                "Using {} private key {} for bastion authentication",
                key.algorithm(),
                key.fingerprint()
            );
            return Ok(AuthMethod::PublicKey(key));
        }

        // Used verbatim, surrounding whitespace included
        if let Some(password) = non_empty(password) {
            debug!("Using password for bastion authentication");
            return Ok(AuthMethod::Password(PasswordAuth::new(password)));
        }

        Err(TunnelError::Configuration(
            "no bastion credential supplied: one of bastion_password or bastion_private_key is required"
                .to_string(),
        ))
    }
}

#[async_trait]
impl AuthStrategy for AuthMethod {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<TunnelClientHandler>,
        username: &str,
    ) -> Result<bool, russh::Error> {
        match self {
            AuthMethod::PublicKey(key) => key.authenticate(handle, username).await,
            AuthMethod::Password(password) => password.authenticate(handle, username).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AuthMethod::PublicKey(key) => key.name(),
            AuthMethod::Password(password) => password.name(),
        }
    }
}
