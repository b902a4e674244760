//! Authentication strategy trait definition.
//!
//! Defines the interface for bastion authentication strategies, enabling
//! the Strategy pattern for SSH authentication methods.

use async_trait::async_trait;
use russh::client;

use crate::tunnel::handler::TunnelClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks. Each strategy represents a different authentication
/// method (password, private key, etc.).
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the bastion.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - The bastion rejected the credentials
    /// * `Err(error)` - The transport failed during the attempt
    async fn authenticate(
        &self,
        handle: &mut client::Handle<TunnelClientHandler>,
        username: &str,
    ) -> Result<bool, russh::Error>;

    /// Get the name of this authentication strategy.
    ///
    /// Used for logging and in error messages.
    fn name(&self) -> &'static str;
}
