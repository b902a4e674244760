//! Bastion connection and authentication.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: Build the russh client configuration. The
//!    bastion connection carries the tunnel for as long as the process wants
//!    it, so there is no inactivity timeout; keepalives detect dead peers.
//!
//! 2. **Connection Establishment**: TCP connect and SSH handshake with a
//!    per-attempt timeout. The host key policy is enforced by
//!    [`TunnelClientHandler`] during the handshake.
//!
//! 3. **Authentication**: Present the single resolved [`AuthMethod`].
//!
//! ## Retry Strategy
//!
//! Connection attempts use exponential backoff with jitter via the `backon` crate:
//!
//! - **Initial delay**: `TunnelOptions::retry_delay` (default: 1000ms)
//! - **Maximum delay**: Capped at [`MAX_RETRY_DELAY`] (10 seconds)
//! - **Maximum attempts**: `TunnelOptions::max_retries` (default: 3)
//!
//! Only [`TunnelError::Connection`] is retried. Authentication failures are
//! never retried to avoid account lockouts, and a host key mismatch will not
//! fix itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{Disconnect, client};
use tracing::{debug, error, info, warn};

use super::auth::AuthStrategy;
use super::config::{MAX_RETRY_DELAY, TunnelConfig, TunnelOptions};
use super::error::TunnelError;
use super::handler::TunnelClientHandler;

/// Authenticated connection to the bastion.
pub(crate) type BastionHandle = client::Handle<TunnelClientHandler>;

/// Build russh client configuration from the tunnel options.
///
/// - No inactivity timeout
/// - Keepalive every `keepalive_interval`, at most 3 unanswered
/// - ZLIB compression offered only when `compress` is set
pub(crate) fn build_client_config(options: &TunnelOptions) -> Arc<client::Config> {
    let compression = if options.compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(options.keepalive_interval),
        keepalive_max: 3,
        preferred,
        ..Default::default()
    })
}

/// Connect to the bastion with retry logic using exponential backoff with jitter.
///
/// # Returns
///
/// * `Ok((handle, retry_count))` - Authenticated handle and number of retries needed
/// * `Err(error)` - The last error encountered
pub(crate) async fn connect_bastion_with_retry(
    config: &TunnelConfig,
    options: &TunnelOptions,
) -> Result<(BastionHandle, u32), TunnelError> {
    let attempt_counter = AtomicU32::new(0);
    let client_config = build_client_config(options);

    let backoff = ExponentialBuilder::default()
        .with_min_delay(options.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(options.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let current_attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);

        if current_attempt > 0 {
            warn!(
                "Bastion connection retry attempt {} to {}@{}",
                current_attempt, config.user, config.bastion
            );
        }

        connect_bastion(config, client_config.clone(), options.connect_timeout).await
    })
    .retry(backoff)
    .when(|e: &TunnelError| {
        let retryable = e.is_retryable();
        if !retryable {
            warn!(
                "Bastion connection to {}@{} failed with non-retryable error: {}",
                config.user, config.bastion, e
            );
        }
        retryable
    })
    .notify(|err, dur| {
        warn!("Bastion connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    let retry_count = total_attempts.saturating_sub(1);

    match result {
        Ok(handle) => {
            if retry_count > 0 {
                info!(
                    "Bastion connection to {}@{} succeeded after {} retry attempt(s)",
                    config.user, config.bastion, retry_count
                );
            }
            Ok((handle, retry_count))
        }
        Err(e) => {
            error!(
                "Bastion connection to {}@{} failed after {} attempt(s). Last error: {}",
                config.user, config.bastion, total_attempts, e
            );
            Err(e)
        }
    }
}

/// Establish one bastion connection and authenticate it.
async fn connect_bastion(
    config: &TunnelConfig,
    client_config: Arc<client::Config>,
    timeout: Duration,
) -> Result<BastionHandle, TunnelError> {
    let addr = config.bastion.to_string();
    let handler = TunnelClientHandler::new(Arc::new(config.host_key.clone()));
    let presented_key = handler.presented_key();

    let host = config
        .bastion
        .host
        .trim_start_matches('[')
        .trim_end_matches(']');
    let connect_future = client::connect(client_config, (host, config.bastion.port), handler);

    let mut handle = match tokio::time::timeout(timeout, connect_future).await {
        Err(_) => {
            return Err(TunnelError::connection(
                &addr,
                format!("connection timed out after {:?}", timeout),
            ));
        }
        Ok(Err(russh::Error::UnknownKey)) => {
            return Err(TunnelError::HostKeyMismatch {
                addr,
                expected: config.host_key.expected_fingerprint().unwrap_or_default(),
                presented: presented_key
                    .get()
                    .cloned()
                    .unwrap_or_else(|| "<unknown>".to_string()),
            });
        }
        Ok(Err(e)) => return Err(TunnelError::connection(&addr, format!("failed to connect: {}", e))),
        Ok(Ok(handle)) => handle,
    };

    debug!(
        "Transport to {} established, authenticating {} with {}",
        addr,
        config.user,
        config.auth.name()
    );

    let accepted = tokio::time::timeout(timeout, config.auth.authenticate(&mut handle, &config.user))
        .await
        .map_err(|_| {
            TunnelError::connection(
                &addr,
                format!("authentication timed out after {:?}", timeout),
            )
        })?
        .map_err(|e| {
            TunnelError::connection(&addr, format!("transport failed during authentication: {}", e))
        })?;

    if !accepted {
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "authentication rejected", "en")
            .await
        {
            debug!("Error during disconnect after rejected authentication: {}", e);
        }
        return Err(TunnelError::Authentication {
            addr,
            user: config.user.clone(),
            method: config.auth.name(),
        });
    }

    info!(
        "Authenticated to bastion {} as {} using {}",
        addr,
        config.user,
        config.auth.name()
    );
    Ok(handle)
}
