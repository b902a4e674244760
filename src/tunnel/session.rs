//! Tunnel session lifecycle.
//!
//! A [`TunnelSession`] binds one [`TunnelConfig`] to a live bastion
//! connection and a local listener:
//!
//! ```text
//! Created -> Dialing -> Listening -> Forwarding -> Failed | Terminated
//! ```
//!
//! [`TunnelSession::start`] returns only once both the bastion connection and
//! the listener are up, or with the first error. Nothing is left behind on
//! failure: a dial failure happens before the listener exists, and a bind
//! failure disconnects the bastion before returning.
//!
//! Once forwarding, the session runs on its own task until
//! [`TunnelSession::shutdown`] is called or the accept loop hits a fault.
//! Dropping the session value does not stop the tunnel.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use russh::Disconnect;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::auth::AuthStrategy;
use super::client::{BastionHandle, connect_bastion_with_retry};
use super::config::{Endpoint, TunnelConfig, TunnelOptions};
use super::error::TunnelError;
use super::forward::Forwarder;
use super::port::allocate_local_addr;

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Dialing,
    Listening,
    Forwarding,
    /// The accept loop could not continue.
    Failed(String),
    /// Shut down on request.
    Terminated,
}

impl TunnelState {
    /// Whether the tunnel has stopped for good.
    pub fn is_finished(&self) -> bool {
        matches!(self, TunnelState::Failed(_) | TunnelState::Terminated)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Created => write!(f, "created"),
            TunnelState::Dialing => write!(f, "dialing"),
            TunnelState::Listening => write!(f, "listening"),
            TunnelState::Forwarding => write!(f, "forwarding"),
            TunnelState::Failed(reason) => write!(f, "failed: {}", reason),
            TunnelState::Terminated => write!(f, "terminated"),
        }
    }
}

/// A running tunnel.
pub struct TunnelSession {
    id: String,
    bastion: Endpoint,
    remote: Endpoint,
    user: String,
    auth_method: &'static str,
    host_key_fingerprint: Option<String>,
    warning: Option<&'static str>,
    local_addr: SocketAddr,
    retry_attempts: u32,
    opened_at: DateTime<Utc>,
    state: watch::Receiver<TunnelState>,
    cancel: CancellationToken,
    handle: Arc<BastionHandle>,
}

impl TunnelSession {
    /// Allocate a local port, connect to the bastion, and start forwarding.
    pub async fn start(config: TunnelConfig, options: TunnelOptions) -> Result<Self, TunnelError> {
        let local_addr = allocate_local_addr().await?;
        Self::start_on(config, options, local_addr).await
    }

    /// Like [`start`](Self::start) but listens on `local_addr`.
    pub async fn start_on(
        config: TunnelConfig,
        options: TunnelOptions,
        local_addr: SocketAddr,
    ) -> Result<Self, TunnelError> {
        let (state_tx, state_rx) = watch::channel(TunnelState::Created);
        let id = config.tunnel_id();

        info!(
            "Opening tunnel {} -> {} via {}@{} (auth: {}, host key: {})",
            local_addr,
            config.remote,
            config.user,
            config.bastion,
            config.auth.name(),
            config
                .host_key
                .expected_fingerprint()
                .unwrap_or_else(|| "not verified".to_string())
        );

        state_tx.send_replace(TunnelState::Dialing);
        let (handle, retry_attempts) = match connect_bastion_with_retry(&config, &options).await {
            Ok(connected) => connected,
            Err(e) => {
                state_tx.send_replace(TunnelState::Failed(e.to_string()));
                return Err(e);
            }
        };

        state_tx.send_replace(TunnelState::Listening);
        let listener = match TcpListener::bind(local_addr).await {
            Ok(listener) => listener,
            Err(source) => {
                disconnect(&handle, "local bind failed").await;
                let e = TunnelError::Bind {
                    addr: local_addr.to_string(),
                    source,
                };
                state_tx.send_replace(TunnelState::Failed(e.to_string()));
                return Err(e);
            }
        };
        // Resolves port 0 to the concrete port
        let local_addr = listener.local_addr().unwrap_or(local_addr);

        state_tx.send_replace(TunnelState::Forwarding);
        let cancel = CancellationToken::new();
        let bastion = Arc::new(handle);
        let forwarder = Forwarder::new(
            bastion.clone(),
            config.bastion.clone(),
            config.remote.clone(),
            options.forward_mode,
        );
        tokio::spawn(run_forwarding(
            forwarder,
            listener,
            bastion.clone(),
            cancel.clone(),
            state_tx,
            id.clone(),
        ));

        info!("Tunnel {} forwarding {} -> {}", id, local_addr, config.remote);

        Ok(Self {
            id,
            host_key_fingerprint: config.host_key.expected_fingerprint(),
            warning: config.host_key.warning(),
            auth_method: config.auth.name(),
            bastion: config.bastion,
            remote: config.remote,
            user: config.user,
            local_addr,
            retry_attempts,
            opened_at: Utc::now(),
            state: state_rx,
            cancel,
            handle: bastion,
        })
    }

    /// Stop accepting, close every forwarded connection and the bastion
    /// connection, and wait until all of it is released.
    pub async fn shutdown(&self) -> TunnelState {
        self.cancel.cancel();
        let mut state = self.state.clone();
        let finished = state.wait_for(TunnelState::is_finished).await.map(|s| s.clone());
        finished.unwrap_or_else(|_| self.state())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn local_host(&self) -> String {
        self.local_addr.ip().to_string()
    }

    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn bastion(&self) -> &Endpoint {
        &self.bastion
    }

    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn auth_method(&self) -> &'static str {
        self.auth_method
    }

    /// Whether the bastion's host key was checked against a pinned key.
    pub fn host_key_verified(&self) -> bool {
        self.host_key_fingerprint.is_some()
    }

    pub fn host_key_fingerprint(&self) -> Option<&str> {
        self.host_key_fingerprint.as_deref()
    }

    /// Security warning for the operator, set when the host key is not verified.
    pub fn warning(&self) -> Option<&'static str> {
        self.warning
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    /// Forwarding and still connected to the bastion.
    ///
    /// A lost bastion shows up here before the accept loop records the
    /// failure in [`state`](Self::state).
    pub fn is_forwarding(&self) -> bool {
        *self.state.borrow() == TunnelState::Forwarding && !self.handle.is_closed()
    }
}

async fn run_forwarding(
    forwarder: Forwarder,
    listener: TcpListener,
    bastion: Arc<BastionHandle>,
    cancel: CancellationToken,
    state: watch::Sender<TunnelState>,
    id: String,
) {
    let outcome = forwarder.run(listener, cancel).await;
    drop(forwarder);
    disconnect(&bastion, "tunnel closed").await;

    let final_state = match outcome {
        Ok(()) => {
            info!("Tunnel {} terminated", id);
            TunnelState::Terminated
        }
        Err(e) => {
            error!("Tunnel {} failed: {}", id, e);
            TunnelState::Failed(e.to_string())
        }
    };
    state.send_replace(final_state);
}

async fn disconnect(handle: &BastionHandle, reason: &str) {
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, reason, "en")
        .await
    {
        debug!("Error during bastion disconnect: {}", e);
    }
}
