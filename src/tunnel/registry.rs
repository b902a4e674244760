//! Process-wide registry of open tunnels.
//!
//! Tunnels are keyed by their identity string, so opening the same
//! bastion/remote/user triple twice returns the tunnel that is already
//! forwarding instead of allocating a second local port.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use super::config::{TunnelConfig, TunnelOptions, TunnelSettings};
use super::error::TunnelError;
use super::session::{TunnelSession, TunnelState};

/// Result of [`TunnelRegistry::open`].
pub struct OpenedTunnel {
    pub session: Arc<TunnelSession>,
    /// The tunnel was already forwarding and was returned as is.
    pub reused: bool,
}

/// DashMap-backed map from tunnel identity to session.
pub struct TunnelRegistry {
    tunnels: DashMap<String, Arc<TunnelSession>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            tunnels: DashMap::new(),
        }
    }

    /// Open a tunnel, or return the live one with the same identity.
    ///
    /// A failed or terminated entry with the same identity is replaced.
    pub async fn open(
        &self,
        settings: &TunnelSettings,
        options: TunnelOptions,
    ) -> Result<OpenedTunnel, TunnelError> {
        let config = TunnelConfig::from_settings(settings)?;
        let id = config.tunnel_id();

        if let Some(session) = self.live(&id) {
            info!("Reusing tunnel {} on {}", id, session.local_addr());
            return Ok(OpenedTunnel {
                session,
                reused: true,
            });
        }

        let session = Arc::new(TunnelSession::start(config, options).await?);

        // Another caller may have opened the same tunnel while we were dialing
        let winner = match self.tunnels.entry(id) {
            Entry::Occupied(entry) if entry.get().is_forwarding() => Some(entry.get().clone()),
            Entry::Occupied(mut entry) => {
                let stale = entry.insert(session.clone());
                debug!("Replaced tunnel {} in state {}", stale.id(), stale.state());
                None
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
                None
            }
        };

        match winner {
            Some(existing) => {
                session.shutdown().await;
                Ok(OpenedTunnel {
                    session: existing,
                    reused: true,
                })
            }
            None => Ok(OpenedTunnel {
                session,
                reused: false,
            }),
        }
    }

    /// The forwarding tunnel with this identity, if any.
    pub fn live(&self, id: &str) -> Option<Arc<TunnelSession>> {
        self.tunnels
            .get(id)
            .filter(|entry| entry.is_forwarding())
            .map(|entry| entry.value().clone())
    }

    pub fn get(&self, id: &str) -> Option<Arc<TunnelSession>> {
        self.tunnels.get(id).map(|entry| entry.value().clone())
    }

    /// Every registered tunnel, including failed ones not yet closed.
    pub fn list(&self) -> Vec<Arc<TunnelSession>> {
        let mut tunnels: Vec<_> = self.tunnels.iter().map(|e| e.value().clone()).collect();
        tunnels.sort_by_key(|session| session.opened_at());
        tunnels
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Shut a tunnel down and remove it. Returns its final state.
    pub async fn close(&self, id: &str) -> Option<TunnelState> {
        let (_, session) = self.tunnels.remove(id)?;
        let state = session.shutdown().await;
        info!("Closed tunnel {} ({})", id, state);
        Some(state)
    }

    /// Shut every tunnel down concurrently. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self.tunnels.iter().map(|e| e.key().clone()).collect();
        let sessions: Vec<_> = ids
            .iter()
            .filter_map(|id| self.tunnels.remove(id).map(|(_, session)| session))
            .collect();

        let count = sessions.len();
        join_all(sessions.iter().map(|session| session.shutdown())).await;
        if count > 0 {
            info!("Closed {} tunnel(s)", count);
        }
        count
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global tunnel registry.
pub static TUNNELS: Lazy<TunnelRegistry> = Lazy::new(TunnelRegistry::new);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::net::TcpStream;

    use crate::tunnel::forward::ForwardMode;
    use crate::tunnel::port::allocate_local_addr;
    use crate::tunnel::testing::{EchoServer, TestBastion, fast_options, round_trip};

    #[tokio::test]
    async fn test_open_registers_tunnel_under_identity() {
        let registry = TunnelRegistry::new();
        let bastion = TestBastion::start().await;
        let echo = EchoServer::start().await;
        let settings = bastion.password_settings(echo.addr);

        let opened = registry.open(&settings, fast_options()).await.unwrap();
        assert!(!opened.reused);

        let expected = TunnelConfig::from_settings(&settings).unwrap().tunnel_id();
        assert_eq!(opened.session.id(), expected);
        assert_eq!(registry.len(), 1);
        assert!(registry.live(&expected).is_some());

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_reopening_live_tunnel_reuses_it() {
        let registry = TunnelRegistry::new();
        let bastion = TestBastion::start().await;
        let echo = EchoServer::start().await;
        let settings = bastion.password_settings(echo.addr);

        let first = registry.open(&settings, fast_options()).await.unwrap();
        let second = registry.open(&settings, fast_options()).await.unwrap();

        assert!(second.reused);
        assert_eq!(first.session.local_addr(), second.session.local_addr());
        assert_eq!(registry.len(), 1);

        let mut client = TcpStream::connect(second.session.local_addr()).await.unwrap();
        assert_eq!(round_trip(&mut client, b"same").await, b"same");

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_invalid_settings_register_nothing() {
        let registry = TunnelRegistry::new();
        let settings = TunnelSettings {
            bastion_host: "bastion.example.com".to_string(),
            bastion_port: 22,
            bastion_user: "alice".to_string(),
            remote_host: "db.internal".to_string(),
            remote_port: 5432,
            ..Default::default()
        };

        let err = registry.open(&settings, fast_options()).await.err().unwrap();
        assert!(matches!(err, TunnelError::Configuration(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_close_shuts_down_and_removes() {
        let registry = TunnelRegistry::new();
        let bastion = TestBastion::start().await;
        let echo = EchoServer::start().await;
        let opened = registry
            .open(&bastion.password_settings(echo.addr), fast_options())
            .await
            .unwrap();
        let id = opened.session.id().to_string();

        assert_eq!(registry.close(&id).await, Some(TunnelState::Terminated));
        assert!(registry.get(&id).is_none());
        assert!(TcpStream::connect(opened.session.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_unknown_tunnel() {
        let registry = TunnelRegistry::new();
        assert_eq!(registry.close("missing").await, None);
    }

    #[tokio::test]
    async fn test_failed_tunnel_is_replaced() {
        let registry = TunnelRegistry::new();
        let bastion = TestBastion::start().await;
        let unused = allocate_local_addr().await.unwrap();
        let settings = bastion.password_settings(unused);
        let strict = TunnelOptions {
            forward_mode: ForwardMode::Strict,
            ..fast_options()
        };

        let first = registry.open(&settings, strict.clone()).await.unwrap();
        let _client = TcpStream::connect(first.session.local_addr()).await.unwrap();
        let mut state = first.session.subscribe();
        tokio::time::timeout(Duration::from_secs(10), state.wait_for(TunnelState::is_finished))
            .await
            .expect("strict tunnel did not fail")
            .unwrap();
        assert!(registry.live(first.session.id()).is_none());

        let second = registry.open(&settings, strict).await.unwrap();
        assert!(!second.reused);
        assert!(second.session.is_forwarding());
        assert_eq!(registry.len(), 1);

        registry.close_all().await;
    }

    #[tokio::test]
    async fn test_tunnel_with_lost_bastion_is_not_live() {
        let registry = TunnelRegistry::new();
        let bastion = TestBastion::start().await;
        let echo = EchoServer::start().await;
        let settings = bastion.password_settings(echo.addr);

        let opened = registry.open(&settings, fast_options()).await.unwrap();
        let id = opened.session.id().to_string();
        bastion.kill();

        let mut state = opened.session.subscribe();
        tokio::time::timeout(Duration::from_secs(10), state.wait_for(TunnelState::is_finished))
            .await
            .expect("tunnel did not notice the lost bastion")
            .unwrap();

        assert!(registry.live(&id).is_none());
        assert!(registry.get(&id).unwrap().state().is_finished());

        // The bastion is gone, so reopening dials again instead of reusing
        let err = registry.open(&settings, fast_options()).await.err().unwrap();
        assert!(matches!(err, TunnelError::Connection { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let registry = TunnelRegistry::new();
        let bastion = TestBastion::start().await;
        let first = EchoServer::start().await;
        let second = EchoServer::start().await;

        registry
            .open(&bastion.password_settings(first.addr), fast_options())
            .await
            .unwrap();
        registry
            .open(&bastion.password_settings(second.addr), fast_options())
            .await
            .unwrap();
        assert_eq!(registry.list().len(), 2);

        assert_eq!(registry.close_all().await, 2);
        assert!(registry.is_empty());
    }
}
