//! Local port forwarding through the bastion.
//!
//! This module provides SSH local forwarding using the `direct-tcpip`
//! channel type defined in RFC 4254.
//!
//! # Architecture
//!
//! 1. **Accept loop**: [`Forwarder::run`] accepts on the session's local
//!    listener. Every accepted client gets its own task, tracked so shutdown
//!    can wait until every pair has released its sockets.
//!
//! 2. **Connection pair**: each task opens a `direct-tcpip` channel to the
//!    remote destination over the shared bastion connection and relays bytes
//!    in both directions:
//!    - Local client -> SSH channel -> Remote destination
//!    - Remote destination -> SSH channel -> Local client
//!
//!    Each direction shuts down its destination when its source ends. The
//!    first direction to finish tears the whole pair down.
//!
//! # Fault isolation
//!
//! A relay error only closes its own pair. A failed channel open only drops
//! its own client in [`ForwardMode::Isolated`]; in [`ForwardMode::Strict`]
//! it fails the whole tunnel. A closed bastion connection fails the tunnel in
//! both modes since no later client could be served either. The accept loop
//! checks the bastion every [`BASTION_CHECK_INTERVAL`], so an idle tunnel
//! notices the loss without waiting for a client.
//!
//! Running out of file descriptors while accepting backs off for
//! [`ACCEPT_BACKOFF`] and keeps the listener open.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::client::BastionHandle;
use super::config::Endpoint;
use super::error::{ForwardStage, TunnelError};

/// How often the accept loop checks that the bastion connection is alive.
pub(crate) const BASTION_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after an accept failed for lack of descriptors or memory.
pub(crate) const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How a failed remote dial affects the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardMode {
    /// Drop only the client whose channel could not be opened.
    #[default]
    Isolated,
    /// Fail the whole tunnel on the first channel open failure.
    Strict,
}

/// How a connection pair ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PairEnd {
    /// The local client closed first after sending `bytes_up` bytes.
    LocalClosed { bytes_up: u64 },
    /// The remote side closed first after sending `bytes_down` bytes.
    RemoteClosed { bytes_down: u64 },
    /// The tunnel shut down.
    Cancelled,
}

/// Accepts local clients and forwards each one to the remote destination.
pub(crate) struct Forwarder {
    bastion: Arc<BastionHandle>,
    bastion_addr: Endpoint,
    remote: Endpoint,
    mode: ForwardMode,
}

impl Forwarder {
    pub(crate) fn new(
        bastion: Arc<BastionHandle>,
        bastion_addr: Endpoint,
        remote: Endpoint,
        mode: ForwardMode,
    ) -> Self {
        Self {
            bastion,
            bastion_addr,
            remote,
            mode,
        }
    }

    /// Run the accept loop until `cancel` fires or the loop cannot continue.
    ///
    /// The listener is dropped and every live pair is torn down and awaited
    /// before this returns. `Ok(())` means the loop was cancelled.
    pub(crate) async fn run(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), TunnelError> {
        let tracker = TaskTracker::new();
        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel::<TunnelError>();
        let mut bastion_check = tokio::time::interval(BASTION_CHECK_INTERVAL);
        bastion_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Ok(local_addr) = listener.local_addr() {
            debug!("Port forwarding active on {} -> {}", local_addr, self.remote);
        }

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                Some(fault) = fault_rx.recv() => break Err(fault),
                _ = bastion_check.tick() => {
                    if self.bastion.is_closed() {
                        warn!("Bastion connection to {} lost", self.bastion_addr);
                        break Err(TunnelError::connection(
                            &self.bastion_addr,
                            "bastion connection lost",
                        ));
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((local_stream, peer)) => {
                        debug!("New connection from {} to forwarded port", peer);
                        self.spawn_pair(&tracker, local_stream, peer, cancel.child_token(), fault_tx.clone());
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        debug!("Ignoring aborted incoming connection: {}", e);
                    }
                    Err(e) if is_resource_exhausted(&e) => {
                        warn!(
                            "Accept for {} hit a resource limit, retrying in {:?}: {}",
                            self.remote, ACCEPT_BACKOFF, e
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => break Ok(()),
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                    Err(e) => {
                        break Err(TunnelError::forwarding(ForwardStage::Accept, &self.remote, e));
                    }
                },
            }
        };

        drop(listener);
        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        debug!("All forwarded connections to {} closed", self.remote);

        outcome
    }

    fn spawn_pair(
        &self,
        tracker: &TaskTracker,
        local_stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
        fault_tx: mpsc::UnboundedSender<TunnelError>,
    ) {
        let bastion = self.bastion.clone();
        let remote = self.remote.clone();
        let mode = self.mode;

        tracker.spawn(async move {
            match forward_connection(&bastion, &remote, local_stream, peer, &cancel).await {
                Ok(PairEnd::LocalClosed { bytes_up }) => {
                    debug!("Client {} closed after sending {} bytes", peer, bytes_up)
                }
                Ok(PairEnd::RemoteClosed { bytes_down }) => {
                    debug!("Remote closed connection from {} after {} bytes", peer, bytes_down)
                }
                Ok(PairEnd::Cancelled) => debug!("Forwarded connection from {} cancelled", peer),
                Err(e @ TunnelError::Forwarding { stage: ForwardStage::Dial, .. }) => {
                    if bastion.is_closed() {
                        warn!("Bastion connection lost while serving {}: {}", peer, e);
                        let _ = fault_tx.send(e);
                    } else if mode == ForwardMode::Strict {
                        let _ = fault_tx.send(e);
                    } else {
                        warn!("Dropping client {}: {}", peer, e);
                    }
                }
                Err(e) => debug!("Forwarded connection from {} ended with error: {}", peer, e),
            }
        });
    }
}

/// Open a channel for one accepted client and relay until the pair closes.
async fn forward_connection(
    bastion: &BastionHandle,
    remote: &Endpoint,
    local_stream: TcpStream,
    peer: SocketAddr,
    cancel: &CancellationToken,
) -> Result<PairEnd, TunnelError> {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return Ok(PairEnd::Cancelled),
        opened = bastion.channel_open_direct_tcpip(
            remote.host.as_str(),
            u32::from(remote.port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        ) => opened,
    };
    let channel = opened.map_err(|e| TunnelError::forwarding(ForwardStage::Dial, remote, e))?;

    if let Err(e) = local_stream.set_nodelay(true) {
        debug!("Could not disable Nagle on connection from {}: {}", peer, e);
    }

    relay(local_stream, channel.into_stream(), cancel)
        .await
        .map_err(|e| TunnelError::forwarding(ForwardStage::Relay, remote, e))
}

/// Copy bytes between `local` and `remote` until either side closes.
///
/// Both write halves are shut down before returning, so closing one side
/// closes the pair.
pub(crate) async fn relay<L, R>(
    local: L,
    remote: R,
    cancel: &CancellationToken,
) -> io::Result<PairEnd>
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let end = tokio::select! {
        _ = cancel.cancelled() => Ok(PairEnd::Cancelled),
        result = pipe(&mut local_read, &mut remote_write) => {
            result.map(|bytes_up| PairEnd::LocalClosed { bytes_up })
        }
        result = pipe(&mut remote_read, &mut local_write) => {
            result.map(|bytes_down| PairEnd::RemoteClosed { bytes_down })
        }
    };

    // Already shut down on the direction that finished; errors are expected
    let _ = remote_write.shutdown().await;
    let _ = local_write.shutdown().await;

    end
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = tokio::io::copy(reader, writer).await?;
    writer.shutdown().await?;
    Ok(copied)
}

/// Accept errors that concern one incoming connection, not the listener.
fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Accept errors caused by a temporary lack of descriptors or memory.
fn is_resource_exhausted(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }

    #[cfg(unix)]
    if matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    ) {
        return true;
    }

    false
}
