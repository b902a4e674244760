//! Ephemeral local port allocation.
//!
//! The allocator binds `localhost:0`, reads back the port the OS picked and
//! closes the listener again. The port is free at the moment it is returned
//! but it is not reserved: another caller or process may grab it before the
//! session binds it. The session reports that case as a
//! [`TunnelError::Bind`] like any other bind failure.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::debug;

use super::error::TunnelError;

const PROBE_ADDR: &str = "localhost:0";

/// Find a local address whose port is currently unused.
pub async fn allocate_local_addr() -> Result<SocketAddr, TunnelError> {
    let bind_error = |source| TunnelError::Bind {
        addr: PROBE_ADDR.to_string(),
        source,
    };

    let listener = TcpListener::bind(PROBE_ADDR).await.map_err(bind_error)?;
    let addr = listener.local_addr().map_err(bind_error)?;
    drop(listener);

    debug!("Allocated local address {}", addr);
    Ok(addr)
}
