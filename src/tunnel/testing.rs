//! Test fixtures: an embedded bastion and TCP echo destinations.
//!
//! [`TestBastion`] is a real russh server on a random loopback port with a
//! freshly generated Ed25519 host key. It authenticates one user by password
//! and, optionally, by public key, and serves `direct-tcpip` channels by
//! connecting to the requested host and copying bytes both ways.
//!
//! russh runs each server session on its own task, so every client socket is
//! relayed through an in-memory pipe that the bastion owns. Dropping the
//! bastion (or calling [`TestBastion::kill`]) cuts those sockets, which the
//! client sees as a lost transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key::LineEnding;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::{TunnelOptions, TunnelSettings};

pub(crate) const TEST_USER: &str = "alice";
pub(crate) const TEST_PASSWORD: &str = "secret";

/// Generate an Ed25519 key pair as (OpenSSH private key, OpenSSH public key line).
pub(crate) fn generate_client_key() -> (String, String) {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("generate key");
    let private = key
        .to_openssh(LineEnding::LF)
        .expect("encode private key")
        .as_str()
        .to_owned();
    let public = key.public_key().to_openssh().expect("encode public key");
    (private, public)
}

struct Credentials {
    user: String,
    password: String,
    authorized_key: Option<PublicKey>,
}

/// An in-process SSH bastion.
pub(crate) struct TestBastion {
    pub addr: SocketAddr,
    /// OpenSSH line of the bastion's host key.
    pub host_public_key: String,
    cancel: CancellationToken,
}

impl TestBastion {
    /// Start a bastion accepting `alice`/`secret`.
    pub(crate) async fn start() -> Self {
        Self::start_with_key(None).await
    }

    /// Start a bastion that also accepts `alice` with the given public key line.
    pub(crate) async fn start_with_key(authorized_key: Option<&str>) -> Self {
        let host_key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("host key");
        let host_public_key = host_key.public_key().to_openssh().expect("encode host key");

        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            keys: vec![host_key],
            ..Default::default()
        });

        let credentials = Arc::new(Credentials {
            user: TEST_USER.to_string(),
            password: TEST_PASSWORD.to_string(),
            authorized_key: authorized_key
                .map(|line| PublicKey::from_openssh(line).expect("authorized key")),
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind bastion");
        let addr = listener.local_addr().expect("bastion addr");
        let cancel = CancellationToken::new();

        let server_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = server_cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let handler = BastionHandler {
                            credentials: credentials.clone(),
                        };
                        let config = config.clone();
                        let (server_side, pipe_side) = tokio::io::duplex(64 * 1024);
                        tokio::spawn(async move {
                            if let Ok(session) = server::run_stream(config, server_side, handler).await {
                                let _ = session.await;
                            }
                        });
                        tokio::spawn(pump(stream, pipe_side, server_cancel.clone()));
                    }
                }
            }
        });

        Self {
            addr,
            host_public_key,
            cancel,
        }
    }

    /// Tunnel settings pointing at `remote` through this bastion with password auth.
    pub(crate) fn password_settings(&self, remote: SocketAddr) -> TunnelSettings {
        TunnelSettings {
            bastion_host: self.addr.ip().to_string(),
            bastion_port: self.addr.port(),
            bastion_user: TEST_USER.to_string(),
            bastion_host_key: None,
            bastion_password: Some(TEST_PASSWORD.to_string()),
            bastion_private_key: None,
            remote_host: remote.ip().to_string(),
            remote_port: remote.port(),
        }
    }
}

impl TestBastion {
    /// Stop accepting and cut every live client connection.
    pub(crate) fn kill(&self) {
        self.cancel.cancel();
    }
}

/// Copy between a client socket and its server session until either side
/// closes or the bastion is killed. Dropping the socket is what the client sees.
async fn pump(mut socket: TcpStream, mut pipe: DuplexStream, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::io::copy_bidirectional(&mut socket, &mut pipe) => {}
    }
}

impl Drop for TestBastion {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Options that fail fast instead of retrying.
pub(crate) fn fast_options() -> TunnelOptions {
    TunnelOptions {
        connect_timeout: Duration::from_secs(5),
        max_retries: 0,
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

struct BastionHandler {
    credentials: Arc<Credentials>,
}

fn reject() -> Auth {
    Auth::Reject {
        proceed_with_methods: None,
        partial_success: false,
    }
}

impl server::Handler for BastionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == self.credentials.user && password == self.credentials.password {
            Ok(Auth::Accept)
        } else {
            Ok(reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match &self.credentials.authorized_key {
            Some(expected)
                if user == self.credentials.user
                    && expected.key_data() == public_key.key_data() =>
            {
                Ok(Auth::Accept)
            }
            _ => Ok(reject()),
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };

        match TcpStream::connect((host_to_connect, port)).await {
            Ok(mut remote) => {
                tokio::spawn(async move {
                    let mut stream = channel.into_stream();
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
                    let _ = stream.shutdown().await;
                    let _ = remote.shutdown().await;
                });
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

/// A remote destination that echoes every byte back.
pub(crate) struct EchoServer {
    pub addr: SocketAddr,
    /// Receives the peer address of every connection once it has closed.
    pub closed: mpsc::UnboundedReceiver<SocketAddr>,
}

impl EchoServer {
    pub(crate) async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("bind echo");
        let addr = listener.local_addr().expect("echo addr");
        let (closed_tx, closed) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut stream, peer)) = listener.accept().await {
                let closed_tx = closed_tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = stream.shutdown().await;
                    let _ = closed_tx.send(peer);
                });
            }
        });

        Self { addr, closed }
    }
}

/// Write `payload` to `stream` and read the same number of bytes back.
pub(crate) async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.expect("write");
    let mut received = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut received))
        .await
        .expect("echo timed out")
        .expect("read");
    received
}
