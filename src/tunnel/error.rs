//! Error taxonomy for the tunnel engine.
//!
//! Every failure the engine can report maps to exactly one [`TunnelError`]
//! variant, and every variant names the stage it happened in, so callers can
//! tell "could not reach the bastion" apart from "the bastion rejected our
//! credentials" apart from "the bastion is not who we pinned".
//!
//! # Retry classification
//!
//! Only [`TunnelError::Connection`] is transient. Authentication failures are
//! never retried to avoid account lockouts, and host key mismatches are never
//! retried because the bastion's identity will not change between attempts.

use std::fmt;

use thiserror::Error;

/// Where inside the forwarding loop a [`TunnelError::Forwarding`] happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardStage {
    /// Opening the `direct-tcpip` channel to the remote destination.
    Dial,
    /// Copying bytes between a local client and its channel.
    Relay,
    /// Accepting on the local listener.
    Accept,
}

impl fmt::Display for ForwardStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardStage::Dial => write!(f, "dial"),
            ForwardStage::Relay => write!(f, "relay"),
            ForwardStage::Accept => write!(f, "accept"),
        }
    }
}

/// Errors produced while establishing or running a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The supplied settings cannot describe a tunnel (missing credential,
    /// empty required field, out of range port).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Key material could not be parsed.
    #[error("credential error: {0}")]
    Credential(String),

    /// The local listener (or the ephemeral port lookup) could not be bound.
    #[error("failed to bind local address {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The bastion could not be reached or the transport broke.
    #[error("could not reach bastion {addr}: {reason}")]
    Connection { addr: String, reason: String },

    /// The bastion refused the credentials.
    #[error("bastion {addr} rejected {method} authentication for user '{user}'")]
    Authentication {
        addr: String,
        user: String,
        method: &'static str,
    },

    /// The bastion presented a host key other than the pinned one.
    #[error(
        "bastion {addr} presented host key {presented}, which does not match the pinned key {expected}"
    )]
    HostKeyMismatch {
        addr: String,
        expected: String,
        presented: String,
    },

    /// A forwarded connection (or the accept loop) failed.
    #[error("forwarding to {remote} failed during {stage}: {reason}")]
    Forwarding {
        stage: ForwardStage,
        remote: String,
        reason: String,
    },
}

impl TunnelError {
    /// Short, stable name of the stage the error belongs to.
    pub fn stage(&self) -> &'static str {
        match self {
            TunnelError::Configuration(_) => "configuration",
            TunnelError::Credential(_) => "credential",
            TunnelError::Bind { .. } => "bind",
            TunnelError::Connection { .. } => "connection",
            TunnelError::Authentication { .. } => "authentication",
            TunnelError::HostKeyMismatch { .. } => "host_key",
            TunnelError::Forwarding { .. } => "forwarding",
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TunnelError::Connection { .. })
    }

    pub(crate) fn connection(addr: impl fmt::Display, reason: impl fmt::Display) -> Self {
        TunnelError::Connection {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn forwarding(
        stage: ForwardStage,
        remote: impl fmt::Display,
        reason: impl fmt::Display,
    ) -> Self {
        TunnelError::Forwarding {
            stage,
            remote: remote.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod retry_classification {
        use super::*;

        #[test]
        fn test_connection_is_retryable() {
            let err = TunnelError::connection("bastion:22", "Connection refused");
            assert!(err.is_retryable());
        }

        #[test]
        fn test_authentication_is_not_retryable() {
            let err = TunnelError::Authentication {
                addr: "bastion:22".to_string(),
                user: "alice".to_string(),
                method: "password",
            };
            assert!(!err.is_retryable());
        }

        #[test]
        fn test_host_key_mismatch_is_not_retryable() {
            let err = TunnelError::HostKeyMismatch {
                addr: "bastion:22".to_string(),
                expected: "SHA256:aaa".to_string(),
                presented: "SHA256:bbb".to_string(),
            };
            assert!(!err.is_retryable());
        }

        #[test]
        fn test_configuration_and_credential_are_not_retryable() {
            assert!(!TunnelError::Configuration("x".to_string()).is_retryable());
            assert!(!TunnelError::Credential("x".to_string()).is_retryable());
        }

        #[test]
        fn test_bind_is_not_retryable() {
            let err = TunnelError::Bind {
                addr: "127.0.0.1:0".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
            };
            assert!(!err.is_retryable());
        }
    }

    mod messages {
        use super::*;

        #[test]
        fn test_stages_are_distinct_for_establishment_failures() {
            let connection = TunnelError::connection("b:22", "timeout");
            let auth = TunnelError::Authentication {
                addr: "b:22".to_string(),
                user: "u".to_string(),
                method: "publickey",
            };
            let host_key = TunnelError::HostKeyMismatch {
                addr: "b:22".to_string(),
                expected: "e".to_string(),
                presented: "p".to_string(),
            };
            assert_eq!(connection.stage(), "connection");
            assert_eq!(auth.stage(), "authentication");
            assert_eq!(host_key.stage(), "host_key");
        }

        #[test]
        fn test_authentication_message_names_user_and_method() {
            let err = TunnelError::Authentication {
                addr: "example.com:22".to_string(),
                user: "alice".to_string(),
                method: "password",
            };
            let msg = err.to_string();
            assert!(msg.contains("example.com:22"));
            assert!(msg.contains("alice"));
            assert!(msg.contains("password"));
        }

        #[test]
        fn test_forwarding_message_names_stage() {
            let err = TunnelError::forwarding(ForwardStage::Dial, "db.internal:5432", "refused");
            assert_eq!(
                err.to_string(),
                "forwarding to db.internal:5432 failed during dial: refused"
            );
        }

        #[test]
        fn test_bind_exposes_io_source() {
            use std::error::Error as _;
            let err = TunnelError::Bind {
                addr: "127.0.0.1:1".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            };
            assert!(err.source().is_some());
        }
    }
}
