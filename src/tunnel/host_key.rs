//! Bastion host key verification policy.
//!
//! A configured host key pins the bastion's identity: the transport handshake
//! is rejected unless the bastion presents exactly that key. Without one the
//! policy is [`HostKeyPolicy::AcceptAny`], the equivalent of
//! `StrictHostKeyChecking=no`. That is an explicit, documented trust
//! weakening, so it is logged as a warning and reported back to the operator
//! rather than silently ignored.
//!
//! Accepted formats for the configured key:
//!
//! - an OpenSSH public key line: `ssh-ed25519 AAAA... [comment]`
//! - a bare base64 key blob: `AAAA...`
//! - a `known_hosts` entry: `bastion.example.com ssh-ed25519 AAAA...`

use russh::keys::{self, HashAlg, PublicKey};
use tracing::{info, warn};

use super::config::non_empty;
use super::error::TunnelError;

/// Warning surfaced to the operator when the bastion is not verified.
pub const ACCEPT_ANY_WARNING: &str = "bastion_host_key is not set: the bastion's identity is NOT verified and the tunnel is open to man-in-the-middle attacks";

/// How the bastion's host key is checked during the handshake.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Only this exact key is accepted.
    Pinned(PublicKey),
    /// Any key is accepted.
    AcceptAny,
}

impl HostKeyPolicy {
    /// Build the policy from the optional configured host key.
    pub fn from_config(host_key: Option<&str>) -> Result<Self, TunnelError> {
        match non_empty(host_key) {
            Some(text) => {
                let key = parse_host_key(text.trim())?;
                info!(
                    "Pinning bastion host key {} ({})",
                    fingerprint(&key),
                    key.algorithm().as_str()
                );
                Ok(HostKeyPolicy::Pinned(key))
            }
            None => {
                warn!("{}", ACCEPT_ANY_WARNING);
                Ok(HostKeyPolicy::AcceptAny)
            }
        }
    }

    /// Whether the presented key satisfies this policy.
    ///
    /// Only key material is compared; comments are ignored.
    pub fn verify(&self, presented: &PublicKey) -> bool {
        match self {
            HostKeyPolicy::Pinned(expected) => expected.key_data() == presented.key_data(),
            HostKeyPolicy::AcceptAny => true,
        }
    }

    pub fn is_pinned(&self) -> bool {
        matches!(self, HostKeyPolicy::Pinned(_))
    }

    /// SHA-256 fingerprint of the pinned key, if any.
    pub fn expected_fingerprint(&self) -> Option<String> {
        match self {
            HostKeyPolicy::Pinned(key) => Some(fingerprint(key)),
            HostKeyPolicy::AcceptAny => None,
        }
    }

    /// Operator-facing warning for this policy, if it weakens trust.
    pub fn warning(&self) -> Option<&'static str> {
        match self {
            HostKeyPolicy::Pinned(_) => None,
            HostKeyPolicy::AcceptAny => Some(ACCEPT_ANY_WARNING),
        }
    }
}

pub(crate) fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

fn parse_host_key(text: &str) -> Result<PublicKey, TunnelError> {
    let openssh_error = match PublicKey::from_openssh(text) {
        Ok(key) => return Ok(key),
        Err(e) => e,
    };

    let fields: Vec<&str> = text.split_whitespace().collect();

    // Bare base64 blob
    if let [blob] = fields.as_slice()
        && let Ok(key) = keys::parse_public_key_base64(blob)
    {
        return Ok(key);
    }

    // known_hosts entry: host pattern first
    if fields.len() >= 3
        && let Ok(key) = PublicKey::from_openssh(&fields[1..].join(" "))
    {
        return Ok(key);
    }

    Err(TunnelError::Credential(format!(
        "error parsing bastion host public key: {}",
        openssh_error
    )))
}
