//! Peer identities and nodes.
//!
//! An [`Identity`] is the SHA-256 hash of a peer's RSA public key in PKCS#1
//! DER form. Identities are compared byte-wise; the hex form only appears in
//! human contexts (hostkey file names, logs).

use std::fmt;

use crate::constants::IDENTITY_SIZE;

/// Errors constructing identities and nodes.
#[derive(Clone, Debug, thiserror::Error)]
pub enum NodeError {
    #[error("identity must be {IDENTITY_SIZE} bytes, got {0}")]
    InvalidIdentityLength(usize),
}

/// A peer identity: SHA-256 over the peer's PKCS#1-encoded RSA public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity([u8; IDENTITY_SIZE]);

impl Identity {
    /// Construct an identity from raw bytes, rejecting wrong lengths.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NodeError> {
        let raw: [u8; IDENTITY_SIZE] = bytes
            .try_into()
            .map_err(|_| NodeError::InvalidIdentityLength(bytes.len()))?;
        Ok(Identity(raw))
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_SIZE] {
        &self.0
    }
}

impl From<crate::Hash> for Identity {
    fn from(hash: crate::Hash) -> Self {
        Identity(hash)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", hex::encode(self.0))
    }
}

/// A peer within the gossip overlay.
///
/// The address format is opaque to the protocol ("host:port"); protocol-level
/// equality is by identity, but view deduplication distinguishes addresses so
/// a re-homed peer is not conflated with its stale entry.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Node {
    pub identity: Identity,
    pub address: String,
}

impl Node {
    pub fn new(identity: Identity, address: impl Into<String>) -> Self {
        Node {
            identity,
            address: address.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.address)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({}@{})", self.identity, self.address)
    }
}
