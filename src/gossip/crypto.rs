//! Per-peer RSA keyring and the packet-level crypto pipeline.
//!
//! The keyring maps identities to RSA public keys and is populated once at
//! startup from a directory of PEM files whose names are the hex identity.
//! A file is only accepted if `SHA-256(PKCS1(pubkey))` reproduces the
//! identity in its name; anything else aborts startup.
//!
//! Packets are signed with RSA-PKCS1v15 over SHA-256 and wrapped in hybrid
//! encryption: a fresh 32-byte AES-256 key plus 12-byte GCM nonce are
//! RSA-OAEP(SHA-256)-encrypted to the recipient and prepended to the
//! AES-GCM ciphertext of the signed packet.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::constants::{GCM_NONCE_SIZE, PACKET_KEY_SIZE};
use crate::gossip::node::Identity;

/// Errors on the packet crypto path. All of these drop the packet.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("unknown peer identity {0}")]
    UnknownPeer(Identity),
    #[error("signature verification failed")]
    BadSignature,
    #[error("packet decryption failed: {0}")]
    Decrypt(String),
    #[error("packet encryption failed: {0}")]
    Encrypt(String),
    #[error("signing failed: {0}")]
    Sign(rsa::Error),
}

/// Fatal errors while building the keyring at startup.
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    #[error("could not read hostkeys directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not read hostkey file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("hostkey file name {0:?} is not a hex-encoded identity")]
    MalformedFileName(String),
    #[error("could not parse hostkey {path}: {source}")]
    ParseKey {
        path: PathBuf,
        source: rsa::pkcs1::Error,
    },
    #[error("hostkey {path} does not match the identity in its file name")]
    KeyMismatch { path: PathBuf },
}

/// Container for all cryptographic state: the local private key, the derived
/// own identity, and the identity-to-public-key keyring.
pub struct Crypto {
    private_key: RsaPrivateKey,
    own_identity: Identity,
    keyring: HashMap<Identity, RsaPublicKey>,
}

impl Crypto {
    /// Build the crypto container by scanning `hostkeys_path` for peer keys.
    pub fn new(private_key: RsaPrivateKey, hostkeys_path: &Path) -> Result<Self, KeyringError> {
        let own_identity = identity_of(&private_key.to_public_key());
        let keyring = load_keyring(hostkeys_path)?;
        tracing::info!(
            peers = keyring.len(),
            identity = %own_identity,
            "Hostkey keyring loaded"
        );
        Ok(Crypto {
            private_key,
            own_identity,
            keyring,
        })
    }

    /// Our own identity, derived from the local public key.
    pub fn identity(&self) -> Identity {
        self.own_identity
    }

    /// Byte length of an RSA signature produced by the local key.
    ///
    /// All peers deploy the same key size, so this is also the length of the
    /// signature footer on inbound packets.
    pub fn signature_len(&self) -> usize {
        self.private_key.size()
    }

    /// Whether the peer with the given identity is in the keyring.
    pub fn knows_peer(&self, identity: &Identity) -> bool {
        self.keyring.contains_key(identity)
    }

    /// Sign data with RSA-PKCS1v15 over its SHA-256 digest.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let digest = crate::sha256(data);
        self.private_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(CryptoError::Sign)
    }

    /// Verify an RSA-PKCS1v15/SHA-256 signature against a peer's public key.
    pub fn verify(
        &self,
        data: &[u8],
        signature: &[u8],
        sender: &Identity,
    ) -> Result<(), CryptoError> {
        let public_key = self
            .keyring
            .get(sender)
            .ok_or(CryptoError::UnknownPeer(*sender))?;
        let digest = crate::sha256(data);
        public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    /// Encrypt a signed packet for a recipient.
    ///
    /// A random AES-256 key and GCM nonce are generated per packet,
    /// RSA-OAEP-wrapped with the recipient's public key, and prepended to the
    /// AES-GCM ciphertext of the packet.
    pub fn encrypt_packet(
        &self,
        plaintext: &[u8],
        recipient: &Identity,
    ) -> Result<Vec<u8>, CryptoError> {
        let public_key = self
            .keyring
            .get(recipient)
            .ok_or(CryptoError::UnknownPeer(*recipient))?;

        let mut key_and_nonce = [0u8; PACKET_KEY_SIZE + GCM_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut key_and_nonce);

        let cipher = Aes256Gcm::new_from_slice(&key_and_nonce[..PACKET_KEY_SIZE])
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        let body = cipher
            .encrypt(Nonce::from_slice(&key_and_nonce[PACKET_KEY_SIZE..]), plaintext)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;

        let mut ciphertext = public_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &key_and_nonce)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        ciphertext.extend_from_slice(&body);
        Ok(ciphertext)
    }

    /// Decrypt a packet addressed to us.
    ///
    /// The first `signature_len()` bytes carry the RSA-OAEP-wrapped AES key
    /// and nonce; the remainder is the AES-GCM ciphertext of the signed
    /// packet.
    pub fn decrypt_packet(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key_len = self.private_key.size();
        if ciphertext.len() <= key_len {
            return Err(CryptoError::Decrypt(format!(
                "ciphertext too short: {} bytes",
                ciphertext.len()
            )));
        }

        let key_and_nonce = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext[..key_len])
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        if key_and_nonce.len() != PACKET_KEY_SIZE + GCM_NONCE_SIZE {
            return Err(CryptoError::Decrypt(format!(
                "packet key preamble has {} bytes",
                key_and_nonce.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_and_nonce[..PACKET_KEY_SIZE])
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        cipher
            .decrypt(
                Nonce::from_slice(&key_and_nonce[PACKET_KEY_SIZE..]),
                &ciphertext[key_len..],
            )
            .map_err(|_| CryptoError::Decrypt("AES-GCM authentication failed".into()))
    }
}

/// Derive a peer identity from an RSA public key: SHA-256 over PKCS#1 DER.
pub fn identity_of(public_key: &RsaPublicKey) -> Identity {
    let der = public_key
        .to_pkcs1_der()
        .expect("PKCS#1 encoding of a valid RSA key cannot fail");
    Identity::from(crate::sha256(der.as_bytes()))
}

fn load_keyring(hostkeys_path: &Path) -> Result<HashMap<Identity, RsaPublicKey>, KeyringError> {
    let entries = std::fs::read_dir(hostkeys_path).map_err(|source| KeyringError::ReadDir {
        path: hostkeys_path.to_path_buf(),
        source,
    })?;

    let mut keyring = HashMap::new();
    for entry in entries {
        let entry = entry.map_err(|source| KeyringError::ReadDir {
            path: hostkeys_path.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy().into_owned();
        let identity = hex::decode(&file_name)
            .ok()
            .and_then(|raw| Identity::from_bytes(&raw).ok())
            .ok_or_else(|| KeyringError::MalformedFileName(file_name.clone()))?;

        let pem = std::fs::read_to_string(&path).map_err(|source| KeyringError::ReadFile {
            path: path.clone(),
            source,
        })?;
        let public_key =
            RsaPublicKey::from_pkcs1_pem(&pem).map_err(|source| KeyringError::ParseKey {
                path: path.clone(),
                source,
            })?;

        if identity_of(&public_key) != identity {
            return Err(KeyringError::KeyMismatch { path });
        }
        keyring.insert(identity, public_key);
    }
    Ok(keyring)
}
