//! Node identity keys.
//!
//! Every node holds a static X25519 keypair. The private key is stored
//! base64-encoded under the configuration base directory (mode 0600) and
//! generated on first start; peers learn each other's public keys from
//! the configuration tree. Key material and the PID file are the only
//! state that survives a restart.

use crate::error::{Error, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};

/// Wire/log length of a public-key fingerprint.
const FINGERPRINT_LEN: usize = 16;

/// A node's X25519 keypair.
#[derive(Clone)]
pub struct Keypair {
    private_key: StaticSecret,
    public_key: PublicKey,
}

impl Keypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let private_key = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public_key = PublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// Rebuild a keypair from raw private key bytes.
    pub fn from_private_key_bytes(bytes: [u8; 32]) -> Self {
        let private_key = StaticSecret::from(bytes);
        let public_key = PublicKey::from(&private_key);
        Self {
            private_key,
            public_key,
        }
    }

    /// The private half.
    pub fn private_key(&self) -> &StaticSecret {
        &self.private_key
    }

    /// The public half.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Public key as base64 (config-file form).
    pub fn public_key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.public_key.as_bytes())
    }

    /// Fingerprint of the public key (wire/log form).
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public_key)
    }

    /// Load a keypair from `path` (base64 private key).
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read key file {}: {e}", path.display())))?;
        let bytes = decode_key(contents.trim())?;
        Ok(Self::from_private_key_bytes(bytes))
    }

    /// Save the private key to `path`, mode 0600.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(self.private_key.to_bytes());
        std::fs::write(path, encoded).map_err(|e| {
            Error::Config(format!("Failed to write key file {}: {e}", path.display()))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(
                |e| Error::Config(format!("Failed to set key file permissions: {e}")),
            )?;
        }

        Ok(())
    }

    /// Load the key file, generating and saving a fresh keypair when the
    /// file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            log::info!("Generating new identity key: {}", path.display());
            let keypair = Self::generate();
            keypair.save(path)?;
            Ok(keypair)
        }
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the private half.
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

/// Parse a peer public key from base64 (config-file form).
pub fn parse_public_key(encoded: &str) -> Result<PublicKey> {
    Ok(PublicKey::from(decode_key(encoded)?))
}

/// Fingerprint of a public key: SHA-256, base64, truncated.
pub fn fingerprint(key: &PublicKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(digest);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::Crypto(format!("Invalid base64 key: {e}")))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| Error::Crypto(format!("Invalid key length: expected 32 bytes, got {len}")))
}
