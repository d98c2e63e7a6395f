//! Cryptographic collaborators for the meta-protocol handshake.
//!
//! The daemon core treats the primitives as black boxes with three
//! contracts: seal a fresh session key to a peer's static public key
//! (METAKEY), encrypt/decrypt short blobs under a session key
//! (CHALLENGE), and digest a challenge nonce (CHAL_REPLY). Sealing uses
//! ephemeral X25519 agreement, HKDF-SHA256 and ChaCha20-Poly1305; the
//! digest is SHA-256.

use crate::error::{Error, Result};
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Session key length.
pub const SESSION_KEY_LEN: usize = 32;

/// Challenge nonce length.
pub const CHALLENGE_LEN: usize = 32;

/// AEAD nonce length (prepended to every ciphertext).
const NONCE_LEN: usize = 12;

/// HKDF context string binding derived keys to this protocol step.
const METAKEY_INFO: &[u8] = b"tincd-metakey-v1";

/// A symmetric session key negotiated during the handshake.
#[derive(Clone)]
pub struct SessionKey(pub [u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Generate a fresh random session key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// A session key sealed to a peer's static public key.
pub struct SealedKey {
    /// Ephemeral public half used for agreement.
    pub ephemeral: [u8; 32],
    /// AEAD nonce + ciphertext of the session key.
    pub ciphertext: Vec<u8>,
}

/// Seal `key` so only the holder of the private half of `peer` can
/// recover it.
pub fn seal_session_key(peer: &PublicKey, key: &SessionKey) -> Result<SealedKey> {
    let ephemeral_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(peer);

    let wrap_key = derive_wrap_key(shared.as_bytes())?;
    let ciphertext = aead_encrypt(&wrap_key, &key.0)?;

    Ok(SealedKey {
        ephemeral: *ephemeral_public.as_bytes(),
        ciphertext,
    })
}

/// Recover a session key sealed to our static key.
pub fn open_session_key(
    ours: &StaticSecret,
    ephemeral: &[u8; 32],
    ciphertext: &[u8],
) -> Result<SessionKey> {
    let shared = ours.diffie_hellman(&PublicKey::from(*ephemeral));
    let wrap_key = derive_wrap_key(shared.as_bytes())?;
    let plain = aead_decrypt(&wrap_key, ciphertext)?;
    let len = plain.len();
    let bytes: [u8; SESSION_KEY_LEN] = plain
        .try_into()
        .map_err(|_| Error::Crypto(format!("Sealed key has wrong length {len}")))?;
    Ok(SessionKey(bytes))
}

/// Symmetric cipher bound to one session key.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}

impl SessionCipher {
    /// Build a cipher from a negotiated session key.
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
        }
    }

    /// Encrypt `plain`; output is nonce + ciphertext.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut out = nonce_bytes.to_vec();
        let ciphertext = self
            .cipher
            .encrypt(nonce, plain)
            .map_err(|_| Error::Crypto("AEAD encryption failed".to_string()))?;
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a nonce + ciphertext blob.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() <= NONCE_LEN {
            return Err(Error::Crypto(format!(
                "Ciphertext too short: {} bytes",
                data.len()
            )));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Crypto("AEAD decryption failed".to_string()))
    }
}

/// Generate a fresh challenge nonce.
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut nonce = [0u8; CHALLENGE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Digest of a challenge nonce, as sent in CHAL_REPLY.
pub fn challenge_digest(nonce: &[u8]) -> [u8; 32] {
    Sha256::digest(nonce).into()
}

fn derive_wrap_key(shared: &[u8]) -> Result<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 32];
    hk.expand(METAKEY_INFO, &mut okm)
        .map_err(|_| Error::Crypto("HKDF expansion failed".to_string()))?;
    Ok(okm)
}

fn aead_encrypt(key: &[u8; 32], plain: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let mut out = nonce_bytes.to_vec();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plain)
        .map_err(|_| Error::Crypto("AEAD encryption failed".to_string()))?;
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aead_decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() <= NONCE_LEN {
        return Err(Error::Crypto(format!(
            "Ciphertext too short: {} bytes",
            data.len()
        )));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| Error::Crypto("AEAD decryption failed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;

    #[test]
    fn test_seal_open_session_key() {
        let peer = Keypair::generate();
        let key = SessionKey::generate();

        let sealed = seal_session_key(&peer.public_key(), &key).expect("seal");
        let opened =
            open_session_key(peer.private_key(), &sealed.ephemeral, &sealed.ciphertext)
                .expect("open");
        assert_eq!(opened.0, key.0);
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let peer = Keypair::generate();
        let stranger = Keypair::generate();
        let key = SessionKey::generate();

        let sealed = seal_session_key(&peer.public_key(), &key).expect("seal");
        let result =
            open_session_key(stranger.private_key(), &sealed.ephemeral, &sealed.ciphertext);
        assert!(result.is_err());
    }

    #[test]
    fn test_session_cipher_roundtrip() {
        let key = SessionKey::generate();
        let cipher = SessionCipher::new(&key);

        let blob = cipher.encrypt(b"challenge nonce").expect("encrypt");
        assert_ne!(&blob[NONCE_LEN..], b"challenge nonce");
        let plain = cipher.decrypt(&blob).expect("decrypt");
        assert_eq!(plain, b"challenge nonce");
    }

    #[test]
    fn test_session_cipher_rejects_tampering() {
        let key = SessionKey::generate();
        let cipher = SessionCipher::new(&key);

        let mut blob = cipher.encrypt(b"challenge nonce").expect("encrypt");
        let last = blob.len() - 1;
        blob[last] ^= 0xff;
        assert!(cipher.decrypt(&blob).is_err());
    }

    #[test]
    fn test_challenge_digest_matches_reference() {
        let nonce = generate_challenge();
        let d1 = challenge_digest(&nonce);
        let d2 = challenge_digest(&nonce);
        assert_eq!(d1, d2);

        let other = generate_challenge();
        assert_ne!(challenge_digest(&other), d1);
    }
}
