//! Symmetric sealing shared by the login envelope and secrets at rest.
//!
//! Sealed data is `nonce (12 bytes) || ciphertext`, ChaCha20-Poly1305 with
//! caller-supplied associated data.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretBox};
use std::sync::Arc;

pub mod envelope;

pub use envelope::{ClientPublicKey, ServerKeyPair};

const NONCE_LEN: usize = 12;

/// Seal `plaintext` under a 32-byte key.
///
/// # Errors
/// Returns `Validation` if the cipher rejects the input.
pub fn seal(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> crate::Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| crate::Error::validation("encryption failure"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open data produced by [`seal`].
///
/// # Errors
/// Returns `Decryption` for a short input, a wrong key, wrong AAD or tampering.
pub fn open(key: &[u8; 32], sealed: &[u8], aad: &[u8]) -> crate::Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(crate::Error::Decryption);
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(
            Nonce::from_slice(nonce_bytes),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| crate::Error::Decryption)
}

/// Server-side key for secrets stored in documents (TOTP seeds).
#[derive(Clone)]
pub struct SecretKey(Arc<SecretBox<[u8; 32]>>);

impl SecretKey {
    /// # Errors
    /// Returns `Validation` unless exactly 32 bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| crate::Error::validation("secret key must be 32 bytes"))?;
        Ok(Self(Arc::new(SecretBox::new(Box::new(key)))))
    }

    /// A random key; secrets sealed with it do not survive a restart.
    #[must_use]
    pub fn ephemeral() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(Arc::new(SecretBox::new(Box::new(key))))
    }

    /// # Errors
    /// See [`seal`].
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> crate::Result<Vec<u8>> {
        seal(self.0.expose_secret(), plaintext, aad)
    }

    /// # Errors
    /// See [`open`].
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> crate::Result<Vec<u8>> {
        open(self.0.expose_secret(), sealed, aad)
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}
