//! Login handshake envelope.
//!
//! Each login session owns an ephemeral X25519 key pair. The symmetric key
//! for a message is HKDF-SHA256 over the X25519 shared secret, salted with
//! both public keys (server first), and the payload is sealed with
//! ChaCha20-Poly1305. Both directions use the same key, so a payload only
//! opens for the exact key pair it was sealed for.
//!
//! Public keys travel as unpadded base64url of the 32 raw bytes.

use base64ct::{Base64UrlUnpadded, Encoding};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, Result};

const KDF_INFO: &[u8] = b"portunus login envelope v1";
const AAD: &[u8] = b"login-envelope:v1";

/// A client's X25519 public key as supplied at login prologue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientPublicKey(PublicKey);

impl ClientPublicKey {
    /// # Errors
    /// Returns `Validation` when the value is not 32 base64url-encoded bytes.
    pub fn parse(encoded: &str) -> Result<Self> {
        decode_key(encoded).map(|bytes| Self(PublicKey::from(bytes)))
    }

    #[must_use]
    pub fn encode(&self) -> String {
        Base64UrlUnpadded::encode_string(self.0.as_bytes())
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = Base64UrlUnpadded::decode_vec(encoded.trim())
        .map_err(|_| Error::validation("malformed public key"))?;
    bytes
        .try_into()
        .map_err(|_| Error::validation("public key must be 32 bytes"))
}

/// Derive the per-pair symmetric key. The salt is always ordered
/// server-then-client so both sides agree.
fn derive(
    secret: &StaticSecret,
    server_public: &PublicKey,
    client_public: &PublicKey,
    peer: &PublicKey,
) -> Result<[u8; 32]> {
    // A reflected key would make the envelope self-keyed.
    if bool::from(server_public.as_bytes().ct_eq(client_public.as_bytes())) {
        return Err(Error::Decryption);
    }
    let shared = secret.diffie_hellman(peer);
    if !shared.was_contributory() {
        return Err(Error::Decryption);
    }

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(server_public.as_bytes());
    salt[32..].copy_from_slice(client_public.as_bytes());

    let mut key = [0u8; 32];
    Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes())
        .expand(KDF_INFO, &mut key)
        .map_err(|_| Error::Decryption)?;
    Ok(key)
}

/// The server half of a login session's key material.
#[derive(Clone)]
pub struct ServerKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ServerKeyPair {
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Restore a pair persisted with [`Self::export_secret`].
    ///
    /// # Errors
    /// Returns `Validation` if the encoded secret is malformed.
    pub fn from_secret(encoded: &str) -> Result<Self> {
        let secret = StaticSecret::from(decode_key(encoded)?);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    #[must_use]
    pub fn export_secret(&self) -> String {
        Base64UrlUnpadded::encode_string(self.secret.as_bytes())
    }

    #[must_use]
    pub fn public_key(&self) -> String {
        Base64UrlUnpadded::encode_string(self.public.as_bytes())
    }

    /// Seal a response for `client`.
    ///
    /// # Errors
    /// Returns `Decryption` if no key can be derived for this pair.
    pub fn encrypt(&self, client: &ClientPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = derive(&self.secret, &self.public, &client.0, &client.0)?;
        super::seal(&key, plaintext, AAD)
    }

    /// Open a request sealed by `client`.
    ///
    /// # Errors
    /// Returns `Decryption` for a mismatched pair or corrupted ciphertext.
    pub fn decrypt(&self, client: &ClientPublicKey, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = derive(&self.secret, &self.public, &client.0, &client.0)?;
        super::open(&key, ciphertext, AAD)
    }
}

impl std::fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("public", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// The browser side of the handshake; used by tests and tooling.
pub struct ClientKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl ClientKeyPair {
    #[must_use]
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    #[must_use]
    pub fn public_key(&self) -> ClientPublicKey {
        ClientPublicKey(self.public)
    }

    /// # Errors
    /// Returns `Validation` for a malformed server key, `Decryption` if no key derives.
    pub fn encrypt(&self, server_public: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let server = PublicKey::from(decode_key(server_public)?);
        let key = derive(&self.secret, &server, &self.public, &server)?;
        super::seal(&key, plaintext, AAD)
    }

    /// # Errors
    /// Returns `Decryption` for a mismatched pair or corrupted ciphertext.
    pub fn decrypt(&self, server_public: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let server = PublicKey::from(decode_key(server_public)?);
        let key = derive(&self.secret, &server, &self.public, &server)?;
        super::open(&key, ciphertext, AAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_in_both_directions() -> anyhow::Result<()> {
        let server = ServerKeyPair::generate();
        let client = ClientKeyPair::generate();

        let request = client.encrypt(&server.public_key(), b"{\"password\":\"x\"}")?;
        assert_eq!(
            server.decrypt(&client.public_key(), &request)?,
            b"{\"password\":\"x\"}"
        );

        let response = server.encrypt(&client.public_key(), b"{\"result\":\"OK\"}")?;
        assert_eq!(
            client.decrypt(&server.public_key(), &response)?,
            b"{\"result\":\"OK\"}"
        );
        Ok(())
    }

    #[test]
    fn empty_payload_roundtrips() -> anyhow::Result<()> {
        let server = ServerKeyPair::generate();
        let client = ClientKeyPair::generate();
        let sealed = server.encrypt(&client.public_key(), b"")?;
        assert!(server.decrypt(&client.public_key(), &sealed)?.is_empty());
        Ok(())
    }

    #[test]
    fn mismatched_pair_fails() -> anyhow::Result<()> {
        let server = ServerKeyPair::generate();
        let client = ClientKeyPair::generate();
        let intruder = ClientKeyPair::generate();

        let sealed = client.encrypt(&server.public_key(), b"payload")?;
        assert!(matches!(
            server.decrypt(&intruder.public_key(), &sealed),
            Err(Error::Decryption)
        ));

        let other_server = ServerKeyPair::generate();
        assert!(matches!(
            other_server.decrypt(&client.public_key(), &sealed),
            Err(Error::Decryption)
        ));
        Ok(())
    }

    #[test]
    fn corrupted_ciphertext_fails() -> anyhow::Result<()> {
        let server = ServerKeyPair::generate();
        let client = ClientKeyPair::generate();
        let mut sealed = client.encrypt(&server.public_key(), b"payload")?;
        sealed[14] ^= 0xff;
        assert!(matches!(
            server.decrypt(&client.public_key(), &sealed),
            Err(Error::Decryption)
        ));
        Ok(())
    }

    #[test]
    fn reflected_key_is_rejected() -> anyhow::Result<()> {
        let server = ServerKeyPair::generate();
        let reflected = ClientPublicKey::parse(&server.public_key())?;
        assert!(matches!(
            server.encrypt(&reflected, b"x"),
            Err(Error::Decryption)
        ));
        Ok(())
    }

    #[test]
    fn exported_secret_restores_the_pair() -> anyhow::Result<()> {
        let server = ServerKeyPair::generate();
        let restored = ServerKeyPair::from_secret(&server.export_secret())?;
        assert_eq!(server.public_key(), restored.public_key());

        let client = ClientKeyPair::generate();
        let sealed = client.encrypt(&server.public_key(), b"hello")?;
        assert_eq!(restored.decrypt(&client.public_key(), &sealed)?, b"hello");
        Ok(())
    }

    #[test]
    fn malformed_public_key_is_a_validation_error() {
        assert!(matches!(
            ClientPublicKey::parse("not base64!"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            ClientPublicKey::parse("AAAA"),
            Err(Error::Validation(_))
        ));
    }
}
