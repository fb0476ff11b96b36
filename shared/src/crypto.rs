//! Key material and the per-connection cipher.
//!
//! The server owns a long-lived X25519 key pair ([`ServerIdentity`]). A client
//! picks a random [`SessionKey`] and seals it for the server in a
//! [`KeyEnvelope`]: an ephemeral X25519 exchange with the server's public key
//! is stretched through HKDF-SHA256 into a wrapping key, and the session key
//! is encrypted under it with ChaCha20-Poly1305. Only the holder of the
//! server's secret can open the envelope.
//!
//! After the handshake both ends run a [`SessionCipher`]: ChaCha20-Poly1305
//! under the session key, with a per-direction counter as the nonce. Frames
//! therefore have to be decrypted in the order they were sent, and a replayed
//! or dropped frame fails authentication.

use crate::error::{DecryptError, HandshakeError, KeyLoadError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

/// Length of X25519 keys and of the session key.
pub const KEY_LEN: usize = 32;

/// Length of the ChaCha20-Poly1305 nonce.
pub const NONCE_LEN: usize = 12;

/// Length of the Poly1305 authentication tag.
pub const TAG_LEN: usize = 16;

const ENVELOPE_INFO: &[u8] = b"realmgate/v1/session-key-envelope";

/// The server's long-lived key pair. Loaded once at startup.
pub struct ServerIdentity {
    secret: StaticSecret,
    public: PublicKey,
}

impl ServerIdentity {
    pub fn generate() -> Self {
        Self::from_secret_bytes(random_bytes())
    }

    pub fn from_secret_bytes(bytes: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reads a base64 encoded secret key from `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, KeyLoadError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| KeyLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let bytes = STANDARD
            .decode(text.trim())
            .map_err(|e| KeyLoadError::Encoding {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let secret: [u8; KEY_LEN] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| KeyLoadError::Length {
                    path: path.to_path_buf(),
                    expected: KEY_LEN,
                    actual: bytes.len(),
                })?;

        Ok(Self::from_secret_bytes(secret))
    }

    /// Writes the secret key to `path` in the format [`ServerIdentity::load`] reads.
    pub fn save(&self, path: impl AsRef<Path>) -> io::Result<()> {
        fs::write(path, format!("{}\n", STANDARD.encode(self.secret.to_bytes())))
    }

    pub fn public_key(&self) -> [u8; KEY_LEN] {
        self.public.to_bytes()
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.public.to_bytes())
    }

    /// Opens an envelope sealed for this identity.
    pub fn open(&self, envelope: &KeyEnvelope) -> Result<SessionKey, HandshakeError> {
        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(envelope.ephemeral_public));
        let wrap = derive_wrapping_key(
            shared.as_bytes(),
            &envelope.ephemeral_public,
            &self.public.to_bytes(),
        )?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&wrap));
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                envelope.sealed_key.as_slice(),
            )
            .map_err(|_| HandshakeError::SignatureMismatch)?;

        let bytes: [u8; KEY_LEN] = plain
            .as_slice()
            .try_into()
            .map_err(|_| HandshakeError::Malformed(format!("session key of {} bytes", plain.len())))?;

        if bytes.iter().all(|b| *b == 0) {
            return Err(HandshakeError::Malformed("all-zero session key".to_string()));
        }

        Ok(SessionKey(bytes))
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Symmetric key for one connection. Zeroed on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }

    /// Seals this key for the server whose public key is `server_public`.
    pub fn seal(&self, server_public: &[u8; KEY_LEN]) -> Result<KeyEnvelope, HandshakeError> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = PublicKey::from(&ephemeral).to_bytes();
        let shared = ephemeral.diffie_hellman(&PublicKey::from(*server_public));
        let wrap = derive_wrapping_key(shared.as_bytes(), &ephemeral_public, server_public)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&wrap));
        let sealed_key = cipher
            .encrypt(Nonce::from_slice(&nonce), self.0.as_slice())
            .map_err(|_| HandshakeError::Malformed("failed to seal session key".to_string()))?;

        Ok(KeyEnvelope {
            ephemeral_public,
            nonce,
            sealed_key,
        })
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.fill(0);
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({})", self.fingerprint())
    }
}

/// A session key sealed for the server's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEnvelope {
    pub ephemeral_public: [u8; KEY_LEN],
    pub nonce: [u8; NONCE_LEN],
    pub sealed_key: Vec<u8>,
}

/// Which end of the connection a cipher belongs to. Each direction has its
/// own nonce space so the two ends never encrypt under the same nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn send_direction(self) -> u8 {
        match self {
            Role::Client => 0x01,
            Role::Server => 0x02,
        }
    }

    fn recv_direction(self) -> u8 {
        match self {
            Role::Client => 0x02,
            Role::Server => 0x01,
        }
    }
}

/// Authenticated encryption for one side of a connection.
pub struct SessionCipher {
    cipher: ChaCha20Poly1305,
    role: Role,
    fingerprint: String,
    send_counter: u64,
    recv_counter: u64,
}

impl SessionCipher {
    /// Consumes the key. The cipher keeps the only remaining copy.
    pub fn new(key: SessionKey, role: Role) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key.0)),
            role,
            fingerprint: key.fingerprint(),
            send_counter: 0,
            recv_counter: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn key_fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        let nonce = nonce_for(self.role.send_direction(), self.send_counter);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| DecryptError::Authentication {
                counter: self.send_counter,
            })?;
        self.send_counter = self
            .send_counter
            .checked_add(1)
            .ok_or(DecryptError::CounterExhausted)?;
        Ok(ciphertext)
    }

    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, DecryptError> {
        if ciphertext.len() < TAG_LEN {
            return Err(DecryptError::TooShort {
                len: ciphertext.len(),
            });
        }

        let nonce = nonce_for(self.role.recv_direction(), self.recv_counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| DecryptError::Authentication {
                counter: self.recv_counter,
            })?;
        self.recv_counter = self
            .recv_counter
            .checked_add(1)
            .ok_or(DecryptError::CounterExhausted)?;
        Ok(plaintext)
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCipher")
            .field("role", &self.role)
            .field("key", &self.fingerprint)
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish()
    }
}

/// Short hex digest used to identify keys in logs without revealing them.
pub fn fingerprint(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn nonce_for(direction: u8, counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[0] = direction;
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn derive_wrapping_key(
    shared: &[u8; KEY_LEN],
    ephemeral_public: &[u8; KEY_LEN],
    server_public: &[u8; KEY_LEN],
) -> Result<[u8; KEY_LEN], HandshakeError> {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(ephemeral_public);
    salt[KEY_LEN..].copy_from_slice(server_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(ENVELOPE_INFO, &mut okm)
        .map_err(|_| HandshakeError::Malformed("key derivation failed".to_string()))?;
    Ok(okm)
}

fn random_bytes() -> [u8; KEY_LEN] {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
