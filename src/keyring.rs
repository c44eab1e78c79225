// Authenticated datagram framing
//
// Every datagram on the gossip mesh is protected with AES-256-GCM under a
// rotating ring of symmetric keys. The head of the ring is the active
// encryption key; all keys are candidates for decryption, so operators can
// rotate keys with zero downtime: add the new key on every node, wait one
// dissemination period, then retire the old one.
//
// Envelope layout (bit-exact): `IV(16) || TAG(16) || CIPHERTEXT`.
// Anything shorter than 32 bytes fails verification outright.

use crate::error::{GossipError, Result};
use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use std::fmt;

/// Key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Envelope IV length in bytes
pub const IV_LEN: usize = 16;

/// GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;

/// Fixed per-datagram envelope overhead
pub const ENVELOPE_OVERHEAD: usize = IV_LEN + TAG_LEN;

/// AES-256-GCM parameterized with the 16-byte IV the envelope carries
type EnvelopeCipher = AesGcm<Aes256, U16>;

/// Ordered ring of symmetric keys plus the cluster-wide AAD.
///
/// A `Keyring` is an immutable snapshot: `add` returns a new ring rather
/// than mutating in place, so a ring shared across tasks stays consistent
/// while a rotation publishes the replacement.
#[derive(Clone)]
pub struct Keyring {
    keys: Vec<[u8; KEY_LEN]>,
    aad: Vec<u8>,
}

impl Keyring {
    /// Create a keyring from raw keys, newest first.
    ///
    /// Requires at least one key; every key must be exactly 32 bytes.
    pub fn new(keys: Vec<Vec<u8>>, aad: Vec<u8>) -> Result<Self> {
        if keys.is_empty() {
            return Err(GossipError::EmptyKeyring);
        }
        let mut fixed = Vec::with_capacity(keys.len());
        for key in keys {
            let key: [u8; KEY_LEN] =
                key.try_into().map_err(|bad: Vec<u8>| GossipError::BadKeyLength {
                    expected: KEY_LEN,
                    actual: bad.len(),
                })?;
            fixed.push(key);
        }
        Ok(Self { keys: fixed, aad })
    }

    /// Create a keyring from hex-encoded keys, newest first
    pub fn from_hex_keys(hex_keys: &[&str], aad: Vec<u8>) -> Result<Self> {
        let mut keys = Vec::with_capacity(hex_keys.len());
        for raw in hex_keys {
            let key = hex::decode(raw)
                .map_err(|e| GossipError::Configuration(format!("Invalid hex key: {}", e)))?;
            keys.push(key);
        }
        Self::new(keys, aad)
    }

    /// Return a new ring with `key` prepended as the active encryption key.
    /// All previous keys remain valid for decryption.
    pub fn add(&self, key: Vec<u8>) -> Result<Self> {
        let key: [u8; KEY_LEN] =
            key.try_into().map_err(|bad: Vec<u8>| GossipError::BadKeyLength {
                expected: KEY_LEN,
                actual: bad.len(),
            })?;
        let mut keys = Vec::with_capacity(self.keys.len() + 1);
        keys.push(key);
        keys.extend_from_slice(&self.keys);
        Ok(Self {
            keys,
            aad: self.aad.clone(),
        })
    }

    /// Number of keys in the ring
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// A keyring is never empty; kept for API completeness
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The associated authenticated data bound to every envelope
    pub fn aad(&self) -> &[u8] {
        &self.aad
    }

    /// Encrypt `plaintext` under the head key with a fresh random IV.
    ///
    /// Output is `IV(16) || TAG(16) || CIPHERTEXT(len(plaintext))`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = EnvelopeCipher::new_from_slice(&self.keys[0])
            .map_err(|e| GossipError::Encryption(format!("Failed to create cipher: {}", e)))?;

        // IVs come from the OS CSPRNG, never the shuffling RNG
        let iv = EnvelopeCipher::generate_nonce(&mut OsRng);

        let sealed = cipher
            .encrypt(
                &iv,
                Payload {
                    msg: plaintext,
                    aad: &self.aad,
                },
            )
            .map_err(|e| GossipError::Encryption(format!("Encryption failed: {}", e)))?;

        // The aead crate appends the tag; the envelope wants it up front
        let split = sealed.len() - TAG_LEN;
        let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed[split..]);
        out.extend_from_slice(&sealed[..split]);
        Ok(out)
    }

    /// Decrypt an envelope by trial decryption against each key in ring
    /// order. Returns the first successful plaintext, or
    /// `FailedVerification` when no key authenticates the datagram.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < ENVELOPE_OVERHEAD {
            return Err(GossipError::FailedVerification);
        }

        let iv = Nonce::<U16>::from_slice(&data[..IV_LEN]);
        let tag = &data[IV_LEN..ENVELOPE_OVERHEAD];
        let body = &data[ENVELOPE_OVERHEAD..];

        let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);

        for key in &self.keys {
            let cipher = EnvelopeCipher::new_from_slice(key)
                .map_err(|e| GossipError::Encryption(format!("Failed to create cipher: {}", e)))?;
            if let Ok(plaintext) = cipher.decrypt(
                iv,
                Payload {
                    msg: &sealed,
                    aad: &self.aad,
                },
            ) {
                return Ok(plaintext);
            }
        }

        Err(GossipError::FailedVerification)
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs
        f.debug_struct("Keyring")
            .field("keys", &self.keys.len())
            .field("aad_len", &self.aad.len())
            .finish()
    }
}
