//! Reversible, tamper-evident masking of integer ids.
//!
//! Token layout before encoding: `nonce(12) || tag(16) || ciphertext`, where
//! the plaintext is the decimal form of the id. Encoded as URL-safe base64
//! without padding.

use std::sync::Arc;

use aes_gcm::{
    aead::{AeadCore, AeadInPlace, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tracing::warn;

use crate::key_ring::{KeyRing, KeyRingError};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = NONCE_LEN + TAG_LEN;

/// Masks ids under the newest key of a shared [`KeyRing`] and unmasks them
/// under any retained key.
#[derive(Debug, Clone)]
pub struct IdentifierCodec {
    ring: Arc<KeyRing>,
}

impl IdentifierCodec {
    pub fn new(ring: Arc<KeyRing>) -> Self {
        Self { ring }
    }

    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.ring
    }

    /// Encrypt `id` under the newest key with a fresh random nonce. Two calls
    /// for the same id yield different tokens.
    pub fn mask(&self, id: u64) -> Result<String, KeyRingError> {
        let keys = self.ring.read()?;
        let key = keys
            .first()
            .ok_or_else(|| KeyRingError::Empty(self.ring.dir().to_path_buf()))?;

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut buffer = id.to_string().into_bytes();
        let tag = key
            .cipher()
            .encrypt_in_place_detached(&nonce, b"", &mut buffer)
            .map_err(|e| KeyRingError::Cipher(e.to_string()))?;

        let mut raw = Vec::with_capacity(HEADER_LEN + buffer.len());
        raw.extend_from_slice(nonce.as_slice());
        raw.extend_from_slice(tag.as_slice());
        raw.extend_from_slice(&buffer);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Recover the id from `token`, trying keys newest to oldest. Any
    /// malformed, tampered, or expired token yields `None`. When no key
    /// matches and another process changed the key directory, the ring is
    /// reloaded and the token tried once more.
    pub fn unmask(&self, token: &str) -> Option<u64> {
        let raw = URL_SAFE_NO_PAD.decode(token).ok()?;
        if raw.len() < HEADER_LEN {
            return None;
        }
        let (nonce, rest) = raw.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        match self.open(nonce, tag, ciphertext) {
            Opened::NoKey => {}
            opened => return opened.id(),
        }
        match self.ring.reload_if_changed() {
            Ok(true) => self.open(nonce, tag, ciphertext).id(),
            Ok(false) => None,
            Err(err) => {
                warn!(error = %err, "key ring reload failed, rejecting token");
                None
            }
        }
    }

    fn open(&self, nonce: &[u8], tag: &[u8], ciphertext: &[u8]) -> Opened {
        let nonce = Nonce::from_slice(nonce);
        let tag = Tag::from_slice(tag);
        let keys = match self.ring.read() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "key ring unavailable, rejecting token");
                return Opened::Rejected;
            }
        };

        for key in keys.iter() {
            let mut buffer = ciphertext.to_vec();
            if key
                .cipher()
                .decrypt_in_place_detached(nonce, b"", &mut buffer, tag)
                .is_err()
            {
                continue;
            }
            // Authenticated under this key; nothing older can also match.
            return match parse_id(&buffer) {
                Some(id) => Opened::Id(id),
                None => {
                    warn!(key = %key.id(), "token authenticated but plaintext is not an id");
                    Opened::Rejected
                }
            };
        }
        Opened::NoKey
    }
}

enum Opened {
    Id(u64),
    /// No retained key authenticates the token.
    NoKey,
    Rejected,
}

impl Opened {
    fn id(self) -> Option<u64> {
        match self {
            Opened::Id(id) => Some(id),
            Opened::NoKey | Opened::Rejected => None,
        }
    }
}

fn parse_id(plaintext: &[u8]) -> Option<u64> {
    if plaintext.is_empty() || !plaintext.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(plaintext).ok()?.parse().ok()
}
