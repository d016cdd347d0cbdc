//! Rotating symmetric key ring and the reversible identifier codec built on it.
//! Keys live one-per-file in a private directory; tokens are AES-256-GCM.

pub mod codec;
pub mod fs;
pub mod key_ring;

pub use codec::IdentifierCodec;
pub use key_ring::{KeyRing, KeyRingConfig, KeyRingError, KeySummary};
