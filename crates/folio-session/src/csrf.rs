use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

const TOKEN_BYTES: usize = 24;

/// Fresh 48-character hex token.
pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time comparison; differing lengths never match.
pub(crate) fn tokens_match(expected: &str, candidate: &str) -> bool {
    bool::from(expected.as_bytes().ct_eq(candidate.as_bytes()))
}
