//! Password digests as stored in the `auth.users` table.
use sha2::{Digest, Sha256};

/// Lowercase hex sha256 of `password`.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Check `password` against a stored hex digest of either case.
pub fn verify_password(stored: &str, password: &str) -> bool {
    let Ok(stored) = hex::decode(stored) else {
        return false;
    };
    let actual = Sha256::digest(password.as_bytes());
    // no early exit on the first differing byte
    stored.len() == actual.len()
        && stored
            .iter()
            .zip(actual.iter())
            .fold(0u8, |diff, (a, b)| diff | (a ^ b))
            == 0
}
