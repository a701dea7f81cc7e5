//! PBKDF2-HMAC-SHA256 password hashing for user accounts.
//!
//! Hashes are stored as `pbkdf2-sha256$<iterations>$<salt b64>$<hash b64>` so
//! the iteration count can be raised later without invalidating old rows.

use std::num::NonZeroU32;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::warn;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const ITERATIONS: u32 = 100_000;

static ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// Hash a password with a fresh random salt.
///
/// Returns None only if the system RNG fails.
pub fn hash_password(password: &str) -> Option<String> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new().fill(&mut salt).ok()?;
    let iterations = NonZeroU32::new(ITERATIONS)?;
    Some(hash_with_salt(password, &salt, iterations))
}

fn hash_with_salt(password: &str, salt: &[u8], iterations: NonZeroU32) -> String {
    let mut out = [0u8; HASH_LEN];
    pbkdf2::derive(ALGORITHM, iterations, salt, password.as_bytes(), &mut out);
    format!(
        "{SCHEME}${}${}${}",
        iterations,
        BASE64.encode(salt),
        BASE64.encode(out)
    )
}

/// Constant-time check of `password` against a stored hash.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let (Some(scheme), Some(iterations), Some(salt), Some(hash), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        warn!(
            component = "crypto",
            event = "crypto.hash_malformed",
            "Stored password hash is malformed"
        );
        return false;
    };
    if scheme != SCHEME {
        return false;
    }

    let Some(iterations) = iterations.parse::<u32>().ok().and_then(NonZeroU32::new) else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (BASE64.decode(salt), BASE64.decode(hash)) else {
        return false;
    };

    pbkdf2::verify(ALGORITHM, iterations, &salt, password.as_bytes(), &hash).is_ok()
}
