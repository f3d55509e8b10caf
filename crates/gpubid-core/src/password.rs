//! Password hashing and verification using PBKDF2-HMAC-SHA256
//!
//! Salts and derived keys are stored hex-encoded in the document; all
//! comparisons of secret material are constant time.

use pbkdf2::pbkdf2_hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{SchedError, SchedResult};

/// PBKDF2 iteration count
pub const PASSWORD_ITERATIONS: u32 = 150_000;

const SALT_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Hash a password with a fresh random salt. Returns `(salt_hex, hash_hex)`.
pub fn hash_password(password: &str) -> (String, String) {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let salt_hex = hex::encode(salt);
    let hash_hex = derive(password, &salt);
    (salt_hex, hash_hex)
}

/// Hash a password against a stored hex salt
pub fn hash_with_salt(password: &str, salt_hex: &str) -> SchedResult<String> {
    let salt = hex::decode(salt_hex)
        .map_err(|_| SchedError::Internal("Corrupt password salt".to_string()))?;
    Ok(derive(password, &salt))
}

/// Verify a password against a stored hex salt and hash
pub fn verify_password(password: &str, salt_hex: &str, hash_hex: &str) -> bool {
    match hash_with_salt(password, salt_hex) {
        Ok(candidate) => constant_time_str_eq(&candidate, hash_hex),
        Err(_) => false,
    }
}

/// Constant-time string comparison for secret material
pub fn constant_time_str_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn derive(password: &str, salt: &[u8]) -> String {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PASSWORD_ITERATIONS, &mut key);
    hex::encode(key)
}
