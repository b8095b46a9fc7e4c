//! Password hashing for snapshot credentials.
//!
//! Registered devices are protected by a password chosen at activation
//! time; only its argon2 hash is retained, in PHC string format.

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand_core::OsRng;

/// Hashes the given clear password with a generated salt.
pub fn hash_password(pass: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(pass.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Tells whether the clear password `pass` corresponds to the stored hash.
/// An unparseable hash never verifies.
pub fn check_password(hash: &str, pass: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(pass.as_bytes(), &parsed_hash)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_trip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(check_password(&hash, "hunter2"));
        assert!(!check_password(&hash, "hunter3"));
        assert!(!check_password("not a phc string", "hunter2"));
    }
}
