//! Password hashing and verification.
//!
//! The hashing boundary is pluggable so tests can swap in a cheap
//! deterministic comparator; production uses Argon2id with a random
//! per-hash salt, stored in PHC string format so parameters travel with
//! the hash.

use anyhow::{anyhow, Result};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

use crate::error::Error;

/// One-way password hashing scheme.
///
/// `verify` returns `Ok(false)` on a mismatch; an `Err` means the stored
/// hash was malformed or hashing itself failed, never "wrong password".
pub trait PasswordScheme: Send + Sync {
    fn hash(&self, plaintext: &str) -> Result<String>;
    fn verify(&self, hash: &str, plaintext: &str) -> Result<bool>;
}

/// Production scheme: Argon2id with default parameters.
#[derive(Clone, Copy, Debug, Default)]
pub struct Argon2Scheme;

impl PasswordScheme for Argon2Scheme {
    fn hash(&self, plaintext: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|err| anyhow!("failed to hash password: {err}"))?;
        Ok(hash.to_string())
    }

    fn verify(&self, hash: &str, plaintext: &str) -> Result<bool> {
        let parsed =
            PasswordHash::new(hash).map_err(|err| anyhow!("malformed password hash: {err}"))?;
        match Argon2::default().verify_password(plaintext.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(err) => Err(anyhow!("failed to verify password: {err}")),
        }
    }
}

/// Check a plaintext against a stored hash, mapping a mismatch to
/// [`Error::InvalidPassword`].
pub(crate) fn validate_password(
    scheme: &dyn PasswordScheme,
    hash: &str,
    plaintext: &str,
) -> Result<(), Error> {
    if scheme.verify(hash, plaintext)? {
        Ok(())
    } else {
        Err(Error::InvalidPassword)
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_password, Argon2Scheme, PasswordScheme};
    use crate::error::Error;

    #[test]
    fn hash_and_verify_round_trip() {
        let scheme = Argon2Scheme;
        let hash = scheme.hash("correct-horse-battery-staple").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(scheme.verify(&hash, "correct-horse-battery-staple").unwrap());
        assert!(!scheme.verify(&hash, "wrong").unwrap());
    }

    #[test]
    fn hashes_are_salted() {
        let scheme = Argon2Scheme;
        let first = scheme.hash("hunter2").unwrap();
        let second = scheme.hash("hunter2").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_hash_is_an_error_not_a_mismatch() {
        let scheme = Argon2Scheme;
        assert!(scheme.verify("not-a-phc-string", "hunter2").is_err());
    }

    #[test]
    fn validate_password_maps_mismatch() {
        let scheme = Argon2Scheme;
        let hash = scheme.hash("hunter2").unwrap();
        assert!(validate_password(&scheme, &hash, "hunter2").is_ok());
        assert!(matches!(
            validate_password(&scheme, &hash, "wrong"),
            Err(Error::InvalidPassword)
        ));
    }
}
