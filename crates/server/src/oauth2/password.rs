//! Password and client-secret hashing.
//!
//! Uses Argon2id; the same verifier covers user passwords and registered
//! client secrets since both are stored as PHC strings.

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};

/// Hash a secret using Argon2id.
///
/// Returns the PHC-formatted hash string suitable for storage.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a secret against a stored hash.
///
/// Returns true if the secret matches. Malformed hashes verify as false
/// rather than erroring.
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed_hash) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let password = "my-secure-password-123!";
        let hash = hash_password(password).expect("Failed to hash password");

        assert!(hash.starts_with("$argon2"));
        assert!(verify_password(password, &hash));
        assert!(!verify_password("wrong-password", &hash));
    }

    #[test]
    fn hashes_carry_unique_salts() {
        let password = "same-password";
        let hash1 = hash_password(password).expect("Failed to hash");
        let hash2 = hash_password(password).expect("Failed to hash");

        assert_ne!(hash1, hash2);
        assert!(verify_password(password, &hash1));
        assert!(verify_password(password, &hash2));
    }

    #[test]
    fn invalid_hash_format_verifies_false() {
        assert!(!verify_password("password", "not-a-valid-hash"));
        assert!(!verify_password("password", ""));
        assert!(!verify_password("password", "$invalid$hash$format"));
    }
}
