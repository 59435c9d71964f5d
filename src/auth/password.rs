//! Credential hashing
//!
//! New hashes are argon2id with m=102400, t=2, p=8. Verification also
//! accepts the legacy `{SSHA}` digests migrated from the previous directory
//! tooling, so existing accounts keep working until their next password
//! change.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::{Result, UdbError};

const ARGON2_M_COST: u32 = 102400;
const ARGON2_T_COST: u32 = 2;
const ARGON2_P_COST: u32 = 8;

/// Hash a password for storage. Always emits argon2id.
pub fn hash_password(password: &str) -> Result<String> {
    let params = Params::new(ARGON2_M_COST, ARGON2_T_COST, ARGON2_P_COST, None)
        .map_err(|e| UdbError::PasswordHash(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::generate(&mut OsRng);
    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| UdbError::PasswordHash(e.to_string()))
}

/// Verify a password against a stored hash. `None` (directory-backed
/// accounts) never verifies locally.
pub fn check_password(password: &str, stored: Option<&str>) -> bool {
    let Some(stored) = stored else {
        return false;
    };
    if let Some(encoded) = stored.strip_prefix("{SSHA}") {
        return check_ssha(password, encoded);
    }
    if stored.starts_with("$argon2") {
        let Ok(parsed) = PasswordHash::new(stored) else {
            return false;
        };
        return Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
    }
    false
}

/// Salted SHA1: base64 of `sha1(password + salt) + salt`.
fn check_ssha(password: &str, encoded: &str) -> bool {
    let Ok(raw) = BASE64.decode(encoded) else {
        return false;
    };
    if raw.len() < 20 {
        return false;
    }
    let (digest, salt) = raw.split_at(20);
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    hasher.finalize().as_slice() == digest
}

#[cfg(test)]
mod tests {
    use super::*;

    const SSHA_ADMIN123: &str = "{SSHA}/LAr7zGT/Rv/CEsbrEndyh27h+4fLb9h";
    const ARGON2_ADMIN123: &str =
        "$argon2id$v=19$m=102400,t=2,p=8$/mDhOg8wyZeMTUjcbIC7mg$3pxRSfYgUXmKEKNtasP1Og";

    #[test]
    fn test_ssha_verification() {
        assert!(check_password("admin123", Some(SSHA_ADMIN123)));
        assert!(!check_password("admin12", Some(SSHA_ADMIN123)));
    }

    #[test]
    fn test_legacy_argon2_verification() {
        assert!(check_password("admin123", Some(ARGON2_ADMIN123)));
        assert!(!check_password("admin12", Some(ARGON2_ADMIN123)));
    }

    #[test]
    fn test_hash_round_trip() {
        let hash = hash_password("admin12").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(hash.contains("m=102400,t=2,p=8"));
        assert!(check_password("admin12", Some(&hash)));
        assert!(!check_password("admin123", Some(&hash)));
    }

    #[test]
    fn test_absent_or_malformed_hash_never_verifies() {
        assert!(!check_password("admin123", None));
        assert!(!check_password("admin123", Some("")));
        assert!(!check_password("admin123", Some("{SSHA}not-base64!!!")));
        assert!(!check_password("admin123", Some("plaintext")));
    }
}
