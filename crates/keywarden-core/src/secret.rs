//! Password hashing and key generation.

use crate::error::{KeywardenError, KeywardenResult};
use pbkdf2::pbkdf2_hmac;
use sha2::Sha512;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Length of the random salt mixed into the access-password hash.
pub const SALT_LEN: usize = 16;
/// Length of the stored password hash.
pub const HASH_LEN: usize = 64;
/// Length of every generated volume key (512 bits).
pub const KEY_LEN: usize = 64;
/// Shortest access password `init-server` accepts.
pub const MIN_PASSWORD_LEN: usize = 10;

/// Iteration count sized so one verification costs upwards of 100 ms on
/// server-class hardware.
pub const PBKDF2_ROUNDS: u32 = 600_000;

/// Draw a fresh password salt from the OS RNG.
pub fn generate_salt() -> KeywardenResult<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt)
        .map_err(|err| KeywardenError::Io(std::io::Error::other(format!("rng failure: {err}"))))?;
    Ok(salt)
}

/// Derive the stored hash for an access password.
pub fn hash_access_password(salt: &[u8], password: &str) -> [u8; HASH_LEN] {
    hash_with_rounds(salt, password, PBKDF2_ROUNDS)
}

/// Constant-time comparison of a candidate password against the stored hash.
pub fn verify_access_password(salt: &[u8], expected_hash: &[u8], password: &str) -> bool {
    let derived = hash_with_rounds(salt, password, PBKDF2_ROUNDS);
    derived.as_slice().ct_eq(expected_hash).into()
}

fn hash_with_rounds(salt: &[u8], password: &str, rounds: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, rounds, &mut out);
    out
}

/// Generate a 64-byte volume key. RNG failure is an error and must abort the
/// request that needed the key.
pub fn generate_volume_key() -> KeywardenResult<Zeroizing<Vec<u8>>> {
    let mut key = Zeroizing::new(vec![0u8; KEY_LEN]);
    getrandom::getrandom(&mut key)
        .map_err(|err| KeywardenError::Io(std::io::Error::other(format!("rng failure: {err}"))))?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_salt_sensitive() {
        let a = hash_with_rounds(&[1u8; SALT_LEN], "secret password", 2);
        let b = hash_with_rounds(&[1u8; SALT_LEN], "secret password", 2);
        let c = hash_with_rounds(&[2u8; SALT_LEN], "secret password", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, hash_with_rounds(&[1u8; SALT_LEN], "other password", 2));
    }

    #[test]
    fn verify_accepts_right_and_rejects_wrong_password() {
        let salt = [7u8; SALT_LEN];
        let stored = hash_access_password(&salt, "correct horse battery staple");
        assert!(verify_access_password(
            &salt,
            &stored,
            "correct horse battery staple"
        ));
        assert!(!verify_access_password(
            &salt,
            &stored,
            "incorrect horse battery staple"
        ));
    }

    #[test]
    fn generated_material_has_contracted_lengths() {
        let salt = generate_salt().unwrap();
        assert_eq!(salt.len(), SALT_LEN);

        let key = generate_volume_key().unwrap();
        assert_eq!(key.len(), KEY_LEN);
        let other = generate_volume_key().unwrap();
        assert_ne!(&key[..], &other[..]);
    }
}
