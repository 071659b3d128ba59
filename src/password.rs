use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
};
use argon2::{Algorithm, Argon2, Params, Version};

/// Argon2id cost parameters. Memory is in KiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for HashParams {
    fn default() -> Self {
        // m=65536 KiB (64 MiB), t=3, p=1
        Self {
            memory_kib: 65_536,
            iterations: 3,
        }
    }
}

impl HashParams {
    #[cfg(test)]
    pub fn cheap() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
        }
    }
}

pub fn hash_password(plaintext: &str, params: HashParams) -> Result<String, String> {
    if plaintext.is_empty() {
        return Err("password is empty".to_string());
    }

    let params = Params::new(params.memory_kib, params.iterations, 1, None)
        .map_err(|e| format!("argon2 params: {e}"))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2
        .hash_password(plaintext.as_bytes(), &salt)
        .map_err(|e| format!("argon2 hash: {e}"))?
        .to_string();
    Ok(hash)
}

/// Checks `plaintext` against a stored PHC string. Malformed or non-argon2id
/// hashes never verify.
pub fn verify_password(plaintext: &str, stored: &str) -> bool {
    if plaintext.is_empty() {
        return false;
    }
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    if parsed.algorithm.as_str() != "argon2id" {
        return false;
    }
    // Cost parameters are read back from the PHC string.
    Argon2::default()
        .verify_password(plaintext.as_bytes(), &parsed)
        .is_ok()
}
