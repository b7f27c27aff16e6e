use std::sync::LazyLock;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::RngCore;

use crate::error::{AuthError, AuthResult};

/// Pre-computed hash used to burn comparable CPU when the account does not
/// exist, so login latency does not reveal which emails are registered.
static DUMMY_HASH: LazyLock<String> = LazyLock::new(|| {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(b"timing-equalization-dummy", &salt)
        .expect("dummy hash")
        .to_string()
});

/// Argon2id hash, off the async reactor.
pub async fn hash(secret: String) -> AuthResult<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| AuthError::Internal(format!("hashing failed: {err}")))
    })
    .await
    .map_err(|err| AuthError::Internal(format!("hashing task failed: {err}")))?
}

pub async fn verify(stored_hash: String, candidate: String) -> AuthResult<bool> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored_hash)
            .map_err(|err| AuthError::Internal(format!("stored hash invalid: {err}")))?;
        Ok(Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|err| AuthError::Internal(format!("hashing task failed: {err}")))?
}

/// Verifies the candidate against the dummy hash and discards the outcome.
pub async fn burn(candidate: String) {
    let stored = DUMMY_HASH.clone();
    let _ = verify(stored, candidate).await;
}

/// 32 random bytes, hex-encoded: the secret half of pending-token composites.
pub fn generate_secret_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_and_verify_roundtrip() {
        let hashed = hash("Password123!".to_string()).await.unwrap();
        assert!(verify(hashed.clone(), "Password123!".to_string())
            .await
            .unwrap());
        assert!(!verify(hashed, "wrong".to_string()).await.unwrap());
    }

    #[test]
    fn secrets_are_unique_and_hex() {
        let a = generate_secret_hex();
        let b = generate_secret_hex();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
