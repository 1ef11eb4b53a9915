//! Password verification, plain or hashed at rest.
use std::{fmt, sync::Arc};

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::core::cache::CredentialCache;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PasswordHashError {
    #[error("Password hashing failed: {0}")]
    Hash(String),
    #[error("Stored hash is not valid: {0}")]
    InvalidHash(String),
}

/// An expensive, salted password hash function.
pub trait PasswordHasher: Send + Sync + 'static {
    fn hash(&self, plain: &str) -> Result<String, PasswordHashError>;
    fn verify(&self, plain: &str, hash: &str) -> Result<bool, PasswordHashError>;
}

/// bcrypt with a configurable cost.
#[derive(Debug, Clone, Copy)]
pub struct BcryptHasher {
    cost: u32,
}

impl BcryptHasher {
    pub fn new(cost: u32) -> Self {
        Self { cost }
    }
}

impl PasswordHasher for BcryptHasher {
    fn hash(&self, plain: &str) -> Result<String, PasswordHashError> {
        bcrypt::hash(plain, self.cost).map_err(|e| PasswordHashError::Hash(e.to_string()))
    }

    fn verify(&self, plain: &str, hash: &str) -> Result<bool, PasswordHashError> {
        bcrypt::verify(plain, hash).map_err(|e| PasswordHashError::InvalidHash(e.to_string()))
    }
}

/// Cache key for hashed verifications: one entry per account and stored hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PasswordCacheKey {
    pub principal: String,
    pub expected_hash: String,
}

/// Cache of the last verified credential per key. Values are SHA-256
/// fingerprints of the plaintext, never the plaintext itself.
pub type PasswordCache = CredentialCache<PasswordCacheKey, [u8; 32]>;

/// Checks a supplied password against the stored credential.
#[derive(Clone)]
pub struct PasswordVerifier {
    hasher: Option<Arc<dyn PasswordHasher>>,
    cache: Option<Arc<PasswordCache>>,
}

impl fmt::Debug for PasswordVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordVerifier")
            .field("hashed", &self.hasher.is_some())
            .field("cached", &self.cache.is_some())
            .finish()
    }
}

impl PasswordVerifier {
    /// Stored passwords are plaintext.
    pub fn plain() -> Self {
        Self {
            hasher: None,
            cache: None,
        }
    }

    /// Stored passwords are hashes produced by `hasher`.
    pub fn hashed(hasher: Arc<dyn PasswordHasher>, cache: Option<Arc<PasswordCache>>) -> Self {
        Self {
            hasher: Some(hasher),
            cache,
        }
    }

    pub fn is_hashed(&self) -> bool {
        self.hasher.is_some()
    }

    pub fn hasher(&self) -> Option<&Arc<dyn PasswordHasher>> {
        self.hasher.as_ref()
    }

    pub fn cache(&self) -> Option<&Arc<PasswordCache>> {
        self.cache.as_ref()
    }

    pub async fn verify(&self, principal: &str, supplied: &str, expected: &str) -> bool {
        let Some(hasher) = &self.hasher else {
            return bool::from(supplied.as_bytes().ct_eq(expected.as_bytes()));
        };

        let key = PasswordCacheKey {
            principal: principal.to_string(),
            expected_hash: expected.to_string(),
        };
        let fingerprint = fingerprint(supplied);

        if let Some(cache) = &self.cache {
            if let Some(known) = cache.get(&key).await {
                if bool::from(known[..].ct_eq(&fingerprint[..])) {
                    return true;
                }
            }
        }

        let hasher = hasher.clone();
        let (plain, hash) = (supplied.to_string(), expected.to_string());
        let verified = match tokio::task::spawn_blocking(move || hasher.verify(&plain, &hash)).await {
            Ok(Ok(verified)) => verified,
            Ok(Err(e)) => {
                tracing::warn!(principal, error = %e, "Password hash verification failed");
                false
            }
            Err(e) => {
                tracing::error!(principal, error = %e, "Password hash task failed");
                false
            }
        };

        if let Some(cache) = &self.cache {
            if verified {
                cache.put(key, fingerprint).await;
            } else {
                cache.invalidate(&key).await;
            }
        }

        verified
    }
}

fn fingerprint(plain: &str) -> [u8; 32] {
    Sha256::digest(plain.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::core::cache::ExpirePolicy;

    /// Stores "hashed:<plain>" and counts verifications.
    #[derive(Default)]
    struct CountingHasher {
        verifications: AtomicUsize,
    }

    impl PasswordHasher for CountingHasher {
        fn hash(&self, plain: &str) -> Result<String, PasswordHashError> {
            Ok(format!("hashed:{plain}"))
        }

        fn verify(&self, plain: &str, hash: &str) -> Result<bool, PasswordHashError> {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            Ok(hash == format!("hashed:{plain}"))
        }
    }

    fn cache() -> Arc<PasswordCache> {
        Arc::new(CredentialCache::new(
            100,
            Duration::from_secs(20 * 60),
            ExpirePolicy::AfterRead,
        ))
    }

    #[tokio::test]
    async fn test_plain_comparison() {
        let verifier = PasswordVerifier::plain();
        assert!(verifier.verify("alice", "secret", "secret").await);
        assert!(!verifier.verify("alice", "secret", "secreT").await);
        assert!(!verifier.verify("alice", "secret", "secret2").await);
    }

    #[tokio::test]
    async fn test_repeated_credential_skips_hash_function() {
        let hasher = Arc::new(CountingHasher::default());
        let verifier = PasswordVerifier::hashed(hasher.clone(), Some(cache()));

        assert!(verifier.verify("alice", "secret", "hashed:secret").await);
        assert!(verifier.verify("alice", "secret", "hashed:secret").await);
        assert_eq!(hasher.verifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_check_invalidates_entry() {
        let hasher = Arc::new(CountingHasher::default());
        let cache = cache();
        let verifier = PasswordVerifier::hashed(hasher.clone(), Some(cache.clone()));

        assert!(verifier.verify("alice", "secret", "hashed:secret").await);
        assert!(!verifier.verify("alice", "wrong", "hashed:secret").await);
        assert!(cache.is_empty());

        // The next correct attempt recomputes the hash
        assert!(verifier.verify("alice", "secret", "hashed:secret").await);
        assert_eq!(hasher.verifications.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_entries_are_scoped_per_account() {
        let hasher = Arc::new(CountingHasher::default());
        let verifier = PasswordVerifier::hashed(hasher.clone(), Some(cache()));

        // Same stored hash for two accounts must not share a cache entry
        assert!(verifier.verify("alice", "secret", "hashed:secret").await);
        assert!(verifier.verify("bob", "secret", "hashed:secret").await);
        assert_eq!(hasher.verifications.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_bcrypt_round_trip() {
        let hasher = BcryptHasher::new(4);
        let hash = hasher.hash("secret").unwrap();
        assert!(hash.starts_with("$2"));

        let verifier = PasswordVerifier::hashed(Arc::new(hasher), None);
        assert!(verifier.verify("alice", "secret", &hash).await);
        assert!(!verifier.verify("alice", "other", &hash).await);
        assert!(!verifier.verify("alice", "secret", "not-a-hash").await);
    }
}
