//! Account lookup and credential verification shared by the mechanisms.
//!
//! Accounts are loaded from an [`AccountStore`] as JSON documents and turned
//! into [`Account`]s. Found accounts go through an optional loading cache;
//! misses and store failures are never cached, so an outage heals itself on
//! the next request.
use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::{
    core::{
        cache::CredentialCache,
        exchange::Account,
        security::{
            digest::{self, DigestResponse},
            password::{PasswordHashError, PasswordVerifier},
        },
    },
    metrics,
    ports::account_store::{AccountStore, AccountStoreError},
};

/// Why an account could not be produced from the store.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum AccountLookupError {
    #[error(transparent)]
    Store(#[from] AccountStoreError),
    #[error("Account document is not an object")]
    NotAnObject,
    #[error("Account document has no '{0}' property")]
    MissingPassword(String),
    #[error("Account property '{0}' is not a string")]
    PasswordNotString(String),
    #[error("Account roles at '{0}' are not an array")]
    RolesNotArray(String),
}

impl AccountLookupError {
    fn reason(&self) -> &'static str {
        match self {
            AccountLookupError::Store(_) => "store_unavailable",
            _ => "malformed_account",
        }
    }
}

/// A credential presented by a mechanism.
#[derive(Debug, Clone, Copy)]
pub enum Credential<'a> {
    Password(&'a str),
    Digest(&'a DigestResponse),
}

/// Where account properties live inside a document.
#[derive(Debug, Clone)]
pub struct AccountDocumentLayout {
    pub users_uri: String,
    pub prop_id: String,
    pub prop_password: String,
    /// Dotted path to the roles array, optionally starting with `$.`.
    pub roles_path: String,
}

impl Default for AccountDocumentLayout {
    fn default() -> Self {
        Self {
            users_uri: "/users".to_string(),
            prop_id: "_id".to_string(),
            prop_password: "password".to_string(),
            roles_path: "roles".to_string(),
        }
    }
}

pub type AccountCache = CredentialCache<String, Account>;

pub struct Authenticator {
    store: Arc<dyn AccountStore>,
    layout: AccountDocumentLayout,
    verifier: PasswordVerifier,
    account_cache: Option<Arc<AccountCache>>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("layout", &self.layout)
            .field("verifier", &self.verifier)
            .field("account_cache", &self.account_cache.is_some())
            .finish()
    }
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn AccountStore>,
        layout: AccountDocumentLayout,
        verifier: PasswordVerifier,
    ) -> Self {
        Self {
            store,
            layout,
            verifier,
            account_cache: None,
        }
    }

    pub fn with_account_cache(mut self, cache: Arc<AccountCache>) -> Self {
        self.account_cache = Some(cache);
        self
    }

    pub fn users_uri(&self) -> &str {
        &self.layout.users_uri
    }

    pub fn password_property(&self) -> &str {
        &self.layout.prop_password
    }

    pub fn is_password_hashed(&self) -> bool {
        self.verifier.is_hashed()
    }

    pub fn account_cache(&self) -> Option<&Arc<AccountCache>> {
        self.account_cache.as_ref()
    }

    pub fn password_cache(&self) -> Option<&Arc<super::password::PasswordCache>> {
        self.verifier.cache()
    }

    /// Hash a plaintext password the way stored passwords are hashed.
    pub async fn hash_password(&self, plain: &str) -> Result<String, PasswordHashError> {
        let hasher = self
            .verifier
            .hasher()
            .cloned()
            .ok_or_else(|| PasswordHashError::Hash("password hashing is disabled".to_string()))?;
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&plain))
            .await
            .map_err(|e| PasswordHashError::Hash(e.to_string()))?
    }

    /// Load an account, through the account cache when enabled.
    pub async fn find_account(&self, principal_id: &str) -> Result<Option<Account>, AccountLookupError> {
        let load = || async {
            match self.store.find(principal_id).await? {
                Some(document) => self.account_from_document(principal_id, &document).map(Some),
                None => Ok(None),
            }
        };

        match &self.account_cache {
            Some(cache) => cache.get_or_load(&principal_id.to_string(), load).await,
            None => load().await,
        }
    }

    /// Verify a credential for `principal_id`, returning the account on success.
    ///
    /// Unknown accounts, wrong credentials and lookup failures all yield
    /// `None`; the distinguishing cause is only logged.
    pub async fn verify(&self, principal_id: &str, credential: Credential<'_>) -> Option<Account> {
        let account = match self.find_account(principal_id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                tracing::debug!(principal = principal_id, "Authentication failed: unknown account");
                metrics::record_auth_failure("unknown_account");
                return None;
            }
            Err(e) => {
                tracing::warn!(principal = principal_id, error = %e, "Authentication failed: account lookup error");
                metrics::record_auth_failure(e.reason());
                return None;
            }
        };

        let stored = account.credential_digest()?;

        let verified = match credential {
            Credential::Password(supplied) => self.verifier.verify(principal_id, supplied, stored).await,
            Credential::Digest(response) => {
                if self.verifier.is_hashed() {
                    tracing::warn!(
                        principal = principal_id,
                        "Digest authentication is not possible with hashed passwords"
                    );
                    false
                } else {
                    response.matches_ha1(&digest::ha1(principal_id, &response.realm, stored))
                }
            }
        };

        if verified {
            Some(account)
        } else {
            tracing::debug!(principal = principal_id, "Authentication failed: wrong credential");
            metrics::record_auth_failure("wrong_credential");
            None
        }
    }

    fn account_from_document(
        &self,
        principal_id: &str,
        document: &serde_json::Value,
    ) -> Result<Account, AccountLookupError> {
        let object = document.as_object().ok_or(AccountLookupError::NotAnObject)?;

        let password = object
            .get(&self.layout.prop_password)
            .ok_or_else(|| AccountLookupError::MissingPassword(self.layout.prop_password.clone()))?
            .as_str()
            .ok_or_else(|| AccountLookupError::PasswordNotString(self.layout.prop_password.clone()))?;

        let roles = match lookup_path(document, &self.layout.roles_path) {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|item| {
                    let role = item.as_str();
                    if role.is_none() {
                        tracing::warn!(
                            principal = principal_id,
                            value = %item,
                            "Skipping account role that is not a string"
                        );
                    }
                    role.map(str::to_string)
                })
                .collect(),
            Some(_) => return Err(AccountLookupError::RolesNotArray(self.layout.roles_path.clone())),
        };

        Ok(Account::new(principal_id, roles).with_credential_digest(password))
    }
}

fn lookup_path<'a>(document: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(document, |node, segment| node.get(segment))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::core::{
        cache::ExpirePolicy,
        security::password::{BcryptHasher, PasswordHasher},
    };

    #[derive(Default)]
    struct FakeStore {
        documents: HashMap<String, serde_json::Value>,
        offline: AtomicBool,
        lookups: AtomicUsize,
    }

    impl FakeStore {
        fn with(id: &str, document: serde_json::Value) -> Self {
            let mut store = Self::default();
            store.documents.insert(id.to_string(), document);
            store
        }
    }

    #[async_trait]
    impl AccountStore for FakeStore {
        async fn find(&self, principal_id: &str) -> Result<Option<serde_json::Value>, AccountStoreError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(AccountStoreError::Unavailable("connection refused".to_string()));
            }
            Ok(self.documents.get(principal_id).cloned())
        }
    }

    fn authenticator(store: Arc<FakeStore>) -> Authenticator {
        Authenticator::new(store, AccountDocumentLayout::default(), PasswordVerifier::plain())
    }

    #[tokio::test]
    async fn test_password_verification() {
        let store = Arc::new(FakeStore::with(
            "alice",
            json!({"_id": "alice", "password": "secret", "roles": ["admin", "user"]}),
        ));
        let auth = authenticator(store);

        let account = auth.verify("alice", Credential::Password("secret")).await.unwrap();
        assert!(account.has_role("admin"));
        assert!(account.has_role("user"));

        assert!(auth.verify("alice", Credential::Password("nope")).await.is_none());
        assert!(auth.verify("bob", Credential::Password("secret")).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_documents_are_distinct_causes() {
        let mut store = FakeStore::default();
        store.documents.insert("array".into(), json!([1, 2]));
        store.documents.insert("nopwd".into(), json!({"roles": []}));
        store.documents.insert("numpwd".into(), json!({"password": 42}));
        store
            .documents
            .insert("badroles".into(), json!({"password": "x", "roles": "admin"}));
        let auth = authenticator(Arc::new(store));

        assert!(matches!(auth.find_account("array").await, Err(AccountLookupError::NotAnObject)));
        assert!(matches!(
            auth.find_account("nopwd").await,
            Err(AccountLookupError::MissingPassword(_))
        ));
        assert!(matches!(
            auth.find_account("numpwd").await,
            Err(AccountLookupError::PasswordNotString(_))
        ));
        assert!(matches!(
            auth.find_account("badroles").await,
            Err(AccountLookupError::RolesNotArray(_))
        ));
    }

    #[tokio::test]
    async fn test_nested_roles_path_and_non_string_roles() {
        let store = Arc::new(FakeStore::with(
            "alice",
            json!({"password": "secret", "meta": {"roles": ["admin", 7, null]}}),
        ));
        let layout = AccountDocumentLayout {
            roles_path: "$.meta.roles".to_string(),
            ..Default::default()
        };
        let auth = Authenticator::new(store, layout, PasswordVerifier::plain());

        let account = auth.find_account("alice").await.unwrap().unwrap();
        assert_eq!(account.roles().len(), 1);
        assert!(account.has_role("admin"));
    }

    #[tokio::test]
    async fn test_missing_roles_means_no_roles() {
        let store = Arc::new(FakeStore::with("alice", json!({"password": "secret"})));
        let account = authenticator(store).find_account("alice").await.unwrap().unwrap();
        assert!(account.roles().is_empty());
    }

    #[tokio::test]
    async fn test_store_failures_are_not_cached() {
        let store = Arc::new(FakeStore::with("alice", json!({"password": "secret"})));
        let cache = Arc::new(CredentialCache::new(10, Duration::from_secs(60), ExpirePolicy::AfterWrite));
        let auth = authenticator(store.clone()).with_account_cache(cache.clone());

        store.offline.store(true, Ordering::SeqCst);
        assert!(auth.verify("alice", Credential::Password("secret")).await.is_none());
        assert!(cache.is_empty());

        store.offline.store(false, Ordering::SeqCst);
        assert!(auth.verify("alice", Credential::Password("secret")).await.is_some());
        assert!(auth.verify("alice", Credential::Password("secret")).await.is_some());
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_digest_with_plain_passwords() {
        let store = Arc::new(FakeStore::with("alice", json!({"password": "secret"})));
        let auth = authenticator(store);

        let ha1 = digest::ha1("alice", "gatehouse", "secret");
        let ha2 = digest::sha256_hex("GET:/x");
        let response = digest::sha256_hex(&format!("{ha1}:n1:{ha2}"));
        let header = format!(
            "Digest username=\"alice\", realm=\"gatehouse\", nonce=\"n1\", uri=\"/x\", response=\"{response}\""
        );
        let parsed = DigestResponse::parse(&header, "GET").unwrap();

        assert!(auth.verify("alice", Credential::Digest(&parsed)).await.is_some());
    }

    #[tokio::test]
    async fn test_digest_fails_closed_with_hashed_passwords() {
        let hasher = BcryptHasher::new(4);
        let hashed = hasher.hash("secret").unwrap();
        let store = Arc::new(FakeStore::with("alice", json!({"password": hashed})));
        let auth = Authenticator::new(
            store,
            AccountDocumentLayout::default(),
            PasswordVerifier::hashed(Arc::new(hasher), None),
        );

        // Even a digest computed over the stored hash must not verify
        let ha1 = digest::ha1("alice", "gatehouse", &hashed);
        let ha2 = digest::sha256_hex("GET:/x");
        let response = digest::sha256_hex(&format!("{ha1}:n1:{ha2}"));
        let header = format!(
            "Digest username=\"alice\", realm=\"gatehouse\", nonce=\"n1\", uri=\"/x\", response=\"{response}\""
        );
        let parsed = DigestResponse::parse(&header, "GET").unwrap();

        assert!(auth.verify("alice", Credential::Digest(&parsed)).await.is_none());
        assert!(auth.verify("alice", Credential::Password("secret")).await.is_some());
        assert!(auth.hash_password("other").await.unwrap().starts_with("$2"));
    }
}
