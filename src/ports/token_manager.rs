use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::core::exchange::Account;

/// An issued authentication token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub valid_until: DateTime<Utc>,
}

/// Issues and caches short-lived tokens derived from verified accounts.
#[async_trait]
pub trait TokenManager: Send + Sync + 'static {
    /// Issue a token for the account, replacing any previous one.
    async fn issue(&self, account: &Account) -> AuthToken;

    /// The live token for the account, if any.
    async fn get(&self, account: &Account) -> Option<AuthToken>;

    /// Refresh the account data bound to an existing token. No-op when the
    /// account has no live token.
    async fn update(&self, account: &Account);

    /// Resolve a presented token back to the account it was issued for.
    /// Expired or unknown tokens resolve to `None`.
    async fn verify(&self, token: &str) -> Option<Account>;

    /// Revoke the account's token.
    async fn invalidate(&self, account: &Account);
}
