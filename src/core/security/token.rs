//! In-memory token manager issuing random tokens.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use scc::HashMap;
use tokio::time::Instant;

use crate::{
    core::exchange::Account,
    ports::token_manager::{AuthToken, TokenManager},
    utils::graceful_shutdown::ShutdownToken,
};

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Clone)]
struct TokenEntry {
    token: AuthToken,
    account: Account,
    expires_at: Instant,
}

/// Tokens keyed by principal, with a reverse index for verification.
pub struct RandomTokenManager {
    by_principal: HashMap<String, TokenEntry>,
    by_token: HashMap<String, String>,
    ttl: Duration,
}

impl RandomTokenManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_principal: HashMap::new(),
            by_token: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn live_entry(&self, principal_id: &str) -> Option<TokenEntry> {
        let entry = self.by_principal.get_async(principal_id).await?;
        if entry.get().expires_at > Instant::now() {
            return Some(entry.get().clone());
        }
        let (_, expired) = entry.remove_entry();
        let _ = self.by_token.remove_async(&expired.token.value).await;
        None
    }

    /// Drop expired tokens. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.by_principal
            .retain_async(|_, entry| {
                let live = entry.expires_at > now;
                if !live {
                    expired.push(entry.token.value.clone());
                }
                live
            })
            .await;
        for token in &expired {
            let _ = self.by_token.remove_async(token).await;
        }
        expired.len()
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: ShutdownToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep().await;
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired auth tokens");
                        }
                    }
                    _ = shutdown.wait_for_shutdown() => break,
                }
            }
        })
    }
}

impl Default for RandomTokenManager {
    fn default() -> Self {
        Self::new(DEFAULT_TOKEN_TTL)
    }
}

#[async_trait]
impl TokenManager for RandomTokenManager {
    async fn issue(&self, account: &Account) -> AuthToken {
        let token = AuthToken {
            value: uuid::Uuid::new_v4().simple().to_string(),
            valid_until: chrono::Utc::now()
                + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::minutes(15)),
        };
        let entry = TokenEntry {
            token: token.clone(),
            account: account.clone(),
            expires_at: Instant::now() + self.ttl,
        };

        let principal = account.principal_id().to_string();
        let previous = match self.by_principal.entry_async(principal.clone()).await {
            scc::hash_map::Entry::Occupied(mut occupied) => {
                Some(std::mem::replace(occupied.get_mut(), entry).token.value)
            }
            scc::hash_map::Entry::Vacant(vacant) => {
                vacant.insert_entry(entry);
                None
            }
        };
        if let Some(previous) = previous {
            let _ = self.by_token.remove_async(&previous).await;
        }
        let _ = self.by_token.insert_async(token.value.clone(), principal).await;

        tracing::debug!(principal = account.principal_id(), "Issued auth token");
        token
    }

    async fn get(&self, account: &Account) -> Option<AuthToken> {
        self.live_entry(account.principal_id()).await.map(|entry| entry.token)
    }

    async fn update(&self, account: &Account) {
        if let Some(mut entry) = self.by_principal.get_async(account.principal_id()).await {
            if entry.get().expires_at > Instant::now() {
                entry.get_mut().account = account.clone();
            }
        }
    }

    async fn verify(&self, token: &str) -> Option<Account> {
        let principal = self.by_token.get_async(token).await?.get().clone();
        let entry = self.live_entry(&principal).await?;
        (entry.token.value == token).then_some(entry.account)
    }

    async fn invalidate(&self, account: &Account) {
        if let Some((_, entry)) = self.by_principal.remove_async(account.principal_id()).await {
            let _ = self.by_token.remove_async(&entry.token.value).await;
            tracing::debug!(principal = account.principal_id(), "Invalidated auth token");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::advance;

    use super::*;

    #[tokio::test]
    async fn test_issue_and_verify() {
        let manager = RandomTokenManager::default();
        let alice = Account::new("alice", ["user"]);

        let token = manager.issue(&alice).await;
        assert_eq!(manager.get(&alice).await, Some(token.clone()));
        assert_eq!(manager.verify(&token.value).await, Some(alice));
        assert_eq!(manager.verify("forged").await, None);
    }

    #[tokio::test]
    async fn test_reissue_revokes_previous_token() {
        let manager = RandomTokenManager::default();
        let alice = Account::new("alice", ["user"]);

        let first = manager.issue(&alice).await;
        let second = manager.issue(&alice).await;
        assert_ne!(first.value, second.value);
        assert_eq!(manager.verify(&first.value).await, None);
        assert!(manager.verify(&second.value).await.is_some());
    }

    #[tokio::test]
    async fn test_update_propagates_roles() {
        let manager = RandomTokenManager::default();
        let token = manager.issue(&Account::new("alice", ["user"])).await;

        manager.update(&Account::new("alice", ["user", "admin"])).await;
        let account = manager.verify(&token.value).await.unwrap();
        assert!(account.has_role("admin"));

        // No token, no-op
        manager.update(&Account::new("bob", ["admin"])).await;
        assert!(manager.get(&Account::new("bob", ["admin"])).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_expire() {
        let manager = RandomTokenManager::new(Duration::from_secs(60));
        let alice = Account::new("alice", ["user"]);
        let token = manager.issue(&alice).await;

        advance(Duration::from_secs(61)).await;
        assert_eq!(manager.verify(&token.value).await, None);
        assert_eq!(manager.get(&alice).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_invalidate() {
        let manager = RandomTokenManager::new(Duration::from_secs(60));
        let alice = Account::new("alice", ["user"]);
        let bob = Account::new("bob", ["user"]);
        manager.issue(&alice).await;
        advance(Duration::from_secs(30)).await;
        let bob_token = manager.issue(&bob).await;
        advance(Duration::from_secs(31)).await;

        assert_eq!(manager.sweep().await, 1);

        manager.invalidate(&bob).await;
        assert_eq!(manager.verify(&bob_token.value).await, None);
    }
}
