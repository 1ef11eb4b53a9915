use std::sync::Arc;

use async_trait::async_trait;

use super::basic_credentials;
use crate::{
    core::exchange::{Account, Exchange},
    ports::{auth_mechanism::AuthMechanism, token_manager::TokenManager},
};

/// Accepts `Authorization: Basic id:token` where `token` was issued by the
/// token manager for `id`.
pub struct TokenAuthMechanism {
    tokens: Arc<dyn TokenManager>,
}

impl TokenAuthMechanism {
    pub fn new(tokens: Arc<dyn TokenManager>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl AuthMechanism for TokenAuthMechanism {
    async fn authenticate(&self, exchange: &mut Exchange) -> Option<Account> {
        let (id, token) = basic_credentials(exchange).ok().flatten()?;
        let account = self.tokens.verify(&token).await?;
        if account.principal_id() != id {
            tracing::debug!(mechanism = "token", principal = %id, "Token issued to another principal");
            return None;
        }
        Some(account)
    }

    /// Token authentication falls back silently to the other mechanisms.
    fn send_challenge(&self, _exchange: &mut Exchange) {}

    fn is_token_based(&self) -> bool {
        true
    }
}
