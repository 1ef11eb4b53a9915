use async_trait::async_trait;

use crate::core::exchange::{Account, Exchange};

/// Extracts credentials from a request and verifies them into an [`Account`].
///
/// Mechanisms are tried in configured order; the first one returning an
/// account wins and the rest are skipped for that exchange.
#[async_trait]
pub trait AuthMechanism: Send + Sync + 'static {
    /// Try to authenticate the exchange.
    ///
    /// Returns `None` both when the request carries no credential this
    /// mechanism understands and when the credential does not verify.
    async fn authenticate(&self, exchange: &mut Exchange) -> Option<Account>;

    /// Add this mechanism's challenge (typically a `WWW-Authenticate` value)
    /// to the pending response.
    fn send_challenge(&self, exchange: &mut Exchange);

    /// Whether accounts produced by this mechanism come from a previously
    /// issued auth token rather than a primary credential.
    fn is_token_based(&self) -> bool {
        false
    }
}
