use async_trait::async_trait;
use thiserror::Error;

/// Failures of the account backing store, kept apart from "credential invalid".
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum AccountStoreError {
    /// The store could not be reached.
    #[error("Account store unavailable: {0}")]
    Unavailable(String),

    /// The store answered with an unexpected status.
    #[error("Account store returned status {0}")]
    UnexpectedStatus(u16),

    /// The store answered with something that is not a document.
    #[error("Malformed account store response: {0}")]
    Malformed(String),
}

/// Remote lookup of account documents by principal id.
#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    /// Find the account document, `Ok(None)` when it does not exist.
    async fn find(&self, principal_id: &str) -> Result<Option<serde_json::Value>, AccountStoreError>;
}
