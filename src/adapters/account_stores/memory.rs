use std::collections::HashMap;

use async_trait::async_trait;

use crate::ports::account_store::{AccountStore, AccountStoreError};

/// Account documents held in memory, typically listed in the configuration.
#[derive(Debug, Default, Clone)]
pub struct MemoryAccountStore {
    documents: HashMap<String, serde_json::Value>,
}

impl MemoryAccountStore {
    /// Index `documents` by their `prop_id` property. Documents without a
    /// string id are skipped.
    pub fn new(documents: impl IntoIterator<Item = serde_json::Value>, prop_id: &str) -> Self {
        let documents = documents
            .into_iter()
            .filter_map(|document| match document.get(prop_id).and_then(|id| id.as_str()) {
                Some(id) => Some((id.to_string(), document)),
                None => {
                    tracing::warn!(prop_id, "Skipping account document without a string id");
                    None
                }
            })
            .collect();
        Self { documents }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find(&self, principal_id: &str) -> Result<Option<serde_json::Value>, AccountStoreError> {
        Ok(self.documents.get(principal_id).cloned())
    }
}
