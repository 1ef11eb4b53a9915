use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::Client;

use crate::ports::account_store::{AccountStore, AccountStoreError};

/// Account store backed by a database REST service.
///
/// Accounts are queried on the users collection with
/// `filter={"<prop_id>":"<id>"}&pagesize=1`. A 2xx answer with an empty
/// array means the account does not exist; any other status is a store failure.
pub struct HttpAccountStore {
    collection_url: String,
    prop_id: String,
    client: Client,
}

impl HttpAccountStore {
    pub fn new(base_url: &str, users_uri: &str, prop_id: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build account store HTTP client")?;

        Ok(Self {
            collection_url: format!("{}{}", base_url.trim_end_matches('/'), users_uri),
            prop_id: prop_id.to_string(),
            client,
        })
    }

    pub fn collection_url(&self) -> &str {
        &self.collection_url
    }
}

#[async_trait]
impl AccountStore for HttpAccountStore {
    async fn find(&self, principal_id: &str) -> Result<Option<serde_json::Value>, AccountStoreError> {
        let mut filter = serde_json::Map::new();
        filter.insert(self.prop_id.clone(), principal_id.into());
        let filter = serde_json::Value::Object(filter).to_string();

        let resp = self
            .client
            .get(&self.collection_url)
            .query(&[("filter", filter.as_str()), ("pagesize", "1")])
            .send()
            .await
            .map_err(|e| AccountStoreError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AccountStoreError::UnexpectedStatus(status.as_u16()));
        }

        let body = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AccountStoreError::Malformed(e.to_string()))?;

        match body {
            serde_json::Value::Array(mut documents) => {
                if documents.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(documents.swap_remove(0)))
                }
            }
            other => Err(AccountStoreError::Malformed(format!(
                "expected an array of documents, got {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::{Json, Router, extract::Query, http::StatusCode, routing::get};
    use tokio::net::TcpListener;

    use super::*;

    async fn users(Query(params): Query<HashMap<String, String>>) -> Result<Json<serde_json::Value>, StatusCode> {
        let filter: serde_json::Value = serde_json::from_str(&params["filter"]).unwrap();
        assert_eq!(params["pagesize"], "1");
        match filter["_id"].as_str() {
            Some("alice") => Ok(Json(serde_json::json!([
                {"_id": "alice", "password": "secret", "roles": ["user"]}
            ]))),
            Some("broken") => Err(StatusCode::INTERNAL_SERVER_ERROR),
            _ => Ok(Json(serde_json::json!([]))),
        }
    }

    async fn spawn_store() -> String {
        let app = Router::new().route("/users", get(users));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_http_account_store() {
        let base = spawn_store().await;
        let store = HttpAccountStore::new(&base, "/users", "_id", Duration::from_secs(5)).unwrap();

        let alice = store.find("alice").await.unwrap().unwrap();
        assert_eq!(alice["roles"][0], "user");
        assert!(store.find("nobody").await.unwrap().is_none());
        assert!(matches!(
            store.find("broken").await,
            Err(AccountStoreError::UnexpectedStatus(500))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let store = HttpAccountStore::new(
            &format!("http://127.0.0.1:{port}"),
            "/users",
            "_id",
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(matches!(
            store.find("alice").await,
            Err(AccountStoreError::Unavailable(_))
        ));
    }
}
