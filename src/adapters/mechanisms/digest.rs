use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use hyper::header::{self, HeaderValue};
use serde::Deserialize;
use crate::{
    core::{
        cache::{CredentialCache, ExpirePolicy},
        exchange::{Account, Exchange},
        security::{
            authenticator::{Authenticator, Credential},
            digest::DigestResponse,
        },
    },
    ports::auth_mechanism::AuthMechanism,
};

fn default_realm() -> String {
    "gatehouse".to_string()
}

fn default_domain() -> String {
    "/".to_string()
}

fn default_nonce_ttl_secs() -> u64 {
    300
}

fn default_max_nonces() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DigestArgs {
    #[serde(default = "default_realm")]
    pub realm: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default = "default_nonce_ttl_secs")]
    pub nonce_ttl_secs: u64,
    /// Upper bound on outstanding nonces; the least recently used is dropped first.
    #[serde(default = "default_max_nonces")]
    pub max_nonces: usize,
}

impl Default for DigestArgs {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            domain: default_domain(),
            nonce_ttl_secs: default_nonce_ttl_secs(),
            max_nonces: default_max_nonces(),
        }
    }
}

/// HTTP Digest authentication (SHA-256, `qop=auth`).
///
/// Nonces are minted by the challenge and accepted until they expire.
/// Only works with passwords stored in plain text.
pub struct DigestAuthMechanism {
    authenticator: Arc<Authenticator>,
    args: DigestArgs,
    nonces: Arc<CredentialCache<String, ()>>,
}

impl DigestAuthMechanism {
    pub fn new(authenticator: Arc<Authenticator>, args: DigestArgs) -> Self {
        let nonces = CredentialCache::new(
            args.max_nonces,
            Duration::from_secs(args.nonce_ttl_secs),
            ExpirePolicy::AfterWrite,
        );
        Self {
            authenticator,
            args,
            nonces: Arc::new(nonces),
        }
    }

    pub fn nonce_cache(&self) -> &Arc<CredentialCache<String, ()>> {
        &self.nonces
    }

    fn mint_nonce(&self) -> String {
        let nonce: String = rand::random::<[u8; 16]>()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        self.nonces.put_sync(nonce.clone(), ());
        nonce
    }
}

#[async_trait]
impl AuthMechanism for DigestAuthMechanism {
    async fn authenticate(&self, exchange: &mut Exchange) -> Option<Account> {
        let value = exchange.header_str(header::AUTHORIZATION)?;
        let response = DigestResponse::parse(value, exchange.method().as_str())?;

        if response.realm != self.args.realm {
            tracing::debug!(mechanism = "digest", realm = %response.realm, "Realm mismatch");
            return None;
        }
        if self.nonces.get(&response.nonce).await.is_none() {
            tracing::debug!(mechanism = "digest", "Unknown or expired nonce");
            return None;
        }
        let request_uri = exchange
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        if response.uri != request_uri {
            tracing::debug!(mechanism = "digest", uri = %response.uri, "Digest uri does not match the request");
            return None;
        }

        self.authenticator
            .verify(&response.username, Credential::Digest(&response))
            .await
    }

    fn send_challenge(&self, exchange: &mut Exchange) {
        let challenge = format!(
            "Digest realm=\"{}\", domain=\"{}\", nonce=\"{}\", algorithm=SHA-256, qop=\"auth\"",
            self.args.realm,
            self.args.domain,
            self.mint_nonce()
        );
        match HeaderValue::from_str(&challenge) {
            Ok(value) => {
                exchange
                    .response_mut()
                    .headers
                    .append(header::WWW_AUTHENTICATE, value);
            }
            Err(e) => tracing::error!(mechanism = "digest", error = %e, "Invalid digest challenge"),
        }
    }
}
