use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{self, HeaderValue};
use serde::Deserialize;

use super::basic_credentials;
use crate::{
    core::{
        exchange::{Account, Exchange},
        security::authenticator::{Authenticator, Credential},
    },
    ports::auth_mechanism::AuthMechanism,
};

fn default_realm() -> String {
    "gatehouse".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicArgs {
    #[serde(default = "default_realm")]
    pub realm: String,
}

impl Default for BasicArgs {
    fn default() -> Self {
        Self {
            realm: default_realm(),
        }
    }
}

/// HTTP Basic authentication against the configured account store.
pub struct BasicAuthMechanism {
    authenticator: Arc<Authenticator>,
    challenge: HeaderValue,
}

impl BasicAuthMechanism {
    pub fn new(authenticator: Arc<Authenticator>, args: BasicArgs) -> Self {
        let challenge = HeaderValue::from_str(&format!("Basic realm=\"{}\"", args.realm))
            .unwrap_or_else(|_| HeaderValue::from_static("Basic realm=\"gatehouse\""));
        Self {
            authenticator,
            challenge,
        }
    }
}

#[async_trait]
impl AuthMechanism for BasicAuthMechanism {
    async fn authenticate(&self, exchange: &mut Exchange) -> Option<Account> {
        let (id, password) = match basic_credentials(exchange) {
            Ok(Some(credentials)) => credentials,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(mechanism = "basic", error = %e, "Ignoring malformed credentials");
                return None;
            }
        };
        self.authenticator
            .verify(&id, Credential::Password(&password))
            .await
    }

    fn send_challenge(&self, exchange: &mut Exchange) {
        exchange
            .response_mut()
            .headers
            .append(header::WWW_AUTHENTICATE, self.challenge.clone());
    }
}
