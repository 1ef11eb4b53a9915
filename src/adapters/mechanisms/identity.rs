use async_trait::async_trait;
use serde::Deserialize;

use crate::{
    core::exchange::{Account, Exchange},
    ports::auth_mechanism::AuthMechanism,
};

fn default_id_header() -> String {
    "x-identity-id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityArgs {
    #[serde(default = "default_id_header")]
    pub id_header: String,
    /// Comma separated roles. No roles when unset.
    #[serde(default)]
    pub roles_header: Option<String>,
}

impl Default for IdentityArgs {
    fn default() -> Self {
        Self {
            id_header: default_id_header(),
            roles_header: None,
        }
    }
}

/// Trusts identity headers set by a front proxy.
///
/// Only safe when the gateway is reachable exclusively through that proxy.
pub struct IdentityAuthMechanism {
    args: IdentityArgs,
}

impl IdentityAuthMechanism {
    pub fn new(args: IdentityArgs) -> Self {
        Self { args }
    }
}

#[async_trait]
impl AuthMechanism for IdentityAuthMechanism {
    async fn authenticate(&self, exchange: &mut Exchange) -> Option<Account> {
        let id = exchange.header_str(self.args.id_header.as_str())?.trim();
        if id.is_empty() {
            return None;
        }

        let roles: Vec<&str> = self
            .args
            .roles_header
            .as_deref()
            .and_then(|name| exchange.header_str(name))
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|role| !role.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Some(Account::new(id, roles))
    }

    fn send_challenge(&self, _exchange: &mut Exchange) {}
}
