//! Per-exchange security state machine.
//!
//! `Unauthenticated -> Authenticated -> (Allowed | Denied)`, or `Challenged`
//! when a secured pipeline receives no verifiable credential.
use std::sync::Arc;

use hyper::{
    StatusCode,
    header::{HeaderName, HeaderValue},
};

use crate::{
    core::{
        exchange::{AuthState, Exchange},
        plugin::PluginRecord,
        security::AllowAllAuthorizer,
    },
    metrics,
    ports::{auth_mechanism::AuthMechanism, authorizer::Authorizer, token_manager::TokenManager},
};

pub const AUTH_TOKEN_HEADER: &str = "auth-token";
pub const AUTH_TOKEN_VALID_HEADER: &str = "auth-token-valid-until";
pub const AUTH_TOKEN_LOCATION_HEADER: &str = "auth-token-location";

/// Result of securing one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityOutcome {
    Allowed,
    /// 401 with the challenges of every mechanism.
    Challenged,
    /// 403.
    Denied,
}

/// Runs authentication mechanisms, then authorizers, then token bookkeeping.
pub struct SecurityOrchestrator {
    mechanisms: Vec<PluginRecord<dyn AuthMechanism>>,
    authorizers: Vec<PluginRecord<dyn Authorizer>>,
    global_predicates: Vec<PluginRecord<dyn Authorizer>>,
    token_manager: Option<PluginRecord<dyn TokenManager>>,
}

impl SecurityOrchestrator {
    /// Only enabled plugins are kept.
    pub fn new(
        mechanisms: &[PluginRecord<dyn AuthMechanism>],
        authorizers: &[PluginRecord<dyn Authorizer>],
        global_predicates: &[PluginRecord<dyn Authorizer>],
        token_manager: Option<&PluginRecord<dyn TokenManager>>,
    ) -> Self {
        let enabled = |records: &[PluginRecord<dyn Authorizer>]| {
            records
                .iter()
                .filter(|r| r.is_enabled())
                .cloned()
                .collect::<Vec<_>>()
        };

        Self {
            mechanisms: mechanisms.iter().filter(|m| m.is_enabled()).cloned().collect(),
            authorizers: enabled(authorizers),
            global_predicates: enabled(global_predicates),
            token_manager: token_manager.filter(|t| t.is_enabled()).cloned(),
        }
    }

    /// The policy bound to unsecured pipelines: no mechanisms, one always-allow authorizer.
    pub fn allow_anonymous() -> Self {
        let full: Arc<dyn Authorizer> = Arc::new(AllowAllAuthorizer);
        Self {
            mechanisms: Vec::new(),
            authorizers: vec![PluginRecord::new("fullAuthorizer", "full", full)],
            global_predicates: Vec::new(),
            token_manager: None,
        }
    }

    pub fn mechanisms(&self) -> &[PluginRecord<dyn AuthMechanism>] {
        &self.mechanisms
    }

    pub fn authorizers(&self) -> &[PluginRecord<dyn Authorizer>] {
        &self.authorizers
    }

    /// Secure the exchange. Challenged and denied exchanges leave with a
    /// completed error response.
    pub async fn secure(&self, exchange: &mut Exchange) -> SecurityOutcome {
        if !exchange.is_authenticated() && !self.mechanisms.is_empty() {
            if !self.authenticate(exchange).await {
                for mechanism in &self.mechanisms {
                    mechanism.instance().send_challenge(exchange);
                }
                exchange.set_auth_state(AuthState::Challenged);
                exchange.end_with_status(StatusCode::UNAUTHORIZED, None);
                return SecurityOutcome::Challenged;
            }
        }

        let account = exchange.account().cloned();
        for authorizer in self.global_predicates.iter().chain(&self.authorizers) {
            if !authorizer.instance().is_allowed(exchange, account.as_deref()) {
                tracing::info!(
                    authorizer = authorizer.name(),
                    principal = account.as_ref().map(|a| a.principal_id()),
                    path = exchange.path(),
                    "Request denied"
                );
                metrics::record_auth_failure("forbidden");
                exchange.set_auth_state(AuthState::Denied);
                exchange.end_with_status(StatusCode::FORBIDDEN, None);
                return SecurityOutcome::Denied;
            }
        }

        exchange.set_auth_state(AuthState::Allowed);
        self.attach_token_headers(exchange).await;
        SecurityOutcome::Allowed
    }

    /// Try mechanisms in order; the first account wins.
    async fn authenticate(&self, exchange: &mut Exchange) -> bool {
        for mechanism in &self.mechanisms {
            let Some(account) = mechanism.instance().authenticate(exchange).await else {
                continue;
            };

            let via_token = mechanism.instance().is_token_based();
            tracing::debug!(
                mechanism = mechanism.name(),
                principal = account.principal_id(),
                "Authenticated"
            );

            if !via_token {
                if let Some(manager) = &self.token_manager {
                    manager.instance().update(&account).await;
                }
            }

            return match exchange.attach_account(account, via_token) {
                Ok(()) => true,
                Err(e) => {
                    tracing::error!(mechanism = mechanism.name(), error = %e, "Failed to attach account");
                    false
                }
            };
        }
        tracing::debug!(path = exchange.path(), "No mechanism authenticated the request");
        false
    }

    async fn attach_token_headers(&self, exchange: &mut Exchange) {
        let (Some(manager), Some(account)) = (&self.token_manager, exchange.account().cloned()) else {
            return;
        };

        let token = match manager.instance().get(&account).await {
            Some(token) => token,
            None if !exchange.authenticated_by_token() => manager.instance().issue(&account).await,
            None => return,
        };

        let location = format!(
            "/tokens/{}",
            urlencoding::encode(account.principal_id())
        );
        let valid_until = token.valid_until.to_rfc3339();
        let headers = &mut exchange.response_mut().headers;
        for (name, value) in [
            (AUTH_TOKEN_HEADER, token.value.as_str()),
            (AUTH_TOKEN_VALID_HEADER, valid_until.as_str()),
            (AUTH_TOKEN_LOCATION_HEADER, location.as_str()),
        ] {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
    }
}
