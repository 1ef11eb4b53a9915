//! Built-in services.
use std::sync::Arc;

use async_trait::async_trait;
use hyper::{Method, StatusCode, header};
use serde::Deserialize;

use crate::{
    core::exchange::Exchange,
    ports::{
        service::{Service, ServiceError},
        token_manager::TokenManager,
    },
};

fn default_message() -> String {
    "Greetings from Gatehouse!".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingArgs {
    #[serde(default = "default_message")]
    pub message: String,
}

impl Default for PingArgs {
    fn default() -> Self {
        Self {
            message: default_message(),
        }
    }
}

fn method_not_allowed(exchange: &mut Exchange, allow: &'static str) {
    exchange
        .response_mut()
        .headers
        .insert(header::ALLOW, header::HeaderValue::from_static(allow));
    exchange.end_with_status(StatusCode::METHOD_NOT_ALLOWED, None);
}

/// Liveness check answering with a fixed message.
pub struct PingService {
    message: String,
}

impl PingService {
    pub fn new(args: PingArgs) -> Self {
        Self {
            message: args.message,
        }
    }
}

#[async_trait]
impl Service for PingService {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), ServiceError> {
        if !matches!(*exchange.method(), Method::GET | Method::HEAD) {
            method_not_allowed(exchange, "GET, HEAD");
            return Ok(());
        }
        exchange.respond_json(StatusCode::OK, &serde_json::json!({ "message": self.message }));
        Ok(())
    }
}

/// Reports the caller's authentication status and roles.
#[derive(Debug, Default)]
pub struct RolesService;

#[async_trait]
impl Service for RolesService {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), ServiceError> {
        if *exchange.method() != Method::GET {
            method_not_allowed(exchange, "GET");
            return Ok(());
        }
        let body = match exchange.account() {
            Some(account) => serde_json::json!({
                "authenticated": true,
                "roles": account.roles(),
            }),
            None => serde_json::json!({ "authenticated": false, "roles": [] }),
        };
        exchange.respond_json(StatusCode::OK, &body);
        Ok(())
    }
}

/// Token resource: `GET /{id}` describes the caller's token, `DELETE /{id}`
/// revokes it. Callers may only address their own token.
pub struct TokensService {
    tokens: Option<Arc<dyn TokenManager>>,
}

impl TokensService {
    pub fn new(tokens: Option<Arc<dyn TokenManager>>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Service for TokensService {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), ServiceError> {
        let Some(tokens) = &self.tokens else {
            exchange.end_with_status(StatusCode::NOT_FOUND, Some("Token manager not configured"));
            return Ok(());
        };
        let Some(account) = exchange.account().cloned() else {
            exchange.end_with_status(StatusCode::UNAUTHORIZED, None);
            return Ok(());
        };

        let relative = exchange.relative_path();
        let requested = relative.trim_matches('/');
        let requested = urlencoding::decode(requested)
            .map_err(|e| ServiceError::BadRequest(format!("Invalid token id: {e}")))?;
        if requested.is_empty() {
            exchange.end_with_status(StatusCode::BAD_REQUEST, Some("Token id missing from path"));
            return Ok(());
        }
        if requested != account.principal_id() {
            exchange.end_with_status(StatusCode::FORBIDDEN, None);
            return Ok(());
        }

        match *exchange.method() {
            Method::GET => match tokens.get(&account).await {
                Some(token) => exchange.respond_json(
                    StatusCode::OK,
                    &serde_json::json!({
                        "auth_token": token.value,
                        "auth_token_valid_until": token.valid_until.to_rfc3339(),
                    }),
                ),
                None => exchange.end_with_status(StatusCode::NOT_FOUND, None),
            },
            Method::DELETE => {
                tokens.invalidate(&account).await;
                tracing::info!(principal = account.principal_id(), "Auth token invalidated");
                exchange.response_mut().status = StatusCode::NO_CONTENT;
                exchange.complete_response();
            }
            _ => method_not_allowed(exchange, "GET, DELETE"),
        }
        Ok(())
    }
}
