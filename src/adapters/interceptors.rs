//! Built-in interceptors guarding the users collection and applying ACL filters.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::{Method, header};

use crate::{
    core::{
        exchange::{Account, Exchange},
        security::authenticator::Authenticator,
    },
    ports::interceptor::{InterceptPoint, Interceptor, InterceptorError},
};

fn is_under(path: &str, collection: &str) -> bool {
    let collection = collection.trim_end_matches('/');
    let path = path.trim_end_matches('/');
    path == collection
        || path
            .strip_prefix(collection)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn parse_json(content: &Bytes) -> Option<serde_json::Value> {
    if content.is_empty() {
        return None;
    }
    serde_json::from_slice(content).ok()
}

/// Replaces plaintext passwords in account documents written to the users
/// collection with their bcrypt hash.
pub struct PasswordHasherInterceptor {
    authenticator: Option<Arc<Authenticator>>,
}

impl PasswordHasherInterceptor {
    pub fn new(authenticator: Option<Arc<Authenticator>>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl Interceptor for PasswordHasherInterceptor {
    fn intercept_point(&self) -> InterceptPoint {
        InterceptPoint::RequestAfterAuth
    }

    fn requires_content(&self) -> bool {
        true
    }

    fn resolve(&self, exchange: &Exchange) -> bool {
        let Some(authenticator) = &self.authenticator else {
            return false;
        };
        authenticator.is_password_hashed()
            && matches!(*exchange.method(), Method::POST | Method::PUT | Method::PATCH)
            && is_under(exchange.path(), authenticator.users_uri())
    }

    async fn handle(&self, exchange: &mut Exchange) -> Result<(), InterceptorError> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(());
        };
        let Some(mut content) = exchange.body().buffered().and_then(parse_json) else {
            tracing::debug!(interceptor = "user_pwd_hasher", "Request content is not JSON, left as is");
            return Ok(());
        };

        let prop = authenticator.password_property();
        let mut hashed = 0;
        let documents: Vec<&mut serde_json::Value> = match &mut content {
            serde_json::Value::Array(items) => items.iter_mut().collect(),
            single => vec![single],
        };
        for document in documents {
            let Some(plain) = document.get(prop).and_then(|p| p.as_str()).map(str::to_string) else {
                continue;
            };
            let hash = authenticator
                .hash_password(&plain)
                .await
                .map_err(|e| InterceptorError::Failed(e.to_string()))?;
            if let Some(object) = document.as_object_mut() {
                object.insert(prop.to_string(), serde_json::Value::String(hash));
                hashed += 1;
            }
        }

        if hashed > 0 {
            let content = serde_json::to_vec(&content)
                .map_err(|e| InterceptorError::InvalidContent(e.to_string()))?;
            exchange.set_request_content(Bytes::from(content));
            tracing::debug!(interceptor = "user_pwd_hasher", hashed, "Hashed account passwords");
        }
        Ok(())
    }
}

/// Strips the password property from users collection responses.
pub struct PasswordRemoverInterceptor {
    authenticator: Option<Arc<Authenticator>>,
}

impl PasswordRemoverInterceptor {
    pub fn new(authenticator: Option<Arc<Authenticator>>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl Interceptor for PasswordRemoverInterceptor {
    fn intercept_point(&self) -> InterceptPoint {
        InterceptPoint::Response
    }

    fn requires_content(&self) -> bool {
        true
    }

    fn resolve(&self, exchange: &Exchange) -> bool {
        let Some(authenticator) = &self.authenticator else {
            return false;
        };
        let is_json = exchange
            .response()
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        is_json && is_under(exchange.path(), authenticator.users_uri())
    }

    async fn handle(&self, exchange: &mut Exchange) -> Result<(), InterceptorError> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(());
        };
        let Some(mut content) = exchange.response().body.buffered().and_then(parse_json) else {
            return Ok(());
        };

        let prop = authenticator.password_property();
        let removed = match &mut content {
            serde_json::Value::Array(items) => items
                .iter_mut()
                .filter_map(|item| item.as_object_mut())
                .map(|object| object.remove(prop).is_some())
                .filter(|removed| *removed)
                .count(),
            serde_json::Value::Object(object) => usize::from(object.remove(prop).is_some()),
            _ => 0,
        };

        if removed > 0 {
            let content = serde_json::to_vec(&content)
                .map_err(|e| InterceptorError::InvalidContent(e.to_string()))?;
            exchange.set_response_content(Bytes::from(content));
        }
        Ok(())
    }
}

/// Turns the read/write filter an ACL permission attached to the exchange
/// into a concrete filter, with `%u` and `%r` bound to the caller.
pub struct FilterPredicateInjector {
    enabled: bool,
}

impl FilterPredicateInjector {
    /// `enabled` is false when no `acl` authorizer is active.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

#[async_trait]
impl Interceptor for FilterPredicateInjector {
    fn intercept_point(&self) -> InterceptPoint {
        InterceptPoint::RequestAfterAuth
    }

    fn resolve(&self, exchange: &Exchange) -> bool {
        self.enabled && exchange.filter_predicate().is_some()
    }

    async fn handle(&self, exchange: &mut Exchange) -> Result<(), InterceptorError> {
        let Some(predicate) = exchange.filter_predicate() else {
            return Ok(());
        };
        let filter = if *exchange.method() == Method::GET {
            predicate.read_filter.as_ref()
        } else if exchange.is_write() {
            predicate.write_filter.as_ref()
        } else {
            None
        };
        let Some(filter) = filter else {
            tracing::trace!(interceptor = "filter_predicate_injector", "No filter for this method");
            return Ok(());
        };

        let resolved = interpolate(filter, exchange.account().map(Arc::as_ref));
        tracing::debug!(interceptor = "filter_predicate_injector", filter = %resolved, "Injecting filter");
        exchange.add_filter(resolved);
        Ok(())
    }
}

/// Replace `%u` with the principal id and a `%r` value with the role array.
fn interpolate(value: &serde_json::Value, account: Option<&Account>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if s == "%r" => serde_json::Value::Array(
            account
                .map(|a| a.roles().iter().cloned().map(serde_json::Value::String).collect())
                .unwrap_or_default(),
        ),
        serde_json::Value::String(s) if s.contains("%u") => {
            serde_json::Value::String(s.replace("%u", account.map(|a| a.principal_id()).unwrap_or("")))
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| interpolate(v, account)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate(v, account)))
                .collect(),
        ),
        other => other.clone(),
    }
}
