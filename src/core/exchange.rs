//! Per-request state carried through a pipeline.
//!
//! An [`Exchange`] is created by the HTTP adapter for every inbound request,
//! owned by the task handling that request, and converted back into a
//! response once the pipeline finishes. It is never shared between requests.
use std::{collections::BTreeSet, fmt, net::SocketAddr, sync::Arc};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::{HeaderMap, Method, StatusCode, Uri, header};
use serde::Serialize;
use thiserror::Error;

use crate::core::pipeline::PipelineInfo;

/// An authenticated identity.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    principal_id: String,
    roles: BTreeSet<String>,
    #[serde(skip)]
    credential_digest: Option<String>,
}

impl Account {
    pub fn new<I, S>(principal_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            principal_id: principal_id.into(),
            roles: roles.into_iter().map(Into::into).collect(),
            credential_digest: None,
        }
    }

    /// Attach the stored credential (plain or hashed) the account was loaded with.
    pub fn with_credential_digest(mut self, digest: impl Into<String>) -> Self {
        self.credential_digest = Some(digest.into());
        self
    }

    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn credential_digest(&self) -> Option<&str> {
        self.credential_digest.as_deref()
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("principal_id", &self.principal_id)
            .field("roles", &self.roles)
            .field("credential_digest", &self.credential_digest.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Progress of the security state machine for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated,
    /// No mechanism produced an account and a challenge was sent.
    Challenged,
    Allowed,
    Denied,
}

/// Read/write filter clauses an authorizer attached to the exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPredicate {
    pub read_filter: Option<serde_json::Value>,
    pub write_filter: Option<serde_json::Value>,
}

/// Errors raised while manipulating exchange content.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExchangeError {
    #[error("Content exceeds the maximum size of {0} bytes")]
    ContentTooLarge(usize),
    #[error("Failed to read content: {0}")]
    ContentRead(String),
    #[error("An account is already attached to this exchange")]
    AccountAlreadyAttached,
}

/// Request or response payload, either still streaming or fully buffered.
#[derive(Default)]
pub enum ExchangeBody {
    #[default]
    Empty,
    Streaming(AxumBody),
    Buffered(Bytes),
}

impl fmt::Debug for ExchangeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeBody::Empty => write!(f, "Empty"),
            ExchangeBody::Streaming(_) => write!(f, "Streaming"),
            ExchangeBody::Buffered(bytes) => write!(f, "Buffered({} bytes)", bytes.len()),
        }
    }
}

impl ExchangeBody {
    /// Buffer the payload, rejecting it once more than `max` bytes arrive.
    async fn buffer(&mut self, declared_len: Option<usize>, max: usize) -> Result<&Bytes, ExchangeError> {
        if let Some(len) = declared_len {
            if len > max {
                return Err(ExchangeError::ContentTooLarge(max));
            }
        }

        if let ExchangeBody::Streaming(_) | ExchangeBody::Empty = self {
            let bytes = match std::mem::take(self) {
                ExchangeBody::Streaming(body) => Limited::new(body, max)
                    .collect()
                    .await
                    .map(|collected| collected.to_bytes())
                    .map_err(|e| {
                        if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                            ExchangeError::ContentTooLarge(max)
                        } else {
                            ExchangeError::ContentRead(e.to_string())
                        }
                    })?,
                _ => Bytes::new(),
            };
            *self = ExchangeBody::Buffered(bytes);
        }

        match self {
            ExchangeBody::Buffered(bytes) => Ok(&*bytes),
            _ => Err(ExchangeError::ContentRead("content not buffered".to_string())),
        }
    }

    pub fn buffered(&self) -> Option<&Bytes> {
        match self {
            ExchangeBody::Buffered(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn into_axum_body(self) -> AxumBody {
        match self {
            ExchangeBody::Empty => AxumBody::empty(),
            ExchangeBody::Streaming(body) => body,
            ExchangeBody::Buffered(bytes) => AxumBody::from(bytes),
        }
    }
}

/// Response under construction.
#[derive(Debug)]
pub struct ExchangeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ExchangeBody,
    complete: bool,
}

impl Default for ExchangeResponse {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: ExchangeBody::Empty,
            complete: false,
        }
    }
}

impl ExchangeResponse {
    /// Whether a stage marked the response final.
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// Mutable per-request context.
#[derive(Debug)]
pub struct Exchange {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    client_addr: Option<SocketAddr>,
    scheme: &'static str,
    body: ExchangeBody,
    account: Option<Arc<Account>>,
    authenticated_by_token: bool,
    auth_state: AuthState,
    pipeline: Option<Arc<PipelineInfo>>,
    filter_predicate: Option<FilterPredicate>,
    filters: Vec<serde_json::Value>,
    response: ExchangeResponse,
}

impl Exchange {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: ExchangeBody) -> Self {
        Self {
            method,
            uri,
            headers,
            client_addr: None,
            scheme: "http",
            body,
            account: None,
            authenticated_by_token: false,
            auth_state: AuthState::Unauthenticated,
            pipeline: None,
            filter_predicate: None,
            filters: Vec::new(),
            response: ExchangeResponse::default(),
        }
    }

    /// Build an exchange from an inbound request, leaving the body streaming.
    pub fn from_request(req: hyper::Request<AxumBody>, client_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = req.into_parts();
        let mut exchange = Self::new(
            parts.method,
            parts.uri,
            parts.headers,
            ExchangeBody::Streaming(body),
        );
        exchange.client_addr = client_addr;
        exchange
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// First value of a query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then(|| {
                urlencoding::decode(&value.replace('+', " "))
                    .map(|v| v.into_owned())
                    .unwrap_or_else(|_| value.to_string())
            })
        })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header_str(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_addr
    }

    /// Scheme the client used to reach the gateway, `http` or `https`.
    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    pub fn with_scheme(mut self, scheme: &'static str) -> Self {
        self.scheme = scheme;
        self
    }

    /// Whether the method can carry a body that modifies data.
    pub fn is_write(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }

    pub fn account(&self) -> Option<&Arc<Account>> {
        self.account.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.account.is_some()
    }

    pub fn authenticated_by_token(&self) -> bool {
        self.authenticated_by_token
    }

    /// Attach the authenticated account. An account can be attached once.
    pub fn attach_account(&mut self, account: Account, via_token: bool) -> Result<(), ExchangeError> {
        if self.account.is_some() {
            return Err(ExchangeError::AccountAlreadyAttached);
        }
        self.account = Some(Arc::new(account));
        self.authenticated_by_token = via_token;
        self.auth_state = AuthState::Authenticated;
        Ok(())
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state
    }

    pub fn set_auth_state(&mut self, state: AuthState) {
        self.auth_state = state;
    }

    pub fn pipeline(&self) -> Option<&Arc<PipelineInfo>> {
        self.pipeline.as_ref()
    }

    pub fn set_pipeline(&mut self, info: Arc<PipelineInfo>) {
        self.pipeline = Some(info);
    }

    /// Path relative to the mount the exchange was routed to, always starting with `/`.
    pub fn relative_path(&self) -> String {
        let path = self.path();
        let prefix = self
            .pipeline
            .as_ref()
            .map(|info| info.uri_prefix.as_str())
            .unwrap_or("/");
        let rest = if prefix == "/" {
            path
        } else {
            path.strip_prefix(prefix).unwrap_or(path)
        };
        if rest.starts_with('/') {
            rest.to_string()
        } else {
            format!("/{rest}")
        }
    }

    pub fn filter_predicate(&self) -> Option<&FilterPredicate> {
        self.filter_predicate.as_ref()
    }

    pub fn set_filter_predicate(&mut self, predicate: FilterPredicate) {
        self.filter_predicate = Some(predicate);
    }

    /// Filter clauses accumulated by interceptors.
    pub fn filters(&self) -> &[serde_json::Value] {
        &self.filters
    }

    pub fn add_filter(&mut self, filter: serde_json::Value) {
        self.filters.push(filter);
    }

    /// Append `name=value` (percent-encoded) to the request query string.
    pub fn append_query_param(&mut self, name: &str, value: &str) {
        let pair = format!("{}={}", urlencoding::encode(name), urlencoding::encode(value));
        let path_and_query = match self.uri.query() {
            Some(query) if !query.is_empty() => format!("{}?{query}&{pair}", self.uri.path()),
            _ => format!("{}?{pair}", self.uri.path()),
        };

        let mut parts = self.uri.clone().into_parts();
        match path_and_query.parse() {
            Ok(pq) => {
                parts.path_and_query = Some(pq);
                match Uri::from_parts(parts) {
                    Ok(uri) => self.uri = uri,
                    Err(e) => tracing::warn!(error = %e, "Failed to rebuild request uri"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to append query parameter"),
        }
    }

    pub fn body(&self) -> &ExchangeBody {
        &self.body
    }

    /// Buffer the request body (bounded by `max` bytes) and return it.
    pub async fn request_content(&mut self, max: usize) -> Result<&Bytes, ExchangeError> {
        let declared = content_length(&self.headers);
        self.body.buffer(declared, max).await
    }

    /// Replace the request body, keeping `Content-Length` consistent.
    pub fn set_request_content(&mut self, content: Bytes) {
        set_content_length(&mut self.headers, content.len());
        self.body = ExchangeBody::Buffered(content);
    }

    pub fn take_body(&mut self) -> ExchangeBody {
        std::mem::take(&mut self.body)
    }

    pub fn response(&self) -> &ExchangeResponse {
        &self.response
    }

    pub fn response_mut(&mut self) -> &mut ExchangeResponse {
        &mut self.response
    }

    pub fn is_response_complete(&self) -> bool {
        self.response.complete
    }

    /// Mark the response final so remaining request stages are skipped.
    pub fn complete_response(&mut self) {
        self.response.complete = true;
    }

    /// Set a status and JSON body and mark the response final.
    pub fn end_with_status(&mut self, status: StatusCode, message: Option<&str>) {
        let mut body = serde_json::json!({
            "http status code": status.as_u16(),
            "http status description": status.canonical_reason().unwrap_or_default(),
        });
        if let (Some(message), Some(map)) = (message, body.as_object_mut()) {
            map.insert("message".to_string(), serde_json::Value::from(message));
        }
        self.respond_json(status, &body);
        self.response.complete = true;
    }

    /// Set a JSON body without marking the response final.
    pub fn respond_json(&mut self, status: StatusCode, value: &serde_json::Value) {
        let content = Bytes::from(value.to_string());
        self.response.status = status;
        self.response.headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        set_content_length(&mut self.response.headers, content.len());
        self.response.body = ExchangeBody::Buffered(content);
    }

    /// Install a response produced elsewhere (a service or an upstream),
    /// keeping headers already set by earlier stages.
    pub fn set_response(&mut self, status: StatusCode, headers: HeaderMap, body: ExchangeBody) {
        let staged = std::mem::replace(&mut self.response.headers, headers);
        for (name, value) in staged.iter() {
            if !self.response.headers.contains_key(name) {
                self.response.headers.append(name, value.clone());
            }
        }
        self.response.status = status;
        self.response.body = body;
    }

    /// Buffer the response body (bounded by `max` bytes) and return it.
    pub async fn response_content(&mut self, max: usize) -> Result<&Bytes, ExchangeError> {
        let declared = content_length(&self.response.headers);
        self.response.body.buffer(declared, max).await
    }

    /// Replace the response body, keeping `Content-Length` consistent.
    pub fn set_response_content(&mut self, content: Bytes) {
        self.response.headers.remove(header::TRANSFER_ENCODING);
        set_content_length(&mut self.response.headers, content.len());
        self.response.body = ExchangeBody::Buffered(content);
    }

    /// Convert the finished exchange into the response sent to the client.
    pub fn into_response(self) -> hyper::Response<AxumBody> {
        let ExchangeResponse {
            status,
            headers,
            body,
            ..
        } = self.response;
        let mut response = hyper::Response::new(body.into_axum_body());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(len));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::PipelineKind;

    fn exchange(method: Method, uri: &str, body: ExchangeBody) -> Exchange {
        Exchange::new(method, uri.parse().unwrap(), HeaderMap::new(), body)
    }

    #[test]
    fn test_account_can_be_attached_once() {
        let mut ex = exchange(Method::GET, "/", ExchangeBody::Empty);
        assert_eq!(ex.auth_state(), AuthState::Unauthenticated);

        ex.attach_account(Account::new("alice", ["admin"]), false)
            .unwrap();
        assert_eq!(ex.auth_state(), AuthState::Authenticated);

        let second = ex.attach_account(Account::new("mallory", ["admin"]), true);
        assert!(matches!(second, Err(ExchangeError::AccountAlreadyAttached)));
        assert_eq!(ex.account().unwrap().principal_id(), "alice");
        assert!(!ex.authenticated_by_token());
    }

    #[test]
    fn test_account_debug_redacts_credential() {
        let account = Account::new("alice", ["user"]).with_credential_digest("secret");
        let rendered = format!("{account:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("***"));
    }

    #[tokio::test]
    async fn test_request_content_is_buffered_once() {
        let mut ex = exchange(
            Method::POST,
            "/data",
            ExchangeBody::Streaming(AxumBody::from("{\"a\":1}")),
        );
        assert_eq!(ex.request_content(1024).await.unwrap().as_ref(), b"{\"a\":1}");
        assert!(ex.body().buffered().is_some());
        assert_eq!(ex.request_content(1024).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_oversized_content_is_rejected() {
        let mut ex = exchange(
            Method::POST,
            "/data",
            ExchangeBody::Streaming(AxumBody::from(vec![b'x'; 64])),
        );
        let result = ex.request_content(16).await;
        assert!(matches!(result, Err(ExchangeError::ContentTooLarge(16))));
    }

    #[tokio::test]
    async fn test_declared_length_is_checked_before_reading() {
        let mut ex = exchange(
            Method::POST,
            "/data",
            ExchangeBody::Streaming(AxumBody::empty()),
        );
        ex.headers_mut()
            .insert(header::CONTENT_LENGTH, header::HeaderValue::from(1_000_000));
        let result = ex.request_content(1024).await;
        assert!(matches!(result, Err(ExchangeError::ContentTooLarge(1024))));
    }

    #[test]
    fn test_relative_path_strips_mount_prefix() {
        let mut ex = exchange(Method::GET, "/api/users/1?x=1", ExchangeBody::Empty);
        assert_eq!(ex.relative_path(), "/api/users/1");

        ex.set_pipeline(Arc::new(PipelineInfo::new(
            PipelineKind::Proxy,
            "/api",
            "api",
        )));
        assert_eq!(ex.relative_path(), "/users/1");

        let mut root = exchange(Method::GET, "/api", ExchangeBody::Empty);
        root.set_pipeline(Arc::new(PipelineInfo::new(PipelineKind::Proxy, "/api", "api")));
        assert_eq!(root.relative_path(), "/");
    }

    #[test]
    fn test_relative_path_under_trailing_slash_mount() {
        let info = Arc::new(PipelineInfo::new(PipelineKind::Proxy, "/api/", "api"));
        let relative = |uri: &str| {
            let mut ex = exchange(Method::GET, uri, ExchangeBody::Empty);
            ex.set_pipeline(info.clone());
            ex.relative_path()
        };
        assert_eq!(relative("/api"), "/");
        assert_eq!(relative("/api/"), "/");
        assert_eq!(relative("/api/x"), "/x");
    }

    #[test]
    fn test_query_param_is_decoded() {
        let ex = exchange(
            Method::GET,
            "/users?filter=%7B%22password%22%3A1%7D&page=2",
            ExchangeBody::Empty,
        );
        assert_eq!(ex.query_param("filter").as_deref(), Some("{\"password\":1}"));
        assert_eq!(ex.query_param("page").as_deref(), Some("2"));
        assert_eq!(ex.query_param("missing"), None);
    }

    #[test]
    fn test_set_response_keeps_staged_headers() {
        let mut ex = exchange(Method::GET, "/", ExchangeBody::Empty);
        ex.response_mut()
            .headers
            .insert("x-powered-by", header::HeaderValue::from_static("gatehouse"));

        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/plain"));
        ex.set_response(StatusCode::CREATED, upstream, ExchangeBody::Empty);

        let response = ex.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-powered-by").unwrap(), "gatehouse");
        assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");
    }

    #[test]
    fn test_end_with_status_marks_complete() {
        let mut ex = exchange(Method::GET, "/", ExchangeBody::Empty);
        ex.end_with_status(StatusCode::FORBIDDEN, Some("denied"));
        assert!(ex.is_response_complete());
        assert_eq!(ex.response().status, StatusCode::FORBIDDEN);
        let body = ex.response().body.buffered().unwrap();
        let json: serde_json::Value = serde_json::from_slice(body).unwrap();
        assert_eq!(json["http status code"], 403);
        assert_eq!(json["message"], "denied");
    }

    #[test]
    fn test_append_query_param() {
        let mut ex = exchange(Method::GET, "/api/x?page=2", ExchangeBody::Empty);
        ex.append_query_param("filter", "{\"a\":1}");
        assert_eq!(ex.path(), "/api/x");
        assert_eq!(ex.query(), Some("page=2&filter=%7B%22a%22%3A1%7D"));
        assert_eq!(ex.query_param("filter").as_deref(), Some("{\"a\":1}"));

        let mut bare = exchange(Method::GET, "/api", ExchangeBody::Empty);
        bare.append_query_param("k", "v");
        assert_eq!(bare.query(), Some("k=v"));
    }
}
