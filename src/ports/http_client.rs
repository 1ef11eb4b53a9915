use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Upstream failures. Connection errors and timeouts count against the
/// host's health; invalid requests never reach the network.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Refused, reset or failed TLS handshake.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Upstream did not answer within {0} ms")]
    Timeout(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// Outbound leg of a proxy mount.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward `req`, whose URI is already absolute, and return the upstream
    /// response with its body still streaming.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
