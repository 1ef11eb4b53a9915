use async_trait::async_trait;
use thiserror::Error;

use crate::core::exchange::Exchange;

/// Error raised by a service implementation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServiceError {
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Service failure: {0}")]
    Internal(String),
}

/// A request handler served locally by the gateway.
///
/// The request content is buffered before `handle` is called.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle(&self, exchange: &mut Exchange) -> Result<(), ServiceError>;
}
