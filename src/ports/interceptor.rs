use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::exchange::Exchange;

/// Where in a pipeline an interceptor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptPoint {
    RequestBeforeAuth,
    RequestAfterAuth,
    Response,
}

/// Error raised by an interceptor's `handle`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InterceptorError {
    #[error("Invalid content: {0}")]
    InvalidContent(String),
    #[error("Interceptor failed: {0}")]
    Failed(String),
}

/// Inspects or mutates a request or response at a declared point.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    fn intercept_point(&self) -> InterceptPoint;

    /// Lower values run first.
    fn priority(&self) -> i32 {
        10
    }

    /// Whether `handle` needs the content fully buffered beforehand.
    fn requires_content(&self) -> bool {
        false
    }

    /// Applicability predicate, evaluated right before `handle`.
    fn resolve(&self, exchange: &Exchange) -> bool;

    async fn handle(&self, exchange: &mut Exchange) -> Result<(), InterceptorError>;
}
