//! Interceptor chain executor.
//!
//! One chain exists per intercept point. Candidates are ordered by priority
//! once at bootstrap; applicability (`resolve`) is evaluated right before each
//! interceptor runs because earlier interceptors may change the exchange.
use hyper::StatusCode;

use crate::{
    core::{
        exchange::{Exchange, ExchangeError},
        plugin::PluginRecord,
    },
    ports::interceptor::{InterceptPoint, Interceptor},
};

/// How a chain run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    Completed,
    /// The named interceptor marked the response final.
    ShortCircuited(String),
    /// The named interceptor failed; the rest of this point was skipped.
    Failed(String),
}

pub struct InterceptorChain {
    point: InterceptPoint,
    interceptors: Vec<PluginRecord<dyn Interceptor>>,
}

impl InterceptorChain {
    /// Keep the enabled candidates declared for `point`, ordered by priority.
    /// Equal priorities keep their configured order.
    pub fn new(point: InterceptPoint, candidates: &[PluginRecord<dyn Interceptor>]) -> Self {
        let mut interceptors: Vec<_> = candidates
            .iter()
            .filter(|i| i.is_enabled() && i.instance().intercept_point() == point)
            .cloned()
            .collect();
        interceptors.sort_by_key(|i| i.instance().priority());

        tracing::debug!(
            ?point,
            interceptors = ?interceptors.iter().map(|i| i.name()).collect::<Vec<_>>(),
            "Interceptor chain built"
        );

        Self { point, interceptors }
    }

    pub fn point(&self) -> InterceptPoint {
        self.point
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub async fn execute(&self, exchange: &mut Exchange, max_content: usize) -> ChainOutcome {
        let response_point = self.point == InterceptPoint::Response;

        // Request points never run once a stage has produced the final response
        if !response_point && exchange.is_response_complete() {
            return ChainOutcome::Completed;
        }

        for record in &self.interceptors {
            let interceptor = record.instance();

            if !interceptor.resolve(exchange) {
                continue;
            }

            if interceptor.requires_content() {
                if let Err(e) = self.buffer_content(exchange, max_content).await {
                    tracing::warn!(interceptor = record.name(), error = %e, "Failed to buffer content");
                    let status = match e {
                        ExchangeError::ContentTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                        _ => StatusCode::BAD_REQUEST,
                    };
                    exchange.end_with_status(status, None);
                    return ChainOutcome::Failed(record.name().to_string());
                }
            }

            if let Err(e) = interceptor.handle(exchange).await {
                tracing::error!(
                    interceptor = record.name(),
                    point = ?self.point,
                    error = %e,
                    "Interceptor failed"
                );
                exchange.end_with_status(StatusCode::INTERNAL_SERVER_ERROR, None);
                return ChainOutcome::Failed(record.name().to_string());
            }

            if !response_point && exchange.is_response_complete() {
                tracing::debug!(interceptor = record.name(), "Interceptor completed the response");
                return ChainOutcome::ShortCircuited(record.name().to_string());
            }
        }

        ChainOutcome::Completed
    }

    async fn buffer_content(&self, exchange: &mut Exchange, max_content: usize) -> Result<(), ExchangeError> {
        if self.point == InterceptPoint::Response {
            exchange.response_content(max_content).await.map(|_| ())
        } else {
            exchange.request_content(max_content).await.map(|_| ())
        }
    }
}
