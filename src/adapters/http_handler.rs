use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::{
    Router,
    body::Body as AxumBody,
    extract::{ConnectInfo, Request},
    http::{StatusCode, header},
    routing::any,
};
use http_body_util::BodyExt;
use hyper::Response;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;

use crate::{
    core::{exchange::Exchange, gateway::GatewayService},
    metrics::{self, RequestTimer},
    tracing_setup,
    utils::{InFlightGuard, InFlightTracker},
};

/// Readiness check answered outside any pipeline.
pub const HEALTH_PATH: &str = "/_health";

/// Axum front of the gateway: admission control, readiness and metrics
/// around [`GatewayService::handle`].
#[derive(Clone)]
pub struct HttpHandler {
    gateway: Arc<GatewayService>,
    admission: Arc<Semaphore>,
    inflight: Arc<InFlightTracker>,
    draining: Arc<AtomicBool>,
    scheme: &'static str,
}

impl HttpHandler {
    /// `draining` flips to true once shutdown starts; see
    /// [`GracefulShutdown::shutdown_flag`](crate::utils::GracefulShutdown::shutdown_flag).
    pub fn new(
        gateway: Arc<GatewayService>,
        requests_limit: usize,
        inflight: Arc<InFlightTracker>,
        draining: Arc<AtomicBool>,
    ) -> Self {
        Self {
            gateway,
            admission: Arc::new(Semaphore::new(requests_limit.max(1))),
            inflight,
            draining,
            scheme: "http",
        }
    }

    /// Mark exchanges as arriving over TLS.
    pub fn with_tls(mut self, tls: bool) -> Self {
        self.scheme = if tls { "https" } else { "http" };
        self
    }

    pub fn inflight(&self) -> &Arc<InFlightTracker> {
        &self.inflight
    }

    /// Router sending every path and method to [`handle_request`](Self::handle_request).
    pub fn into_router(self) -> Router {
        let handler = Arc::new(self);
        let route = |handler: Arc<HttpHandler>| {
            any(move |req: Request| {
                let handler = handler.clone();
                async move {
                    let client_addr = req
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| *addr);
                    handler.handle_request(req, client_addr).await
                }
            })
        };

        Router::new()
            .route("/", route(handler.clone()))
            .route("/{*path}", route(handler))
    }

    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        if req.uri().path() == HEALTH_PATH {
            return self.handle_health_check();
        }

        if self.draining.load(Ordering::Acquire) {
            metrics::increment_rejected("shutting_down");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "Server is shutting down");
        }

        // Excess requests are refused rather than queued
        let Ok(permit) = self.admission.clone().try_acquire_owned() else {
            tracing::warn!(path = req.uri().path(), "Requests limit reached");
            metrics::increment_rejected("requests_limit");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "Too many requests in flight");
        };

        let slot = RequestSlot {
            guard: Some(self.inflight.track()),
            _permit: permit,
            inflight: self.inflight.clone(),
        };
        metrics::set_inflight_requests(self.inflight.active());

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let pipeline = self.gateway.pipeline_name(&path).unwrap_or("unrouted").to_string();
        let request_id = uuid::Uuid::new_v4().to_string();
        let span = tracing_setup::create_request_span(method.as_str(), &path, &pipeline, &request_id);
        let timer = RequestTimer::new(&pipeline);

        let response = self
            .gateway
            .handle(Exchange::from_request(req, client_addr).with_scheme(self.scheme))
            .instrument(span.clone())
            .await;

        let status = response.status().as_u16();
        span.record("http.status_code", status);
        span.record("duration_ms", timer.elapsed().as_millis() as u64);
        metrics::increment_request_total(&pipeline, method.as_str(), status);
        drop(timer);

        // Streamed bodies keep the request admitted until the last frame is sent
        let (parts, body) = response.into_parts();
        let body = AxumBody::new(body.map_frame(move |frame| {
            let _held = &slot;
            frame
        }));
        Response::from_parts(parts, body)
    }

    fn handle_health_check(&self) -> Response<AxumBody> {
        let draining = self.draining.load(Ordering::Acquire);
        let status = if draining {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        };
        let body = serde_json::json!({
            "status": if draining { "draining" } else { "serving" },
            "inflight": self.inflight.active(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        json_response(status, &body)
    }
}

/// Admission permit and in-flight registration of one request.
struct RequestSlot {
    guard: Option<InFlightGuard>,
    _permit: OwnedSemaphorePermit,
    inflight: Arc<InFlightTracker>,
}

impl Drop for RequestSlot {
    fn drop(&mut self) {
        drop(self.guard.take());
        metrics::set_inflight_requests(self.inflight.active());
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::from(body.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<AxumBody> {
    json_response(
        status,
        &serde_json::json!({
            "http status code": status.as_u16(),
            "http status description": status.canonical_reason().unwrap_or_default(),
            "message": message,
        }),
    )
}
