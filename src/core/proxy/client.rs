//! Load-balancing reverse proxy client.
//!
//! Each proxy pipeline owns one client. The client selects a host round-robin
//! among hosts that are not quarantined, preferring hosts under the soft
//! connection threshold, then any host under the hard cap. When every host is
//! at its cap the request waits in a bounded queue or is rejected.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::body::Body as AxumBody;
use http_body_util::BodyExt;
use hyper::{
    HeaderMap, Request, StatusCode,
    header::{self, HeaderName, HeaderValue},
};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::Instrument;

use crate::{
    config::models::ProxyOptions,
    core::{
        exchange::{Exchange, ExchangeBody},
        proxy::host::{HostLease, UpstreamHost, UpstreamUrl},
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup,
};

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Proxy target '{0}' has no valid upstream")]
    EmptyPool(String),
    #[error("No upstream host available")]
    NoAvailableHost,
    #[error("Upstream capacity and queue exhausted")]
    QueueFull,
    #[error("Timed out waiting for upstream capacity")]
    QueueTimeout,
    #[error("Upstream connection failed: {0}")]
    Connect(String),
    #[error("Upstream did not answer within {0:?}")]
    Timeout(Duration),
    #[error("Invalid upstream request: {0}")]
    InvalidRequest(String),
}

impl ProxyError {
    /// Status sent to the client for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoAvailableHost | ProxyError::QueueFull | ProxyError::QueueTimeout => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Connect(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::EmptyPool(_) | ProxyError::InvalidRequest(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Upstream pool and connection policy of one proxy pipeline.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    upstreams: Vec<UpstreamUrl>,
    options: ProxyOptions,
}

impl ProxyTarget {
    /// Malformed upstream URLs are logged and left out of the pool. A pool
    /// left empty is an error.
    pub fn new(name: &str, upstreams: &[String], options: ProxyOptions) -> Result<Self, ProxyError> {
        let upstreams: Vec<UpstreamUrl> = upstreams
            .iter()
            .filter_map(|raw| match raw.parse::<UpstreamUrl>() {
                Ok(url) => Some(url),
                Err(e) => {
                    tracing::error!(proxy = name, error = %e, "Excluding malformed upstream URL");
                    None
                }
            })
            .collect();

        if upstreams.is_empty() {
            return Err(ProxyError::EmptyPool(name.to_string()));
        }
        Ok(Self { upstreams, options })
    }

    pub fn upstreams(&self) -> &[UpstreamUrl] {
        &self.upstreams
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }
}

pub struct LoadBalancingProxyClient {
    name: String,
    target: ProxyTarget,
    hosts: Vec<Arc<UpstreamHost>>,
    http: Arc<dyn HttpClient>,
    next: AtomicUsize,
    queued: AtomicUsize,
    released: Arc<Notify>,
}

impl LoadBalancingProxyClient {
    pub fn new(name: impl Into<String>, target: ProxyTarget, http: Arc<dyn HttpClient>) -> Self {
        let name = name.into();
        let released = Arc::new(Notify::new());
        let options = target.options();
        let hosts = target
            .upstreams()
            .iter()
            .map(|url| {
                Arc::new(UpstreamHost::new(
                    url.clone(),
                    options.connections_per_thread,
                    Duration::from_secs(options.problem_server_retry_secs),
                    released.clone(),
                ))
            })
            .collect();

        tracing::info!(
            proxy = %name,
            upstreams = ?target.upstreams().iter().map(ToString::to_string).collect::<Vec<_>>(),
            connections_per_host = options.connections_per_thread,
            soft_max = options.soft_max_connections_per_thread,
            max_queue = options.max_queue_size,
            "Proxy client created"
        );

        Self {
            name,
            target,
            hosts,
            http,
            next: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            released,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    pub fn hosts(&self) -> &[Arc<UpstreamHost>] {
        &self.hosts
    }

    /// Requests currently waiting for capacity.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Pick a host and take a connection slot on it.
    pub async fn acquire(&self) -> Result<HostLease, ProxyError> {
        if let Some(lease) = self.try_select()? {
            return Ok(lease);
        }

        let max_queue = self.target.options.max_queue_size;
        if self.queued.fetch_add(1, Ordering::AcqRel) >= max_queue {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!(proxy = %self.name, max_queue, "Upstream capacity exhausted, rejecting request");
            return Err(ProxyError::QueueFull);
        }

        let wait = Duration::from_millis(self.target.options.request_timeout_millis);
        let result = tokio::time::timeout(wait, self.wait_for_slot()).await;
        self.queued.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(lease) => lease,
            Err(_) => Err(ProxyError::QueueTimeout),
        }
    }

    async fn wait_for_slot(&self) -> Result<HostLease, ProxyError> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_select()? {
                return Ok(lease);
            }
            notified.await;
        }
    }

    fn try_select(&self) -> Result<Option<HostLease>, ProxyError> {
        let count = self.hosts.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        let rotation: Vec<&Arc<UpstreamHost>> = (0..count)
            .map(|i| &self.hosts[(start + i) % count])
            .filter(|host| host.is_available())
            .collect();

        metrics::set_problem_servers(&self.name, count - rotation.len());
        if rotation.is_empty() {
            return Err(ProxyError::NoAvailableHost);
        }

        let soft_max = self.target.options.soft_max_connections_per_thread;
        let preferred = rotation
            .iter()
            .filter(|host| host.in_flight() < soft_max)
            .find_map(|host| host.try_lease());
        if preferred.is_some() {
            return Ok(preferred);
        }

        Ok(rotation.iter().find_map(|host| host.try_lease()))
    }

    /// Forward the exchange's request upstream and install the response.
    pub async fn forward(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        let lease = match self.acquire().await {
            Ok(lease) => lease,
            Err(e) => {
                metrics::increment_proxy_request(&self.name, None, "rejected");
                return Err(e);
            }
        };
        let host = lease.host().clone();
        let upstream = host.url().to_string();

        let uri = host
            .url()
            .join(&exchange.relative_path(), exchange.query())
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        let headers = self.outbound_headers(exchange, host.url());

        let mut request = Request::builder()
            .method(exchange.method().clone())
            .uri(uri)
            .body(exchange.take_body().into_axum_body())
            .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;
        *request.headers_mut() = headers;

        let span = tracing_setup::create_backend_span(
            &upstream,
            exchange.method().as_str(),
            request.uri().path(),
        );

        let timeout = Duration::from_millis(self.target.options.request_timeout_millis);
        let outcome = tokio::time::timeout(timeout, self.http.send_request(request))
            .instrument(span.clone())
            .await;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(HttpClientError::InvalidRequest(e))) => {
                return Err(ProxyError::InvalidRequest(e));
            }
            Ok(Err(HttpClientError::Timeout(_))) | Err(_) => {
                self.record_failure(&host, "timeout");
                return Err(ProxyError::Timeout(timeout));
            }
            Ok(Err(e)) => {
                self.record_failure(&host, "connect_error");
                return Err(ProxyError::Connect(e.to_string()));
            }
        };

        host.record_success();
        metrics::increment_proxy_request(&self.name, Some(&upstream), "ok");
        span.record("http.status_code", response.status().as_u16());

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        // The slot stays taken until the response body is done streaming
        let body = AxumBody::new(body.map_frame(move |frame| {
            let _held = &lease;
            frame
        }));
        exchange.set_response(parts.status, parts.headers, ExchangeBody::Streaming(body));
        Ok(())
    }

    fn record_failure(&self, host: &UpstreamHost, outcome: &'static str) {
        metrics::increment_proxy_request(&self.name, Some(&host.url().to_string()), outcome);
        if host.record_failure() {
            let problems = self.hosts.iter().filter(|h| h.is_problem_server()).count();
            metrics::set_problem_servers(&self.name, problems);
        }
    }

    fn outbound_headers(&self, exchange: &Exchange, upstream: &UpstreamUrl) -> HeaderMap {
        let mut headers = exchange.headers().clone();
        strip_hop_by_hop(&mut headers);

        let original_host = exchange.header_str(header::HOST).map(str::to_string);

        if self.target.options.rewrite_host_header {
            if let Ok(value) = HeaderValue::from_str(upstream.authority()) {
                headers.insert(header::HOST, value);
            }
        }

        if let Some(addr) = exchange.client_addr() {
            let forwarded_for = match exchange.header_str("x-forwarded-for") {
                Some(existing) => format!("{existing}, {}", addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(HeaderName::from_static("x-forwarded-for"), value);
            }
        }
        if !headers.contains_key("x-forwarded-proto") {
            headers.insert(
                HeaderName::from_static("x-forwarded-proto"),
                HeaderValue::from_static(exchange.scheme()),
            );
        }
        if let Some(host) = original_host.and_then(|h| HeaderValue::from_str(&h).ok()) {
            headers.insert(HeaderName::from_static("x-forwarded-host"), host);
        }

        headers
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hyper::{Method, Response};

    use super::*;
    use crate::{
        core::pipeline::{PipelineInfo, PipelineKind},
        ports::http_client::HttpClientResult,
    };

    /// Records requests and answers with a fixed status, or fails.
    #[derive(Default)]
    struct MockClient {
        seen: Mutex<Vec<Request<AxumBody>>>,
        fail: Mutex<Option<HttpClientError>>,
    }

    #[async_trait]
    impl HttpClient for MockClient {
        async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
            let authority = req.uri().authority().map(ToString::to_string).unwrap_or_default();
            self.seen.lock().unwrap().push(req);
            if let Some(e) = self.fail.lock().unwrap().take() {
                return Err(e);
            }
            let mut response = Response::new(AxumBody::from(authority));
            response.headers_mut().insert(header::CONNECTION, HeaderValue::from_static("close"));
            Ok(response)
        }
    }

    fn options() -> ProxyOptions {
        ProxyOptions {
            connections_per_thread: 2,
            soft_max_connections_per_thread: 1,
            max_queue_size: 0,
            ..ProxyOptions::default()
        }
    }

    fn client(upstreams: &[&str], options: ProxyOptions, http: Arc<MockClient>) -> LoadBalancingProxyClient {
        let upstreams: Vec<String> = upstreams.iter().map(|s| s.to_string()).collect();
        let target = ProxyTarget::new("api", &upstreams, options).unwrap();
        LoadBalancingProxyClient::new("api", target, http)
    }

    fn exchange(path: &str) -> Exchange {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("gateway.example.com"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        let mut ex = Exchange::new(Method::GET, path.parse().unwrap(), headers, ExchangeBody::Empty);
        ex.set_pipeline(Arc::new(PipelineInfo::new(PipelineKind::Proxy, "/api", "api")));
        ex
    }

    #[test]
    fn test_malformed_upstreams_are_excluded() {
        let upstreams = vec!["not a url".to_string(), "http://127.0.0.1:1".to_string()];
        let target = ProxyTarget::new("api", &upstreams, ProxyOptions::default()).unwrap();
        assert_eq!(target.upstreams().len(), 1);

        let only_bad = vec!["ftp://x".to_string()];
        assert!(matches!(
            ProxyTarget::new("api", &only_bad, ProxyOptions::default()),
            Err(ProxyError::EmptyPool(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_rewrites_uri_and_headers() {
        let http = Arc::new(MockClient::default());
        let client = client(&["http://10.0.0.1:8080/db"], options(), http.clone());

        let mut ex = exchange("/api/users?page=2");
        client.forward(&mut ex).await.unwrap();

        let seen = http.seen.lock().unwrap();
        let request = &seen[0];
        assert_eq!(request.uri(), "http://10.0.0.1:8080/db/users?page=2");
        assert_eq!(request.headers().get(header::HOST).unwrap(), "10.0.0.1:8080");
        assert_eq!(request.headers().get("x-forwarded-host").unwrap(), "gateway.example.com");
        assert_eq!(request.headers().get("x-forwarded-proto").unwrap(), "http");
        assert!(!request.headers().contains_key(header::CONNECTION));
        assert!(!request.headers().contains_key("x-trace"));
        assert!(!ex.response().headers.contains_key(header::CONNECTION));
    }

    #[tokio::test]
    async fn test_forwarded_proto_follows_listener_scheme() {
        let http = Arc::new(MockClient::default());
        let client = client(&["http://10.0.0.1:8080"], options(), http.clone());

        client.forward(&mut exchange("/api/x").with_scheme("https")).await.unwrap();

        let mut relayed = exchange("/api/x").with_scheme("https");
        relayed
            .headers_mut()
            .insert("x-forwarded-proto", HeaderValue::from_static("http"));
        client.forward(&mut relayed).await.unwrap();

        let seen = http.seen.lock().unwrap();
        assert_eq!(seen[0].headers().get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(seen[1].headers().get("x-forwarded-proto").unwrap(), "http");
    }

    #[tokio::test]
    async fn test_host_header_preserved_when_not_rewriting() {
        let http = Arc::new(MockClient::default());
        let options = ProxyOptions {
            rewrite_host_header: false,
            ..options()
        };
        let client = client(&["http://10.0.0.1:8080"], options, http.clone());

        client.forward(&mut exchange("/api/x")).await.unwrap();
        let seen = http.seen.lock().unwrap();
        assert_eq!(seen[0].headers().get(header::HOST).unwrap(), "gateway.example.com");
    }

    #[tokio::test]
    async fn test_round_robin_across_hosts() {
        let http = Arc::new(MockClient::default());
        let client = client(&["http://10.0.0.1", "http://10.0.0.2"], options(), http.clone());

        for _ in 0..4 {
            client.forward(&mut exchange("/api/x")).await.unwrap();
        }
        let authorities: Vec<_> = http
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.uri().authority().unwrap().to_string())
            .collect();
        assert_eq!(authorities, ["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]);
    }

    #[tokio::test]
    async fn test_soft_max_prefers_less_loaded_host() {
        let http = Arc::new(MockClient::default());
        let client = client(&["http://10.0.0.1", "http://10.0.0.2"], options(), http);

        let first = client.acquire().await.unwrap();
        let second = client.acquire().await.unwrap();
        assert_ne!(first.host().url(), second.host().url());

        // Both hosts are at the soft max, the hard cap still allows one more each
        let third = client.acquire().await.unwrap();
        let fourth = client.acquire().await.unwrap();
        assert_ne!(third.host().url(), fourth.host().url());
        assert!(matches!(client.acquire().await, Err(ProxyError::QueueFull)));
    }

    #[tokio::test]
    async fn test_queued_request_waits_for_a_slot() {
        let http = Arc::new(MockClient::default());
        let options = ProxyOptions {
            connections_per_thread: 1,
            soft_max_connections_per_thread: 1,
            max_queue_size: 1,
            ..ProxyOptions::default()
        };
        let client = Arc::new(client(&["http://10.0.0.1"], options, http));

        let held = client.acquire().await.unwrap();
        let waiter = {
            let client = client.clone();
            tokio::spawn(async move { client.acquire().await.map(|_| ()) })
        };
        while client.queued() == 0 {
            tokio::task::yield_now().await;
        }

        // Queue is full now
        assert!(matches!(client.acquire().await, Err(ProxyError::QueueFull)));

        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(client.queued(), 0);
    }

    #[tokio::test]
    async fn test_failures_map_to_gateway_statuses() {
        let http = Arc::new(MockClient::default());
        let client = client(&["http://10.0.0.1"], options(), http.clone());

        *http.fail.lock().unwrap() = Some(HttpClientError::ConnectionError("refused".into()));
        let err = client.forward(&mut exchange("/api/x")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);

        *http.fail.lock().unwrap() = Some(HttpClientError::Timeout(10));
        let err = client.forward(&mut exchange("/api/x")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(client.hosts()[0].consecutive_failures(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_problem_server_leaves_rotation() {
        let http = Arc::new(MockClient::default());
        let client = client(&["http://10.0.0.1"], options(), http.clone());

        for _ in 0..3 {
            *http.fail.lock().unwrap() = Some(HttpClientError::ConnectionError("refused".into()));
            assert!(client.forward(&mut exchange("/api/x")).await.is_err());
        }

        let err = client.forward(&mut exchange("/api/x")).await.unwrap_err();
        assert!(matches!(err, ProxyError::NoAvailableHost));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(client.forward(&mut exchange("/api/x")).await.is_ok());
    }

    /// Keeps the labels of every proxy request counter increment.
    #[derive(Default)]
    struct ProxyCounterLabels(Mutex<Vec<Vec<(String, String)>>>);

    impl ::metrics::Recorder for ProxyCounterLabels {
        fn describe_counter(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}

        fn describe_gauge(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}

        fn describe_histogram(&self, _: ::metrics::KeyName, _: Option<::metrics::Unit>, _: ::metrics::SharedString) {}

        fn register_counter(&self, key: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Counter {
            if key.name() == metrics::GATEHOUSE_PROXY_REQUESTS_TOTAL {
                let labels = key
                    .labels()
                    .map(|label| (label.key().to_string(), label.value().to_string()))
                    .collect();
                self.0.lock().unwrap().push(labels);
            }
            ::metrics::Counter::noop()
        }

        fn register_gauge(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Gauge {
            ::metrics::Gauge::noop()
        }

        fn register_histogram(&self, _: &::metrics::Key, _: &::metrics::Metadata<'_>) -> ::metrics::Histogram {
            ::metrics::Histogram::noop()
        }
    }

    #[test]
    fn test_proxy_counter_labels_are_uniform_across_outcomes() {
        let recorder = ProxyCounterLabels::default();
        ::metrics::with_local_recorder(&recorder, || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let http = Arc::new(MockClient::default());
                let client = client(&["http://10.0.0.1"], options(), http.clone());

                client.forward(&mut exchange("/api/x")).await.unwrap();

                *http.fail.lock().unwrap() = Some(HttpClientError::ConnectionError("refused".into()));
                assert!(client.forward(&mut exchange("/api/x")).await.is_err());

                let _first = client.acquire().await.unwrap();
                let _second = client.acquire().await.unwrap();
                assert!(matches!(
                    client.forward(&mut exchange("/api/x")).await,
                    Err(ProxyError::QueueFull)
                ));
            });
        });

        let labels = |target: &str, upstream: &str, outcome: &str| {
            vec![
                ("target".to_string(), target.to_string()),
                ("upstream".to_string(), upstream.to_string()),
                ("outcome".to_string(), outcome.to_string()),
            ]
        };
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![
                labels("api", "http://10.0.0.1", "ok"),
                labels("api", "http://10.0.0.1", "connect_error"),
                labels("api", "none", "rejected"),
            ]
        );
    }
}
