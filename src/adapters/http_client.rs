use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::{
    config::models::ProxyOptions,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// Connection pool settings of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_idle_per_host: usize,
    /// `None` keeps idle connections forever.
    pub idle_timeout: Option<Duration>,
    pub connect_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&ProxyOptions::default())
    }
}

impl From<&ProxyOptions> for PoolSettings {
    fn from(options: &ProxyOptions) -> Self {
        Self {
            max_idle_per_host: options.connections_per_thread,
            idle_timeout: u64::try_from(options.ttl_millis)
                .ok()
                .map(Duration::from_millis),
            connect_timeout: Duration::from_millis(options.connect_timeout_millis),
        }
    }
}

/// HTTP client adapter using Hyper with Rustls (HTTP/1.1, h2 through ALPN).
///
/// One instance backs one proxy mount or account store, so pool limits and
/// connection lifetimes follow that mount's options.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new(settings: PoolSettings) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs
        http_connector.set_connect_timeout(Some(settings.connect_timeout));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(settings.max_idle_per_host)
            .pool_idle_timeout(settings.idle_timeout)
            .build::<_, AxumBody>(https_connector);

        tracing::debug!(?settings, "Created upstream HTTP client");
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;
        if !parts.headers.contains_key(header::USER_AGENT) {
            parts.headers.insert(
                header::USER_AGENT,
                header::HeaderValue::from_static("Gatehouse/0.1"),
            );
        }

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        tracing::debug!(%method, %uri, "Sending upstream request");

        match self.client.request(Request::from_parts(parts, body)).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();
                // Framing is redone by the server side
                parts.headers.remove(header::TRANSFER_ENCODING);
                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::debug!(%method, %uri, error = %e, "Upstream request failed");
                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method} {uri} failed: {e}"
                )))
            }
        }
    }
}
