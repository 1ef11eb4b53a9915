//! Gateway assembly and the per-request driver loop.
//!
//! [`GatewayService::bootstrap`] turns the validated configuration and the
//! plugin registry into a mount table of [`Pipeline`]s. Any inconsistency is
//! reported as a [`BootstrapError`] before traffic is served; nothing starts
//! partially. [`GatewayService::handle`] then drives one exchange through the
//! stages of the pipeline its path resolves to.
use std::{collections::HashSet, sync::Arc};

use axum::body::Body as AxumBody;
use hyper::{
    Method, Request, StatusCode,
    header::{self, HeaderName, HeaderValue},
};
use thiserror::Error;

use crate::{
    config::models::{CorsConfig, GatewayConfig, MountConfig, MountKind, ProxyOptions, StaticOptions},
    core::{
        exchange::{Exchange, ExchangeBody, ExchangeError},
        interceptor::InterceptorChain,
        pipeline::{Pipeline, PipelineHandler, PipelineInfo, PipelineKind, Stage},
        plugin::PluginRegistry,
        proxy::{LoadBalancingProxyClient, ProxyTarget},
        router::{PipelineRouter, RouterError},
        security::{
            SecurityOrchestrator, SecurityOutcome,
            orchestrator::{AUTH_TOKEN_HEADER, AUTH_TOKEN_LOCATION_HEADER, AUTH_TOKEN_VALID_HEADER},
        },
    },
    metrics,
    ports::{
        file_system::FileSystem,
        http_client::HttpClient,
        interceptor::InterceptPoint,
        service::ServiceError,
    },
};

pub const POWERED_BY: &str = "Gatehouse";
pub const FORWARDED_ACCOUNT_ID_HEADER: &str = "x-forwarded-account-id";
pub const FORWARDED_ROLES_HEADER: &str = "x-forwarded-roles";

/// A fatal startup problem. Each cause exits the process with its own code.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BootstrapError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid listener: {0}")]
    InvalidListener(String),
    #[error("Invalid mount '{location}': {reason}")]
    InvalidMount { location: String, reason: String },
    #[error("Duplicate mount path '{0}'")]
    DuplicateMount(String),
    #[error("Plugin '{name}' is misconfigured: {reason}")]
    PluginConfig { name: String, reason: String },
    #[error("Unknown {section} type '{kind}' for plugin '{name}'")]
    UnknownPlugin {
        section: &'static str,
        name: String,
        kind: String,
    },
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

impl BootstrapError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::InvalidConfig(_) => 2,
            BootstrapError::InvalidListener(_) => 3,
            BootstrapError::InvalidMount { .. } | BootstrapError::DuplicateMount(_) => 4,
            BootstrapError::PluginConfig { .. } | BootstrapError::UnknownPlugin { .. } => 5,
            BootstrapError::Bind { .. } => 6,
        }
    }

    fn invalid_mount(mount: &MountConfig, reason: impl Into<String>) -> Self {
        BootstrapError::InvalidMount {
            location: mount.location.clone(),
            reason: reason.into(),
        }
    }
}

/// Builds the upstream client of one proxy mount from its options.
pub type HttpClientFactory =
    Arc<dyn Fn(&ProxyOptions) -> eyre::Result<Arc<dyn HttpClient>> + Send + Sync>;

/// Mount args are optional; `null` means all defaults.
fn mount_args<T: serde::de::DeserializeOwned>(mount: &MountConfig) -> Result<T, BootstrapError> {
    let args = if mount.args.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        mount.args.clone()
    };
    serde_json::from_value(args).map_err(|e| BootstrapError::invalid_mount(mount, e.to_string()))
}

/// The assembled gateway: mount table, security policies and interceptor chains.
pub struct GatewayService {
    router: PipelineRouter<Pipeline>,
    registry: Arc<PluginRegistry>,
    secured: SecurityOrchestrator,
    anonymous: SecurityOrchestrator,
    before_auth: InterceptorChain,
    after_auth: InterceptorChain,
    response: InterceptorChain,
    file_system: Arc<dyn FileSystem>,
    proxies: Vec<Arc<LoadBalancingProxyClient>>,
    allowed_methods: HashSet<Method>,
    allow_header: HeaderValue,
    max_content_size: usize,
    cors: Option<CorsHeaders>,
}

struct CorsHeaders {
    allow_origin: HeaderValue,
    expose_headers: HeaderValue,
}

impl CorsHeaders {
    fn new(config: &CorsConfig) -> Result<Option<Self>, BootstrapError> {
        if !config.enabled {
            return Ok(None);
        }
        let mut exposed: Vec<&str> = config.expose_headers.iter().map(String::as_str).collect();
        for token_header in [AUTH_TOKEN_HEADER, AUTH_TOKEN_VALID_HEADER, AUTH_TOKEN_LOCATION_HEADER] {
            if !exposed.iter().any(|h| h.eq_ignore_ascii_case(token_header)) {
                exposed.push(token_header);
            }
        }
        let invalid = |e: header::InvalidHeaderValue| BootstrapError::InvalidConfig(format!("cors: {e}"));
        Ok(Some(Self {
            allow_origin: HeaderValue::from_str(&config.allow_origin).map_err(invalid)?,
            expose_headers: HeaderValue::from_str(&exposed.join(", ")).map_err(invalid)?,
        }))
    }
}

impl GatewayService {
    /// Assemble the gateway. Mounts are processed in configured order.
    pub fn bootstrap(
        config: &GatewayConfig,
        registry: Arc<PluginRegistry>,
        file_system: Arc<dyn FileSystem>,
        client_factory: HttpClientFactory,
    ) -> Result<Self, BootstrapError> {
        let mut allowed_methods = HashSet::new();
        for method in &config.allowed_methods {
            let parsed = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|_| BootstrapError::InvalidConfig(format!("unknown method '{method}'")))?;
            allowed_methods.insert(parsed);
        }
        let mut allow: Vec<&str> = allowed_methods.iter().map(Method::as_str).collect();
        allow.sort_unstable();
        let allow_header = HeaderValue::from_str(&allow.join(", "))
            .map_err(|e| BootstrapError::InvalidConfig(e.to_string()))?;

        let mut router = PipelineRouter::new();
        let mut proxies = Vec::new();
        for mount in &config.mounts {
            let pipeline = Self::build_pipeline(mount, &registry, &client_factory)?;
            if let PipelineHandler::Proxy(client) = pipeline.handler() {
                proxies.push(client.clone());
            }
            tracing::info!(
                location = %mount.location,
                kind = ?pipeline.info().kind,
                pipeline = %pipeline.info().name,
                secured = mount.secured,
                "Mounted pipeline"
            );
            router
                .mount(&mount.location, mount.match_policy, pipeline)
                .map_err(|e| match e {
                    RouterError::DuplicateMount(location) => BootstrapError::DuplicateMount(location),
                    other => BootstrapError::invalid_mount(mount, other.to_string()),
                })?;
        }
        if router.is_empty() {
            return Err(BootstrapError::InvalidConfig("no mounts configured".to_string()));
        }

        let secured = SecurityOrchestrator::new(
            registry.mechanisms(),
            registry.authorizers(),
            registry.global_predicates(),
            registry.token_manager(),
        );
        let interceptors = registry.interceptors();
        let before_auth = InterceptorChain::new(InterceptPoint::RequestBeforeAuth, interceptors);
        let after_auth = InterceptorChain::new(InterceptPoint::RequestAfterAuth, interceptors);
        let response = InterceptorChain::new(InterceptPoint::Response, interceptors);

        Ok(Self {
            secured,
            anonymous: SecurityOrchestrator::allow_anonymous(),
            before_auth,
            after_auth,
            response,
            router,
            registry,
            file_system,
            proxies,
            allowed_methods,
            allow_header,
            max_content_size: config.max_content_size,
            cors: CorsHeaders::new(&config.cors)?,
        })
    }

    fn build_pipeline(
        mount: &MountConfig,
        registry: &PluginRegistry,
        client_factory: &HttpClientFactory,
    ) -> Result<Pipeline, BootstrapError> {
        let what = mount
            .what
            .first()
            .ok_or_else(|| BootstrapError::invalid_mount(mount, "'what' is empty"))?;

        match mount.kind {
            MountKind::Service => {
                let service = registry
                    .service(what)
                    .filter(|s| s.is_enabled())
                    .ok_or_else(|| {
                        BootstrapError::invalid_mount(mount, format!("no enabled service named '{what}'"))
                    })?;
                let name = mount.name.clone().unwrap_or_else(|| what.to_string());
                Ok(Pipeline::service(
                    PipelineInfo::new(PipelineKind::Service, &mount.location, name),
                    mount.secured,
                    service.clone(),
                ))
            }
            MountKind::Proxy => {
                let options: ProxyOptions = mount_args(mount)?;
                let name = mount.display_name().to_string();
                let target = ProxyTarget::new(&name, &mount.what.to_vec(), options.clone())
                    .map_err(|e| BootstrapError::invalid_mount(mount, e.to_string()))?;
                let http = (client_factory.as_ref())(&options)
                    .map_err(|e| BootstrapError::invalid_mount(mount, format!("{e:#}")))?;
                let client = Arc::new(LoadBalancingProxyClient::new(name.clone(), target, http));
                Ok(Pipeline::proxy(
                    PipelineInfo::new(PipelineKind::Proxy, &mount.location, name),
                    mount.secured,
                    client,
                ))
            }
            MountKind::Static => {
                let options: StaticOptions = mount_args(mount)?;
                Ok(Pipeline::static_resource(
                    PipelineInfo::new(PipelineKind::StaticResource, &mount.location, mount.display_name()),
                    mount.secured,
                    what,
                    options.welcome_file,
                ))
            }
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn proxies(&self) -> &[Arc<LoadBalancingProxyClient>] {
        &self.proxies
    }

    pub fn is_method_allowed(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }

    /// Value of the `Allow` header sent with 405 responses.
    pub fn allow_header(&self) -> &HeaderValue {
        &self.allow_header
    }

    /// Name of the pipeline serving `path`, for logs and metrics.
    pub fn pipeline_name(&self, path: &str) -> Option<&str> {
        self.router.resolve(path).map(|p| p.info().name.as_str())
    }

    /// Run one exchange through its pipeline and produce the response.
    pub async fn handle(&self, mut exchange: Exchange) -> hyper::Response<AxumBody> {
        if !self.is_method_allowed(exchange.method()) {
            self.method_not_allowed(&mut exchange);
            return exchange.into_response();
        }

        let Some(pipeline) = self.router.resolve(exchange.path()) else {
            tracing::debug!(path = exchange.path(), "No pipeline mounted");
            exchange.end_with_status(StatusCode::NOT_FOUND, Some("Request not managed"));
            return exchange.into_response();
        };

        for stage in pipeline.stages() {
            // Only response interceptors see an exchange whose response is final
            if exchange.is_response_complete() && *stage != Stage::Interceptors(InterceptPoint::Response) {
                continue;
            }
            self.run_stage(*stage, pipeline, &mut exchange).await;
        }

        exchange.into_response()
    }

    async fn run_stage(&self, stage: Stage, pipeline: &Pipeline, exchange: &mut Exchange) {
        match stage {
            Stage::InjectPipelineInfo => exchange.set_pipeline(pipeline.info().clone()),
            Stage::LogRequest => tracing::debug!(
                pipeline = %pipeline.info().name,
                method = %exchange.method(),
                path = exchange.path(),
                "Routing request"
            ),
            Stage::Cors => self.apply_cors(exchange),
            Stage::PoweredBy => {
                exchange
                    .response_mut()
                    .headers
                    .insert(HeaderName::from_static("x-powered-by"), HeaderValue::from_static(POWERED_BY));
            }
            Stage::Interceptors(point) => {
                let chain = match point {
                    InterceptPoint::RequestBeforeAuth => &self.before_auth,
                    InterceptPoint::RequestAfterAuth => &self.after_auth,
                    InterceptPoint::Response => &self.response,
                };
                chain.execute(exchange, self.max_content_size).await;
            }
            Stage::Security => {
                let orchestrator = if pipeline.is_secured() {
                    &self.secured
                } else {
                    &self.anonymous
                };
                let outcome = orchestrator.secure(exchange).await;
                if outcome != SecurityOutcome::Allowed {
                    tracing::debug!(pipeline = %pipeline.info().name, ?outcome, "Request not allowed");
                }
            }
            Stage::RemoveAuthHeaders => {
                let headers = exchange.headers_mut();
                headers.remove(header::AUTHORIZATION);
                for name in [AUTH_TOKEN_HEADER, AUTH_TOKEN_VALID_HEADER, AUTH_TOKEN_LOCATION_HEADER] {
                    headers.remove(name);
                }
            }
            Stage::InjectForwardedHeaders => inject_forwarded_account(exchange),
            Stage::Handle => {
                self.run_handler(pipeline.handler(), exchange).await;
                exchange.complete_response();
            }
        }
    }

    fn apply_cors(&self, exchange: &mut Exchange) {
        let Some(cors) = &self.cors else {
            return;
        };
        let preflight = *exchange.method() == Method::OPTIONS;
        let requested_headers = exchange
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned();

        let headers = &mut exchange.response_mut().headers;
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, cors.allow_origin.clone());
        headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, cors.expose_headers.clone());
        headers.insert(header::ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));

        if preflight {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, self.allow_header.clone());
            headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                requested_headers.unwrap_or_else(|| HeaderValue::from_static("*")),
            );
            exchange.response_mut().status = StatusCode::OK;
            exchange.complete_response();
        }
    }

    fn method_not_allowed(&self, exchange: &mut Exchange) {
        metrics::increment_rejected("method_not_allowed");
        exchange
            .response_mut()
            .headers
            .insert(header::ALLOW, self.allow_header.clone());
        exchange.end_with_status(StatusCode::METHOD_NOT_ALLOWED, None);
    }

    async fn run_handler(&self, handler: &PipelineHandler, exchange: &mut Exchange) {
        match handler {
            PipelineHandler::Service(record) => {
                if let Err(e) = exchange.request_content(self.max_content_size).await {
                    let status = match e {
                        ExchangeError::ContentTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                        _ => StatusCode::BAD_REQUEST,
                    };
                    exchange.end_with_status(status, None);
                    return;
                }
                match record.instance().handle(exchange).await {
                    Ok(()) => {}
                    Err(ServiceError::BadRequest(message)) => {
                        exchange.end_with_status(StatusCode::BAD_REQUEST, Some(&message));
                    }
                    Err(e) => {
                        tracing::error!(service = record.name(), error = %e, "Service failed");
                        exchange.end_with_status(StatusCode::INTERNAL_SERVER_ERROR, None);
                    }
                }
            }
            PipelineHandler::Proxy(client) => {
                for filter in exchange.filters().to_vec() {
                    exchange.append_query_param("filter", &filter.to_string());
                }
                if let Err(e) = client.forward(exchange).await {
                    tracing::warn!(proxy = client.name(), error = %e, "Proxy forwarding failed");
                    exchange.end_with_status(e.status(), None);
                }
            }
            PipelineHandler::StaticResource { root, welcome_file } => {
                self.serve_static(root, welcome_file, exchange).await;
            }
        }
    }

    async fn serve_static(&self, root: &str, welcome_file: &str, exchange: &mut Exchange) {
        if !matches!(*exchange.method(), Method::GET | Method::HEAD) {
            exchange
                .response_mut()
                .headers
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            exchange.end_with_status(StatusCode::METHOD_NOT_ALLOWED, None);
            return;
        }

        let relative = exchange.relative_path();
        let mut request = Request::builder()
            .method(exchange.method().clone())
            .uri(relative.as_str())
            .body(AxumBody::empty())
            .unwrap_or_else(|_| Request::new(AxumBody::empty()));
        *request.headers_mut() = exchange.headers().clone();

        match self.file_system.serve_file(root, &relative, welcome_file, request).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                exchange.set_response(parts.status, parts.headers, ExchangeBody::Streaming(body));
            }
            Err(e) => {
                tracing::debug!(root, path = %relative, error = %e, "Static resource not served");
                exchange.end_with_status(StatusCode::NOT_FOUND, None);
            }
        }
    }
}

/// Replace client supplied identity headers with the attached account, if any.
fn inject_forwarded_account(exchange: &mut Exchange) {
    let account = exchange.account().cloned();
    let headers = exchange.headers_mut();
    headers.remove(FORWARDED_ACCOUNT_ID_HEADER);
    headers.remove(FORWARDED_ROLES_HEADER);

    let Some(account) = account else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(account.principal_id()) {
        headers.insert(HeaderName::from_static(FORWARDED_ACCOUNT_ID_HEADER), value);
    }
    let roles = account.roles().iter().map(String::as_str).collect::<Vec<_>>().join(",");
    if let Ok(value) = HeaderValue::from_str(&roles) {
        headers.insert(HeaderName::from_static(FORWARDED_ROLES_HEADER), value);
    }
}
