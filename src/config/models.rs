//! Configuration data structures for Gatehouse.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde-friendly and include defaults so that minimal configs remain concise.
//! Plugin `args` stay untyped here and are parsed into each plugin's own struct
//! when the gateway is assembled.
use serde::{Deserialize, Serialize};

use crate::core::{cache::ExpirePolicy, router::MatchPolicy};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_requests_limit() -> usize {
    100
}

fn default_max_content_size() -> usize {
    16 * 1024 * 1024
}

fn default_shutdown_grace_secs() -> u64 {
    60
}

fn default_allowed_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_true() -> bool {
    true
}

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Maximum number of exchanges processed at once; the excess gets 503.
    #[serde(default = "default_requests_limit")]
    pub requests_limit: usize,
    /// Upper bound for buffered request and response content, in bytes.
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Mount points, in declaration order.
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub interceptors: Vec<PluginConfig>,
    #[serde(default)]
    pub services: Vec<PluginConfig>,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tls: None,
            requests_limit: default_requests_limit(),
            max_content_size: default_max_content_size(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            allowed_methods: default_allowed_methods(),
            logging: LoggingConfig::default(),
            cors: CorsConfig::default(),
            mounts: Vec::new(),
            security: SecurityConfig::default(),
            interceptors: Vec::new(),
            services: Vec::new(),
        }
    }
}

/// Builder for GatewayConfig, used by tests and embedders.
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Set TLS certificate and key paths
    pub fn tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.config.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    pub fn requests_limit(mut self, limit: usize) -> Self {
        self.config.requests_limit = limit;
        self
    }

    pub fn max_content_size(mut self, bytes: usize) -> Self {
        self.config.max_content_size = bytes;
        self
    }

    pub fn shutdown_grace_secs(mut self, secs: u64) -> Self {
        self.config.shutdown_grace_secs = secs;
        self
    }

    pub fn cors(mut self, cors: CorsConfig) -> Self {
        self.config.cors = cors;
        self
    }

    /// Add a mount point
    pub fn mount(mut self, mount: MountConfig) -> Self {
        self.config.mounts.push(mount);
        self
    }

    pub fn authenticator(mut self, authenticator: AuthenticatorConfig) -> Self {
        self.config.security.authenticator = Some(authenticator);
        self
    }

    pub fn mechanism(mut self, plugin: PluginConfig) -> Self {
        self.config.security.mechanisms.push(plugin);
        self
    }

    pub fn authorizer(mut self, plugin: PluginConfig) -> Self {
        self.config.security.authorizers.push(plugin);
        self
    }

    pub fn global_predicate(mut self, plugin: PluginConfig) -> Self {
        self.config.security.global_predicates.push(plugin);
        self
    }

    pub fn token_manager(mut self, plugin: PluginConfig) -> Self {
        self.config.security.token_manager = Some(plugin);
        self
    }

    pub fn interceptor(mut self, plugin: PluginConfig) -> Self {
        self.config.interceptors.push(plugin);
        self
    }

    pub fn service(mut self, plugin: PluginConfig) -> Self {
        self.config.services.push(plugin);
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        if self.config.mounts.is_empty() {
            return Err("At least one mount must be configured".to_string());
        }
        Ok(self.config)
    }
}

/// TLS certificate and key, both PEM encoded.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
    /// Emit span open/close events.
    pub spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            spans: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_origin: String,
    /// Extra headers to expose besides the auth token headers.
    pub expose_headers: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_origin: "*".to_string(),
            expose_headers: vec!["location".to_string(), "etag".to_string()],
        }
    }
}

/// A single upstream URL, a service name or a directory; or a list of upstream URLs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MountTarget {
    One(String),
    Many(Vec<String>),
}

impl MountTarget {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            MountTarget::One(value) => vec![value.clone()],
            MountTarget::Many(values) => values.clone(),
        }
    }

    pub fn first(&self) -> Option<&str> {
        match self {
            MountTarget::One(value) => Some(value),
            MountTarget::Many(values) => values.first().map(String::as_str),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MountKind {
    /// `what` names a configured service.
    Service,
    /// `what` is one or more upstream base URLs.
    Proxy,
    /// `what` is a directory on disk.
    Static,
}

/// Binds a path on the listener to a pipeline.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MountConfig {
    pub what: MountTarget,
    #[serde(rename = "where")]
    pub location: String,
    #[serde(rename = "type")]
    pub kind: MountKind,
    #[serde(default = "default_true")]
    pub secured: bool,
    #[serde(default)]
    pub match_policy: MatchPolicy,
    /// Pipeline name used in logs and metrics; defaults to the location.
    #[serde(default)]
    pub name: Option<String>,
    /// Kind-specific options: [`ProxyOptions`] for proxies, [`StaticOptions`] for static mounts.
    #[serde(default)]
    pub args: serde_json::Value,
}

impl MountConfig {
    pub fn proxy(location: impl Into<String>, upstreams: Vec<String>) -> Self {
        Self::new(location, MountKind::Proxy, MountTarget::Many(upstreams))
    }

    pub fn service(location: impl Into<String>, service: impl Into<String>) -> Self {
        Self::new(location, MountKind::Service, MountTarget::One(service.into()))
    }

    pub fn static_dir(location: impl Into<String>, root: impl Into<String>) -> Self {
        Self::new(location, MountKind::Static, MountTarget::One(root.into()))
    }

    fn new(location: impl Into<String>, kind: MountKind, what: MountTarget) -> Self {
        Self {
            what,
            location: location.into(),
            kind,
            secured: true,
            match_policy: MatchPolicy::default(),
            name: None,
            args: serde_json::Value::Null,
        }
    }

    pub fn secured(mut self, secured: bool) -> Self {
        self.secured = secured;
        self
    }

    pub fn exact(mut self) -> Self {
        self.match_policy = MatchPolicy::Exact;
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.location)
    }
}

/// Connection policy of a proxy mount.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ProxyOptions {
    /// Hard cap of concurrent requests per upstream host.
    pub connections_per_thread: usize,
    /// Hosts under this many requests are preferred.
    pub soft_max_connections_per_thread: usize,
    /// Requests allowed to wait when every host is at its cap.
    pub max_queue_size: usize,
    /// Idle connection lifetime; negative means connections are never recycled.
    pub ttl_millis: i64,
    pub problem_server_retry_secs: u64,
    pub rewrite_host_header: bool,
    pub connect_timeout_millis: u64,
    pub request_timeout_millis: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            connections_per_thread: 10,
            soft_max_connections_per_thread: 5,
            max_queue_size: 0,
            ttl_millis: -1,
            problem_server_retry_secs: 10,
            rewrite_host_header: true,
            connect_timeout_millis: 10_000,
            request_timeout_millis: 30_000,
        }
    }
}

/// Options of a static resource mount.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct StaticOptions {
    pub welcome_file: String,
}

impl Default for StaticOptions {
    fn default() -> Self {
        Self {
            welcome_file: "index.html".to_string(),
        }
    }
}

/// Declarative entry of a plugin.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Built-in implementation to instantiate.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            kind: kind.into(),
            args: serde_json::Value::Null,
        }
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SecurityConfig {
    pub authenticator: Option<AuthenticatorConfig>,
    /// Authentication mechanisms, tried in order.
    pub mechanisms: Vec<PluginConfig>,
    pub authorizers: Vec<PluginConfig>,
    pub token_manager: Option<PluginConfig>,
    pub global_predicates: Vec<PluginConfig>,
    /// Deny users collection queries filtering on the password property.
    pub deny_filter_on_password: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            authenticator: None,
            mechanisms: Vec::new(),
            authorizers: Vec::new(),
            token_manager: None,
            global_predicates: Vec::new(),
            deny_filter_on_password: true,
        }
    }
}

/// Where account documents come from.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AccountStoreConfig {
    /// Account documents listed inline.
    Memory {
        #[serde(default)]
        accounts: Vec<serde_json::Value>,
    },
    /// A database REST service reachable over HTTP.
    Http {
        base_url: String,
        #[serde(default = "default_store_timeout_millis")]
        timeout_millis: u64,
    },
}

fn default_store_timeout_millis() -> u64 {
    5_000
}

impl Default for AccountStoreConfig {
    fn default() -> Self {
        AccountStoreConfig::Memory { accounts: Vec::new() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AuthenticatorConfig {
    pub store: AccountStoreConfig,
    pub users_uri: String,
    pub prop_id: String,
    pub prop_password: String,
    /// Dotted path of the roles array in the account document.
    pub roles_path: String,
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub cache_ttl_secs: u64,
    pub cache_expire_policy: ExpirePolicy,
    pub bcrypt_hashed_password: bool,
    pub bcrypt_complexity: u32,
    pub password_cache_size: usize,
    pub password_cache_ttl_secs: u64,
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            store: AccountStoreConfig::default(),
            users_uri: "/users".to_string(),
            prop_id: "_id".to_string(),
            prop_password: "password".to_string(),
            roles_path: "roles".to_string(),
            cache_enabled: true,
            cache_size: 1000,
            cache_ttl_secs: 60,
            cache_expire_policy: ExpirePolicy::AfterWrite,
            bcrypt_hashed_password: false,
            bcrypt_complexity: 12,
            password_cache_size: 1000,
            password_cache_ttl_secs: 20 * 60,
        }
    }
}
