use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate
/// Supports multiple formats: TOML, YAML, JSON.
pub async fn load_config(config_path: &str) -> Result<GatewayConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<GatewayConfig> {
    let config_path = Path::new(config_path);

    // Determine file format based on extension
    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    let gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })?;

    Ok(gateway_config)
}

/// Commented starting configuration written by `gatehouse init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"# Gatehouse gateway configuration

# The address to listen on
listen_addr = "127.0.0.1:8080"

# Exchanges processed at once; the excess is answered with 503
requests_limit = 100

# Seconds to wait for in-flight requests on shutdown
shutdown_grace_secs = 60

[logging]
level = "info"
format = "pretty"

# Accounts used by the basic and digest mechanisms
[security.authenticator]
users_uri = "/users"
bcrypt_hashed_password = false

[security.authenticator.store]
type = "memory"
accounts = [
    { _id = "admin", password = "changeit", roles = ["admin"] },
]

[[security.mechanisms]]
name = "tokenAuthMechanism"
type = "token"

[[security.mechanisms]]
name = "basicAuthMechanism"
type = "basic"
args = { realm = "gatehouse" }

[[security.authorizers]]
name = "aclAuthorizer"
type = "acl"
args = { permissions = [
    { role = "admin", path = "/", methods = ["*"] },
] }

[security.token_manager]
name = "tokenManager"
type = "random"
args = { ttl_secs = 900 }

[[services]]
name = "ping"
type = "ping"

[[services]]
name = "roles"
type = "roles"

[[services]]
name = "tokens"
type = "tokens"

[[mounts]]
what = "ping"
where = "/ping"
type = "service"
secured = false

[[mounts]]
what = "roles"
where = "/roles"
type = "service"

[[mounts]]
what = "tokens"
where = "/tokens"
type = "service"

# Reverse proxy with two load-balanced upstreams
[[mounts]]
what = ["http://localhost:3001", "http://localhost:3002"]
where = "/api"
type = "proxy"
args = { connections_per_thread = 10, max_queue_size = 0 }

# Static files
# [[mounts]]
# what = "./static"
# where = "/static"
# type = "static"
# secured = false
"#;
