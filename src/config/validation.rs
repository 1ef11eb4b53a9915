use std::{collections::HashSet, net::SocketAddr, str::FromStr};

use hyper::Method;

use crate::config::models::{
    AccountStoreConfig, GatewayConfig, MountConfig, MountKind, PluginConfig, ProxyOptions,
    StaticOptions, TlsConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Invalid TLS configuration: {message}")]
    InvalidTls { message: String },

    #[error("Mount conflict detected: {message}")]
    MountConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem at once.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let errors = Self::collect_errors(config);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            })
        }
    }

    /// Every problem found in the configuration, in a stable order.
    pub fn collect_errors(config: &GatewayConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if let Some(tls_config) = &config.tls {
            if let Err(e) = Self::validate_tls_config(tls_config) {
                errors.push(e);
            }
        }

        if config.requests_limit == 0 {
            errors.push(ValidationError::InvalidField {
                field: "requests_limit".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }
        if config.max_content_size == 0 {
            errors.push(ValidationError::InvalidField {
                field: "max_content_size".to_string(),
                message: "Must be greater than zero".to_string(),
            });
        }
        for method in &config.allowed_methods {
            if Method::from_str(method).is_err() {
                errors.push(ValidationError::InvalidField {
                    field: "allowed_methods".to_string(),
                    message: format!("'{method}' is not an HTTP method"),
                });
            }
        }

        if config.mounts.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "mounts".to_string(),
            });
        }
        let service_names: HashSet<&str> = config.services.iter().map(|s| s.name.as_str()).collect();
        for mount in &config.mounts {
            errors.extend(Self::validate_mount(mount, &service_names));
        }
        errors.extend(Self::check_mount_conflicts(&config.mounts));

        let security = &config.security;
        for (section, plugins) in [
            ("security.mechanisms", &security.mechanisms),
            ("security.authorizers", &security.authorizers),
            ("security.global_predicates", &security.global_predicates),
            ("interceptors", &config.interceptors),
            ("services", &config.services),
        ] {
            errors.extend(Self::validate_plugins(section, plugins));
        }
        if let Some(tm) = &security.token_manager {
            errors.extend(Self::validate_plugins("security.token_manager", std::slice::from_ref(tm)));
        }

        if let Some(auth) = &security.authenticator {
            if !auth.users_uri.starts_with('/') {
                errors.push(ValidationError::InvalidField {
                    field: "security.authenticator.users_uri".to_string(),
                    message: "Must start with '/'".to_string(),
                });
            }
            if !(4..=31).contains(&auth.bcrypt_complexity) {
                errors.push(ValidationError::InvalidField {
                    field: "security.authenticator.bcrypt_complexity".to_string(),
                    message: format!("Cost {} is outside 4..=31", auth.bcrypt_complexity),
                });
            }
            if let AccountStoreConfig::Http { base_url, .. } = &auth.store {
                if let Err(e) = Self::validate_url(base_url, "security.authenticator.store.base_url") {
                    errors.push(e);
                }
            }
        }

        errors
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_mount(mount: &MountConfig, services: &HashSet<&str>) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let location = &mount.location;

        if !location.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("mount '{location}'"),
                message: "Mount paths must start with '/'".to_string(),
            });
        }

        let args = if mount.args.is_null() {
            serde_json::json!({})
        } else {
            mount.args.clone()
        };

        match mount.kind {
            MountKind::Proxy => {
                let upstreams = mount.what.to_vec();
                if upstreams.is_empty() {
                    errors.push(ValidationError::InvalidField {
                        field: format!("mount '{location}' what"),
                        message: "Proxy mounts must have at least one upstream".to_string(),
                    });
                }
                for (i, upstream) in upstreams.iter().enumerate() {
                    if let Err(e) =
                        Self::validate_url(upstream, &format!("mount '{location}' upstream {}", i + 1))
                    {
                        errors.push(e);
                    }
                }
                match serde_json::from_value::<ProxyOptions>(args) {
                    Ok(options) => errors.extend(Self::validate_proxy_options(location, &options)),
                    Err(e) => errors.push(ValidationError::InvalidField {
                        field: format!("mount '{location}' args"),
                        message: e.to_string(),
                    }),
                }
            }
            MountKind::Service => match mount.what.first() {
                Some(name) if services.contains(name) => {}
                Some(name) => errors.push(ValidationError::InvalidField {
                    field: format!("mount '{location}' what"),
                    message: format!("No service named '{name}' is configured"),
                }),
                None => errors.push(ValidationError::MissingField {
                    field: format!("mount '{location}' what"),
                }),
            },
            MountKind::Static => {
                match mount.what.first() {
                    Some(root) if std::path::Path::new(root).is_dir() => {}
                    Some(root) => errors.push(ValidationError::InvalidField {
                        field: format!("mount '{location}' what"),
                        message: format!("Static root directory '{root}' does not exist"),
                    }),
                    None => errors.push(ValidationError::MissingField {
                        field: format!("mount '{location}' what"),
                    }),
                }
                if let Err(e) = serde_json::from_value::<StaticOptions>(args) {
                    errors.push(ValidationError::InvalidField {
                        field: format!("mount '{location}' args"),
                        message: e.to_string(),
                    });
                }
            }
        }

        errors
    }

    fn validate_proxy_options(location: &str, options: &ProxyOptions) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let field = format!("mount '{location}' args");

        if options.connections_per_thread == 0 {
            errors.push(ValidationError::InvalidField {
                field: field.clone(),
                message: "connections_per_thread must be greater than zero".to_string(),
            });
        }
        if options.soft_max_connections_per_thread > options.connections_per_thread {
            errors.push(ValidationError::InvalidField {
                field: field.clone(),
                message: "soft_max_connections_per_thread cannot exceed connections_per_thread"
                    .to_string(),
            });
        }
        if options.request_timeout_millis == 0 {
            errors.push(ValidationError::InvalidField {
                field,
                message: "request_timeout_millis must be greater than zero".to_string(),
            });
        }
        errors
    }

    fn validate_plugins(section: &str, plugins: &[PluginConfig]) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for plugin in plugins {
            if plugin.name.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{section} name"),
                });
            } else if !seen.insert(plugin.name.as_str()) {
                errors.push(ValidationError::InvalidField {
                    field: format!("{section} '{}'", plugin.name),
                    message: "Plugin names must be unique".to_string(),
                });
            }
            if plugin.kind.trim().is_empty() {
                errors.push(ValidationError::MissingField {
                    field: format!("{section} '{}' type", plugin.name),
                });
            }
        }
        errors
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    /// Validate TLS configuration
    fn validate_tls_config(config: &TlsConfig) -> ValidationResult<()> {
        if !std::path::Path::new(&config.cert_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Certificate file does not exist: {}", config.cert_path),
            });
        }

        if !std::path::Path::new(&config.key_path).exists() {
            return Err(ValidationError::InvalidTls {
                message: format!("Private key file does not exist: {}", config.key_path),
            });
        }

        Ok(())
    }

    /// Two mounts may not share a location, whatever their match policy.
    fn check_mount_conflicts(mounts: &[MountConfig]) -> Vec<ValidationError> {
        let mut seen = HashSet::new();
        mounts
            .iter()
            .filter_map(|mount| {
                let normalized = match mount.location.trim_end_matches('/') {
                    "" => "/".to_string(),
                    trimmed => trimmed.to_string(),
                };
                (!seen.insert(normalized.clone())).then(|| ValidationError::MountConflict {
                    message: format!("Duplicate mount for path '{normalized}'"),
                })
            })
            .collect()
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{AuthenticatorConfig, MountConfig};

    fn minimal_valid_config() -> GatewayConfig {
        GatewayConfig::builder()
            .mount(MountConfig::proxy("/api", vec!["http://localhost:3000".to_string()]))
            .mount(MountConfig::service("/ping", "ping"))
            .service(PluginConfig::new("ping", "ping"))
            .build()
            .unwrap()
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(GatewayConfigValidator::validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_mounts() {
        let mut config = minimal_valid_config();
        config
            .mounts
            .push(MountConfig::proxy("/api/", vec!["http://localhost:4000".to_string()]).exact());

        let errors = GatewayConfigValidator::collect_errors(&config);
        assert_eq!(
            errors,
            [ValidationError::MountConflict {
                message: "Duplicate mount for path '/api'".to_string()
            }]
        );
    }

    #[test]
    fn validate_reports_every_problem() {
        let mut config = minimal_valid_config();
        config.listen_addr = "localhost".to_string();
        config.requests_limit = 0;
        config.mounts.push(MountConfig::service("relative", "missing"));
        config.mounts.push(
            MountConfig::proxy("/bad", vec!["ftp://x".to_string()])
                .with_args(serde_json::json!({"soft_max_connections_per_thread": 50})),
        );

        let errors = GatewayConfigValidator::collect_errors(&config);
        // listen addr, requests_limit, mount path, unknown service, scheme, soft max
        assert_eq!(errors.len(), 6, "{errors:?}");

        let message = GatewayConfigValidator::validate(&config).unwrap_err().to_string();
        assert!(message.contains("Found 6 validation errors"));
    }

    #[test]
    fn validate_rejects_malformed_proxy_args() {
        let mut config = minimal_valid_config();
        config.mounts[0].args = serde_json::json!({"max_queue_size": "lots"});
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn validate_rejects_missing_static_root_and_bad_bcrypt_cost() {
        let mut config = minimal_valid_config();
        config.mounts.push(MountConfig::static_dir("/files", "/definitely/not/here"));
        config.security.authenticator = Some(AuthenticatorConfig {
            bcrypt_complexity: 2,
            ..AuthenticatorConfig::default()
        });

        assert_eq!(GatewayConfigValidator::collect_errors(&config).len(), 2);
    }

    #[test]
    fn validate_rejects_duplicate_plugin_names() {
        let mut config = minimal_valid_config();
        config.services.push(PluginConfig::new("ping", "roles"));
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }
}
