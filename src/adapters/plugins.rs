//! Instantiates the built-in plugins named in the configuration.
//!
//! The set of plugin types is closed: each `type` maps to one implementation
//! whose `args` are parsed into a typed struct. Unknown types and args that
//! do not parse abort the bootstrap.
use std::{sync::Arc, time::Duration};

use serde::{Deserialize, de::DeserializeOwned};

use crate::{
    adapters::{
        account_stores::{HttpAccountStore, MemoryAccountStore},
        authorizers::{AclArgs, AclAuthorizer, DenyFilterOnPasswordPredicate},
        interceptors::{FilterPredicateInjector, PasswordHasherInterceptor, PasswordRemoverInterceptor},
        mechanisms::{
            BasicArgs, BasicAuthMechanism, DigestArgs, DigestAuthMechanism, IdentityArgs,
            IdentityAuthMechanism, TokenAuthMechanism,
        },
        services::{PingArgs, PingService, RolesService, TokensService},
    },
    config::models::{AccountStoreConfig, AuthenticatorConfig, GatewayConfig, PluginConfig},
    core::{
        cache::{CredentialCache, ExpirePolicy},
        gateway::BootstrapError,
        plugin::{PluginRecord, PluginRegistry, PluginRegistryBuilder},
        security::{
            AllowAllAuthorizer,
            authenticator::{AccountDocumentLayout, Authenticator},
            password::{BcryptHasher, PasswordVerifier},
            token::{DEFAULT_TOKEN_TTL, RandomTokenManager},
        },
    },
    ports::{
        account_store::AccountStore, auth_mechanism::AuthMechanism, authorizer::Authorizer,
        interceptor::Interceptor, service::Service, token_manager::TokenManager,
    },
    utils::ShutdownToken,
};

/// Class name of the ACL authorizer, looked up by the filter injector.
pub const ACL_AUTHORIZER: &str = "acl";

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn default_token_ttl_secs() -> u64 {
    DEFAULT_TOKEN_TTL.as_secs()
}

#[derive(Debug, Clone, Deserialize)]
struct TokenManagerArgs {
    #[serde(default = "default_token_ttl_secs")]
    ttl_secs: u64,
}

/// The frozen registry plus the concrete components needing background upkeep.
pub struct PluginSet {
    pub registry: Arc<PluginRegistry>,
    pub token_manager: Option<Arc<RandomTokenManager>>,
}

impl PluginSet {
    /// Sweep expired tokens and cache entries until shutdown.
    pub fn spawn_maintenance(&self, shutdown: &ShutdownToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(tokens) = &self.token_manager {
            handles.push(tokens.clone().spawn_sweeper(SWEEP_INTERVAL, shutdown.clone()));
        }
        if let Some(authenticator) = self.registry.authenticator() {
            if let Some(cache) = authenticator.account_cache() {
                handles.push(cache.clone().spawn_sweeper(SWEEP_INTERVAL, shutdown.clone(), "accounts"));
            }
            if let Some(cache) = authenticator.password_cache() {
                handles.push(cache.clone().spawn_sweeper(SWEEP_INTERVAL, shutdown.clone(), "passwords"));
            }
        }
        handles
    }
}

fn parse_args<T: DeserializeOwned>(plugin: &PluginConfig) -> Result<T, BootstrapError> {
    let args = if plugin.args.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        plugin.args.clone()
    };
    serde_json::from_value(args).map_err(|e| BootstrapError::PluginConfig {
        name: plugin.name.clone(),
        reason: e.to_string(),
    })
}

fn record<T: ?Sized>(plugin: &PluginConfig, instance: Arc<T>) -> PluginRecord<T> {
    PluginRecord::new(&plugin.name, &plugin.kind, instance)
        .with_description(&plugin.description)
        .with_enabled(plugin.enabled)
        .with_conf_args(plugin.args.clone())
}

fn unknown(section: &'static str, plugin: &PluginConfig) -> BootstrapError {
    BootstrapError::UnknownPlugin {
        section,
        name: plugin.name.clone(),
        kind: plugin.kind.clone(),
    }
}

fn needs_authenticator(plugin: &PluginConfig) -> BootstrapError {
    BootstrapError::PluginConfig {
        name: plugin.name.clone(),
        reason: "requires security.authenticator to be configured".to_string(),
    }
}

/// Build every configured plugin.
///
/// Order matters: mechanisms need the authenticator and token manager, and
/// interceptors inspect the authorizers registered before them.
pub fn build_plugins(config: &GatewayConfig) -> Result<PluginSet, BootstrapError> {
    let security = &config.security;
    let mut builder = PluginRegistry::builder();

    let authenticator = match &security.authenticator {
        Some(auth_config) => {
            let authenticator = Arc::new(build_authenticator(auth_config)?);
            builder = builder.authenticator(authenticator.clone());
            Some(authenticator)
        }
        None => None,
    };

    let mut random_tokens = None;
    let mut tokens: Option<Arc<dyn TokenManager>> = None;
    if let Some(plugin) = &security.token_manager {
        match plugin.kind.as_str() {
            "random" => {
                let args: TokenManagerArgs = parse_args(plugin)?;
                let manager = Arc::new(RandomTokenManager::new(Duration::from_secs(args.ttl_secs)));
                let instance: Arc<dyn TokenManager> = manager.clone();
                builder = builder.token_manager(record(plugin, instance.clone()));
                if plugin.enabled {
                    random_tokens = Some(manager);
                    tokens = Some(instance);
                }
            }
            _ => return Err(unknown("token manager", plugin)),
        }
    }

    for plugin in &security.mechanisms {
        let instance = build_mechanism(plugin, authenticator.as_ref(), tokens.as_ref())?;
        builder = builder.mechanism(record(plugin, instance));
    }

    for plugin in &security.authorizers {
        let instance = build_authorizer(plugin)?;
        builder = builder.authorizer(record(plugin, instance));
    }

    if security.deny_filter_on_password {
        if let Some(authenticator) = &authenticator {
            let instance: Arc<dyn Authorizer> = Arc::new(DenyFilterOnPasswordPredicate::new(
                authenticator.users_uri(),
                authenticator.password_property(),
            ));
            builder = builder.global_predicate(PluginRecord::new(
                "denyFilterOnUserPasswordPredicate",
                "deny_filter_on_password",
                instance,
            ));
        }
    }
    for plugin in &security.global_predicates {
        let instance = build_authorizer(plugin)?;
        builder = builder.global_predicate(record(plugin, instance));
    }

    for plugin in &config.interceptors {
        let instance = build_interceptor(plugin, &builder, authenticator.as_ref())?;
        builder = builder.interceptor(record(plugin, instance));
    }

    for plugin in &config.services {
        let instance = build_service(plugin, tokens.as_ref())?;
        builder = builder.service(record(plugin, instance));
    }

    Ok(PluginSet {
        registry: Arc::new(builder.build()),
        token_manager: random_tokens,
    })
}

fn build_authenticator(config: &AuthenticatorConfig) -> Result<Authenticator, BootstrapError> {
    let store_error = |reason: String| BootstrapError::PluginConfig {
        name: "authenticator".to_string(),
        reason,
    };

    let store: Arc<dyn AccountStore> = match &config.store {
        AccountStoreConfig::Memory { accounts } => {
            let store = MemoryAccountStore::new(accounts.iter().cloned(), &config.prop_id);
            tracing::info!(accounts = store.len(), "Using in-memory account store");
            Arc::new(store)
        }
        AccountStoreConfig::Http {
            base_url,
            timeout_millis,
        } => {
            let store = HttpAccountStore::new(
                base_url,
                &config.users_uri,
                &config.prop_id,
                Duration::from_millis(*timeout_millis),
            )
            .map_err(|e| store_error(format!("{e:#}")))?;
            tracing::info!(url = store.collection_url(), "Using HTTP account store");
            Arc::new(store)
        }
    };

    let verifier = if config.bcrypt_hashed_password {
        let cache = Arc::new(CredentialCache::new(
            config.password_cache_size,
            Duration::from_secs(config.password_cache_ttl_secs),
            ExpirePolicy::AfterRead,
        ));
        PasswordVerifier::hashed(Arc::new(BcryptHasher::new(config.bcrypt_complexity)), Some(cache))
    } else {
        PasswordVerifier::plain()
    };

    let layout = AccountDocumentLayout {
        users_uri: config.users_uri.clone(),
        prop_id: config.prop_id.clone(),
        prop_password: config.prop_password.clone(),
        roles_path: config.roles_path.clone(),
    };
    let mut authenticator = Authenticator::new(store, layout, verifier);
    if config.cache_enabled {
        authenticator = authenticator.with_account_cache(Arc::new(CredentialCache::new(
            config.cache_size,
            Duration::from_secs(config.cache_ttl_secs),
            config.cache_expire_policy,
        )));
    }
    Ok(authenticator)
}

fn build_mechanism(
    plugin: &PluginConfig,
    authenticator: Option<&Arc<Authenticator>>,
    tokens: Option<&Arc<dyn TokenManager>>,
) -> Result<Arc<dyn AuthMechanism>, BootstrapError> {
    let mechanism: Arc<dyn AuthMechanism> = match plugin.kind.as_str() {
        "basic" => {
            let authenticator = authenticator.ok_or_else(|| needs_authenticator(plugin))?;
            Arc::new(BasicAuthMechanism::new(authenticator.clone(), parse_args::<BasicArgs>(plugin)?))
        }
        "digest" => {
            let authenticator = authenticator.ok_or_else(|| needs_authenticator(plugin))?;
            Arc::new(DigestAuthMechanism::new(authenticator.clone(), parse_args::<DigestArgs>(plugin)?))
        }
        "token" => {
            let tokens = tokens.ok_or_else(|| BootstrapError::PluginConfig {
                name: plugin.name.clone(),
                reason: "requires an enabled security.token_manager".to_string(),
            })?;
            Arc::new(TokenAuthMechanism::new(tokens.clone()))
        }
        "identity" => Arc::new(IdentityAuthMechanism::new(parse_args::<IdentityArgs>(plugin)?)),
        _ => return Err(unknown("mechanism", plugin)),
    };
    Ok(mechanism)
}

fn build_authorizer(plugin: &PluginConfig) -> Result<Arc<dyn Authorizer>, BootstrapError> {
    let authorizer: Arc<dyn Authorizer> = match plugin.kind.as_str() {
        "full" => Arc::new(AllowAllAuthorizer),
        ACL_AUTHORIZER => {
            let acl = AclAuthorizer::new(parse_args::<AclArgs>(plugin)?).map_err(|e| {
                BootstrapError::PluginConfig {
                    name: plugin.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            if acl.is_empty() {
                tracing::warn!(authorizer = %plugin.name, "ACL has no permissions and denies every request");
            }
            Arc::new(acl)
        }
        _ => return Err(unknown("authorizer", plugin)),
    };
    Ok(authorizer)
}

fn build_interceptor(
    plugin: &PluginConfig,
    builder: &PluginRegistryBuilder,
    authenticator: Option<&Arc<Authenticator>>,
) -> Result<Arc<dyn Interceptor>, BootstrapError> {
    let interceptor: Arc<dyn Interceptor> = match plugin.kind.as_str() {
        "user_pwd_hasher" => {
            if authenticator.is_none_or(|a| !a.is_password_hashed()) {
                tracing::warn!(interceptor = %plugin.name, "Password hashing is off; interceptor disabled");
            }
            Arc::new(PasswordHasherInterceptor::new(authenticator.cloned()))
        }
        "user_pwd_remover" => Arc::new(PasswordRemoverInterceptor::new(authenticator.cloned())),
        "filter_predicate_injector" => {
            let enabled = builder.peek().has_enabled_authorizer(ACL_AUTHORIZER);
            if !enabled {
                tracing::warn!(interceptor = %plugin.name, "No enabled acl authorizer; interceptor disabled");
            }
            Arc::new(FilterPredicateInjector::new(enabled))
        }
        _ => return Err(unknown("interceptor", plugin)),
    };
    Ok(interceptor)
}

fn build_service(
    plugin: &PluginConfig,
    tokens: Option<&Arc<dyn TokenManager>>,
) -> Result<Arc<dyn Service>, BootstrapError> {
    let service: Arc<dyn Service> = match plugin.kind.as_str() {
        "ping" => Arc::new(PingService::new(parse_args::<PingArgs>(plugin)?)),
        "roles" => Arc::new(RolesService),
        "tokens" => Arc::new(TokensService::new(tokens.cloned())),
        _ => return Err(unknown("service", plugin)),
    };
    Ok(service)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::{
        DEFAULT_CONFIG_TOML, load_config_sync,
        models::{AccountStoreConfig, MountConfig},
    };

    fn base() -> crate::config::models::GatewayConfigBuilder {
        GatewayConfig::builder().mount(MountConfig::service("/ping", "ping").secured(false))
    }

    fn authenticator_config() -> AuthenticatorConfig {
        AuthenticatorConfig {
            store: AccountStoreConfig::Memory {
                accounts: vec![json!({"_id": "admin", "password": "changeit", "roles": ["admin"]})],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_builds_the_default_stack() {
        let config = base()
            .authenticator(authenticator_config())
            .token_manager(PluginConfig::new("tokenManager", "random"))
            .mechanism(PluginConfig::new("tokenAuthMechanism", "token"))
            .mechanism(PluginConfig::new("basicAuthMechanism", "basic"))
            .authorizer(
                PluginConfig::new("aclAuthorizer", ACL_AUTHORIZER)
                    .with_args(json!({"permissions": [{"role": "admin", "path": "/"}]})),
            )
            .interceptor(PluginConfig::new("injector", "filter_predicate_injector"))
            .service(PluginConfig::new("ping", "ping"))
            .service(PluginConfig::new("tokens", "tokens"))
            .build()
            .unwrap();

        let plugins = build_plugins(&config).unwrap();
        let registry = &plugins.registry;
        let mechanisms: Vec<_> = registry.mechanisms().iter().map(|m| m.name()).collect();
        assert_eq!(mechanisms, ["tokenAuthMechanism", "basicAuthMechanism"]);
        assert!(registry.mechanisms()[0].instance().is_token_based());
        assert_eq!(registry.global_predicates().len(), 1);
        assert!(registry.has_enabled_authorizer(ACL_AUTHORIZER));
        assert!(registry.service("tokens").is_some());
        assert!(plugins.token_manager.is_some());
    }

    #[test]
    fn test_builds_the_shipped_configuration() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        std::io::Write::write_all(&mut file, DEFAULT_CONFIG_TOML.as_bytes()).unwrap();
        let config = load_config_sync(file.path().to_str().unwrap()).unwrap();

        let plugins = build_plugins(&config).unwrap();
        let registry = &plugins.registry;
        assert_eq!(registry.mechanisms().len(), 2);
        assert_eq!(registry.authorizers()[0].class_name(), ACL_AUTHORIZER);
        assert_eq!(registry.services().count(), 3);
        assert!(registry.authenticator().is_some());
        assert_eq!(plugins.token_manager.as_ref().unwrap().ttl(), Duration::from_secs(900));
    }

    #[test]
    fn test_unknown_type_is_fatal() {
        let config = base()
            .mechanism(PluginConfig::new("kerberos", "kerberos"))
            .build()
            .unwrap();
        let Err(err) = build_plugins(&config) else {
            panic!("unknown mechanism type must fail");
        };
        assert!(matches!(err, BootstrapError::UnknownPlugin { section: "mechanism", .. }));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn test_bad_args_are_fatal() {
        let config = base()
            .service(PluginConfig::new("ping", "ping").with_args(json!({"message": 42})))
            .build()
            .unwrap();
        assert!(matches!(
            build_plugins(&config),
            Err(BootstrapError::PluginConfig { .. })
        ));
    }

    #[test]
    fn test_basic_without_authenticator_is_fatal() {
        let config = base()
            .mechanism(PluginConfig::new("basicAuthMechanism", "basic"))
            .build()
            .unwrap();
        assert!(matches!(
            build_plugins(&config),
            Err(BootstrapError::PluginConfig { .. })
        ));
    }

    #[test]
    fn test_password_predicate_follows_authenticator() {
        let with = base().authenticator(authenticator_config()).build().unwrap();
        assert_eq!(build_plugins(&with).unwrap().registry.global_predicates().len(), 1);

        let mut without_flag = with.clone();
        without_flag.security.deny_filter_on_password = false;
        assert!(build_plugins(&without_flag).unwrap().registry.global_predicates().is_empty());
    }

    #[test]
    fn test_injector_disabled_without_acl() {
        let config = base()
            .interceptor(PluginConfig::new("injector", "filter_predicate_injector"))
            .build()
            .unwrap();
        let plugins = build_plugins(&config).unwrap();
        assert_eq!(plugins.registry.interceptors().len(), 1);
        assert!(!plugins.registry.has_enabled_authorizer(ACL_AUTHORIZER));
    }
}
