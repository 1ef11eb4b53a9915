//! Plugin records and the process-wide registry.
//!
//! Plugins form a closed set of capabilities resolved once at startup. The
//! registry is immutable afterwards and shared by reference with every
//! request-handling task.
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    core::security::authenticator::Authenticator,
    ports::{
        auth_mechanism::AuthMechanism, authorizer::Authorizer, interceptor::Interceptor,
        service::Service, token_manager::TokenManager,
    },
};

/// A plugin instance together with its declarative metadata.
pub struct PluginRecord<T: ?Sized> {
    name: String,
    description: String,
    enabled: bool,
    class_name: String,
    conf_args: serde_json::Value,
    instance: Arc<T>,
}

impl<T: ?Sized> Clone for PluginRecord<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            description: self.description.clone(),
            enabled: self.enabled,
            class_name: self.class_name.clone(),
            conf_args: self.conf_args.clone(),
            instance: self.instance.clone(),
        }
    }
}

impl<T: ?Sized> fmt::Debug for PluginRecord<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("name", &self.name)
            .field("class_name", &self.class_name)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl<T: ?Sized> PluginRecord<T> {
    pub fn new(name: impl Into<String>, class_name: impl Into<String>, instance: Arc<T>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            enabled: true,
            class_name: class_name.into(),
            conf_args: serde_json::Value::Null,
            instance,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_conf_args(mut self, conf_args: serde_json::Value) -> Self {
        self.conf_args = conf_args;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn conf_args(&self) -> &serde_json::Value {
        &self.conf_args
    }

    pub fn instance(&self) -> &Arc<T> {
        &self.instance
    }
}

/// Every plugin loaded at startup, grouped by capability.
#[derive(Default)]
pub struct PluginRegistry {
    mechanisms: Vec<PluginRecord<dyn AuthMechanism>>,
    authorizers: Vec<PluginRecord<dyn Authorizer>>,
    global_predicates: Vec<PluginRecord<dyn Authorizer>>,
    token_manager: Option<PluginRecord<dyn TokenManager>>,
    interceptors: Vec<PluginRecord<dyn Interceptor>>,
    services: HashMap<String, PluginRecord<dyn Service>>,
    authenticator: Option<Arc<Authenticator>>,
}

impl PluginRegistry {
    pub fn builder() -> PluginRegistryBuilder {
        PluginRegistryBuilder::default()
    }

    /// Authentication mechanisms in priority order.
    pub fn mechanisms(&self) -> &[PluginRecord<dyn AuthMechanism>] {
        &self.mechanisms
    }

    pub fn authorizers(&self) -> &[PluginRecord<dyn Authorizer>] {
        &self.authorizers
    }

    /// Predicates evaluated together with the authorizers on every secured request.
    pub fn global_predicates(&self) -> &[PluginRecord<dyn Authorizer>] {
        &self.global_predicates
    }

    pub fn token_manager(&self) -> Option<&PluginRecord<dyn TokenManager>> {
        self.token_manager.as_ref()
    }

    pub fn interceptors(&self) -> &[PluginRecord<dyn Interceptor>] {
        &self.interceptors
    }

    pub fn service(&self, name: &str) -> Option<&PluginRecord<dyn Service>> {
        self.services.get(name)
    }

    pub fn services(&self) -> impl Iterator<Item = &PluginRecord<dyn Service>> {
        self.services.values()
    }

    pub fn authenticator(&self) -> Option<&Arc<Authenticator>> {
        self.authenticator.as_ref()
    }

    /// Whether an enabled authorizer of the given class is registered.
    pub fn has_enabled_authorizer(&self, class_name: &str) -> bool {
        self.authorizers
            .iter()
            .any(|a| a.is_enabled() && a.class_name() == class_name)
    }
}

/// Collects plugin records before freezing them into a [`PluginRegistry`].
#[derive(Default)]
pub struct PluginRegistryBuilder {
    registry: PluginRegistry,
}

impl PluginRegistryBuilder {
    pub fn mechanism(mut self, record: PluginRecord<dyn AuthMechanism>) -> Self {
        self.registry.mechanisms.push(record);
        self
    }

    pub fn authorizer(mut self, record: PluginRecord<dyn Authorizer>) -> Self {
        self.registry.authorizers.push(record);
        self
    }

    pub fn global_predicate(mut self, record: PluginRecord<dyn Authorizer>) -> Self {
        self.registry.global_predicates.push(record);
        self
    }

    pub fn token_manager(mut self, record: PluginRecord<dyn TokenManager>) -> Self {
        self.registry.token_manager = Some(record);
        self
    }

    pub fn interceptor(mut self, record: PluginRecord<dyn Interceptor>) -> Self {
        self.registry.interceptors.push(record);
        self
    }

    pub fn service(mut self, record: PluginRecord<dyn Service>) -> Self {
        self.registry
            .services
            .insert(record.name().to_string(), record);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<Authenticator>) -> Self {
        self.registry.authenticator = Some(authenticator);
        self
    }

    /// Read access while assembling, so later plugins can inspect earlier ones.
    pub fn peek(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn build(self) -> PluginRegistry {
        let registry = self.registry;
        tracing::info!(
            mechanisms = registry.mechanisms.len(),
            authorizers = registry.authorizers.len(),
            interceptors = registry.interceptors.len(),
            services = registry.services.len(),
            token_manager = registry.token_manager.is_some(),
            "Plugin registry initialized"
        );
        registry
    }
}
