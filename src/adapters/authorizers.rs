//! Built-in authorizers and global predicates.
use hyper::Method;
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::{
    core::exchange::{Account, Exchange, FilterPredicate},
    ports::authorizer::Authorizer,
};

/// Role matching requests that carry no account.
pub const UNAUTHENTICATED_ROLE: &str = "$unauthenticated";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AclError {
    #[error("Permission for role '{role}' has an invalid path_regex: {source}")]
    InvalidRegex {
        role: String,
        #[source]
        source: regex::Error,
    },
    #[error("Permission for role '{0}' needs either path or path_regex")]
    MissingPath(String),
    #[error("Permission for role '{role}' lists an invalid method '{method}'")]
    InvalidMethod { role: String, method: String },
}

fn default_methods() -> Vec<String> {
    vec!["*".to_string()]
}

/// One ACL permission as written in the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AclPermission {
    pub role: String,
    /// Path prefix matched on segment boundaries.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub path_regex: Option<String>,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub read_filter: Option<serde_json::Value>,
    #[serde(default)]
    pub write_filter: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AclArgs {
    #[serde(default)]
    pub permissions: Vec<AclPermission>,
}

enum PathMatcher {
    Prefix(String),
    Regex(Regex),
}

impl PathMatcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Prefix(prefix) => {
                prefix == "/"
                    || path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            PathMatcher::Regex(regex) => regex.is_match(path),
        }
    }
}

struct CompiledPermission {
    role: String,
    path: PathMatcher,
    /// `None` allows every method.
    methods: Option<Vec<Method>>,
    predicate: FilterPredicate,
}

impl CompiledPermission {
    fn applies_to(&self, exchange: &Exchange, account: Option<&Account>) -> bool {
        let role_matches = match account {
            Some(account) => account.has_role(&self.role),
            None => self.role == UNAUTHENTICATED_ROLE,
        };
        role_matches
            && self.path.matches(exchange.path())
            && self
                .methods
                .as_ref()
                .is_none_or(|methods| methods.contains(exchange.method()))
    }
}

/// Role based access control list. The first permission matching the
/// caller's roles, the path and the method allows the request and may attach
/// read/write filters to it.
pub struct AclAuthorizer {
    permissions: Vec<CompiledPermission>,
}

impl AclAuthorizer {
    pub fn new(args: AclArgs) -> Result<Self, AclError> {
        let permissions = args
            .permissions
            .into_iter()
            .map(compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { permissions })
    }

    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}

fn compile(permission: AclPermission) -> Result<CompiledPermission, AclError> {
    let path = match (permission.path_regex, permission.path) {
        (Some(pattern), _) => PathMatcher::Regex(Regex::new(&pattern).map_err(|source| {
            AclError::InvalidRegex {
                role: permission.role.clone(),
                source,
            }
        })?),
        (None, Some(prefix)) => {
            let trimmed = prefix.trim_end_matches('/');
            PathMatcher::Prefix(if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() })
        }
        (None, None) => return Err(AclError::MissingPath(permission.role)),
    };

    let methods = if permission.methods.iter().any(|m| m == "*") {
        None
    } else {
        Some(
            permission
                .methods
                .iter()
                .map(|m| {
                    Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| AclError::InvalidMethod {
                        role: permission.role.clone(),
                        method: m.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        )
    };

    Ok(CompiledPermission {
        role: permission.role,
        path,
        methods,
        predicate: FilterPredicate {
            read_filter: permission.read_filter,
            write_filter: permission.write_filter,
        },
    })
}

impl Authorizer for AclAuthorizer {
    fn is_allowed(&self, exchange: &mut Exchange, account: Option<&Account>) -> bool {
        let Some(permission) = self
            .permissions
            .iter()
            .find(|permission| permission.applies_to(exchange, account))
        else {
            return false;
        };

        if permission.predicate != FilterPredicate::default() {
            exchange.set_filter_predicate(permission.predicate.clone());
        }
        tracing::trace!(authorizer = "acl", role = %permission.role, "Permission matched");
        true
    }
}

/// Denies requests on the users collection whose `filter` query parameter
/// references the password property, so password values cannot be probed.
pub struct DenyFilterOnPasswordPredicate {
    users_uri: String,
    prop_password: String,
}

impl DenyFilterOnPasswordPredicate {
    pub fn new(users_uri: &str, prop_password: &str) -> Self {
        Self {
            users_uri: users_uri.trim_end_matches('/').to_string(),
            prop_password: prop_password.to_string(),
        }
    }

    fn is_users_request(&self, path: &str) -> bool {
        let path = path.trim_end_matches('/');
        path == self.users_uri
            || path
                .strip_prefix(self.users_uri.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

impl Authorizer for DenyFilterOnPasswordPredicate {
    fn is_allowed(&self, exchange: &mut Exchange, _account: Option<&Account>) -> bool {
        if !self.is_users_request(exchange.path()) {
            return true;
        }
        let Some(query) = exchange.query() else {
            return true;
        };

        !url::form_urlencoded::parse(query.as_bytes())
            .filter(|(name, _)| name == "filter")
            .filter_map(|(_, value)| serde_json::from_str::<serde_json::Value>(&value).ok())
            .any(|filter| references_key(&filter, &self.prop_password))
    }
}

fn references_key(value: &serde_json::Value, key: &str) -> bool {
    match value {
        serde_json::Value::Object(map) => {
            map.contains_key(key) || map.values().any(|v| references_key(v, key))
        }
        serde_json::Value::Array(items) => items.iter().any(|v| references_key(v, key)),
        _ => false,
    }
}
