//! Pipeline router: maps a request path to a mounted pipeline.
//!
//! Exact mounts are checked first, then prefix mounts from the longest prefix
//! down. Prefixes match on segment boundaries, so `/api` serves `/api` and
//! `/api/x` but not `/apix`.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouterError {
    #[error("Mount path '{0}' must start with '/'")]
    InvalidMount(String),
    #[error("Duplicate mount path '{0}'")]
    DuplicateMount(String),
}

/// How a mount's `where` is compared with request paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    Prefix,
    Exact,
}

/// Mount table, built at bootstrap and read-only afterwards.
pub struct PipelineRouter<T> {
    exact: HashMap<String, T>,
    /// Sorted by descending prefix length
    prefixes: Vec<(String, T)>,
}

impl<T> Default for PipelineRouter<T> {
    fn default() -> Self {
        Self {
            exact: HashMap::new(),
            prefixes: Vec::new(),
        }
    }
}

impl<T> PipelineRouter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `target` at `location`. A location can be mounted once,
    /// whatever the match policy.
    pub fn mount(&mut self, location: &str, policy: MatchPolicy, target: T) -> Result<(), RouterError> {
        if !location.starts_with('/') {
            return Err(RouterError::InvalidMount(location.to_string()));
        }
        let location = normalize(location);

        if self.exact.contains_key(&location) || self.prefixes.iter().any(|(p, _)| *p == location) {
            return Err(RouterError::DuplicateMount(location));
        }

        match policy {
            MatchPolicy::Exact => {
                self.exact.insert(location, target);
            }
            MatchPolicy::Prefix => {
                let at = self
                    .prefixes
                    .iter()
                    .position(|(p, _)| p.len() < location.len())
                    .unwrap_or(self.prefixes.len());
                self.prefixes.insert(at, (location, target));
            }
        }
        Ok(())
    }

    /// Resolve a request path to its mount.
    pub fn resolve(&self, path: &str) -> Option<&T> {
        let path = normalize(path);

        if let Some(target) = self.exact.get(&path) {
            return Some(target);
        }

        self.prefixes
            .iter()
            .find(|(prefix, _)| matches_prefix(&path, prefix))
            .map(|(_, target)| target)
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical form of a mount location or request path: no trailing `/`
/// except for the root itself.
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn matches_prefix(path: &str, prefix: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> PipelineRouter<&'static str> {
        let mut router = PipelineRouter::new();
        router.mount("/", MatchPolicy::Prefix, "root").unwrap();
        router.mount("/api", MatchPolicy::Prefix, "api").unwrap();
        router.mount("/api/v2", MatchPolicy::Prefix, "api-v2").unwrap();
        router.mount("/api/v2/status", MatchPolicy::Exact, "status").unwrap();
        router
    }

    #[test]
    fn test_longest_prefix_wins() {
        let router = router();
        assert_eq!(router.resolve("/api/users"), Some(&"api"));
        assert_eq!(router.resolve("/api/v2/users"), Some(&"api-v2"));
        assert_eq!(router.resolve("/api"), Some(&"api"));
        assert_eq!(router.resolve("/other"), Some(&"root"));
    }

    #[test]
    fn test_exact_beats_prefix() {
        let router = router();
        assert_eq!(router.resolve("/api/v2/status"), Some(&"status"));
        assert_eq!(router.resolve("/api/v2/status/"), Some(&"status"));
        assert_eq!(router.resolve("/api/v2/status/x"), Some(&"api-v2"));
    }

    #[test]
    fn test_prefix_respects_segment_boundary() {
        let mut router = PipelineRouter::new();
        router.mount("/api", MatchPolicy::Prefix, "api").unwrap();
        assert_eq!(router.resolve("/apix"), None);
        assert_eq!(router.resolve("/api/"), Some(&"api"));
        assert_eq!(router.resolve("/"), None);
    }

    #[test]
    fn test_duplicate_mount_is_rejected() {
        let mut router = router();
        assert_eq!(
            router.mount("/api/", MatchPolicy::Prefix, "again"),
            Err(RouterError::DuplicateMount("/api".to_string()))
        );
        assert_eq!(
            router.mount("/api", MatchPolicy::Exact, "again"),
            Err(RouterError::DuplicateMount("/api".to_string()))
        );
        assert_eq!(router.len(), 4);
    }

    #[test]
    fn test_mount_must_be_absolute() {
        let mut router = PipelineRouter::new();
        assert_eq!(
            router.mount("api", MatchPolicy::Prefix, ()),
            Err(RouterError::InvalidMount("api".to_string()))
        );
        assert!(router.is_empty());
    }
}
