//! Upstream host state: connection budget, failure tracking and quarantine.
use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use hyper::Uri;
use thiserror::Error;
use tokio::{
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::Instant,
};

/// Consecutive failures after which a host becomes a problem server.
pub const PROBLEM_THRESHOLD: u32 = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UpstreamUrlError {
    #[error("Upstream URL '{0}' is not a valid URI")]
    Malformed(String),
    #[error("Upstream URL '{0}' must use http or https")]
    UnsupportedScheme(String),
    #[error("Upstream URL '{0}' has no host")]
    MissingHost(String),
}

/// A validated upstream base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamUrl {
    scheme: String,
    authority: String,
    base_path: String,
}

impl UpstreamUrl {
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Path prefix on the upstream, without a trailing slash.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Build the absolute upstream URI for a path relative to the mount.
    pub fn join(&self, relative: &str, query: Option<&str>) -> Result<Uri, UpstreamUrlError> {
        let path = match (self.base_path.as_str(), relative) {
            ("", rel) => rel.to_string(),
            (base, "/") => base.to_string(),
            (base, rel) => format!("{base}{rel}"),
        };
        let uri = match query {
            Some(q) => format!("{}://{}{path}?{q}", self.scheme, self.authority),
            None => format!("{}://{}{path}", self.scheme, self.authority),
        };
        uri.parse()
            .map_err(|_| UpstreamUrlError::Malformed(uri.clone()))
    }
}

impl FromStr for UpstreamUrl {
    type Err = UpstreamUrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri: Uri = s.parse().map_err(|_| UpstreamUrlError::Malformed(s.to_string()))?;
        let scheme = match uri.scheme_str() {
            Some(scheme @ ("http" | "https")) => scheme.to_string(),
            _ => return Err(UpstreamUrlError::UnsupportedScheme(s.to_string())),
        };
        let authority = uri
            .authority()
            .filter(|a| !a.host().is_empty())
            .ok_or_else(|| UpstreamUrlError::MissingHost(s.to_string()))?
            .to_string();

        Ok(Self {
            scheme,
            authority,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }
}

impl fmt::Display for UpstreamUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// One member of a load-balanced pool.
pub struct UpstreamHost {
    url: UpstreamUrl,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    consecutive_failures: AtomicU32,
    problem_until: Mutex<Option<Instant>>,
    retry_after: Duration,
    released: Arc<Notify>,
}

impl fmt::Debug for UpstreamHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamHost")
            .field("url", &self.url.to_string())
            .field("in_flight", &self.in_flight())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

impl UpstreamHost {
    /// `released` is notified every time a lease on this host ends.
    pub fn new(url: UpstreamUrl, max_connections: usize, retry_after: Duration, released: Arc<Notify>) -> Self {
        Self {
            url,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            in_flight: AtomicUsize::new(0),
            consecutive_failures: AtomicU32::new(0),
            problem_until: Mutex::new(None),
            retry_after,
            released,
        }
    }

    pub fn url(&self) -> &UpstreamUrl {
        &self.url
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    fn problem_until(&self) -> MutexGuard<'_, Option<Instant>> {
        self.problem_until.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the host may be selected. A host whose quarantine window has
    /// elapsed returns to the rotation here.
    pub fn is_available(&self) -> bool {
        let mut until = self.problem_until();
        match *until {
            Some(deadline) if Instant::now() < deadline => false,
            Some(_) => {
                *until = None;
                tracing::info!(upstream = %self.url, "Problem server back in rotation");
                true
            }
            None => true,
        }
    }

    pub fn is_problem_server(&self) -> bool {
        !self.is_available()
    }

    /// Take a connection slot if one is free.
    pub fn try_lease(self: &Arc<Self>) -> Option<HostLease> {
        let permit = self.permits.clone().try_acquire_owned().ok()?;
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        Some(HostLease {
            host: self.clone(),
            _permit: permit,
        })
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Count a failed forward. Returns true when this failure put the host
    /// in quarantine.
    pub fn record_failure(&self) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < PROBLEM_THRESHOLD {
            return false;
        }

        self.consecutive_failures.store(0, Ordering::Release);
        *self.problem_until() = Some(Instant::now() + self.retry_after);
        tracing::warn!(
            upstream = %self.url,
            failures,
            retry_after = ?self.retry_after,
            "Upstream marked as problem server"
        );
        true
    }
}

/// A connection slot on a host, released on drop.
pub struct HostLease {
    host: Arc<UpstreamHost>,
    _permit: OwnedSemaphorePermit,
}

impl HostLease {
    pub fn host(&self) -> &Arc<UpstreamHost> {
        &self.host
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        self.host.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.host.released.notify_one();
    }
}
