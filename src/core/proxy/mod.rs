//! Reverse proxying to load-balanced upstream pools.
pub mod client;
pub mod host;

pub use client::{LoadBalancingProxyClient, ProxyError, ProxyTarget};
pub use host::{HostLease, PROBLEM_THRESHOLD, UpstreamHost, UpstreamUrl, UpstreamUrlError};
