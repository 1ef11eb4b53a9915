//! Gatehouse - an extensible HTTP gateway with pluggable security pipelines.
//!
//! Every inbound request is resolved by the mount table to one pipeline
//! (a local service, a load-balanced reverse proxy, or a static directory)
//! and driven through its ordered stages: before-auth interceptors,
//! authentication, authorization, after-auth interceptors, the handler and
//! finally the response interceptors.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use gatehouse::{
//!     adapters::{FileSystemAdapter, HttpClientAdapter, PoolSettings, build_plugins},
//!     config::{ProxyOptions, load_config},
//!     core::{GatewayService, gateway::HttpClientFactory},
//!     ports::http_client::HttpClient,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("config.toml").await?;
//! let plugins = build_plugins(&config)?;
//! let clients: HttpClientFactory = Arc::new(|options: &ProxyOptions| {
//!     let client: Arc<dyn HttpClient> = Arc::new(HttpClientAdapter::new(PoolSettings::from(options))?);
//!     Ok(client)
//! });
//! let gateway = GatewayService::bootstrap(
//!     &config,
//!     plugins.registry.clone(),
//!     Arc::new(FileSystemAdapter::new()),
//!     clients,
//! )?;
//! // Serve it through `adapters::HttpHandler::into_router` (see the binary crate)
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! Traits live in `ports`, their implementations in `adapters`, and the
//! request pipeline machinery in `core`. The plugin registry and the mount
//! table are built once at startup and only read afterwards.
//!
//! # Concurrency & Data Structures
//! Shared caches use `scc::HashMap`; proxy admission is bounded per upstream
//! host with counters and a wait queue rather than a global lock.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{FileSystemAdapter, HttpClientAdapter, HttpHandler},
    core::{BootstrapError, GatewayService},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
