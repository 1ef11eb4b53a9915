pub mod account_stores;
pub mod authorizers;
pub mod file_system;
pub mod http_client;
pub mod http_handler;
pub mod interceptors;
pub mod mechanisms;
pub mod plugins;
pub mod services;

/// Re-export commonly used types from adapters
pub use file_system::FileSystemAdapter;
pub use http_client::{HttpClientAdapter, PoolSettings};
pub use http_handler::HttpHandler;
pub use plugins::{PluginSet, build_plugins};
