pub mod cache;
pub mod exchange;
pub mod gateway;
pub mod interceptor;
pub mod pipeline;
pub mod plugin;
pub mod proxy;
pub mod router;
pub mod security;

pub use exchange::Exchange;
pub use gateway::{BootstrapError, GatewayService};
pub use plugin::PluginRegistry;
