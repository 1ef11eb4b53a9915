pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{DEFAULT_CONFIG_TOML, load_config, load_config_sync};
pub use models::*;
pub use validation::{GatewayConfigValidator, ValidationError, ValidationResult};
