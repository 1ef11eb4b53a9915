pub mod account_store;
pub mod auth_mechanism;
pub mod authorizer;
pub mod file_system;
pub mod http_client;
pub mod interceptor;
pub mod service;
pub mod token_manager;
