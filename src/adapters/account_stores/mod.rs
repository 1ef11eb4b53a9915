pub mod http;
pub mod memory;

pub use http::HttpAccountStore;
pub use memory::MemoryAccountStore;
