pub mod http_client;
pub mod oauth_common;
pub mod prepare;
pub mod providers;
pub mod registry;

pub use prepare::{PrepareInput, prepare_request};
pub use registry::build_adapter_registry;
