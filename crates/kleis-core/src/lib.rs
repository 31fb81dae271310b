pub mod auth;
pub mod models;
pub mod passthrough;
pub mod ratelimit;
pub mod recorder;
pub mod service;
pub mod state;

pub use auth::{generate_api_key_value, generate_discovery_token};
pub use models::{ApiKeyScopes, ModelsRegistry};
pub use passthrough::{extract_from_json_body, rewrite_tool_names, wrap_sse_stream};
pub use ratelimit::{RateLimitScope, RateLimiter};
pub use recorder::{MISSING_ACCOUNT_ID, RequestRecorder, UsageContext};
pub use service::{ImportAccountInput, ProviderService};
pub use state::{AppState, bootstrap};
