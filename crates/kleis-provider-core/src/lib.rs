pub mod account;
pub mod adapter;
pub mod headers;
pub mod prepare;
pub mod provider;
pub mod routes;

pub use account::{
    AccountMetadata, ClaudeMetadata, ClaudeOAuthMode, CodexMetadata, CopilotMetadata,
    CopilotRequestProfile, ProviderAccount, RefreshStatus,
};
pub use adapter::{
    AdapterRegistry, OAuthAdapter, OAuthError, OAuthMethod, OAuthResult, OAuthStart,
    OAuthStartOptions, OAuthStateRecord, OAuthTokens,
};
pub use headers::{Headers, header_get, header_remove, header_set};
pub use prepare::{PreparedRequest, ResponseTransform};
pub use provider::{CanonicalProvider, Provider, ProviderMapping, PROVIDER_MAPPINGS, mapping_for};
pub use routes::{Endpoint, ModelResolution, PROXY_ROUTES, ProxyRoute, resolve_model, route_for};
