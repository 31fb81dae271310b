use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::account::{AccountMetadata, ProviderAccount};
use crate::provider::Provider;

pub type OAuthResult<T> = Result<T, OAuthError>;

#[derive(Debug, Clone)]
pub enum OAuthError {
    StateMissingOrExpired,
    PkceMissing,
    StateMismatch,
    TokenExchangeFailed { status: u16, body: String },
    DeviceFlowTimeout,
    MalformedResponse(String),
    Storage(String),
    Http(String),
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OAuthError::StateMissingOrExpired => write!(f, "oauth state missing or expired"),
            OAuthError::PkceMissing => write!(f, "pkce verifier missing"),
            OAuthError::StateMismatch => write!(f, "callback state mismatch"),
            OAuthError::TokenExchangeFailed { status, body } => {
                write!(f, "token exchange failed: {status} {body}")
            }
            OAuthError::DeviceFlowTimeout => write!(f, "device flow timed out"),
            OAuthError::MalformedResponse(msg) => write!(f, "malformed upstream response: {msg}"),
            OAuthError::Storage(msg) => write!(f, "oauth state storage: {msg}"),
            OAuthError::Http(msg) => write!(f, "oauth http: {msg}"),
        }
    }
}

impl Error for OAuthError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthMethod {
    /// Device/polling flow; completion needs no pasted code.
    Auto,
    /// The user pastes the callback code or URL.
    Code,
}

#[derive(Debug, Clone, Serialize)]
pub struct OAuthStart {
    pub authorization_url: String,
    pub state: String,
    pub method: OAuthMethod,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthStartOptions {
    /// Copilot: enterprise GitHub host, e.g. `ghe.example.com`.
    pub enterprise_domain: Option<String>,
    /// Claude: `max` (claude.ai) or `console` (console.anthropic.com).
    pub mode: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub account_id: Option<String>,
    pub metadata: AccountMetadata,
    pub label: Option<String>,
}

/// Pending-flow state persisted between `start_oauth` and `complete_oauth`.
#[derive(Debug, Clone)]
pub struct OAuthStateRecord {
    pub state: String,
    pub provider: Provider,
    pub pkce_verifier: Option<String>,
    pub metadata_json: Option<String>,
    pub expires_at: i64,
}

#[async_trait::async_trait]
pub trait OAuthAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    async fn start_oauth(
        &self,
        redirect_uri: Option<&str>,
        options: &OAuthStartOptions,
        now_ms: i64,
    ) -> OAuthResult<OAuthStart>;

    async fn complete_oauth(
        &self,
        state: &str,
        code: Option<&str>,
        now_ms: i64,
    ) -> OAuthResult<OAuthTokens>;

    async fn refresh_account(
        &self,
        account: &ProviderAccount,
        now_ms: i64,
    ) -> OAuthResult<OAuthTokens>;
}

/// Fixed provider → adapter map, immutable after construction.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn OAuthAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn OAuthAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn OAuthAdapter>> {
        self.adapters.get(&provider).cloned()
    }
}
