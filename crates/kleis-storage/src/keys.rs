use serde::{Deserialize, Serialize};

use kleis_provider_core::Provider;

/// Caller-issued API key. `provider_scopes` / `model_scopes` of `None`
/// mean unrestricted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub key: String,
    pub models_discovery_token: Option<String>,
    pub label: Option<String>,
    pub provider_scopes: Option<Vec<Provider>>,
    pub model_scopes: Option<Vec<String>>,
    pub expires_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub created_at: i64,
}

impl ApiKey {
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.revoked_at.is_none() && self.expires_at.is_none_or(|expires| expires > now_ms)
    }
}

#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub key: String,
    pub models_discovery_token: Option<String>,
    pub label: Option<String>,
    pub provider_scopes: Option<Vec<Provider>>,
    pub model_scopes: Option<Vec<String>>,
    pub expires_at: Option<i64>,
}

/// Admin PATCH payload; `None` leaves a field untouched, the nested
/// `Option` writes null.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyPatch {
    pub label: Option<Option<String>>,
    pub provider_scopes: Option<Option<Vec<Provider>>>,
    pub model_scopes: Option<Option<Vec<String>>>,
    pub expires_at: Option<Option<i64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKeyOutcome {
    Deleted,
    NotRevoked,
    NotFound,
}
