use serde::{Deserialize, Serialize};

use crate::provider::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Success,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshStatus::Success => "success",
            RefreshStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(RefreshStatus::Success),
            "failed" => Some(RefreshStatus::Failed),
            _ => None,
        }
    }
}

/// One set of OAuth credentials bound to an upstream identity.
///
/// `refresh_lock_token` / `refresh_lock_expires_at` form the advisory lease
/// granting exclusive right to refresh; both are null when unheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderAccount {
    pub id: String,
    pub provider: Provider,
    pub account_id: Option<String>,
    pub label: Option<String>,
    pub is_primary: bool,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub refresh_lock_token: Option<String>,
    pub refresh_lock_expires_at: Option<i64>,
    pub metadata: AccountMetadata,
    pub last_refresh_at: Option<i64>,
    pub last_refresh_status: Option<RefreshStatus>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProviderAccount {
    pub fn token_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Provider-specific request profile constants captured at OAuth time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AccountMetadata {
    Codex(CodexMetadata),
    Copilot(CopilotMetadata),
    Claude(ClaudeMetadata),
}

impl AccountMetadata {
    pub fn provider(&self) -> Provider {
        match self {
            AccountMetadata::Codex(_) => Provider::Codex,
            AccountMetadata::Copilot(_) => Provider::Copilot,
            AccountMetadata::Claude(_) => Provider::Claude,
        }
    }

    pub fn empty_for(provider: Provider) -> Self {
        match provider {
            Provider::Codex => AccountMetadata::Codex(CodexMetadata::default()),
            Provider::Copilot => AccountMetadata::Copilot(CopilotMetadata::default()),
            Provider::Claude => AccountMetadata::Claude(ClaudeMetadata::default()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodexMetadata {
    #[serde(default)]
    pub originator: Option<String>,
    #[serde(default)]
    pub chatgpt_account_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopilotMetadata {
    /// Derived from the `proxy-ep` segment of the Copilot token.
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub enterprise_domain: Option<String>,
    #[serde(default)]
    pub request_profile: Option<CopilotRequestProfile>,
}

/// Optional overrides for the header names the copilot preparer writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopilotRequestProfile {
    #[serde(default)]
    pub intent_header: Option<String>,
    #[serde(default)]
    pub initiator_header: Option<String>,
    #[serde(default)]
    pub vision_header: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaudeOAuthMode {
    #[default]
    Max,
    Console,
}

impl ClaudeOAuthMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "max" => Some(ClaudeOAuthMode::Max),
            "console" => Some(ClaudeOAuthMode::Console),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaudeMetadata {
    #[serde(default)]
    pub mode: ClaudeOAuthMode,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub betas: Vec<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub system_identity: Option<String>,
    #[serde(default)]
    pub tool_prefix: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_round_trips_through_json_with_tag() {
        let metadata = AccountMetadata::Claude(ClaudeMetadata {
            mode: ClaudeOAuthMode::Console,
            betas: vec!["oauth-2025-04-20".to_string()],
            ..Default::default()
        });
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json.get("kind").and_then(|v| v.as_str()), Some("claude"));
        let back: AccountMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, metadata);
        assert_eq!(back.provider(), Provider::Claude);
    }

    #[test]
    fn token_expiry_is_inclusive_of_now() {
        let mut account = sample_account();
        account.expires_at = 1_000;
        assert!(account.token_expired(1_000));
        assert!(!account.token_expired(999));
    }

    fn sample_account() -> ProviderAccount {
        ProviderAccount {
            id: "acc_1".to_string(),
            provider: Provider::Codex,
            account_id: None,
            label: None,
            is_primary: true,
            access_token: "A".to_string(),
            refresh_token: "R".to_string(),
            expires_at: 0,
            refresh_lock_token: None,
            refresh_lock_expires_at: None,
            metadata: AccountMetadata::empty_for(Provider::Codex),
            last_refresh_at: None,
            last_refresh_status: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}
