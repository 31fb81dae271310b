use serde::{Deserialize, Serialize};

/// Upstream account family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Codex,
    Copilot,
    Claude,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Codex, Provider::Copilot, Provider::Claude];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Codex => "codex",
            Provider::Copilot => "copilot",
            Provider::Claude => "claude",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "codex" => Some(Provider::Codex),
            "copilot" => Some(Provider::Copilot),
            "claude" => Some(Provider::Claude),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public wire identity carried in the route prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalProvider {
    #[serde(rename = "openai")]
    Openai,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "github-copilot")]
    GithubCopilot,
}

impl CanonicalProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalProvider::Openai => "openai",
            CanonicalProvider::Anthropic => "anthropic",
            CanonicalProvider::GithubCopilot => "github-copilot",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "openai" => Some(CanonicalProvider::Openai),
            "anthropic" => Some(CanonicalProvider::Anthropic),
            "github-copilot" => Some(CanonicalProvider::GithubCopilot),
            _ => None,
        }
    }
}

impl std::fmt::Display for CanonicalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderMapping {
    pub canonical: CanonicalProvider,
    pub internal: Provider,
    pub route_base_path: &'static str,
    /// Package hint consumed only by the models registry.
    pub npm_hint: &'static str,
}

pub static PROVIDER_MAPPINGS: [ProviderMapping; 3] = [
    ProviderMapping {
        canonical: CanonicalProvider::Openai,
        internal: Provider::Codex,
        route_base_path: "/openai/v1",
        npm_hint: "@ai-sdk/openai",
    },
    ProviderMapping {
        canonical: CanonicalProvider::Anthropic,
        internal: Provider::Claude,
        route_base_path: "/anthropic/v1",
        npm_hint: "@ai-sdk/anthropic",
    },
    ProviderMapping {
        canonical: CanonicalProvider::GithubCopilot,
        internal: Provider::Copilot,
        route_base_path: "/copilot/v1",
        npm_hint: "@ai-sdk/openai-compatible",
    },
];

pub fn mapping_for(canonical: CanonicalProvider) -> &'static ProviderMapping {
    PROVIDER_MAPPINGS
        .iter()
        .find(|mapping| mapping.canonical == canonical)
        .expect("every canonical provider has a mapping")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_and_internal_round_trip_through_parse() {
        for mapping in PROVIDER_MAPPINGS {
            assert_eq!(
                CanonicalProvider::parse(mapping.canonical.as_str()),
                Some(mapping.canonical)
            );
            assert_eq!(
                Provider::parse(mapping.internal.as_str()),
                Some(mapping.internal)
            );
        }
    }

    #[test]
    fn base_paths_follow_canonical_names() {
        assert_eq!(mapping_for(CanonicalProvider::Openai).route_base_path, "/openai/v1");
        assert_eq!(
            mapping_for(CanonicalProvider::GithubCopilot).route_base_path,
            "/copilot/v1"
        );
    }
}
