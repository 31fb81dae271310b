use crate::provider::{CanonicalProvider, Provider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Responses,
    Messages,
    ChatCompletions,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Responses => "responses",
            Endpoint::Messages => "messages",
            Endpoint::ChatCompletions => "chat_completions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyRoute {
    pub canonical: CanonicalProvider,
    pub endpoint: Endpoint,
    pub internal: Provider,
}

/// The static proxy route table. Paths are
/// `POST {canonical base}/{public suffix}`.
pub static PROXY_ROUTES: [ProxyRoute; 4] = [
    ProxyRoute {
        canonical: CanonicalProvider::Openai,
        endpoint: Endpoint::Responses,
        internal: Provider::Codex,
    },
    ProxyRoute {
        canonical: CanonicalProvider::Anthropic,
        endpoint: Endpoint::Messages,
        internal: Provider::Claude,
    },
    ProxyRoute {
        canonical: CanonicalProvider::GithubCopilot,
        endpoint: Endpoint::ChatCompletions,
        internal: Provider::Copilot,
    },
    ProxyRoute {
        canonical: CanonicalProvider::GithubCopilot,
        endpoint: Endpoint::Responses,
        internal: Provider::Copilot,
    },
];

pub fn route_for(canonical: CanonicalProvider, endpoint: Endpoint) -> Option<&'static ProxyRoute> {
    PROXY_ROUTES
        .iter()
        .find(|route| route.canonical == canonical && route.endpoint == endpoint)
}

/// Outcome of model prefix normalization for one request.
///
/// `upstream` is what the provider sees. `candidates` is what scope checks
/// intersect against; a recognized prefix expands to the raw value, the
/// unprefixed value and both provider-qualified spellings, while a foreign
/// prefix (e.g. `openai/...` on an anthropic route) disqualifies every
/// candidate so scoped keys cannot be satisfied across routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResolution {
    pub raw: String,
    pub upstream: String,
    pub candidates: Vec<String>,
    pub rewritten: bool,
}

pub fn resolve_model(raw: &str, route: &ProxyRoute) -> ModelResolution {
    let canonical = route.canonical.as_str();
    let internal = route.internal.as_str();

    let (upstream, rewritten, foreign_prefix) = match raw.split_once('/') {
        Some((prefix, rest)) if prefix == canonical || prefix == internal => {
            (rest.to_string(), true, false)
        }
        Some(_) => (raw.to_string(), false, true),
        None => (raw.to_string(), false, false),
    };

    let candidates = if foreign_prefix {
        Vec::new()
    } else {
        let mut candidates = vec![
            raw.to_string(),
            upstream.clone(),
            format!("{canonical}/{upstream}"),
            format!("{internal}/{upstream}"),
        ];
        candidates.dedup();
        let mut seen = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if !seen.contains(&candidate) {
                seen.push(candidate);
            }
        }
        seen
    };

    ModelResolution {
        raw: raw.to_string(),
        upstream,
        candidates,
        rewritten,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_route() -> &'static ProxyRoute {
        route_for(CanonicalProvider::Openai, Endpoint::Responses).unwrap()
    }

    fn anthropic_route() -> &'static ProxyRoute {
        route_for(CanonicalProvider::Anthropic, Endpoint::Messages).unwrap()
    }

    #[test]
    fn table_contains_the_four_public_routes() {
        assert_eq!(PROXY_ROUTES.len(), 4);
        assert!(route_for(CanonicalProvider::GithubCopilot, Endpoint::Responses).is_some());
        assert!(route_for(CanonicalProvider::Openai, Endpoint::Messages).is_none());
    }

    #[test]
    fn canonical_prefix_is_stripped_for_upstream() {
        let resolved = resolve_model("openai/gpt-5.1-codex", openai_route());
        assert_eq!(resolved.upstream, "gpt-5.1-codex");
        assert!(resolved.rewritten);
        assert_eq!(
            resolved.candidates,
            vec![
                "openai/gpt-5.1-codex".to_string(),
                "gpt-5.1-codex".to_string(),
                "codex/gpt-5.1-codex".to_string(),
            ]
        );
    }

    #[test]
    fn internal_prefix_is_also_recognized() {
        let resolved = resolve_model("codex/gpt-5.2", openai_route());
        assert_eq!(resolved.upstream, "gpt-5.2");
        assert!(resolved.candidates.contains(&"openai/gpt-5.2".to_string()));
    }

    #[test]
    fn bare_model_round_trips_unchanged() {
        let resolved = resolve_model("claude-sonnet-4-5", anthropic_route());
        assert_eq!(resolved.upstream, "claude-sonnet-4-5");
        assert!(!resolved.rewritten);
        assert_eq!(
            resolved.candidates,
            vec![
                "claude-sonnet-4-5".to_string(),
                "anthropic/claude-sonnet-4-5".to_string(),
                "claude/claude-sonnet-4-5".to_string(),
            ]
        );
    }

    #[test]
    fn foreign_prefix_disqualifies_all_candidates() {
        let resolved = resolve_model("openai/gpt-5.1-codex", anthropic_route());
        assert_eq!(resolved.upstream, "openai/gpt-5.1-codex");
        assert!(!resolved.rewritten);
        assert!(resolved.candidates.is_empty());
    }

    #[test]
    fn prefix_round_trip_property_holds() {
        for route in &PROXY_ROUTES {
            for prefix in [route.canonical.as_str(), route.internal.as_str()] {
                let prefixed = format!("{prefix}/some-model");
                assert_eq!(resolve_model(&prefixed, route).upstream, "some-model");
            }
            assert_eq!(resolve_model("some-model", route).upstream, "some-model");
        }
    }
}
