use serde_json::{Map, Value as JsonValue, json};

use kleis_common::{ServiceResult, now_ms};
use kleis_provider_core::{PROVIDER_MAPPINGS, Provider};
use kleis_provider_impl::http_client::shared_client;

const MODELS_DEV_URL: &str = "https://models.dev/api.json";
const CACHE_TTL_MS: i64 = 5 * 60_000;

/// Codex exposes far more models than its backend accepts; only codex
/// variants and this fixed set are advertised.
const CODEX_MODEL_ALLOW: [&str; 6] = [
    "gpt-5.1-codex-max",
    "gpt-5.1-codex-mini",
    "gpt-5.2",
    "gpt-5.2-codex",
    "gpt-5.3-codex",
    "gpt-5.1-codex",
];

#[derive(Debug, Clone, Default)]
pub struct ApiKeyScopes {
    pub provider_scopes: Option<Vec<Provider>>,
    pub model_scopes: Option<Vec<String>>,
}

struct CachedDoc {
    fetched_at: i64,
    doc: JsonValue,
}

/// Registry built by merging the models.dev catalog with the proxy's own
/// canonical provider entries.
#[derive(Default)]
pub struct ModelsRegistry {
    cache: tokio::sync::Mutex<Option<CachedDoc>>,
}

impl ModelsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn registry_json(
        &self,
        public_origin: &str,
        configured: &[Provider],
        scopes: Option<&ApiKeyScopes>,
    ) -> ServiceResult<JsonValue> {
        let doc = self.fetch_doc().await;
        Ok(build_registry(&doc, public_origin, configured, scopes))
    }

    async fn fetch_doc(&self) -> JsonValue {
        let now = now_ms();
        let mut guard = self.cache.lock().await;
        if let Some(cached) = guard.as_ref()
            && now - cached.fetched_at < CACHE_TTL_MS
        {
            return cached.doc.clone();
        }

        match fetch_models_dev().await {
            Ok(doc) => {
                *guard = Some(CachedDoc {
                    fetched_at: now,
                    doc: doc.clone(),
                });
                doc
            }
            Err(err) => {
                tracing::warn!(error = %err, "models.dev fetch failed; serving stale or empty");
                guard
                    .as_ref()
                    .map(|cached| cached.doc.clone())
                    .unwrap_or_else(|| JsonValue::Object(Map::new()))
            }
        }
    }
}

async fn fetch_models_dev() -> Result<JsonValue, String> {
    let client = shared_client();
    let resp = client
        .get(MODELS_DEV_URL)
        .send()
        .await
        .map_err(|err| err.to_string())?;
    let status = resp.status();
    let bytes = resp.bytes().await.map_err(|err| err.to_string())?;
    if !status.is_success() {
        return Err(format!("models.dev returned {status}"));
    }
    serde_json::from_slice::<JsonValue>(&bytes).map_err(|err| err.to_string())
}

/// Unscoped: the upstream document with canonical entries rewritten to
/// point at the proxy, plus a synthetic `kleis` aggregate. Scoped: built
/// from scratch out of the allowed providers and models only.
pub fn build_registry(
    doc: &JsonValue,
    public_origin: &str,
    configured: &[Provider],
    scopes: Option<&ApiKeyScopes>,
) -> JsonValue {
    let public_origin = public_origin.trim_end_matches('/');
    let mut registry = match scopes {
        None => doc.as_object().cloned().unwrap_or_default(),
        Some(_) => Map::new(),
    };

    let mut kleis_models = Map::new();
    for mapping in PROVIDER_MAPPINGS {
        if !configured.contains(&mapping.internal) {
            if scopes.is_none() {
                rewrite_canonical_entry(&mut registry, &mapping, doc, public_origin);
            }
            continue;
        }
        if let Some(scopes) = scopes
            && let Some(providers) = scopes.provider_scopes.as_deref()
            && !providers.is_empty()
            && !providers.contains(&mapping.internal)
        {
            continue;
        }

        let source_models = doc
            .get(mapping.canonical.as_str())
            .and_then(|entry| entry.get("models"))
            .and_then(|models| models.as_object())
            .cloned()
            .unwrap_or_default();
        let mut allowed = Map::new();
        for (model_id, model) in source_models {
            if mapping.internal == Provider::Codex && !codex_model_allowed(&model_id) {
                continue;
            }
            if let Some(scopes) = scopes
                && !model_in_scope(&model_id, &mapping, scopes.model_scopes.as_deref())
            {
                continue;
            }
            kleis_models.insert(
                format!("{}/{model_id}", mapping.canonical.as_str()),
                model.clone(),
            );
            allowed.insert(model_id, model);
        }

        match scopes {
            None => {
                rewrite_canonical_entry(&mut registry, &mapping, doc, public_origin);
            }
            Some(_) => {
                let name = doc
                    .get(mapping.canonical.as_str())
                    .and_then(|entry| entry.get("name"))
                    .cloned()
                    .unwrap_or_else(|| json!(mapping.canonical.as_str()));
                registry.insert(
                    mapping.canonical.as_str().to_string(),
                    json!({
                        "id": mapping.canonical.as_str(),
                        "name": name,
                        "api": format!("{public_origin}{}", mapping.route_base_path),
                        "npm": mapping.npm_hint,
                        "env": ["KLEIS_API_KEY"],
                        "models": allowed,
                    }),
                );
            }
        }
    }

    registry.insert(
        "kleis".to_string(),
        json!({
            "id": "kleis",
            "name": "Kleis",
            "api": public_origin,
            "env": ["KLEIS_API_KEY"],
            "models": kleis_models,
        }),
    );
    JsonValue::Object(registry)
}

fn rewrite_canonical_entry(
    registry: &mut Map<String, JsonValue>,
    mapping: &kleis_provider_core::ProviderMapping,
    doc: &JsonValue,
    public_origin: &str,
) {
    let entry = registry
        .entry(mapping.canonical.as_str().to_string())
        .or_insert_with(|| {
            doc.get(mapping.canonical.as_str()).cloned().unwrap_or_else(|| {
                json!({
                    "id": mapping.canonical.as_str(),
                    "name": mapping.canonical.as_str(),
                    "models": {},
                })
            })
        });
    if let Some(obj) = entry.as_object_mut() {
        obj.insert(
            "api".to_string(),
            json!(format!("{public_origin}{}", mapping.route_base_path)),
        );
        obj.insert("env".to_string(), json!(["KLEIS_API_KEY"]));
        obj.entry("npm".to_string())
            .or_insert_with(|| json!(mapping.npm_hint));
    }
}

fn codex_model_allowed(model_id: &str) -> bool {
    model_id.contains("codex") || CODEX_MODEL_ALLOW.contains(&model_id)
}

fn model_in_scope(
    model_id: &str,
    mapping: &kleis_provider_core::ProviderMapping,
    model_scopes: Option<&[String]>,
) -> bool {
    let Some(scopes) = model_scopes else {
        return true;
    };
    if scopes.is_empty() {
        return true;
    }
    let canonical = format!("{}/{model_id}", mapping.canonical.as_str());
    let internal = format!("{}/{model_id}", mapping.internal.as_str());
    scopes
        .iter()
        .any(|scope| scope == model_id || *scope == canonical || *scope == internal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_doc() -> JsonValue {
        json!({
            "openai": {
                "id": "openai",
                "name": "OpenAI",
                "api": "https://api.openai.com/v1",
                "env": ["OPENAI_API_KEY"],
                "models": {
                    "gpt-5.1-codex": {"id": "gpt-5.1-codex"},
                    "gpt-5.2": {"id": "gpt-5.2"},
                    "gpt-4o": {"id": "gpt-4o"},
                },
            },
            "anthropic": {
                "id": "anthropic",
                "name": "Anthropic",
                "api": "https://api.anthropic.com/v1",
                "env": ["ANTHROPIC_API_KEY"],
                "models": {
                    "claude-sonnet-4-5": {"id": "claude-sonnet-4-5"},
                },
            },
            "mistral": {
                "id": "mistral",
                "name": "Mistral",
                "models": {"mistral-large": {}},
            },
        })
    }

    #[test]
    fn canonical_entries_point_at_the_proxy() {
        let registry = build_registry(
            &fixture_doc(),
            "https://kleis.example",
            &[Provider::Codex, Provider::Claude],
            None,
        );
        assert_eq!(
            registry["openai"]["api"].as_str(),
            Some("https://kleis.example/openai/v1")
        );
        assert_eq!(
            registry["anthropic"]["api"].as_str(),
            Some("https://kleis.example/anthropic/v1")
        );
        assert_eq!(registry["openai"]["env"], json!(["KLEIS_API_KEY"]));
        // Unrelated providers pass through untouched.
        assert_eq!(registry["mistral"]["name"].as_str(), Some("Mistral"));
    }

    #[test]
    fn kleis_aggregate_prefixes_and_filters_codex_models() {
        let registry = build_registry(
            &fixture_doc(),
            "https://kleis.example",
            &[Provider::Codex, Provider::Claude],
            None,
        );
        let models = registry["kleis"]["models"].as_object().unwrap();
        assert!(models.contains_key("openai/gpt-5.1-codex"));
        assert!(models.contains_key("openai/gpt-5.2"));
        assert!(models.contains_key("anthropic/claude-sonnet-4-5"));
        // gpt-4o is neither a codex variant nor allow-listed.
        assert!(!models.contains_key("openai/gpt-4o"));
    }

    #[test]
    fn unconfigured_providers_contribute_no_aggregate_models() {
        let registry = build_registry(
            &fixture_doc(),
            "https://kleis.example",
            &[Provider::Claude],
            None,
        );
        let models = registry["kleis"]["models"].as_object().unwrap();
        assert!(models.keys().all(|key| key.starts_with("anthropic/")));
    }

    #[test]
    fn scoped_registry_is_built_from_scratch() {
        let scopes = ApiKeyScopes {
            provider_scopes: Some(vec![Provider::Claude]),
            model_scopes: None,
        };
        let registry = build_registry(
            &fixture_doc(),
            "https://kleis.example",
            &[Provider::Codex, Provider::Claude],
            Some(&scopes),
        );
        assert!(registry.get("openai").is_none());
        assert!(registry.get("mistral").is_none());
        assert_eq!(
            registry["anthropic"]["api"].as_str(),
            Some("https://kleis.example/anthropic/v1")
        );
    }

    #[test]
    fn model_scopes_filter_the_scoped_registry() {
        let scopes = ApiKeyScopes {
            provider_scopes: None,
            model_scopes: Some(vec!["openai/gpt-5.1-codex".to_string()]),
        };
        let registry = build_registry(
            &fixture_doc(),
            "https://kleis.example",
            &[Provider::Codex, Provider::Claude],
            Some(&scopes),
        );
        let openai_models = registry["openai"]["models"].as_object().unwrap();
        assert_eq!(openai_models.len(), 1);
        assert!(openai_models.contains_key("gpt-5.1-codex"));
        let anthropic_models = registry["anthropic"]["models"].as_object().unwrap();
        assert!(anthropic_models.is_empty());
    }
}
