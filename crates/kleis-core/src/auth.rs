use base64::Engine;
use rand::RngCore;

use kleis_common::{ErrorKind, ServiceError, ServiceResult};
use kleis_provider_core::{ModelResolution, ProxyRoute};
use kleis_storage::{ApiKey, Repository};

pub const API_KEY_PREFIX: &str = "kleis_";
pub const DISCOVERY_TOKEN_PREFIX: &str = "kmd_";

pub fn generate_api_key_value() -> String {
    format!("{API_KEY_PREFIX}{}", random_token())
}

pub fn generate_discovery_token() -> String {
    format!("{DISCOVERY_TOKEN_PREFIX}{}", random_token())
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Bearer from `Authorization`, falling back to `x-api-key`.
pub fn extract_bearer(authorization: Option<&str>, x_api_key: Option<&str>) -> Option<String> {
    if let Some(value) = authorization {
        let value = value.trim();
        let prefix = "Bearer ";
        if value.len() > prefix.len() && value[..prefix.len()].eq_ignore_ascii_case(prefix) {
            let token = value[prefix.len()..].trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    if let Some(value) = x_api_key {
        let value = value.trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Resolves an active key or fails 401 with a deliberately generic
/// message; the caller's credential never reaches logs or responses.
pub async fn authenticate(
    repository: &Repository,
    authorization: Option<&str>,
    x_api_key: Option<&str>,
    now_ms: i64,
) -> ServiceResult<ApiKey> {
    let Some(token) = extract_bearer(authorization, x_api_key) else {
        return Err(ServiceError::unauthorized());
    };
    let found = repository
        .find_active_api_key_by_value(&token, now_ms)
        .await
        .map_err(|err| ServiceError::internal(err.to_string()))?;
    found.ok_or_else(ServiceError::unauthorized)
}

pub fn check_provider_scope(key: &ApiKey, route: &ProxyRoute) -> ServiceResult<()> {
    let Some(scopes) = key.provider_scopes.as_deref() else {
        return Ok(());
    };
    if scopes.is_empty() || scopes.contains(&route.internal) {
        return Ok(());
    }
    Err(ServiceError::new(
        ErrorKind::Forbidden,
        format!("key is not scoped to provider {}", route.internal),
    ))
}

/// Model scopes intersect the candidate expansion of the request model.
/// A scoped key without an explicit model field is always denied.
pub fn check_model_scope(key: &ApiKey, model: Option<&ModelResolution>) -> ServiceResult<()> {
    let Some(scopes) = key.model_scopes.as_deref() else {
        return Ok(());
    };
    if scopes.is_empty() {
        return Ok(());
    }
    let Some(resolution) = model else {
        return Err(ServiceError::new(
            ErrorKind::Forbidden,
            "key model scope requires an explicit model field",
        ));
    };
    let allowed = resolution
        .candidates
        .iter()
        .any(|candidate| scopes.iter().any(|scope| scope == candidate));
    if allowed {
        return Ok(());
    }
    Err(ServiceError::new(
        ErrorKind::Forbidden,
        format!("model {} is outside the key's scope", resolution.raw),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use kleis_provider_core::{CanonicalProvider, Endpoint, Provider, resolve_model, route_for};

    fn key(providers: Option<Vec<Provider>>, models: Option<Vec<&str>>) -> ApiKey {
        ApiKey {
            id: "k1".to_string(),
            key: "kleis_x".to_string(),
            models_discovery_token: None,
            label: None,
            provider_scopes: providers,
            model_scopes: models.map(|m| m.into_iter().map(|s| s.to_string()).collect()),
            expires_at: None,
            revoked_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn bearer_is_preferred_over_x_api_key() {
        assert_eq!(
            extract_bearer(Some("Bearer kleis_a"), Some("kleis_b")).as_deref(),
            Some("kleis_a")
        );
        assert_eq!(
            extract_bearer(Some("bearer kleis_a"), None).as_deref(),
            Some("kleis_a")
        );
        assert_eq!(extract_bearer(None, Some("kleis_b")).as_deref(), Some("kleis_b"));
        assert!(extract_bearer(Some("Basic abc"), None).is_none());
    }

    #[test]
    fn generated_values_carry_their_prefixes() {
        assert!(generate_api_key_value().starts_with(API_KEY_PREFIX));
        assert!(generate_discovery_token().starts_with(DISCOVERY_TOKEN_PREFIX));
        assert_ne!(generate_api_key_value(), generate_api_key_value());
    }

    #[test]
    fn provider_scope_denies_unlisted_provider() {
        let openai = route_for(CanonicalProvider::Openai, Endpoint::Responses).unwrap();
        let anthropic = route_for(CanonicalProvider::Anthropic, Endpoint::Messages).unwrap();
        let scoped = key(Some(vec![Provider::Codex]), None);

        assert!(check_provider_scope(&scoped, openai).is_ok());
        assert!(check_provider_scope(&scoped, anthropic).is_err());
        assert!(check_provider_scope(&key(None, None), anthropic).is_ok());
    }

    #[test]
    fn model_scope_accepts_prefix_qualified_candidates() {
        let route = route_for(CanonicalProvider::Openai, Endpoint::Responses).unwrap();
        let scoped = key(None, Some(vec!["openai/gpt-5.1-codex"]));

        let allowed = resolve_model("openai/gpt-5.1-codex", route);
        assert!(check_model_scope(&scoped, Some(&allowed)).is_ok());

        let bare = resolve_model("gpt-5.1-codex", route);
        assert!(check_model_scope(&scoped, Some(&bare)).is_ok());

        let denied = resolve_model("gpt-5.1-codex-mini", route);
        assert!(check_model_scope(&scoped, Some(&denied)).is_err());
    }

    #[test]
    fn scoped_key_without_model_field_is_denied() {
        let scoped = key(None, Some(vec!["openai/gpt-5.1-codex"]));
        let err = check_model_scope(&scoped, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(err.message.contains("explicit model field"));
    }

    #[test]
    fn foreign_prefix_cannot_leak_across_routes() {
        // A key scoped to openai/gpt-5.1-codex must not pass on the
        // anthropic route even when the request names that very model.
        let anthropic = route_for(CanonicalProvider::Anthropic, Endpoint::Messages).unwrap();
        let scoped = key(None, Some(vec!["openai/gpt-5.1-codex"]));
        let resolution = resolve_model("openai/gpt-5.1-codex", anthropic);
        assert!(check_model_scope(&scoped, Some(&resolution)).is_err());
    }
}
