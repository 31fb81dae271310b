use base64::Engine;
use rand::RngCore;
use sha2::Digest;

use kleis_provider_core::{OAuthError, OAuthResult};
use kleis_storage::StorageError;

pub(crate) struct PkceCodes {
    pub code_verifier: String,
    pub code_challenge: String,
}

pub(crate) fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub(crate) fn generate_pkce() -> PkceCodes {
    let mut bytes = [0u8; 64];
    rand::rng().fill_bytes(&mut bytes);
    let code_verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let digest = sha2::Sha256::digest(code_verifier.as_bytes());
    let code_challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
    PkceCodes {
        code_verifier,
        code_challenge,
    }
}

/// Accepts the raw authorization code, a full callback URL, or the
/// `code#state` form some consoles hand the user, and returns
/// `(code, embedded_state)`.
pub(crate) fn resolve_code_and_state(raw: &str) -> OAuthResult<(String, Option<String>)> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(OAuthError::MalformedResponse("empty code".to_string()));
    }

    if raw.contains("://") || raw.starts_with("code=") || raw.contains("?code=") {
        let query = match raw.find('?') {
            Some(idx) => &raw[idx + 1..],
            None => raw,
        };
        let query = query.split('#').next().unwrap_or(query);
        let code = parse_query_value(query, "code")
            .ok_or_else(|| OAuthError::MalformedResponse("callback url without code".to_string()))?;
        let state = parse_query_value(query, "state");
        return Ok((code, state));
    }

    if let Some((code, state)) = raw.split_once('#') {
        let state = state.trim();
        let state = if state.is_empty() {
            None
        } else {
            Some(state.to_string())
        };
        return Ok((code.trim().to_string(), state));
    }

    Ok((raw.to_string(), None))
}

pub(crate) fn parse_query_value(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut iter = pair.splitn(2, '=');
        let k = iter.next().unwrap_or_default();
        if k != key {
            continue;
        }
        let v = iter.next().unwrap_or_default();
        let decoded = urlencoding::decode(v).ok()?;
        let value = decoded.trim();
        if value.is_empty() {
            return None;
        }
        return Some(value.to_string());
    }
    None
}

pub(crate) fn store_err(err: StorageError) -> OAuthError {
    OAuthError::Storage(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_code_passes_through() {
        let (code, state) = resolve_code_and_state("abc-123").unwrap();
        assert_eq!(code, "abc-123");
        assert!(state.is_none());
    }

    #[test]
    fn callback_url_yields_code_and_state() {
        let (code, state) =
            resolve_code_and_state("http://localhost:1455/auth/callback?code=abc&state=st_1")
                .unwrap();
        assert_eq!(code, "abc");
        assert_eq!(state.as_deref(), Some("st_1"));
    }

    #[test]
    fn hash_form_splits_code_and_state() {
        let (code, state) = resolve_code_and_state("abc#st_2").unwrap();
        assert_eq!(code, "abc");
        assert_eq!(state.as_deref(), Some("st_2"));
    }

    #[test]
    fn bare_query_string_is_supported() {
        let (code, state) = resolve_code_and_state("code=opaque%2Bvalue&state=s1").unwrap();
        assert_eq!(code, "opaque+value");
        assert_eq!(state.as_deref(), Some("s1"));
    }

    #[test]
    fn empty_input_is_rejected() {
        assert!(resolve_code_and_state("  ").is_err());
    }

    #[test]
    fn pkce_challenge_is_base64url_sha256_of_verifier() {
        let pkce = generate_pkce();
        let digest = sha2::Sha256::digest(pkce.code_verifier.as_bytes());
        let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        assert_eq!(pkce.code_challenge, expected);
    }
}
