use super::*;

use kleis_common::{ServiceError, ServiceResult};
use kleis_provider_core::{
    AccountMetadata, CodexMetadata, Endpoint, PreparedRequest, ResponseTransform, header_get,
    header_set,
};

use crate::prepare::{PrepareInput, unsupported};
use super::instructions::DEFAULT_INSTRUCTIONS;

pub(crate) fn prepare(mut input: PrepareInput<'_>) -> ServiceResult<PreparedRequest> {
    if input.route.endpoint != Endpoint::Responses {
        return Err(unsupported(input.route));
    }
    let metadata = match &input.account.metadata {
        AccountMetadata::Codex(metadata) => metadata.clone(),
        _ => CodexMetadata::default(),
    };

    header_set(
        &mut input.headers,
        "authorization",
        format!("Bearer {}", input.account.access_token),
    );
    if header_get(&input.headers, "originator").is_none() {
        header_set(
            &mut input.headers,
            "originator",
            metadata
                .originator
                .clone()
                .unwrap_or_else(|| DEFAULT_ORIGINATOR.to_string()),
        );
    }
    if let Some(account_id) = metadata
        .chatgpt_account_id
        .clone()
        .or_else(|| input.account.account_id.clone())
    {
        header_set(&mut input.headers, "ChatGPT-Account-Id", account_id);
    }

    let body = match input.body_json {
        Some(mut json) => {
            if let Some(obj) = json.as_object_mut() {
                obj.remove("max_output_tokens");
                obj.remove("max_completion_tokens");
                if needs_default_instructions(obj.get("instructions")) {
                    obj.insert(
                        "instructions".to_string(),
                        JsonValue::String(DEFAULT_INSTRUCTIONS.to_string()),
                    );
                }
            }
            serde_json::to_string(&json).map_err(|err| ServiceError::internal(err.to_string()))?
        }
        None => input.body_text,
    };

    Ok(PreparedRequest {
        upstream_url: RESPONSES_URL.to_string(),
        headers: input.headers,
        body,
        transform: Some(ResponseTransform::OpenAiResponsesUsage),
    })
}

fn needs_default_instructions(instructions: Option<&JsonValue>) -> bool {
    match instructions {
        None | Some(JsonValue::Null) => true,
        Some(JsonValue::String(text)) => text.trim().is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kleis_provider_core::{
        CanonicalProvider, Provider, ProviderAccount, route_for,
    };

    fn codex_account() -> ProviderAccount {
        ProviderAccount {
            id: "acc-1".to_string(),
            provider: Provider::Codex,
            account_id: Some("acct-1".to_string()),
            label: None,
            is_primary: true,
            access_token: "A".to_string(),
            refresh_token: "R".to_string(),
            expires_at: i64::MAX,
            refresh_lock_token: None,
            refresh_lock_expires_at: None,
            metadata: AccountMetadata::Codex(CodexMetadata::default()),
            last_refresh_at: None,
            last_refresh_status: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn prepare_body(body: serde_json::Value) -> PreparedRequest {
        let account = codex_account();
        let route = route_for(CanonicalProvider::Openai, Endpoint::Responses).unwrap();
        let input = PrepareInput {
            route,
            query: None,
            headers: Vec::new(),
            body_text: body.to_string(),
            body_json: Some(body),
            account: &account,
        };
        prepare(input).expect("prepare succeeds")
    }

    #[test]
    fn sets_auth_originator_and_account_headers() {
        let prepared = prepare_body(serde_json::json!({"model": "gpt-5.1-codex", "input": []}));
        assert_eq!(prepared.upstream_url, RESPONSES_URL);
        assert_eq!(header_get(&prepared.headers, "authorization"), Some("Bearer A"));
        assert_eq!(header_get(&prepared.headers, "originator"), Some("opencode"));
        assert_eq!(header_get(&prepared.headers, "chatgpt-account-id"), Some("acct-1"));
        assert_eq!(prepared.transform, Some(ResponseTransform::OpenAiResponsesUsage));
    }

    #[test]
    fn strips_token_limits_and_fills_default_instructions() {
        let prepared = prepare_body(serde_json::json!({
            "model": "gpt-5.1-codex",
            "max_output_tokens": 128,
            "max_completion_tokens": 64,
        }));
        let body: JsonValue = serde_json::from_str(&prepared.body).unwrap();
        assert!(body.get("max_output_tokens").is_none());
        assert!(body.get("max_completion_tokens").is_none());
        let instructions = body.get("instructions").and_then(|v| v.as_str()).unwrap();
        assert!(!instructions.trim().is_empty());
    }

    #[test]
    fn keeps_caller_instructions_when_present() {
        let prepared = prepare_body(serde_json::json!({
            "model": "gpt-5.1-codex",
            "instructions": "be terse",
        }));
        let body: JsonValue = serde_json::from_str(&prepared.body).unwrap();
        assert_eq!(body.get("instructions").and_then(|v| v.as_str()), Some("be terse"));
    }

    #[test]
    fn existing_originator_header_is_preserved() {
        let account = codex_account();
        let route = route_for(CanonicalProvider::Openai, Endpoint::Responses).unwrap();
        let input = PrepareInput {
            route,
            query: None,
            headers: vec![("originator".to_string(), "custom".to_string())],
            body_json: None,
            body_text: String::new(),
            account: &account,
        };
        let prepared = prepare(input).unwrap();
        assert_eq!(header_get(&prepared.headers, "originator"), Some("custom"));
    }
}
