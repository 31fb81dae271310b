use serde_json::Value as JsonValue;

use kleis_common::ServiceResult;
use kleis_provider_core::{
    AccountMetadata, CopilotMetadata, Endpoint, PreparedRequest, ResponseTransform, header_remove,
    header_set,
};

use super::*;
use crate::prepare::{PrepareInput, append_query};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RequestProfile {
    vision: bool,
    agent: bool,
}

pub(crate) fn prepare(mut input: PrepareInput<'_>) -> ServiceResult<PreparedRequest> {
    let metadata = match &input.account.metadata {
        AccountMetadata::Copilot(metadata) => metadata.clone(),
        _ => CopilotMetadata::default(),
    };
    let profile = derive_profile(input.route.endpoint, input.body_json.as_ref());
    let overrides = metadata.request_profile.clone().unwrap_or_default();
    let intent_header = overrides.intent_header.as_deref().unwrap_or(HEADER_INTENT);
    let initiator_header = overrides
        .initiator_header
        .as_deref()
        .unwrap_or(HEADER_INITIATOR);
    let vision_header = overrides.vision_header.as_deref().unwrap_or(HEADER_VISION);

    // Upstream authenticates with the long-lived GitHub token; the
    // short-lived Copilot token only gates expiry-driven refresh.
    header_set(
        &mut input.headers,
        "authorization",
        format!("Bearer {}", input.account.refresh_token),
    );
    header_set(&mut input.headers, intent_header, INTENT_VALUE);
    header_set(
        &mut input.headers,
        initiator_header,
        if profile.agent { "agent" } else { "user" },
    );
    if profile.vision {
        header_set(&mut input.headers, vision_header, "true");
    } else {
        header_remove(&mut input.headers, vision_header);
    }

    let base = metadata
        .api_base_url
        .as_deref()
        .unwrap_or(DEFAULT_API_BASE_URL)
        .trim_end_matches('/');
    let path = match input.route.endpoint {
        Endpoint::ChatCompletions => "/chat/completions",
        Endpoint::Responses => "/responses",
        Endpoint::Messages => "/v1/messages",
    };
    let upstream_url = format!("{base}{}", append_query(path, input.query));

    let transform = match input.route.endpoint {
        Endpoint::ChatCompletions => ResponseTransform::OpenAiChatUsage,
        Endpoint::Responses => ResponseTransform::OpenAiResponsesUsage,
        Endpoint::Messages => ResponseTransform::AnthropicUsage {
            rewrite_tool_names: false,
        },
    };

    Ok(PreparedRequest {
        upstream_url,
        headers: input.headers,
        body: input.body_text,
        transform: Some(transform),
    })
}

fn derive_profile(endpoint: Endpoint, body: Option<&JsonValue>) -> RequestProfile {
    match endpoint {
        Endpoint::ChatCompletions => {
            let messages = list(body, "messages");
            RequestProfile {
                vision: messages.iter().any(|message| {
                    parts(message.get("content"))
                        .iter()
                        .any(|part| part_type(part) == Some("image_url"))
                }),
                agent: last_role_is_not_user(&messages),
            }
        }
        Endpoint::Responses => {
            let input = list(body, "input");
            RequestProfile {
                vision: input.iter().any(|item| {
                    parts(item.get("content"))
                        .iter()
                        .any(|part| part_type(part) == Some("input_image"))
                }),
                agent: last_role_is_not_user(&input),
            }
        }
        Endpoint::Messages => {
            let messages = list(body, "messages");
            let vision = messages.iter().any(|message| {
                parts(message.get("content")).iter().any(|part| {
                    if part_type(part) == Some("image") {
                        return true;
                    }
                    part_type(part) == Some("tool_result")
                        && parts(part.get("content"))
                            .iter()
                            .any(|inner| part_type(inner) == Some("image"))
                })
            });
            let agent = match messages.last() {
                Some(last) => {
                    let user = last.get("role").and_then(|role| role.as_str()) == Some("user");
                    let has_plain_part = match last.get("content") {
                        Some(JsonValue::String(_)) => true,
                        Some(JsonValue::Array(items)) => items
                            .iter()
                            .any(|part| part_type(part) != Some("tool_result")),
                        _ => false,
                    };
                    !(user && has_plain_part)
                }
                None => false,
            };
            RequestProfile { vision, agent }
        }
    }
}

fn list<'a>(body: Option<&'a JsonValue>, key: &str) -> Vec<&'a JsonValue> {
    body.and_then(|body| body.get(key))
        .and_then(|value| value.as_array())
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

fn parts<'a>(content: Option<&'a JsonValue>) -> Vec<&'a JsonValue> {
    content
        .and_then(|value| value.as_array())
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

fn part_type(part: &JsonValue) -> Option<&str> {
    part.get("type").and_then(|value| value.as_str())
}

fn last_role_is_not_user(items: &[&JsonValue]) -> bool {
    match items.last() {
        Some(item) => item.get("role").and_then(|role| role.as_str()) != Some("user"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use kleis_provider_core::{
        CanonicalProvider, Provider, ProviderAccount, header_get, route_for,
    };

    fn copilot_account() -> ProviderAccount {
        ProviderAccount {
            id: "acc-1".to_string(),
            provider: Provider::Copilot,
            account_id: None,
            label: None,
            is_primary: true,
            access_token: "copilot-token".to_string(),
            refresh_token: "gho_github".to_string(),
            expires_at: i64::MAX,
            refresh_lock_token: None,
            refresh_lock_expires_at: None,
            metadata: AccountMetadata::Copilot(CopilotMetadata {
                api_base_url: Some("https://api.enterprise.githubcopilot.com".to_string()),
                enterprise_domain: None,
                request_profile: None,
            }),
            last_refresh_at: None,
            last_refresh_status: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn prepare_chat(body: serde_json::Value) -> PreparedRequest {
        let account = copilot_account();
        let route = route_for(CanonicalProvider::GithubCopilot, Endpoint::ChatCompletions).unwrap();
        prepare(PrepareInput {
            route,
            query: None,
            headers: Vec::new(),
            body_text: body.to_string(),
            body_json: Some(body),
            account: &account,
        })
        .expect("prepare succeeds")
    }

    #[test]
    fn image_content_from_user_sets_vision_and_user_initiator() {
        let prepared = prepare_chat(serde_json::json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "image_url", "image_url": {"url": "data:..."}}
                ]}
            ]
        }));
        assert_eq!(header_get(&prepared.headers, "x-initiator"), Some("user"));
        assert_eq!(
            header_get(&prepared.headers, "copilot-vision-request"),
            Some("true")
        );
        assert_eq!(
            header_get(&prepared.headers, "authorization"),
            Some("Bearer gho_github")
        );
        assert_eq!(
            header_get(&prepared.headers, "openai-intent"),
            Some("conversation-edits")
        );
        assert_eq!(
            prepared.upstream_url,
            "https://api.enterprise.githubcopilot.com/chat/completions"
        );
    }

    #[test]
    fn assistant_last_message_without_images_is_agent_initiated() {
        let prepared = prepare_chat(serde_json::json!({
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }));
        assert_eq!(header_get(&prepared.headers, "x-initiator"), Some("agent"));
        assert!(header_get(&prepared.headers, "copilot-vision-request").is_none());
        assert_eq!(
            prepared.transform,
            Some(ResponseTransform::OpenAiChatUsage)
        );
    }

    #[test]
    fn responses_endpoint_derives_from_input_items() {
        let body = serde_json::json!({
            "input": [
                {"role": "user", "content": [{"type": "input_image", "image_url": "..."}]}
            ]
        });
        let profile = derive_profile(Endpoint::Responses, Some(&body));
        assert!(profile.vision);
        assert!(!profile.agent);
    }

    #[test]
    fn messages_endpoint_counts_nested_tool_result_images() {
        let body = serde_json::json!({
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "content": [{"type": "image"}]}
                ]}
            ]
        });
        let profile = derive_profile(Endpoint::Messages, Some(&body));
        assert!(profile.vision);
        // Only tool_result parts in the last user message: agent turn.
        assert!(profile.agent);
    }

    #[test]
    fn messages_endpoint_with_plain_user_text_is_user_initiated() {
        let body = serde_json::json!({
            "messages": [{"role": "user", "content": "describe"}]
        });
        let profile = derive_profile(Endpoint::Messages, Some(&body));
        assert!(!profile.vision);
        assert!(!profile.agent);
    }

    #[test]
    fn empty_body_defaults_to_user_without_vision() {
        let profile = derive_profile(Endpoint::ChatCompletions, None);
        assert!(!profile.vision);
        assert!(!profile.agent);
    }
}
