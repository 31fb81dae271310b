use serde_json::Value as JsonValue;

use kleis_common::{ServiceError, ServiceResult};
use kleis_provider_core::{
    AccountMetadata, ClaudeMetadata, Endpoint, PreparedRequest, ResponseTransform, header_get,
    header_set,
};

use super::*;
use crate::prepare::{PrepareInput, unsupported};

pub(crate) fn prepare(mut input: PrepareInput<'_>) -> ServiceResult<PreparedRequest> {
    if input.route.endpoint != Endpoint::Messages {
        return Err(unsupported(input.route));
    }
    let metadata = match &input.account.metadata {
        AccountMetadata::Claude(metadata) => metadata.clone(),
        _ => ClaudeMetadata::default(),
    };
    let system_identity = metadata
        .system_identity
        .clone()
        .unwrap_or_else(|| SYSTEM_IDENTITY.to_string());
    let tool_prefix = metadata
        .tool_prefix
        .clone()
        .unwrap_or_else(|| TOOL_PREFIX.to_string());

    let betas = merge_betas(header_get(&input.headers, HEADER_BETA), &metadata.betas);
    header_set(&mut input.headers, HEADER_BETA, betas);
    header_set(
        &mut input.headers,
        "authorization",
        format!("Bearer {}", input.account.access_token),
    );
    header_set(
        &mut input.headers,
        "user-agent",
        metadata
            .user_agent
            .clone()
            .unwrap_or_else(|| CLAUDE_CODE_UA.to_string()),
    );
    header_set(&mut input.headers, "x-app", "cli");

    let body = match input.body_json {
        Some(mut json) => {
            rewrite_body(&mut json, &system_identity, &tool_prefix);
            serde_json::to_string(&json).map_err(|err| ServiceError::internal(err.to_string()))?
        }
        None => input.body_text,
    };

    let query = match input.query {
        Some(query) if query.split('&').any(|pair| pair.starts_with("beta=")) => query.to_string(),
        Some(query) if !query.is_empty() => format!("{query}&beta=true"),
        _ => "beta=true".to_string(),
    };
    let upstream_url = format!(
        "{}/v1/messages?{query}",
        DEFAULT_API_BASE_URL.trim_end_matches('/')
    );

    Ok(PreparedRequest {
        upstream_url,
        headers: input.headers,
        body,
        transform: Some(ResponseTransform::AnthropicUsage {
            rewrite_tool_names: true,
        }),
    })
}

fn merge_betas(existing: Option<&str>, required: &[String]) -> String {
    let mut merged: Vec<String> = Vec::new();
    if let Some(existing) = existing {
        for beta in existing.split(',') {
            let beta = beta.trim();
            if !beta.is_empty() && !merged.iter().any(|seen| seen == beta) {
                merged.push(beta.to_string());
            }
        }
    }
    let required_list: Vec<&str> = if required.is_empty() {
        REQUIRED_BETAS.to_vec()
    } else {
        required.iter().map(|beta| beta.as_str()).collect()
    };
    for beta in required_list {
        if !merged.iter().any(|seen| seen == beta) {
            merged.push(beta.to_string());
        }
    }
    merged.join(",")
}

fn rewrite_body(body: &mut JsonValue, system_identity: &str, tool_prefix: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };

    let identity_block = serde_json::json!({ "type": "text", "text": system_identity });
    let system = match obj.remove("system") {
        Some(JsonValue::String(text)) => JsonValue::Array(vec![
            identity_block,
            serde_json::json!({ "type": "text", "text": sanitize_identity(&text) }),
        ]),
        Some(JsonValue::Array(mut blocks)) => {
            for block in &mut blocks {
                if let Some(text) = block.get_mut("text")
                    && let Some(raw) = text.as_str()
                {
                    *text = JsonValue::String(sanitize_identity(raw));
                }
            }
            blocks.insert(0, identity_block);
            JsonValue::Array(blocks)
        }
        _ => JsonValue::Array(vec![identity_block]),
    };
    obj.insert("system".to_string(), system);

    if let Some(tools) = obj.get_mut("tools").and_then(|tools| tools.as_array_mut()) {
        for tool in tools {
            prefix_name_field(tool, tool_prefix);
        }
    }

    if let Some(messages) = obj
        .get_mut("messages")
        .and_then(|messages| messages.as_array_mut())
    {
        for message in messages {
            let Some(parts) = message
                .get_mut("content")
                .and_then(|content| content.as_array_mut())
            else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|kind| kind.as_str()) == Some("tool_use") {
                    prefix_name_field(part, tool_prefix);
                }
            }
        }
    }
}

fn prefix_name_field(value: &mut JsonValue, tool_prefix: &str) {
    let Some(name) = value.get("name").and_then(|name| name.as_str()) else {
        return;
    };
    if name.starts_with(tool_prefix) {
        return;
    }
    let prefixed = format!("{tool_prefix}{name}");
    if let Some(obj) = value.as_object_mut() {
        obj.insert("name".to_string(), JsonValue::String(prefixed));
    }
}

/// `OpenCode` reads as this proxy's caller; upstream must see itself.
/// Exact-case matches become "Claude Code", any other casing becomes
/// "Claude", and slash-prefixed occurrences (tool paths) are left alone.
fn sanitize_identity(text: &str) -> String {
    const NEEDLE: &[u8] = b"opencode";
    let bytes = text.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if i + NEEDLE.len() <= bytes.len()
            && bytes[i..i + NEEDLE.len()].eq_ignore_ascii_case(NEEDLE)
        {
            let matched = &bytes[i..i + NEEDLE.len()];
            let slash_prefixed = i > 0 && bytes[i - 1] == b'/';
            if matched == b"OpenCode" {
                out.extend_from_slice(b"Claude Code");
                i += NEEDLE.len();
                continue;
            }
            if !slash_prefixed {
                out.extend_from_slice(b"Claude");
                i += NEEDLE.len();
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| text.to_string())
}
