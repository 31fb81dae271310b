use serde_json::Value as JsonValue;

use kleis_common::{ErrorKind, ServiceError, ServiceResult};
use kleis_provider_core::{Headers, PreparedRequest, Provider, ProviderAccount, ProxyRoute};

/// Everything a preparer may look at. The caller has already stripped
/// `authorization`, `x-api-key`, `host` and `content-length` from
/// `headers` and applied model prefix normalization to the body.
pub struct PrepareInput<'a> {
    pub route: &'a ProxyRoute,
    /// Raw query string of the inbound request, without the `?`.
    pub query: Option<&'a str>,
    pub headers: Headers,
    pub body_json: Option<JsonValue>,
    pub body_text: String,
    pub account: &'a ProviderAccount,
}

pub fn prepare_request(input: PrepareInput<'_>) -> ServiceResult<PreparedRequest> {
    match input.route.internal {
        Provider::Codex => crate::providers::codex::prepare(input),
        Provider::Copilot => crate::providers::copilot::prepare(input),
        Provider::Claude => crate::providers::claude::prepare(input),
    }
}

pub(crate) fn unsupported(route: &ProxyRoute) -> ServiceError {
    ServiceError::new(
        ErrorKind::ProviderNotSupported,
        format!(
            "no {} branch for endpoint {}",
            route.internal,
            route.endpoint.as_str()
        ),
    )
}

pub(crate) fn append_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) if !query.is_empty() => format!("{path}?{query}"),
        _ => path.to_string(),
    }
}
