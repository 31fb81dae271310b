use std::sync::OnceLock;

use kleis_provider_core::OAuthError;

static SHARED_CLIENT: OnceLock<wreq::Client> = OnceLock::new();

/// One shared upstream client for the whole process. Adapter and proxy
/// traffic go through the same pool.
pub fn shared_client() -> wreq::Client {
    SHARED_CLIENT
        .get_or_init(|| {
            wreq::Client::builder()
                .build()
                .expect("default http client builds")
        })
        .clone()
}

pub(crate) fn http_err(err: wreq::Error) -> OAuthError {
    OAuthError::Http(err.to_string())
}
