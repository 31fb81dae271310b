use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Service-level failure kinds. HTTP statuses are a mapping of these, not
/// the other way around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthorized,
    Forbidden,
    TooManyRequests,
    NotFound,
    BadRequest,
    AccountMissing,
    TokenRefreshFailed,
    ProviderNotSupported,
    StateMissingOrExpired,
    InternalError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::TooManyRequests => "too_many_requests",
            ErrorKind::NotFound => "not_found",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::AccountMissing => "account_missing",
            ErrorKind::TokenRefreshFailed => "token_refresh_failed",
            ErrorKind::ProviderNotSupported => "provider_not_supported",
            ErrorKind::StateMissingOrExpired => "state_missing_or_expired",
            ErrorKind::InternalError => "internal_error",
        }
    }

    pub fn status(self) -> u16 {
        match self {
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::TooManyRequests => 429,
            ErrorKind::NotFound => 404,
            ErrorKind::BadRequest => 400,
            ErrorKind::AccountMissing => 400,
            ErrorKind::TokenRefreshFailed => 502,
            ErrorKind::ProviderNotSupported => 500,
            ErrorKind::StateMissingOrExpired => 400,
            ErrorKind::InternalError => 500,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{}: {message}", .kind.as_str())]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorKind::Unauthorized, "missing or invalid credentials")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Final, merged process configuration.
///
/// Merge order: CLI > ENV; there is no DB-backed layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KleisConfig {
    pub host: String,
    pub port: u16,
    /// Static bearer for the admin surface.
    pub admin_token: String,
    /// Database DSN used by this process.
    pub dsn: String,
    /// Public origin used when rewriting model-registry `api` fields.
    pub public_origin: String,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or_default()
}

pub fn new_row_id() -> String {
    uuid::Uuid::now_v7().to_string()
}
