use std::time::Duration;

use kleis_common::{ErrorKind, ServiceError, ServiceResult};
use kleis_provider_core::{
    AccountMetadata, AdapterRegistry, OAuthError, OAuthStart, OAuthStartOptions, Provider,
    ProviderAccount,
};
use kleis_storage::{AccountTokenUpdate, NewProviderAccount, Repository, StorageError};

const REFRESH_LOCK_TTL_MS: i64 = 20_000;
const REFRESH_WAIT_DEADLINE_MS: i64 = 3_000;
const REFRESH_POLL_INTERVAL_MS: u64 = 150;

#[derive(Debug, Clone)]
pub struct ImportAccountInput {
    pub provider: Provider,
    pub account_id: Option<String>,
    pub label: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub metadata: Option<AccountMetadata>,
}

/// Account lifecycle: OAuth flows, import, and the single-flight token
/// refresh behind the primary-account hot path.
pub struct ProviderService {
    repository: Repository,
    registry: AdapterRegistry,
}

impl ProviderService {
    pub fn new(repository: Repository, registry: AdapterRegistry) -> Self {
        Self {
            repository,
            registry,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub async fn start_provider_oauth(
        &self,
        provider: Provider,
        redirect_uri: Option<&str>,
        options: &OAuthStartOptions,
        now_ms: i64,
    ) -> ServiceResult<OAuthStart> {
        let adapter = self.adapter(provider)?;
        adapter
            .start_oauth(redirect_uri, options, now_ms)
            .await
            .map_err(flow_error)
    }

    pub async fn complete_provider_oauth(
        &self,
        provider: Provider,
        state: &str,
        code: Option<&str>,
        now_ms: i64,
    ) -> ServiceResult<ProviderAccount> {
        let adapter = self.adapter(provider)?;
        let tokens = adapter
            .complete_oauth(state, code, now_ms)
            .await
            .map_err(flow_error)?;

        let input = NewProviderAccount {
            provider,
            account_id: tokens.account_id,
            label: tokens.label,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            metadata: tokens.metadata,
        };
        self.repository
            .upsert_provider_account(&input, now_ms)
            .await
            .map_err(storage_error)
    }

    pub async fn import_provider_account(
        &self,
        input: ImportAccountInput,
        now_ms: i64,
    ) -> ServiceResult<ProviderAccount> {
        if input.access_token.trim().is_empty() || input.refresh_token.trim().is_empty() {
            return Err(ServiceError::bad_request(
                "access_token and refresh_token are required",
            ));
        }
        let metadata = input
            .metadata
            .unwrap_or_else(|| AccountMetadata::empty_for(input.provider));
        if metadata.provider() != input.provider {
            return Err(ServiceError::bad_request(
                "metadata does not match the account provider",
            ));
        }

        let new_account = NewProviderAccount {
            provider: input.provider,
            account_id: input.account_id,
            label: input.label,
            access_token: input.access_token,
            refresh_token: input.refresh_token,
            expires_at: input.expires_at,
            metadata,
        };
        self.repository
            .upsert_provider_account(&new_account, now_ms)
            .await
            .map_err(storage_error)
    }

    /// Hot path: the primary account is returned as-is while its token is
    /// valid; expiry funnels every caller through the refresh coordinator.
    pub async fn get_primary_provider_account(
        &self,
        provider: Provider,
        now_ms: i64,
    ) -> ServiceResult<Option<ProviderAccount>> {
        let Some(account) = self
            .repository
            .find_primary_provider_account(provider)
            .await
            .map_err(storage_error)?
        else {
            return Ok(None);
        };
        if account.expires_at > now_ms {
            return Ok(Some(account));
        }
        self.refresh_coordinated(account, now_ms, false).await.map(Some)
    }

    /// Admin-forced refresh, still single-flight per account.
    pub async fn refresh_provider_account(
        &self,
        id: &str,
        now_ms: i64,
    ) -> ServiceResult<ProviderAccount> {
        let Some(account) = self
            .repository
            .get_provider_account(id)
            .await
            .map_err(storage_error)?
        else {
            return Err(ServiceError::not_found("provider account not found"));
        };
        self.refresh_coordinated(account, now_ms, true).await
    }

    /// At most one in-flight refresh per account across processes. The
    /// advisory lease caps a stuck holder at 20 s; waiters poll rather
    /// than queue and give up after 3 s.
    async fn refresh_coordinated(
        &self,
        account: ProviderAccount,
        now_ms: i64,
        force: bool,
    ) -> ServiceResult<ProviderAccount> {
        let lock_token = uuid::Uuid::new_v4().simple().to_string();

        let acquired = self
            .repository
            .try_acquire_provider_account_refresh_lock(
                &account.id,
                &lock_token,
                now_ms,
                now_ms + REFRESH_LOCK_TTL_MS,
            )
            .await
            .map_err(storage_error)?;
        if acquired {
            return self
                .run_refresh(&account.id, account.provider, &lock_token, now_ms, force)
                .await;
        }

        // Someone else is refreshing; wait for them to finish.
        let mut elapsed: i64 = 0;
        while elapsed < REFRESH_WAIT_DEADLINE_MS {
            tokio::time::sleep(Duration::from_millis(REFRESH_POLL_INTERVAL_MS)).await;
            elapsed += REFRESH_POLL_INTERVAL_MS as i64;
            let now = now_ms + elapsed;

            let Some(current) = self
                .repository
                .get_provider_account(&account.id)
                .await
                .map_err(storage_error)?
            else {
                return Err(ServiceError::not_found(
                    "provider account removed during refresh",
                ));
            };
            if current.expires_at > now && !force {
                return Ok(current);
            }
            let lock_active = current.refresh_lock_token.is_some()
                && current.refresh_lock_expires_at.is_some_and(|at| at > now);
            if !lock_active {
                break;
            }
        }

        let now = now_ms + elapsed;
        let acquired = self
            .repository
            .try_acquire_provider_account_refresh_lock(
                &account.id,
                &lock_token,
                now,
                now + REFRESH_LOCK_TTL_MS,
            )
            .await
            .map_err(storage_error)?;
        if acquired {
            return self
                .run_refresh(&account.id, account.provider, &lock_token, now, force)
                .await;
        }
        Err(ServiceError::new(
            ErrorKind::TokenRefreshFailed,
            "token refresh already in progress",
        ))
    }

    /// The refresh itself runs on its own task: if the caller is
    /// cancelled mid-request, the lease is still released by token
    /// instead of idling out its 20 s TTL.
    async fn run_refresh(
        &self,
        id: &str,
        provider: Provider,
        lock_token: &str,
        now_ms: i64,
        force: bool,
    ) -> ServiceResult<ProviderAccount> {
        let adapter = match self.adapter(provider) {
            Ok(adapter) => adapter,
            Err(err) => {
                let _ = self
                    .repository
                    .release_provider_account_refresh_lock(id, lock_token)
                    .await;
                return Err(err);
            }
        };
        let task = tokio::spawn(refresh_holding_lock(
            self.repository.clone(),
            adapter,
            provider,
            id.to_string(),
            lock_token.to_string(),
            now_ms,
            force,
        ));
        match task.await {
            Ok(result) => result,
            Err(err) => Err(ServiceError::internal(format!("refresh task failed: {err}"))),
        }
    }

    fn adapter(
        &self,
        provider: Provider,
    ) -> ServiceResult<std::sync::Arc<dyn kleis_provider_core::OAuthAdapter>> {
        self.registry.get(provider).ok_or_else(|| {
            ServiceError::new(
                ErrorKind::ProviderNotSupported,
                format!("no adapter registered for {provider}"),
            )
        })
    }
}

async fn refresh_holding_lock(
    repository: Repository,
    adapter: std::sync::Arc<dyn kleis_provider_core::OAuthAdapter>,
    provider: Provider,
    id: String,
    lock_token: String,
    now_ms: i64,
    force: bool,
) -> ServiceResult<ProviderAccount> {
    let id = id.as_str();
    let lock_token = lock_token.as_str();

    let Some(current) = repository
        .get_provider_account(id)
        .await
        .map_err(storage_error)?
    else {
        let _ = repository
            .release_provider_account_refresh_lock(id, lock_token)
            .await;
        return Err(ServiceError::not_found("provider account not found"));
    };
    // Another holder may have refreshed between expiry check and lock
    // acquisition.
    if !force && current.expires_at > now_ms {
        let _ = repository
            .release_provider_account_refresh_lock(id, lock_token)
            .await;
        return Ok(current);
    }

    match adapter.refresh_account(&current, now_ms).await {
        Ok(tokens) => {
            if tokens.access_token.trim().is_empty()
                || tokens.refresh_token.trim().is_empty()
                || tokens.expires_at <= now_ms
            {
                let _ = repository
                    .mark_provider_account_refresh_failed(id, Some(lock_token), now_ms)
                    .await;
                let _ = repository
                    .release_provider_account_refresh_lock(id, lock_token)
                    .await;
                return Err(ServiceError::new(
                    ErrorKind::TokenRefreshFailed,
                    "adapter returned unusable tokens",
                ));
            }

            let update = AccountTokenUpdate {
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
                expires_at: tokens.expires_at,
                account_id: tokens.account_id,
                metadata: Some(tokens.metadata),
                label: tokens.label,
            };
            let persisted = repository
                .update_provider_account_tokens(id, &update, Some(lock_token), now_ms)
                .await
                .map_err(storage_error)?;
            let _ = repository
                .release_provider_account_refresh_lock(id, lock_token)
                .await;

            match persisted {
                Some(account) => Ok(account),
                // The lease expired mid-refresh and a successor wrote a
                // fresher token; ours must not clobber it.
                None => Err(ServiceError::new(
                    ErrorKind::TokenRefreshFailed,
                    "refresh lease lost before persisting tokens",
                )),
            }
        }
        Err(err) => {
            let _ = repository
                .mark_provider_account_refresh_failed(id, Some(lock_token), now_ms)
                .await;
            let _ = repository
                .release_provider_account_refresh_lock(id, lock_token)
                .await;
            tracing::warn!(provider = %provider, error = %err, "token refresh failed");
            Err(ServiceError::new(ErrorKind::TokenRefreshFailed, err.to_string()))
        }
    }
}

fn storage_error(err: StorageError) -> ServiceError {
    ServiceError::internal(err.to_string())
}

/// OAuth start/complete failures map onto admin-facing kinds; refresh
/// failures always surface as `token_refresh_failed`.
fn flow_error(err: OAuthError) -> ServiceError {
    match err {
        OAuthError::StateMissingOrExpired => {
            ServiceError::new(ErrorKind::StateMissingOrExpired, err.to_string())
        }
        OAuthError::PkceMissing
        | OAuthError::StateMismatch
        | OAuthError::DeviceFlowTimeout
        | OAuthError::MalformedResponse(_)
        | OAuthError::TokenExchangeFailed { .. } => ServiceError::bad_request(err.to_string()),
        OAuthError::Storage(_) | OAuthError::Http(_) => ServiceError::internal(err.to_string()),
    }
}
