#![allow(clippy::needless_update)]

use sea_orm::ActiveValue::Set;
use sea_orm::sea_query::{Condition, Expr, OnConflict};
use sea_orm::ExprTrait;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Schema, Select, SqlErr, TransactionTrait,
};

use kleis_common::new_row_id;
use kleis_protocol::TokenUsage;
use kleis_provider_core::{
    AccountMetadata, OAuthStateRecord, Provider, ProviderAccount, RefreshStatus,
};

use crate::entities;
use crate::db::connect_shared;
use crate::keys::{ApiKey, ApiKeyPatch, DeleteKeyOutcome, NewApiKey};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone)]
pub struct NewProviderAccount {
    pub provider: Provider,
    pub account_id: Option<String>,
    pub label: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub metadata: AccountMetadata,
}

/// Token fields written after a successful refresh or import. Optional
/// fields leave the stored value untouched.
#[derive(Debug, Clone)]
pub struct AccountTokenUpdate {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub account_id: Option<String>,
    pub metadata: Option<AccountMetadata>,
    pub label: Option<String>,
}

/// Usage bucket identity: one row per minute per
/// (key, account, provider, endpoint, model).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKey {
    pub bucket_start: i64,
    pub api_key_id: String,
    pub provider_account_id: String,
    pub provider: Provider,
    pub endpoint: String,
    pub model: String,
}

#[derive(Debug, Clone, Default)]
pub struct UsageDelta {
    pub request_count: i64,
    pub success_count: i64,
    pub client_error_count: i64,
    pub server_error_count: i64,
    pub auth_error_count: i64,
    pub rate_limit_count: i64,
    pub total_latency_ms: i64,
    pub max_latency_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_write_tokens: i64,
    pub last_request_at: i64,
}

#[derive(Debug, Clone, Default, FromQueryResult)]
pub struct UsageTotals {
    pub request_count: Option<i64>,
    pub success_count: Option<i64>,
    pub client_error_count: Option<i64>,
    pub server_error_count: Option<i64>,
    pub auth_error_count: Option<i64>,
    pub rate_limit_count: Option<i64>,
    pub total_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub last_request_at: Option<i64>,
}

#[derive(Debug, Clone, Default, FromQueryResult)]
pub struct ProviderUsageRow {
    pub provider: String,
    pub request_count: Option<i64>,
    pub success_count: Option<i64>,
    pub client_error_count: Option<i64>,
    pub server_error_count: Option<i64>,
    pub auth_error_count: Option<i64>,
    pub rate_limit_count: Option<i64>,
    pub total_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub last_request_at: Option<i64>,
}

#[derive(Debug, Clone, Default, FromQueryResult)]
pub struct ModelUsageRow {
    pub provider: String,
    pub model: String,
    pub request_count: Option<i64>,
    pub success_count: Option<i64>,
    pub client_error_count: Option<i64>,
    pub server_error_count: Option<i64>,
    pub auth_error_count: Option<i64>,
    pub rate_limit_count: Option<i64>,
    pub total_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub last_request_at: Option<i64>,
}

#[derive(Debug, Clone, Default, FromQueryResult)]
pub struct KeyUsageRow {
    pub api_key_id: String,
    pub request_count: Option<i64>,
    pub success_count: Option<i64>,
    pub client_error_count: Option<i64>,
    pub server_error_count: Option<i64>,
    pub auth_error_count: Option<i64>,
    pub rate_limit_count: Option<i64>,
    pub total_latency_ms: Option<i64>,
    pub max_latency_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_write_tokens: Option<i64>,
    pub last_request_at: Option<i64>,
}

#[derive(Clone)]
pub struct Repository {
    db: DatabaseConnection,
}

impl Repository {
    pub async fn connect(database_url: &str) -> Result<Self, sea_orm::DbErr> {
        let db = connect_shared(database_url).await?;
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync, run once at bootstrap.
    pub async fn sync(&self) -> Result<(), sea_orm::DbErr> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::ProviderAccounts)
            .register(entities::ApiKeys)
            .register(entities::OAuthStates)
            .register(entities::UsageBuckets)
            .sync(&self.db)
            .await
    }

    pub async fn health(&self) -> Result<(), sea_orm::DbErr> {
        entities::ApiKeys::find().limit(1).all(&self.db).await?;
        Ok(())
    }

    // ---- OAuth states ----

    pub async fn insert_oauth_state(&self, record: &OAuthStateRecord) -> StorageResult<()> {
        let active = entities::oauth_states::ActiveModel {
            state: Set(record.state.clone()),
            provider: Set(record.provider.as_str().to_string()),
            pkce_verifier: Set(record.pkce_verifier.clone()),
            metadata_json: Set(record.metadata_json.clone()),
            expires_at: Set(record.expires_at),
            ..Default::default()
        };
        entities::OAuthStates::insert(active).exec(&self.db).await?;
        Ok(())
    }

    pub async fn find_oauth_state(
        &self,
        state: &str,
        provider: Provider,
        now_ms: i64,
    ) -> StorageResult<Option<OAuthStateRecord>> {
        use entities::oauth_states::Column;

        let row = entities::OAuthStates::find()
            .filter(Column::State.eq(state))
            .filter(Column::Provider.eq(provider.as_str()))
            .filter(Column::ExpiresAt.gt(now_ms))
            .one(&self.db)
            .await?;
        Ok(row.map(oauth_state_from_model))
    }

    /// Returns-and-deletes atomically. A zero-row delete means another
    /// caller consumed the state first.
    pub async fn consume_oauth_state(
        &self,
        state: &str,
        provider: Provider,
        now_ms: i64,
    ) -> StorageResult<Option<OAuthStateRecord>> {
        use entities::oauth_states::Column;

        let Some(found) = self.find_oauth_state(state, provider, now_ms).await? else {
            return Ok(None);
        };
        let result = entities::OAuthStates::delete_many()
            .filter(Column::State.eq(state))
            .filter(Column::Provider.eq(provider.as_str()))
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        Ok(Some(found))
    }

    pub async fn delete_expired_oauth_states(&self, now_ms: i64) -> StorageResult<u64> {
        use entities::oauth_states::Column;

        let result = entities::OAuthStates::delete_many()
            .filter(Column::ExpiresAt.lte(now_ms))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    // ---- Provider accounts ----

    pub async fn list_provider_accounts(&self) -> StorageResult<Vec<ProviderAccount>> {
        use entities::provider_accounts::Column;

        let rows = entities::ProviderAccounts::find()
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        rows.into_iter().map(account_from_model).collect()
    }

    pub async fn get_provider_account(&self, id: &str) -> StorageResult<Option<ProviderAccount>> {
        let row = entities::ProviderAccounts::find_by_id(id).one(&self.db).await?;
        row.map(account_from_model).transpose()
    }

    pub async fn find_primary_provider_account(
        &self,
        provider: Provider,
    ) -> StorageResult<Option<ProviderAccount>> {
        use entities::provider_accounts::Column;

        let row = entities::ProviderAccounts::find()
            .filter(Column::Provider.eq(provider.as_str()))
            .filter(Column::IsPrimary.eq(true))
            .one(&self.db)
            .await?;
        row.map(account_from_model).transpose()
    }

    /// Upsert by `(provider, account_id)` when the upstream id is known,
    /// falling back to insert. The first account of a provider becomes
    /// primary. Insert races on the unique key retry as update.
    pub async fn upsert_provider_account(
        &self,
        input: &NewProviderAccount,
        now_ms: i64,
    ) -> StorageResult<ProviderAccount> {
        if let Some(account_id) = input.account_id.as_deref()
            && let Some(existing) = self.find_by_upstream_id(input.provider, account_id).await?
        {
            return self.apply_upsert_update(&existing.id, input, now_ms).await;
        }

        match self.insert_provider_account(input, now_ms).await {
            Ok(account) => Ok(account),
            Err(StorageError::Db(err)) if is_unique_violation(&err) => {
                let Some(account_id) = input.account_id.as_deref() else {
                    return Err(StorageError::Db(err));
                };
                let Some(existing) = self.find_by_upstream_id(input.provider, account_id).await?
                else {
                    return Err(StorageError::Db(err));
                };
                self.apply_upsert_update(&existing.id, input, now_ms).await
            }
            Err(err) => Err(err),
        }
    }

    async fn find_by_upstream_id(
        &self,
        provider: Provider,
        account_id: &str,
    ) -> StorageResult<Option<ProviderAccount>> {
        use entities::provider_accounts::Column;

        let row = entities::ProviderAccounts::find()
            .filter(Column::Provider.eq(provider.as_str()))
            .filter(Column::AccountId.eq(account_id))
            .one(&self.db)
            .await?;
        row.map(account_from_model).transpose()
    }

    async fn insert_provider_account(
        &self,
        input: &NewProviderAccount,
        now_ms: i64,
    ) -> StorageResult<ProviderAccount> {
        use entities::provider_accounts::Column;

        let existing = entities::ProviderAccounts::find()
            .filter(Column::Provider.eq(input.provider.as_str()))
            .count(&self.db)
            .await?;

        let id = new_row_id();
        let active = entities::provider_accounts::ActiveModel {
            id: Set(id.clone()),
            provider: Set(input.provider.as_str().to_string()),
            account_id: Set(input.account_id.clone()),
            label: Set(input.label.clone()),
            is_primary: Set(existing == 0),
            access_token: Set(input.access_token.clone()),
            refresh_token: Set(input.refresh_token.clone()),
            expires_at: Set(input.expires_at),
            refresh_lock_token: Set(None),
            refresh_lock_expires_at: Set(None),
            metadata: Set(serde_json::to_value(&input.metadata)?),
            last_refresh_at: Set(None),
            last_refresh_status: Set(None),
            created_at: Set(now_ms),
            updated_at: Set(now_ms),
            ..Default::default()
        };
        entities::ProviderAccounts::insert(active).exec(&self.db).await?;

        let Some(account) = self.get_provider_account(&id).await? else {
            return Err(StorageError::Corrupt(format!(
                "provider account {id} vanished after insert"
            )));
        };
        Ok(account)
    }

    async fn apply_upsert_update(
        &self,
        id: &str,
        input: &NewProviderAccount,
        now_ms: i64,
    ) -> StorageResult<ProviderAccount> {
        let update = AccountTokenUpdate {
            access_token: input.access_token.clone(),
            refresh_token: input.refresh_token.clone(),
            expires_at: input.expires_at,
            account_id: input.account_id.clone(),
            metadata: Some(input.metadata.clone()),
            label: input.label.clone(),
        };
        let Some(account) = self
            .update_provider_account_tokens(id, &update, None, now_ms)
            .await?
        else {
            return Err(StorageError::Corrupt(format!(
                "provider account {id} vanished during upsert"
            )));
        };
        Ok(account)
    }

    /// Conditional update claiming the refresh lease. Only the readback
    /// decides ownership; the UPDATE alone cannot distinguish raced
    /// claimers.
    pub async fn try_acquire_provider_account_refresh_lock(
        &self,
        id: &str,
        token: &str,
        now_ms: i64,
        lease_expires_at: i64,
    ) -> StorageResult<bool> {
        use entities::provider_accounts::Column;

        entities::ProviderAccounts::update_many()
            .col_expr(Column::RefreshLockToken, Expr::value(token))
            .col_expr(Column::RefreshLockExpiresAt, Expr::value(lease_expires_at))
            .filter(Column::Id.eq(id))
            .filter(
                Condition::any()
                    .add(Column::RefreshLockToken.is_null())
                    .add(Column::RefreshLockExpiresAt.is_null())
                    .add(Column::RefreshLockExpiresAt.lte(now_ms)),
            )
            .exec(&self.db)
            .await?;

        let row = entities::ProviderAccounts::find_by_id(id).one(&self.db).await?;
        Ok(row.is_some_and(|row| row.refresh_lock_token.as_deref() == Some(token)))
    }

    /// When `lock_token` is supplied the write is conditional on still
    /// holding an unexpired lease; `None` is returned on a zero-row
    /// update either way.
    pub async fn update_provider_account_tokens(
        &self,
        id: &str,
        update: &AccountTokenUpdate,
        lock_token: Option<&str>,
        now_ms: i64,
    ) -> StorageResult<Option<ProviderAccount>> {
        use entities::provider_accounts::Column;

        let mut query = entities::ProviderAccounts::update_many()
            .col_expr(Column::AccessToken, Expr::value(update.access_token.as_str()))
            .col_expr(Column::RefreshToken, Expr::value(update.refresh_token.as_str()))
            .col_expr(Column::ExpiresAt, Expr::value(update.expires_at))
            .col_expr(Column::LastRefreshAt, Expr::value(now_ms))
            .col_expr(
                Column::LastRefreshStatus,
                Expr::value(RefreshStatus::Success.as_str()),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now_ms))
            .filter(Column::Id.eq(id));
        if let Some(account_id) = update.account_id.as_deref() {
            query = query.col_expr(Column::AccountId, Expr::value(account_id));
        }
        if let Some(metadata) = update.metadata.as_ref() {
            query = query.col_expr(Column::Metadata, Expr::value(serde_json::to_value(metadata)?));
        }
        if let Some(label) = update.label.as_deref() {
            query = query.col_expr(Column::Label, Expr::value(label));
        }
        if let Some(token) = lock_token {
            query = query
                .filter(Column::RefreshLockToken.eq(token))
                .filter(Column::RefreshLockExpiresAt.gt(now_ms));
        }

        let result = query.exec(&self.db).await?;
        if result.rows_affected == 0 {
            return Ok(None);
        }
        self.get_provider_account(id).await
    }

    pub async fn mark_provider_account_refresh_failed(
        &self,
        id: &str,
        lock_token: Option<&str>,
        now_ms: i64,
    ) -> StorageResult<()> {
        use entities::provider_accounts::Column;

        let mut query = entities::ProviderAccounts::update_many()
            .col_expr(Column::LastRefreshAt, Expr::value(now_ms))
            .col_expr(
                Column::LastRefreshStatus,
                Expr::value(RefreshStatus::Failed.as_str()),
            )
            .col_expr(Column::UpdatedAt, Expr::value(now_ms))
            .filter(Column::Id.eq(id));
        if let Some(token) = lock_token {
            query = query.filter(Column::RefreshLockToken.eq(token));
        }
        query.exec(&self.db).await?;
        Ok(())
    }

    /// Release is owner-scoped: `(id, token)` must still match.
    pub async fn release_provider_account_refresh_lock(
        &self,
        id: &str,
        token: &str,
    ) -> StorageResult<()> {
        use entities::provider_accounts::Column;

        entities::ProviderAccounts::update_many()
            .col_expr(Column::RefreshLockToken, Expr::value(Option::<String>::None))
            .col_expr(
                Column::RefreshLockExpiresAt,
                Expr::value(Option::<i64>::None),
            )
            .filter(Column::Id.eq(id))
            .filter(Column::RefreshLockToken.eq(token))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    /// Transactional clear-then-set; `None` when the target vanished
    /// mid-transaction.
    pub async fn set_primary_provider_account(
        &self,
        id: &str,
        now_ms: i64,
    ) -> StorageResult<Option<ProviderAccount>> {
        use entities::provider_accounts::Column;

        let txn = self.db.begin().await?;
        let Some(target) = entities::ProviderAccounts::find_by_id(id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(None);
        };

        entities::ProviderAccounts::update_many()
            .col_expr(Column::IsPrimary, Expr::value(false))
            .col_expr(Column::UpdatedAt, Expr::value(now_ms))
            .filter(Column::Provider.eq(target.provider.clone()))
            .filter(Column::IsPrimary.eq(true))
            .exec(&txn)
            .await?;

        let promoted = entities::ProviderAccounts::update_many()
            .col_expr(Column::IsPrimary, Expr::value(true))
            .col_expr(Column::UpdatedAt, Expr::value(now_ms))
            .filter(Column::Id.eq(id))
            .exec(&txn)
            .await?;
        if promoted.rows_affected == 0 {
            txn.rollback().await?;
            return Ok(None);
        }

        txn.commit().await?;
        self.get_provider_account(id).await
    }

    /// Hard delete. Deleting the primary promotes the most recently
    /// created remaining account of the same provider.
    pub async fn delete_provider_account(&self, id: &str, now_ms: i64) -> StorageResult<bool> {
        use entities::provider_accounts::Column;

        let txn = self.db.begin().await?;
        let Some(target) = entities::ProviderAccounts::find_by_id(id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(false);
        };

        entities::ProviderAccounts::delete_by_id(id).exec(&txn).await?;

        if target.is_primary
            && let Some(next) = entities::ProviderAccounts::find()
                .filter(Column::Provider.eq(target.provider.clone()))
                .order_by_desc(Column::CreatedAt)
                .one(&txn)
                .await?
        {
            entities::ProviderAccounts::update_many()
                .col_expr(Column::IsPrimary, Expr::value(true))
                .col_expr(Column::UpdatedAt, Expr::value(now_ms))
                .filter(Column::Id.eq(next.id.clone()))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;
        Ok(true)
    }

    // ---- Api keys ----

    pub async fn insert_api_key(&self, input: &NewApiKey, now_ms: i64) -> StorageResult<ApiKey> {
        let id = new_row_id();
        let active = entities::api_keys::ActiveModel {
            id: Set(id.clone()),
            key: Set(input.key.clone()),
            models_discovery_token: Set(input.models_discovery_token.clone()),
            label: Set(input.label.clone()),
            provider_scopes: Set(provider_scopes_to_json(input.provider_scopes.as_deref())),
            model_scopes: Set(model_scopes_to_json(input.model_scopes.as_deref())),
            expires_at: Set(input.expires_at),
            revoked_at: Set(None),
            created_at: Set(now_ms),
            ..Default::default()
        };
        entities::ApiKeys::insert(active).exec(&self.db).await?;

        let Some(key) = self.get_api_key(&id).await? else {
            return Err(StorageError::Corrupt(format!("api key {id} vanished after insert")));
        };
        Ok(key)
    }

    pub async fn list_api_keys(&self) -> StorageResult<Vec<ApiKey>> {
        use entities::api_keys::Column;

        let rows = entities::ApiKeys::find()
            .order_by_asc(Column::CreatedAt)
            .all(&self.db)
            .await?;
        rows.into_iter().map(api_key_from_model).collect()
    }

    pub async fn get_api_key(&self, id: &str) -> StorageResult<Option<ApiKey>> {
        let row = entities::ApiKeys::find_by_id(id).one(&self.db).await?;
        row.map(api_key_from_model).transpose()
    }

    /// Matches `key` AND not revoked AND not expired.
    pub async fn find_active_api_key_by_value(
        &self,
        value: &str,
        now_ms: i64,
    ) -> StorageResult<Option<ApiKey>> {
        use entities::api_keys::Column;

        let row = entities::ApiKeys::find()
            .filter(Column::Key.eq(value))
            .filter(Column::RevokedAt.is_null())
            .filter(
                Condition::any()
                    .add(Column::ExpiresAt.is_null())
                    .add(Column::ExpiresAt.gt(now_ms)),
            )
            .one(&self.db)
            .await?;
        row.map(api_key_from_model).transpose()
    }

    pub async fn find_active_api_key_by_discovery_token(
        &self,
        token: &str,
        now_ms: i64,
    ) -> StorageResult<Option<ApiKey>> {
        use entities::api_keys::Column;

        let row = entities::ApiKeys::find()
            .filter(Column::ModelsDiscoveryToken.eq(token))
            .filter(Column::RevokedAt.is_null())
            .filter(
                Condition::any()
                    .add(Column::ExpiresAt.is_null())
                    .add(Column::ExpiresAt.gt(now_ms)),
            )
            .one(&self.db)
            .await?;
        row.map(api_key_from_model).transpose()
    }

    pub async fn update_api_key(
        &self,
        id: &str,
        patch: &ApiKeyPatch,
    ) -> StorageResult<Option<ApiKey>> {
        use entities::api_keys::Column;

        let mut query = entities::ApiKeys::update_many().filter(Column::Id.eq(id));
        let mut touched = false;
        if let Some(label) = patch.label.as_ref() {
            query = query.col_expr(Column::Label, Expr::value(label.clone()));
            touched = true;
        }
        if let Some(scopes) = patch.provider_scopes.as_ref() {
            query = query.col_expr(
                Column::ProviderScopes,
                Expr::value(provider_scopes_to_json(scopes.as_deref())),
            );
            touched = true;
        }
        if let Some(scopes) = patch.model_scopes.as_ref() {
            query = query.col_expr(
                Column::ModelScopes,
                Expr::value(model_scopes_to_json(scopes.as_deref())),
            );
            touched = true;
        }
        if let Some(expires_at) = patch.expires_at.as_ref() {
            query = query.col_expr(Column::ExpiresAt, Expr::value(*expires_at));
            touched = true;
        }
        if touched {
            let result = query.exec(&self.db).await?;
            if result.rows_affected == 0 {
                return Ok(None);
            }
        }
        self.get_api_key(id).await
    }

    pub async fn revoke_api_key(&self, id: &str, now_ms: i64) -> StorageResult<Option<ApiKey>> {
        use entities::api_keys::Column;

        let result = entities::ApiKeys::update_many()
            .col_expr(Column::RevokedAt, Expr::value(now_ms))
            .filter(Column::Id.eq(id))
            .filter(Column::RevokedAt.is_null())
            .exec(&self.db)
            .await?;
        if result.rows_affected == 0 {
            // Already revoked is fine; missing is not.
            return self.get_api_key(id).await;
        }
        self.get_api_key(id).await
    }

    /// Transactional: refuses unless already revoked; cascades usage rows.
    pub async fn delete_revoked_api_key(&self, id: &str) -> StorageResult<DeleteKeyOutcome> {
        let txn = self.db.begin().await?;
        let Some(key) = entities::ApiKeys::find_by_id(id).one(&txn).await? else {
            txn.rollback().await?;
            return Ok(DeleteKeyOutcome::NotFound);
        };
        if key.revoked_at.is_none() {
            txn.rollback().await?;
            return Ok(DeleteKeyOutcome::NotRevoked);
        }

        entities::UsageBuckets::delete_many()
            .filter(entities::usage_buckets::Column::ApiKeyId.eq(id))
            .exec(&txn)
            .await?;
        entities::ApiKeys::delete_by_id(id).exec(&txn).await?;
        txn.commit().await?;
        Ok(DeleteKeyOutcome::Deleted)
    }

    // ---- Usage buckets ----

    pub async fn record_request_usage(
        &self,
        key: &BucketKey,
        delta: &UsageDelta,
    ) -> StorageResult<()> {
        self.upsert_usage(key, delta).await
    }

    pub async fn record_token_usage(
        &self,
        key: &BucketKey,
        tokens: &TokenUsage,
        occurred_at_ms: i64,
    ) -> StorageResult<()> {
        let delta = UsageDelta {
            input_tokens: tokens.input_tokens,
            output_tokens: tokens.output_tokens,
            cache_read_tokens: tokens.cache_read_tokens,
            cache_write_tokens: tokens.cache_write_tokens,
            last_request_at: occurred_at_ms,
            ..Default::default()
        };
        self.upsert_usage(key, &delta).await
    }

    async fn upsert_usage(&self, key: &BucketKey, delta: &UsageDelta) -> StorageResult<()> {
        use entities::usage_buckets::Column;

        let active = entities::usage_buckets::ActiveModel {
            bucket_start: Set(key.bucket_start),
            api_key_id: Set(key.api_key_id.clone()),
            provider_account_id: Set(key.provider_account_id.clone()),
            provider: Set(key.provider.as_str().to_string()),
            endpoint: Set(key.endpoint.clone()),
            model: Set(key.model.clone()),
            request_count: Set(delta.request_count),
            success_count: Set(delta.success_count),
            client_error_count: Set(delta.client_error_count),
            server_error_count: Set(delta.server_error_count),
            auth_error_count: Set(delta.auth_error_count),
            rate_limit_count: Set(delta.rate_limit_count),
            total_latency_ms: Set(delta.total_latency_ms),
            max_latency_ms: Set(delta.max_latency_ms),
            input_tokens: Set(delta.input_tokens),
            output_tokens: Set(delta.output_tokens),
            cache_read_tokens: Set(delta.cache_read_tokens),
            cache_write_tokens: Set(delta.cache_write_tokens),
            last_request_at: Set(delta.last_request_at),
            ..Default::default()
        };

        entities::UsageBuckets::insert(active)
            .on_conflict(
                OnConflict::columns([
                    Column::BucketStart,
                    Column::ApiKeyId,
                    Column::ProviderAccountId,
                    Column::Provider,
                    Column::Endpoint,
                    Column::Model,
                ])
                .value(
                    Column::RequestCount,
                    Expr::col(Column::RequestCount).add(delta.request_count),
                )
                .value(
                    Column::SuccessCount,
                    Expr::col(Column::SuccessCount).add(delta.success_count),
                )
                .value(
                    Column::ClientErrorCount,
                    Expr::col(Column::ClientErrorCount).add(delta.client_error_count),
                )
                .value(
                    Column::ServerErrorCount,
                    Expr::col(Column::ServerErrorCount).add(delta.server_error_count),
                )
                .value(
                    Column::AuthErrorCount,
                    Expr::col(Column::AuthErrorCount).add(delta.auth_error_count),
                )
                .value(
                    Column::RateLimitCount,
                    Expr::col(Column::RateLimitCount).add(delta.rate_limit_count),
                )
                .value(
                    Column::TotalLatencyMs,
                    Expr::col(Column::TotalLatencyMs).add(delta.total_latency_ms),
                )
                .value(Column::MaxLatencyMs, greatest(Column::MaxLatencyMs, delta.max_latency_ms))
                .value(
                    Column::InputTokens,
                    Expr::col(Column::InputTokens).add(delta.input_tokens),
                )
                .value(
                    Column::OutputTokens,
                    Expr::col(Column::OutputTokens).add(delta.output_tokens),
                )
                .value(
                    Column::CacheReadTokens,
                    Expr::col(Column::CacheReadTokens).add(delta.cache_read_tokens),
                )
                .value(
                    Column::CacheWriteTokens,
                    Expr::col(Column::CacheWriteTokens).add(delta.cache_write_tokens),
                )
                .value(
                    Column::LastRequestAt,
                    greatest(Column::LastRequestAt, delta.last_request_at),
                )
                .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn usage_totals(&self, from_ms: i64, to_ms: i64) -> StorageResult<UsageTotals> {
        use entities::usage_buckets::Column;

        let query = with_usage_sums(entities::UsageBuckets::find().select_only())
            .filter(Column::BucketStart.gte(from_ms))
            .filter(Column::BucketStart.lte(to_ms));
        let totals = query.into_model::<UsageTotals>().one(&self.db).await?;
        Ok(totals.unwrap_or_default())
    }

    pub async fn usage_by_provider(
        &self,
        from_ms: i64,
        to_ms: i64,
    ) -> StorageResult<Vec<ProviderUsageRow>> {
        use entities::usage_buckets::Column;

        let query = with_usage_sums(
            entities::UsageBuckets::find()
                .select_only()
                .column(Column::Provider),
        )
        .filter(Column::BucketStart.gte(from_ms))
        .filter(Column::BucketStart.lte(to_ms))
        .group_by(Column::Provider);
        Ok(query.into_model::<ProviderUsageRow>().all(&self.db).await?)
    }

    pub async fn usage_by_model(
        &self,
        from_ms: i64,
        to_ms: i64,
    ) -> StorageResult<Vec<ModelUsageRow>> {
        use entities::usage_buckets::Column;

        let query = with_usage_sums(
            entities::UsageBuckets::find()
                .select_only()
                .column(Column::Provider)
                .column(Column::Model),
        )
        .filter(Column::BucketStart.gte(from_ms))
        .filter(Column::BucketStart.lte(to_ms))
        .group_by(Column::Provider)
        .group_by(Column::Model);
        Ok(query.into_model::<ModelUsageRow>().all(&self.db).await?)
    }

    pub async fn usage_by_key(&self, from_ms: i64, to_ms: i64) -> StorageResult<Vec<KeyUsageRow>> {
        use entities::usage_buckets::Column;

        let query = with_usage_sums(
            entities::UsageBuckets::find()
                .select_only()
                .column(Column::ApiKeyId),
        )
        .filter(Column::BucketStart.gte(from_ms))
        .filter(Column::BucketStart.lte(to_ms))
        .group_by(Column::ApiKeyId);
        Ok(query.into_model::<KeyUsageRow>().all(&self.db).await?)
    }

    pub async fn usage_for_key(
        &self,
        api_key_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> StorageResult<UsageTotals> {
        use entities::usage_buckets::Column;

        let query = with_usage_sums(entities::UsageBuckets::find().select_only())
            .filter(Column::ApiKeyId.eq(api_key_id))
            .filter(Column::BucketStart.gte(from_ms))
            .filter(Column::BucketStart.lte(to_ms));
        let totals = query.into_model::<UsageTotals>().one(&self.db).await?;
        Ok(totals.unwrap_or_default())
    }

    pub async fn usage_for_key_by_model(
        &self,
        api_key_id: &str,
        from_ms: i64,
        to_ms: i64,
    ) -> StorageResult<Vec<ModelUsageRow>> {
        use entities::usage_buckets::Column;

        let query = with_usage_sums(
            entities::UsageBuckets::find()
                .select_only()
                .column(Column::Provider)
                .column(Column::Model),
        )
        .filter(Column::ApiKeyId.eq(api_key_id))
        .filter(Column::BucketStart.gte(from_ms))
        .filter(Column::BucketStart.lte(to_ms))
        .group_by(Column::Provider)
        .group_by(Column::Model);
        Ok(query.into_model::<ModelUsageRow>().all(&self.db).await?)
    }
}

/// Portable `max(current, candidate)` for upsert conflict clauses.
fn greatest(
    column: entities::usage_buckets::Column,
    candidate: i64,
) -> sea_orm::sea_query::SimpleExpr {
    Expr::case(Expr::col(column).lt(candidate), candidate)
        .finally(Expr::col(column))
        .into()
}

fn with_usage_sums(
    query: Select<entities::UsageBuckets>,
) -> Select<entities::UsageBuckets> {
    use entities::usage_buckets::Column;

    query
        .column_as(Expr::col(Column::RequestCount).sum(), "request_count")
        .column_as(Expr::col(Column::SuccessCount).sum(), "success_count")
        .column_as(Expr::col(Column::ClientErrorCount).sum(), "client_error_count")
        .column_as(Expr::col(Column::ServerErrorCount).sum(), "server_error_count")
        .column_as(Expr::col(Column::AuthErrorCount).sum(), "auth_error_count")
        .column_as(Expr::col(Column::RateLimitCount).sum(), "rate_limit_count")
        .column_as(Expr::col(Column::TotalLatencyMs).sum(), "total_latency_ms")
        .column_as(Expr::col(Column::MaxLatencyMs).max(), "max_latency_ms")
        .column_as(Expr::col(Column::InputTokens).sum(), "input_tokens")
        .column_as(Expr::col(Column::OutputTokens).sum(), "output_tokens")
        .column_as(Expr::col(Column::CacheReadTokens).sum(), "cache_read_tokens")
        .column_as(Expr::col(Column::CacheWriteTokens).sum(), "cache_write_tokens")
        .column_as(Expr::col(Column::LastRequestAt).max(), "last_request_at")
}

fn is_unique_violation(err: &sea_orm::DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

fn oauth_state_from_model(model: entities::oauth_states::Model) -> OAuthStateRecord {
    OAuthStateRecord {
        provider: Provider::parse(&model.provider).unwrap_or(Provider::Codex),
        state: model.state,
        pkce_verifier: model.pkce_verifier,
        metadata_json: model.metadata_json,
        expires_at: model.expires_at,
    }
}

fn account_from_model(model: entities::provider_accounts::Model) -> StorageResult<ProviderAccount> {
    let provider = Provider::parse(&model.provider).ok_or_else(|| {
        StorageError::Corrupt(format!("unknown provider: {}", model.provider))
    })?;
    let metadata = serde_json::from_value::<AccountMetadata>(model.metadata)?;
    let last_refresh_status = match model.last_refresh_status.as_deref() {
        None => None,
        Some(raw) => Some(RefreshStatus::parse(raw).ok_or_else(|| {
            StorageError::Corrupt(format!("unknown refresh status: {raw}"))
        })?),
    };
    Ok(ProviderAccount {
        id: model.id,
        provider,
        account_id: model.account_id,
        label: model.label,
        is_primary: model.is_primary,
        access_token: model.access_token,
        refresh_token: model.refresh_token,
        expires_at: model.expires_at,
        refresh_lock_token: model.refresh_lock_token,
        refresh_lock_expires_at: model.refresh_lock_expires_at,
        metadata,
        last_refresh_at: model.last_refresh_at,
        last_refresh_status,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn api_key_from_model(model: entities::api_keys::Model) -> StorageResult<ApiKey> {
    let provider_scopes = match model.provider_scopes {
        None => None,
        Some(json) => {
            let names = serde_json::from_value::<Vec<String>>(json)?;
            let mut scopes = Vec::with_capacity(names.len());
            for name in names {
                let provider = Provider::parse(&name).ok_or_else(|| {
                    StorageError::Corrupt(format!("unknown provider scope: {name}"))
                })?;
                scopes.push(provider);
            }
            Some(scopes)
        }
    };
    let model_scopes = match model.model_scopes {
        None => None,
        Some(json) => Some(serde_json::from_value::<Vec<String>>(json)?),
    };
    Ok(ApiKey {
        id: model.id,
        key: model.key,
        models_discovery_token: model.models_discovery_token,
        label: model.label,
        provider_scopes,
        model_scopes,
        expires_at: model.expires_at,
        revoked_at: model.revoked_at,
        created_at: model.created_at,
    })
}

fn provider_scopes_to_json(scopes: Option<&[Provider]>) -> Option<serde_json::Value> {
    scopes.map(|scopes| {
        serde_json::Value::Array(
            scopes
                .iter()
                .map(|scope| serde_json::Value::String(scope.as_str().to_string()))
                .collect(),
        )
    })
}

fn model_scopes_to_json(scopes: Option<&[String]>) -> Option<serde_json::Value> {
    scopes.map(|scopes| {
        serde_json::Value::Array(
            scopes
                .iter()
                .map(|scope| serde_json::Value::String(scope.clone()))
                .collect(),
        )
    })
}
