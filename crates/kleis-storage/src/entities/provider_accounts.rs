use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique_key = "provider_account_upstream_id")]
    pub provider: String,
    #[sea_orm(unique_key = "provider_account_upstream_id")]
    pub account_id: Option<String>,
    pub label: Option<String>,
    pub is_primary: bool,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub refresh_lock_token: Option<String>,
    pub refresh_lock_expires_at: Option<i64>,
    pub metadata: Json,
    pub last_refresh_at: Option<i64>,
    pub last_refresh_status: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ActiveModelBehavior for ActiveModel {}
