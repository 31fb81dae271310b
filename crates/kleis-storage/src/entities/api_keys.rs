use sea_orm::entity::prelude::*;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    #[sea_orm(unique_key = "api_key_value")]
    pub key: String,
    #[sea_orm(unique_key = "api_key_discovery_token")]
    pub models_discovery_token: Option<String>,
    pub label: Option<String>,
    pub provider_scopes: Option<Json>,
    pub model_scopes: Option<Json>,
    pub expires_at: Option<i64>,
    pub revoked_at: Option<i64>,
    pub created_at: i64,
}

impl ActiveModelBehavior for ActiveModel {}
