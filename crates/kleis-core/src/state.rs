use std::sync::Arc;

use kleis_common::KleisConfig;
use kleis_provider_impl::build_adapter_registry;
use kleis_storage::Repository;

use crate::models::ModelsRegistry;
use crate::ratelimit::RateLimiter;
use crate::service::ProviderService;

pub struct AppState {
    pub config: KleisConfig,
    pub repository: Repository,
    pub service: ProviderService,
    pub rate_limiter: RateLimiter,
    pub models: ModelsRegistry,
}

/// Connect storage, sync the schema, and wire the adapter registry.
pub async fn bootstrap(config: KleisConfig) -> anyhow::Result<Arc<AppState>> {
    let repository = Repository::connect(&config.dsn).await?;
    repository.sync().await?;

    let registry = build_adapter_registry(repository.clone());
    let service = ProviderService::new(repository.clone(), registry);

    Ok(Arc::new(AppState {
        config,
        repository,
        service,
        rate_limiter: RateLimiter::new(),
        models: ModelsRegistry::new(),
    }))
}
