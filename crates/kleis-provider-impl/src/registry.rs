use std::sync::Arc;

use kleis_provider_core::AdapterRegistry;
use kleis_storage::Repository;

use crate::providers::claude::ClaudeAdapter;
use crate::providers::codex::CodexAdapter;
use crate::providers::copilot::CopilotAdapter;

/// All three adapters share the repository for cross-process OAuth state.
pub fn build_adapter_registry(repository: Repository) -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register(Arc::new(CodexAdapter::new(repository.clone())));
    registry.register(Arc::new(CopilotAdapter::new(repository.clone())));
    registry.register(Arc::new(ClaudeAdapter::new(repository)));
    registry
}
