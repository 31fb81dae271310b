pub mod db;
pub mod entities;
pub mod keys;
pub mod repository;

pub use keys::{ApiKey, ApiKeyPatch, DeleteKeyOutcome, NewApiKey};
pub use repository::{
    AccountTokenUpdate, BucketKey, KeyUsageRow, ModelUsageRow, NewProviderAccount,
    ProviderUsageRow, Repository, StorageError, StorageResult, UsageDelta, UsageTotals,
};
