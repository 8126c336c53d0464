//! Storage trait and configuration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use common_error::StrataResult;
use strata_core::Segment;

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base path or URI prefix for the backend.
    pub base_path: String,
    /// Maximum retries for a failed fetch before the run is failed.
    pub max_fetch_retries: u32,
    /// Initial backoff in milliseconds; doubled per retry.
    pub retry_backoff_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: ":memory:".to_string(),
            max_fetch_retries: 3,
            retry_backoff_ms: 20,
        }
    }
}

/// The storage collaborator.
///
/// Implementations decode their on-disk representation before returning;
/// a returned [`Segment`] is fully usable by the pipeline. A fetch may
/// suspend the caller but must not hold pipeline locks while pending.
#[async_trait]
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Load and decode the segment stored under `key`.
    async fn fetch(&self, key: &str) -> StrataResult<Segment>;

    /// Store a segment under `key`, replacing any previous value.
    async fn write(&self, key: &str, segment: Segment) -> StrataResult<()>;

    /// All keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> StrataResult<Vec<String>>;

    /// Remove the segment under `key`. Removing a missing key is not an
    /// error.
    async fn delete(&self, key: &str) -> StrataResult<()>;

    /// Whether a segment exists under `key`.
    async fn exists(&self, key: &str) -> StrataResult<bool>;
}
