pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::PipelineResult;

/// One document of a bulk request
#[derive(Debug, Clone, PartialEq)]
pub struct BulkDocument {
    /// Document `_id`; the engine assigns one when `None`
    pub id: Option<String>,
    pub source: Value,
}

/// Outcome of a bulk request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkSummary {
    pub indexed: u64,
    /// Reasons reported for items that failed
    pub errors: Vec<String>,
}

/// A single entry of an atomic alias update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasAction {
    Add { index: String, alias: String },
    Remove { index: String, alias: String },
}

impl AliasAction {
    pub fn add(index: impl Into<String>, alias: impl Into<String>) -> Self {
        AliasAction::Add {
            index: index.into(),
            alias: alias.into(),
        }
    }

    pub fn remove(index: impl Into<String>, alias: impl Into<String>) -> Self {
        AliasAction::Remove {
            index: index.into(),
            alias: alias.into(),
        }
    }

    /// Body entry for the `_aliases` API
    pub fn to_json(&self) -> Value {
        match self {
            AliasAction::Add { index, alias } => {
                serde_json::json!({ "add": { "index": index, "alias": alias } })
            }
            AliasAction::Remove { index, alias } => {
                serde_json::json!({ "remove": { "index": index, "alias": alias } })
            }
        }
    }
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Check that the engine is reachable and accepts our credentials
    async fn ping(&self) -> PipelineResult<()>;

    /// Document count of an index or alias, `None` when it does not exist
    async fn count(&self, index: &str) -> PipelineResult<Option<u64>>;

    async fn index_exists(&self, index: &str) -> PipelineResult<bool>;

    /// Create an index from a `{"settings": .., "mappings": ..}` body
    async fn create_index(&self, index: &str, body: &Value) -> PipelineResult<()>;

    /// Delete an index; a missing index is not an error
    async fn delete_index(&self, index: &str) -> PipelineResult<()>;

    async fn refresh(&self, index: &str) -> PipelineResult<()>;

    /// Copy every document of `source` into `dest`, returning the number copied
    async fn reindex(&self, source: &str, dest: &str) -> PipelineResult<u64>;

    /// Physical indices the alias currently points at
    async fn alias_targets(&self, alias: &str) -> PipelineResult<Vec<String>>;

    /// Apply all actions atomically
    async fn update_aliases(&self, actions: &[AliasAction]) -> PipelineResult<()>;

    async fn bulk_index(
        &self,
        index: &str,
        documents: Vec<BulkDocument>,
    ) -> PipelineResult<BulkSummary>;
}
