use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use super::{AliasAction, BulkDocument, BulkSummary, SearchBackend};
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Default, Clone)]
struct MemoryIndex {
    body: Value,
    docs: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct MemoryState {
    reachable: bool,
    indices: BTreeMap<String, MemoryIndex>,
    /// alias -> indices
    aliases: BTreeMap<String, BTreeSet<String>>,
    next_auto_id: u64,
    failing_operation: Option<&'static str>,
    operations: Vec<String>,
}

/// Search backend that keeps indices and aliases in memory
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                reachable: true,
                ..MemoryState::default()
            }),
        }
    }

    /// A backend whose ping fails, as an unreachable cluster would
    pub fn unreachable() -> Self {
        let backend = Self::new();
        backend.lock().reachable = false;
        backend
    }

    /// Make every call of the named operation (`"bulk_index"`, `"count"`, ...) fail
    pub fn fail_operation(&self, operation: &'static str) {
        self.lock().failing_operation = Some(operation);
    }

    pub fn clear_failure(&self) {
        self.lock().failing_operation = None;
    }

    /// Create `index` holding `count` placeholder documents
    pub fn seed_index(&self, index: &str, count: u64) {
        let mut state = self.lock();
        let entry = state.indices.entry(index.to_string()).or_default();
        for n in 0..count {
            entry
                .docs
                .insert(format!("seed-{}", n), serde_json::json!({ "seed": n }));
        }
    }

    /// Point `alias` at `index` only
    pub fn set_alias(&self, alias: &str, index: &str) {
        let mut state = self.lock();
        state
            .aliases
            .insert(alias.to_string(), BTreeSet::from([index.to_string()]));
    }

    /// Documents of a physical index, keyed by id
    pub fn documents(&self, index: &str) -> BTreeMap<String, Value> {
        self.lock()
            .indices
            .get(index)
            .map(|i| i.docs.clone())
            .unwrap_or_default()
    }

    pub fn index_body(&self, index: &str) -> Option<Value> {
        self.lock().indices.get(index).map(|i| i.body.clone())
    }

    pub fn index_names(&self) -> Vec<String> {
        self.lock().indices.keys().cloned().collect()
    }

    pub fn aliases_of(&self, alias: &str) -> Vec<String> {
        self.lock()
            .aliases
            .get(alias)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the operations called so far, in order
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Each call leaves the state consistent, so poisoning is ignored
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, operation: &'static str) -> PipelineResult<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        state.operations.push(operation.to_string());
        if !state.reachable {
            return Err(PipelineError::connection("memory backend is unreachable"));
        }
        if state.failing_operation == Some(operation) {
            return Err(PipelineError::indexing(format!(
                "{} failed (injected)",
                operation
            )));
        }
        Ok(state)
    }
}

impl MemoryState {
    /// Physical indices behind a name that is either an index or an alias
    fn resolve(&self, name: &str) -> Vec<String> {
        if self.indices.contains_key(name) {
            return vec![name.to_string()];
        }
        self.aliases
            .get(name)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    async fn ping(&self) -> PipelineResult<()> {
        self.begin("ping").map(|_| ())
    }

    async fn count(&self, index: &str) -> PipelineResult<Option<u64>> {
        let state = self.begin("count")?;
        let targets = state.resolve(index);
        if targets.is_empty() {
            return Ok(None);
        }
        let total: u64 = targets
            .iter()
            .filter_map(|t| state.indices.get(t))
            .map(|i| i.docs.len() as u64)
            .sum();
        Ok(Some(total))
    }

    async fn index_exists(&self, index: &str) -> PipelineResult<bool> {
        let state = self.begin("index_exists")?;
        Ok(!state.resolve(index).is_empty())
    }

    async fn create_index(&self, index: &str, body: &Value) -> PipelineResult<()> {
        let mut state = self.begin("create_index")?;
        if state.indices.contains_key(index) || state.aliases.contains_key(index) {
            return Err(PipelineError::indexing(format!(
                "index [{}] already exists",
                index
            )));
        }
        state.indices.insert(
            index.to_string(),
            MemoryIndex {
                body: body.clone(),
                docs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> PipelineResult<()> {
        let mut state = self.begin("delete_index")?;
        state.indices.remove(index);
        for members in state.aliases.values_mut() {
            members.remove(index);
        }
        state.aliases.retain(|_, members| !members.is_empty());
        Ok(())
    }

    async fn refresh(&self, index: &str) -> PipelineResult<()> {
        let state = self.begin("refresh")?;
        if state.resolve(index).is_empty() {
            return Err(PipelineError::indexing(format!("no such index [{}]", index)));
        }
        Ok(())
    }

    async fn reindex(&self, source: &str, dest: &str) -> PipelineResult<u64> {
        let mut state = self.begin("reindex")?;
        let docs: BTreeMap<String, Value> = state
            .resolve(source)
            .iter()
            .filter_map(|t| state.indices.get(t))
            .flat_map(|i| i.docs.clone())
            .collect();
        let copied = docs.len() as u64;
        state
            .indices
            .entry(dest.to_string())
            .or_default()
            .docs
            .extend(docs);
        Ok(copied)
    }

    async fn alias_targets(&self, alias: &str) -> PipelineResult<Vec<String>> {
        let state = self.begin("alias_targets")?;
        Ok(state
            .aliases
            .get(alias)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> PipelineResult<()> {
        let mut state = self.begin("update_aliases")?;

        // Validate every action before applying any, so the update is atomic
        let mut next = state.aliases.clone();
        for action in actions {
            match action {
                AliasAction::Add { index, alias } => {
                    if !state.indices.contains_key(index) {
                        return Err(PipelineError::indexing(format!(
                            "no such index [{}]",
                            index
                        )));
                    }
                    if state.indices.contains_key(alias) {
                        return Err(PipelineError::indexing(format!(
                            "an index exists with the same name as the alias [{}]",
                            alias
                        )));
                    }
                    next.entry(alias.clone()).or_default().insert(index.clone());
                }
                AliasAction::Remove { index, alias } => {
                    let removed = next
                        .get_mut(alias)
                        .map(|members| members.remove(index))
                        .unwrap_or(false);
                    if !removed {
                        return Err(PipelineError::indexing(format!(
                            "aliases [{}] missing on index [{}]",
                            alias, index
                        )));
                    }
                }
            }
        }
        next.retain(|_, members| !members.is_empty());
        state.aliases = next;
        Ok(())
    }

    async fn bulk_index(
        &self,
        index: &str,
        documents: Vec<BulkDocument>,
    ) -> PipelineResult<BulkSummary> {
        let mut state = self.begin("bulk_index")?;
        let targets = state.resolve(index);
        let target = match targets.as_slice() {
            [single] => single.clone(),
            [] => index.to_string(),
            _ => {
                return Err(PipelineError::indexing(format!(
                    "alias [{}] has more than one index associated with it",
                    index
                )));
            }
        };

        let mut summary = BulkSummary::default();
        for doc in documents {
            if !doc.source.is_object() {
                summary
                    .errors
                    .push(format!("document {:?} is not a JSON object", doc.id));
                continue;
            }
            let id = match doc.id {
                Some(id) => id,
                None => {
                    state.next_auto_id += 1;
                    format!("auto-{}", state.next_auto_id)
                }
            };
            state
                .indices
                .entry(target.clone())
                .or_default()
                .docs
                .insert(id, doc.source);
            summary.indexed += 1;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_count_through_alias() {
        let backend = MemoryBackend::new();
        backend.seed_index("complaints-v1", 3);
        backend.set_alias("complaints", "complaints-v1");

        assert_eq!(backend.count("complaints").await.unwrap(), Some(3));
        assert_eq!(backend.count("complaints-v1").await.unwrap(), Some(3));
        assert_eq!(backend.count("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_aliases_is_atomic() {
        let backend = MemoryBackend::new();
        backend.seed_index("a-v1", 1);
        backend.set_alias("a", "a-v1");

        // Second action fails, so the first must not be applied either
        let result = backend
            .update_aliases(&[
                AliasAction::remove("a-v1", "a"),
                AliasAction::add("does-not-exist", "a"),
            ])
            .await;
        assert!(result.is_err());
        assert_eq!(backend.aliases_of("a"), vec!["a-v1".to_string()]);
    }

    #[tokio::test]
    async fn test_bulk_rejects_non_objects() {
        let backend = MemoryBackend::new();
        backend.create_index("i", &json!({})).await.unwrap();
        let summary = backend
            .bulk_index(
                "i",
                vec![
                    BulkDocument {
                        id: Some("1".into()),
                        source: json!({ "a": 1 }),
                    },
                    BulkDocument {
                        id: Some("2".into()),
                        source: json!([1, 2]),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.indexed, 1);
        assert_eq!(summary.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_and_injected_failures() {
        let backend = MemoryBackend::unreachable();
        assert!(matches!(
            backend.ping().await,
            Err(PipelineError::Connection(_))
        ));

        let backend = MemoryBackend::new();
        backend.fail_operation("count");
        assert!(backend.count("x").await.is_err());
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_drops_alias_membership() {
        let backend = MemoryBackend::new();
        backend.seed_index("a-v2", 1);
        backend.set_alias("a", "a-v2");
        backend.delete_index("a-v2").await.unwrap();
        assert!(backend.aliases_of("a").is_empty());
        backend.delete_index("never-existed").await.unwrap();
    }
}
