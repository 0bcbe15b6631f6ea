mod primary;
mod taxonomy;

pub use primary::{
    PrimaryIndexJob, PrimaryIndexReport, index_primary, load_index_definition,
    read_complaint_batches,
};
pub use taxonomy::{TaxonomyTerm, index_taxonomy, parse_taxonomy};

use indicatif::ProgressBar;
use log::debug;
use serde_json::Value;

use crate::backend::{AliasAction, BulkDocument, SearchBackend};
use crate::error::{PipelineError, PipelineResult};
use crate::settings::DOC_TYPE_NAME;

/// Field carrying the document type on every indexed document
pub const DOC_TYPE_FIELD: &str = "doc_type";

const MAX_REPORTED_ERRORS: usize = 5;

/// Stamp the document type onto a JSON object
pub fn with_doc_type(mut source: Value) -> Value {
    if let Some(obj) = source.as_object_mut() {
        obj.insert(
            DOC_TYPE_FIELD.to_string(),
            Value::String(DOC_TYPE_NAME.to_string()),
        );
    }
    source
}

/// Send one bulk request. Any item-level failure aborts with an indexing error.
pub(crate) async fn send_batch<B: SearchBackend + ?Sized>(
    backend: &B,
    index: &str,
    batch: Vec<BulkDocument>,
    batch_num: usize,
) -> PipelineResult<u64> {
    let batch_len = batch.len();
    debug!(
        "Sending bulk batch {} ({} documents) to {}",
        batch_num, batch_len, index
    );

    let summary = backend.bulk_index(index, batch).await?;
    if !summary.errors.is_empty() {
        let shown: Vec<&str> = summary
            .errors
            .iter()
            .take(MAX_REPORTED_ERRORS)
            .map(String::as_str)
            .collect();
        return Err(PipelineError::indexing(format!(
            "{} of {} documents in bulk batch {} failed for {}: {}",
            summary.errors.len(),
            batch_len,
            batch_num,
            index,
            shown.join("; ")
        )));
    }
    Ok(summary.indexed)
}

/// Send documents in bulk requests of at most `chunk_size`
pub async fn bulk_insert<B: SearchBackend + ?Sized>(
    backend: &B,
    index: &str,
    documents: Vec<BulkDocument>,
    chunk_size: usize,
    bar: Option<&ProgressBar>,
) -> PipelineResult<u64> {
    let chunk_size = chunk_size.max(1);
    let mut indexed = 0u64;
    let mut documents = documents.into_iter().peekable();
    let mut batch_num = 0usize;

    while documents.peek().is_some() {
        let batch: Vec<BulkDocument> = documents.by_ref().take(chunk_size).collect();
        batch_num += 1;
        indexed += send_batch(backend, index, batch, batch_num).await?;
        if let Some(bar) = bar {
            bar.set_position(indexed);
        }
    }

    Ok(indexed)
}

/// Make `alias` point at `index` and nothing else, in a single atomic update
pub async fn point_alias<B: SearchBackend + ?Sized>(
    backend: &B,
    alias: &str,
    index: &str,
) -> PipelineResult<()> {
    let current = backend.alias_targets(alias).await?;
    let mut actions: Vec<AliasAction> = current
        .iter()
        .filter(|t| t.as_str() != index)
        .map(|t| AliasAction::remove(t.as_str(), alias))
        .collect();
    if !current.iter().any(|t| t == index) {
        actions.push(AliasAction::add(index, alias));
    }

    if actions.is_empty() {
        debug!("Alias {} already points at {}", alias, index);
        return Ok(());
    }

    log::info!(
        "Pointing alias {} at {} (previously {:?})",
        alias,
        index,
        current
    );
    backend.update_aliases(&actions).await
}
