use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

use super::{bulk_insert, with_doc_type};
use crate::backend::{BulkDocument, SearchBackend};
use crate::error::{PipelineError, PipelineResult};
use crate::progress::setup_index_bar;

/// One line of the taxonomy file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomyTerm {
    pub term: String,
}

impl TaxonomyTerm {
    /// Stable id so that re-indexing overwrites rather than duplicates
    pub fn document_id(&self) -> String {
        let mut slug = String::with_capacity(self.term.len());
        for ch in self.term.chars().flat_map(char::to_lowercase) {
            if ch.is_alphanumeric() {
                slug.push(ch);
            } else if !slug.ends_with('-') {
                slug.push('-');
            }
        }
        format!("taxonomy-{}", slug.trim_matches('-'))
    }

    pub fn to_bulk_document(&self) -> BulkDocument {
        BulkDocument {
            id: Some(self.document_id()),
            source: with_doc_type(json!({ "taxonomy": self.term })),
        }
    }
}

/// One term per line; blank lines, `#` comments and duplicates are skipped
pub fn parse_taxonomy(content: &str) -> Vec<TaxonomyTerm> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| TaxonomyTerm {
            term: line.to_string(),
        })
        .filter(|term| {
            let fresh = seen.insert(term.document_id());
            if !fresh {
                log::debug!("Skipping duplicate taxonomy term {:?}", term.term);
            }
            fresh
        })
        .collect()
}

/// Index the taxonomy file through `alias`, without versioning
pub async fn index_taxonomy<B: SearchBackend + ?Sized>(
    backend: &B,
    taxonomy_file: &Path,
    alias: &str,
    chunk_size: usize,
    quiet: bool,
) -> PipelineResult<u64> {
    let content = fs::read_to_string(taxonomy_file).await.map_err(|e| {
        PipelineError::indexing(format!(
            "Failed to read taxonomy file {}: {}",
            taxonomy_file.display(),
            e
        ))
    })?;
    let terms = parse_taxonomy(&content);
    log::info!(
        "Indexing {} taxonomy terms from {} into {}",
        terms.len(),
        taxonomy_file.display(),
        alias
    );

    let documents: Vec<BulkDocument> = terms.iter().map(TaxonomyTerm::to_bulk_document).collect();
    let bar = setup_index_bar(Some(documents.len() as u64), "Taxonomy", quiet);
    let indexed = bulk_insert(backend, alias, documents, chunk_size, bar.as_ref()).await;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }
    let indexed = indexed?;

    backend.refresh(alias).await?;
    Ok(indexed)
}
