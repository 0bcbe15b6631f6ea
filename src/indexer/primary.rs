use indicatif::ProgressBar;
use serde::de::{self, SeqAccess, Visitor};
use serde_json::{Value, json};
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use std::time::Instant;
use tokio::fs;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{point_alias, send_batch, with_doc_type};
use crate::backend::{BulkDocument, SearchBackend};
use crate::error::{PipelineError, PipelineResult};
use crate::fetch::COMPLAINT_ID_FIELD;
use crate::progress::setup_index_bar;

/// Batches read ahead of the bulk requests
const BATCH_BUFFER: usize = 2;

/// Everything needed to rebuild the primary index
#[derive(Debug, Clone)]
pub struct PrimaryIndexJob<'a> {
    pub target_index: &'a str,
    pub backup_index: &'a str,
    pub alias: &'a str,
    pub settings_file: &'a Path,
    pub mapping_file: &'a Path,
    pub data_file: &'a Path,
    pub chunk_size: usize,
    /// Record count reported by the fetch, used for the progress bar
    pub expected_documents: Option<u64>,
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryIndexReport {
    pub indexed: u64,
    /// Documents copied to the backup index, `None` on the first build
    pub backed_up: Option<u64>,
}

async fn read_json_file(path: &Path, what: &str) -> PipelineResult<Value> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        PipelineError::indexing(format!(
            "Failed to read {} file {}: {}",
            what,
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        PipelineError::indexing(format!(
            "Failed to parse {} file {}: {}",
            what,
            path.display(),
            e
        ))
    })
}

/// Accept either the bare object or one wrapped in its top-level key
fn unwrap_key(mut value: Value, key: &str) -> Value {
    if let Some(obj) = value.as_object_mut() {
        if obj.len() == 1 && obj.contains_key(key) {
            return obj.remove(key).unwrap_or(Value::Null);
        }
    }
    value
}

/// Build the index creation body from the settings and mapping documents
pub async fn load_index_definition(
    settings_file: &Path,
    mapping_file: &Path,
) -> PipelineResult<Value> {
    let settings = unwrap_key(read_json_file(settings_file, "index settings").await?, "settings");
    let mappings = unwrap_key(read_json_file(mapping_file, "mapping").await?, "mappings");
    if !settings.is_object() || !mappings.is_object() {
        return Err(PipelineError::indexing(
            "Index settings and mapping must both be JSON objects",
        ));
    }
    Ok(json!({ "settings": settings, "mappings": mappings }))
}

/// Document `_id` taken from the complaint id, when the record has one
fn complaint_id(record: &Value) -> Option<String> {
    match &record[COMPLAINT_ID_FIELD] {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn complaint_document(record: Value) -> BulkDocument {
    BulkDocument {
        id: complaint_id(&record),
        source: with_doc_type(record),
    }
}

struct BatchVisitor<'a> {
    sender: &'a mpsc::Sender<Vec<BulkDocument>>,
    chunk_size: usize,
}

impl BatchVisitor<'_> {
    fn send<E: de::Error>(&self, batch: Vec<BulkDocument>) -> Result<(), E> {
        self.sender
            .blocking_send(batch)
            .map_err(|_| E::custom("indexing stopped before the dataset was read"))
    }
}

impl<'de> Visitor<'de> for BatchVisitor<'_> {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a JSON array of complaint records")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<u64, A::Error> {
        let mut batch = Vec::with_capacity(self.chunk_size);
        let mut total = 0u64;
        while let Some(record) = seq.next_element::<Value>()? {
            batch.push(complaint_document(record));
            total += 1;
            if batch.len() == self.chunk_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.chunk_size));
                self.send::<A::Error>(full)?;
            }
        }
        if !batch.is_empty() {
            self.send::<A::Error>(batch)?;
        }
        Ok(total)
    }
}

fn read_batches(
    data_file: &Path,
    chunk_size: usize,
    sender: &mpsc::Sender<Vec<BulkDocument>>,
) -> PipelineResult<u64> {
    let not_an_array = |e: serde_json::Error| {
        PipelineError::parse(format!(
            "Dataset file {} is not a JSON array: {}",
            data_file.display(),
            e
        ))
    };
    let file = std::fs::File::open(data_file)?;
    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
    let total = serde::Deserializer::deserialize_seq(
        &mut deserializer,
        BatchVisitor { sender, chunk_size },
    )
    .map_err(not_an_array)?;
    deserializer.end().map_err(not_an_array)?;
    Ok(total)
}

/// Read the dataset file on a blocking thread in batches of `chunk_size`
pub fn read_complaint_batches(
    data_file: &Path,
    chunk_size: usize,
) -> (
    mpsc::Receiver<Vec<BulkDocument>>,
    JoinHandle<PipelineResult<u64>>,
) {
    let (tx, rx) = mpsc::channel(BATCH_BUFFER);
    let path = data_file.to_path_buf();
    let chunk_size = chunk_size.max(1);
    let reader = tokio::task::spawn_blocking(move || read_batches(&path, chunk_size, &tx));
    (rx, reader)
}

async fn load_complaints<B: SearchBackend + ?Sized>(
    backend: &B,
    job: &PrimaryIndexJob<'_>,
    bar: Option<&ProgressBar>,
) -> PipelineResult<u64> {
    let (mut batches, reader) = read_complaint_batches(job.data_file, job.chunk_size);
    let mut indexed = 0u64;
    let mut batch_num = 0usize;
    while let Some(batch) = batches.recv().await {
        batch_num += 1;
        indexed += send_batch(backend, job.target_index, batch, batch_num).await?;
        if let Some(bar) = bar {
            bar.set_position(indexed);
        }
    }

    let read = reader
        .await
        .map_err(|e| PipelineError::parse(format!("Dataset reader panicked: {}", e)))??;
    log::debug!("Read {} complaints from {}", read, job.data_file.display());
    Ok(indexed)
}

/// Copy the live content aside before the target is rebuilt
async fn prepare_backup<B: SearchBackend + ?Sized>(
    backend: &B,
    job: &PrimaryIndexJob<'_>,
    definition: &Value,
    live: &[String],
) -> PipelineResult<Option<u64>> {
    // A failed earlier run leaves readers on the backup; it is the last good data
    if live.iter().any(|t| t == job.backup_index) {
        log::warn!(
            "Alias {} still points at {} from an earlier failed run, keeping it as the backup",
            job.alias,
            job.backup_index
        );
        return backend.count(job.backup_index).await;
    }

    log::debug!("Dropping previous backup index {}", job.backup_index);
    backend.delete_index(job.backup_index).await?;

    if !live.iter().any(|t| t == job.target_index) {
        if backend.index_exists(job.target_index).await? {
            log::info!(
                "{} is not behind alias {}, rebuilding it without a backup",
                job.target_index,
                job.alias
            );
        } else {
            log::info!("No existing {}, building it from scratch", job.target_index);
        }
        return Ok(None);
    }

    log::info!(
        "Backing up {} into {}",
        job.target_index,
        job.backup_index
    );
    backend.create_index(job.backup_index, definition).await?;
    let copied = backend.reindex(job.target_index, job.backup_index).await?;
    point_alias(backend, job.alias, job.backup_index).await?;
    Ok(Some(copied))
}

/// Rebuild `target_index` and move the alias onto it. The index the alias
/// points at is never deleted.
pub async fn index_primary<B: SearchBackend + ?Sized>(
    backend: &B,
    job: &PrimaryIndexJob<'_>,
) -> PipelineResult<PrimaryIndexReport> {
    let start = Instant::now();
    let definition = load_index_definition(job.settings_file, job.mapping_file).await?;
    fs::metadata(job.data_file).await?;

    let live = backend.alias_targets(job.alias).await?;
    if live.is_empty() && backend.index_exists(job.alias).await? {
        return Err(PipelineError::indexing(format!(
            "'{}' is a concrete index, it cannot be used as an alias",
            job.alias
        )));
    }

    let backed_up = prepare_backup(backend, job, &definition, &live).await?;

    backend.delete_index(job.target_index).await?;
    backend.create_index(job.target_index, &definition).await?;

    let bar = setup_index_bar(job.expected_documents, "Complaints", job.quiet);
    let indexed = load_complaints(backend, job, bar.as_ref()).await;
    if let Some(bar) = &bar {
        match &indexed {
            Ok(count) => bar.finish_with_message(format!("Indexed {} complaints", count)),
            Err(_) => bar.abandon_with_message("Indexing failed"),
        }
    }
    let indexed = indexed?;

    backend.refresh(job.target_index).await?;
    point_alias(backend, job.alias, job.target_index).await?;

    log::info!(
        "Indexed {} complaints into {} (alias {}) in {:.2?}",
        indexed,
        job.target_index,
        job.alias,
        start.elapsed()
    );
    Ok(PrimaryIndexReport { indexed, backed_up })
}
