use std::path::{Path, PathBuf};
use tokio::fs;

use crate::backend::SearchBackend;
use crate::error::{PipelineError, PipelineResult};
use crate::output::write_atomically;

/// Persisted document count for one index
#[derive(Debug, Clone)]
pub struct CountSnapshot {
    path: PathBuf,
}

impl CountSnapshot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored count; a missing file counts as 0
    pub async fn read(&self) -> PipelineResult<u64> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No count snapshot at {}", self.path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        trimmed.parse::<u64>().map_err(|e| {
            PipelineError::parse(format!(
                "Invalid count snapshot {} ({:?}): {}",
                self.path.display(),
                trimmed,
                e
            ))
        })
    }

    pub async fn write(&self, count: u64) -> PipelineResult<()> {
        write_atomically(&self.path, format!("{}\n", count).as_bytes()).await
    }
}

/// Outcome of a passing check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StabilityReport {
    pub previous: u64,
    pub current: u64,
}

/// Decide whether a count change is acceptable
pub fn evaluate(index: &str, previous: u64, current: u64) -> PipelineResult<StabilityReport> {
    if current < previous {
        return Err(PipelineError::StabilityViolation {
            index: index.to_string(),
            previous,
            current,
        });
    }
    Ok(StabilityReport { previous, current })
}

/// Compare the live count with the snapshot, advancing it only on a pass
pub async fn check_stability<B: SearchBackend + ?Sized>(
    backend: &B,
    index: &str,
    snapshot: &CountSnapshot,
) -> PipelineResult<StabilityReport> {
    let current = match backend.count(index).await? {
        Some(count) => count,
        None => {
            log::warn!("Index {} does not exist yet, treating its count as 0", index);
            0
        }
    };
    let previous = snapshot.read().await?;
    log::info!(
        "Stability check for {}: previous count {}, current count {}",
        index,
        previous,
        current
    );

    let report = evaluate(index, previous, current)?;
    snapshot.write(current).await?;
    log::debug!(
        "Count snapshot {} updated to {}",
        snapshot.path().display(),
        current
    );
    Ok(report)
}
