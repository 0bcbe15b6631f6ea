use log::{debug, info};
use std::fmt;
use std::time::Instant;

use crate::backend::SearchBackend;
use crate::error::PipelineResult;
use crate::fetch::fetch_dataset;
use crate::indexer::{PrimaryIndexJob, index_primary, index_taxonomy};
use crate::settings::Settings;
use crate::stability::{CountSnapshot, StabilityReport, check_stability};

/// Steps of one run; `Failed` can follow any of them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PipelineState {
    #[default]
    Idle,
    Connected,
    Verified,
    Fetched,
    PrimaryIndexed,
    TaxonomyIndexed,
    Done,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a successful run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub final_state: PipelineState,
    pub stability: Option<StabilityReport>,
    pub records_fetched: usize,
    pub documents_indexed: u64,
    pub documents_backed_up: Option<u64>,
    pub taxonomy_indexed: Option<u64>,
}

pub struct Pipeline<'a, B: SearchBackend + ?Sized> {
    settings: &'a Settings,
    backend: &'a B,
    state: PipelineState,
    history: Vec<PipelineState>,
}

impl<'a, B: SearchBackend + ?Sized> Pipeline<'a, B> {
    pub fn new(settings: &'a Settings, backend: &'a B) -> Self {
        Self {
            settings,
            backend,
            state: PipelineState::Idle,
            history: vec![PipelineState::Idle],
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`
    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    fn transition(&mut self, next: PipelineState) {
        debug!("Pipeline state {} -> {}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Run every step once; any error moves the pipeline to `Failed`
    pub async fn run(&mut self) -> PipelineResult<RunReport> {
        if self.state != PipelineState::Idle {
            debug!("Restarting pipeline from Idle (was {})", self.state);
            self.state = PipelineState::Idle;
            self.history = vec![PipelineState::Idle];
        }

        let start = Instant::now();
        match self.execute().await {
            Ok(report) => {
                info!("Pipeline finished in {:.2?}", start.elapsed());
                Ok(report)
            }
            Err(e) => {
                debug!("Pipeline failed while in state {}", self.state);
                self.transition(PipelineState::Failed);
                Err(e)
            }
        }
    }

    async fn execute(&mut self) -> PipelineResult<RunReport> {
        let settings = self.settings;
        let backend = self.backend;
        let mut report = RunReport::default();

        info!("Connecting to Elasticsearch at {}", settings.es_url());
        backend.ping().await?;
        self.transition(PipelineState::Connected);

        if settings.check_stability {
            info!("Checking document count stability of {}", settings.alias());
            let snapshot = CountSnapshot::new(settings.snapshot_path());
            report.stability = Some(check_stability(backend, settings.alias(), &snapshot).await?);
            self.transition(PipelineState::Verified);
        }

        info!("Begin processing input");
        let fetched = fetch_dataset(&settings.dataset_url, &settings.output_file).await?;
        report.records_fetched = fetched.records;
        self.transition(PipelineState::Fetched);

        info!("Begin indexing data in Elasticsearch");
        let primary_index = settings.primary_index();
        let backup_index = settings.backup_index();
        let job = PrimaryIndexJob {
            target_index: &primary_index,
            backup_index: &backup_index,
            alias: settings.alias(),
            settings_file: &settings.settings_file,
            mapping_file: &settings.mapping_file,
            data_file: &settings.output_file,
            chunk_size: settings.bulk_chunk_size,
            expected_documents: Some(fetched.records as u64),
            quiet: settings.quiet,
        };
        let primary = index_primary(backend, &job).await?;
        report.documents_indexed = primary.indexed;
        report.documents_backed_up = primary.backed_up;
        self.transition(PipelineState::PrimaryIndexed);

        if settings.index_taxonomy {
            info!("Begin indexing taxonomy");
            let indexed = index_taxonomy(
                backend,
                &settings.taxonomy_file,
                settings.alias(),
                settings.bulk_chunk_size,
                settings.quiet,
            )
            .await?;
            report.taxonomy_indexed = Some(indexed);
            self.transition(PipelineState::TaxonomyIndexed);
        }

        self.transition(PipelineState::Done);
        report.final_state = self.state;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::cli::Cli;
    use crate::error::PipelineError;
    use crate::settings::FileConfig;
    use serde_json::json;
    use std::path::Path;

    fn write_fixture(dir: &Path, rows: serde_json::Value) {
        std::fs::write(
            dir.join("rows.json"),
            serde_json::to_vec(&json!({
                "meta": { "view": { "columns": [
                    { "fieldName": ":sid" },
                    { "fieldName": "product" },
                    { "fieldName": "complaint_id" }
                ] } },
                "data": rows
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(dir.join("settings.json"), "{}").unwrap();
        std::fs::write(dir.join("mapping.json"), r#"{"properties": {}}"#).unwrap();
        std::fs::write(dir.join("taxonomy.txt"), "Mortgage\nCredit card\n").unwrap();
    }

    fn settings_for(dir: &Path, check_stability: bool, skip_taxonomy: bool) -> Settings {
        let cli = Cli {
            es_host: Some("localhost".to_string()),
            es_port: Some("9200".to_string()),
            index_name: Some("complaints".to_string()),
            dataset_url: Some(dir.join("rows.json").display().to_string()),
            output_file: Some(dir.join("out").join("ccdb_output.json")),
            settings_file: Some(dir.join("settings.json")),
            mapping_file: Some(dir.join("mapping.json")),
            taxonomy_file: Some(dir.join("taxonomy.txt")),
            state_dir: Some(dir.to_path_buf()),
            check_stability,
            skip_taxonomy,
            quiet: true,
            ..Cli::default()
        };
        Settings::resolve(&cli, &FileConfig::default(), |_: &str| None).unwrap()
    }

    #[tokio::test]
    async fn test_full_run_reaches_done() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), json!([[1, "Mortgage", "10"], [2, "Student loan", "11"]]));
        let settings = settings_for(dir.path(), true, false);
        let backend = MemoryBackend::new();

        let mut pipeline = Pipeline::new(&settings, &backend);
        let report = pipeline.run().await.unwrap();

        assert_eq!(
            pipeline.history(),
            &[
                PipelineState::Idle,
                PipelineState::Connected,
                PipelineState::Verified,
                PipelineState::Fetched,
                PipelineState::PrimaryIndexed,
                PipelineState::TaxonomyIndexed,
                PipelineState::Done,
            ]
        );
        assert_eq!(report.final_state, PipelineState::Done);
        assert_eq!(report.records_fetched, 2);
        assert_eq!(report.documents_indexed, 2);
        assert_eq!(report.taxonomy_indexed, Some(2));
        assert_eq!(
            report.stability,
            Some(StabilityReport {
                previous: 0,
                current: 0
            })
        );
        assert_eq!(backend.documents("complaints-v1").len(), 4);
    }

    #[tokio::test]
    async fn test_toggles_skip_optional_states() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), json!([]));
        let settings = settings_for(dir.path(), false, true);
        let backend = MemoryBackend::new();

        let mut pipeline = Pipeline::new(&settings, &backend);
        let report = pipeline.run().await.unwrap();

        assert_eq!(
            pipeline.history(),
            &[
                PipelineState::Idle,
                PipelineState::Connected,
                PipelineState::Fetched,
                PipelineState::PrimaryIndexed,
                PipelineState::Done,
            ]
        );
        assert_eq!(report.documents_indexed, 0);
        assert_eq!(report.taxonomy_indexed, None);
        assert!(!backend.operations().iter().any(|op| op == "count"));
    }

    #[tokio::test]
    async fn test_unreachable_backend_fails_before_fetch() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), json!([[1, "Mortgage", "10"]]));
        let settings = settings_for(dir.path(), false, false);
        let backend = MemoryBackend::unreachable();

        let mut pipeline = Pipeline::new(&settings, &backend);
        let err = pipeline.run().await.unwrap_err();

        assert!(matches!(err, PipelineError::Connection(_)));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(
            pipeline.history(),
            &[PipelineState::Idle, PipelineState::Failed]
        );
        assert!(!settings.output_file.exists());
    }

    #[tokio::test]
    async fn test_stability_violation_skips_indexing() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), json!([[1, "Mortgage", "10"]]));
        let settings = settings_for(dir.path(), true, false);
        std::fs::write(settings.snapshot_path(), "1000\n").unwrap();
        let backend = MemoryBackend::new();
        backend.seed_index("complaints-v1", 950);
        backend.set_alias("complaints", "complaints-v1");

        let mut pipeline = Pipeline::new(&settings, &backend);
        let err = pipeline.run().await.unwrap_err();

        assert!(matches!(err, PipelineError::StabilityViolation { .. }));
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(
            std::fs::read_to_string(settings.snapshot_path()).unwrap(),
            "1000\n"
        );
        assert_eq!(backend.documents("complaints-v1").len(), 950);
        assert!(!backend.operations().iter().any(|op| op == "bulk_index"));
    }

    #[tokio::test]
    async fn test_malformed_dataset_fails_in_connected() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), json!([]));
        std::fs::write(dir.path().join("rows.json"), "{ broken").unwrap();
        let settings = settings_for(dir.path(), false, false);
        let backend = MemoryBackend::new();

        let mut pipeline = Pipeline::new(&settings, &backend);
        let err = pipeline.run().await.unwrap_err();

        assert!(matches!(err, PipelineError::Parse(_)));
        assert_eq!(
            pipeline.history(),
            &[
                PipelineState::Idle,
                PipelineState::Connected,
                PipelineState::Failed
            ]
        );
        assert!(backend.index_names().is_empty());
    }
}
