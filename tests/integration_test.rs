use anyhow::Result;
use complaints_indexer::backend::memory::MemoryBackend;
use complaints_indexer::cli::Cli;
use complaints_indexer::pipeline::{Pipeline, PipelineState};
use complaints_indexer::settings::{FileConfig, Settings};
use serde_json::{Value, json};
use std::path::Path;
use std::process::{Command, Output};

const ES_ENV_VARS: [&str; 5] = ["ES_HOST", "ES_PORT", "ES_USERNAME", "ES_PASSWORD", "INDEX_NAME"];

// Write a small rows.json export plus index definition and taxonomy files
fn write_dataset(dir: &Path, rows: Value) -> Result<()> {
    let document = json!({
        "meta": { "view": { "columns": [
            { "fieldName": ":sid", "name": "sid" },
            { "fieldName": ":id", "name": "id" },
            { "fieldName": "date_received", "name": "Date received" },
            { "fieldName": "product", "name": "Product" },
            { "fieldName": "company", "name": "Company" },
            { "fieldName": "complaint_id", "name": "Complaint ID" }
        ] } },
        "data": rows
    });
    std::fs::write(dir.join("rows.json"), serde_json::to_vec(&document)?)?;
    std::fs::write(
        dir.join("settings.json"),
        r#"{"settings": {"number_of_shards": 1, "number_of_replicas": 0}}"#,
    )?;
    std::fs::write(
        dir.join("mapping.json"),
        r#"{"properties": {"complaint_id": {"type": "keyword"}, "product": {"type": "keyword"}}}"#,
    )?;
    std::fs::write(
        dir.join("taxonomy.txt"),
        "# products\nMortgage\nCredit card\nDebt collection\n",
    )?;
    Ok(())
}

fn rows(n: u32) -> Value {
    Value::Array(
        (1..=n)
            .map(|i| {
                json!([
                    i,
                    format!("row-{}", i),
                    "2024-01-15T00:00:00",
                    if i % 2 == 0 { "Mortgage" } else { "Credit card" },
                    format!("Company {}", i % 3),
                    format!("{}", 9000 + i)
                ])
            })
            .collect(),
    )
}

fn cli_for(dir: &Path, index_name: &str) -> Cli {
    Cli {
        es_host: Some("localhost".to_string()),
        es_port: Some("9200".to_string()),
        index_name: Some(index_name.to_string()),
        dataset_url: Some(dir.join("rows.json").display().to_string()),
        output_file: Some(dir.join("ccdb").join("ccdb_output.json")),
        settings_file: Some(dir.join("settings.json")),
        mapping_file: Some(dir.join("mapping.json")),
        taxonomy_file: Some(dir.join("taxonomy.txt")),
        state_dir: Some(dir.to_path_buf()),
        check_stability: true,
        quiet: true,
        ..Cli::default()
    }
}

fn settings_for(dir: &Path, index_name: &str) -> Result<Settings> {
    Ok(Settings::resolve(
        &cli_for(dir, index_name),
        &FileConfig::default(),
        |_: &str| None,
    )?)
}

// Run the complaints-indexer binary in `dir` with no ES_* variables set
fn run_indexer_command(dir: &Path, args: &[&str]) -> Result<Output> {
    let mut command = Command::new(env!("CARGO_BIN_EXE_complaints-indexer"));
    command.current_dir(dir).args(args);
    for key in ES_ENV_VARS {
        command.env_remove(key);
    }
    Ok(command.output()?)
}

#[tokio::test]
async fn test_pipeline_end_to_end() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path(), rows(25))?;
    let settings = settings_for(dir.path(), "complaints")?;
    let backend = MemoryBackend::new();

    let report = Pipeline::new(&settings, &backend).run().await?;

    assert_eq!(report.records_fetched, 25);
    assert_eq!(report.documents_indexed, 25);
    assert_eq!(report.taxonomy_indexed, Some(3));

    // The normalized file carries only the non-system columns
    let written: Vec<Value> =
        serde_json::from_slice(&std::fs::read(&settings.output_file)?)?;
    assert_eq!(written.len(), 25);
    let first = written[0].as_object().unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(first["complaint_id"], "9001");
    assert!(!first.contains_key(":sid"));

    let docs = backend.documents("complaints-v1");
    assert_eq!(docs.len(), 28);
    assert_eq!(docs["9002"]["product"], "Mortgage");
    assert_eq!(docs["9002"]["doc_type"], "complaint");
    assert_eq!(docs["taxonomy-debt-collection"]["taxonomy"], "Debt collection");
    assert_eq!(
        backend.aliases_of("complaints"),
        vec!["complaints-v1".to_string()]
    );

    // Snapshot records the count seen before this run
    assert_eq!(
        std::fs::read_to_string(settings.snapshot_path())?.trim(),
        "0"
    );

    Ok(())
}

#[tokio::test]
async fn test_rerun_keeps_single_alias_target() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path(), rows(10))?;
    let settings = settings_for(dir.path(), "complaints")?;
    let backend = MemoryBackend::new();

    Pipeline::new(&settings, &backend).run().await?;
    let first = backend.documents("complaints-v1");

    let mut pipeline = Pipeline::new(&settings, &backend);
    let report = pipeline.run().await?;

    assert_eq!(pipeline.state(), PipelineState::Done);
    assert_eq!(report.documents_backed_up, Some(13));
    assert_eq!(backend.documents("complaints-v1"), first);
    assert_eq!(backend.documents("complaints-v2"), first);
    assert_eq!(
        backend.aliases_of("complaints"),
        vec!["complaints-v1".to_string()]
    );
    assert_eq!(
        std::fs::read_to_string(settings.snapshot_path())?.trim(),
        "13"
    );

    Ok(())
}

#[tokio::test]
async fn test_shrinking_index_stops_second_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_dataset(dir.path(), rows(10))?;
    let settings = settings_for(dir.path(), "complaints")?;
    let backend = MemoryBackend::new();
    Pipeline::new(&settings, &backend).run().await?;
    std::fs::write(settings.snapshot_path(), "500\n")?;

    let mut pipeline = Pipeline::new(&settings, &backend);
    let result = pipeline.run().await;

    assert!(result.is_err());
    assert_eq!(pipeline.state(), PipelineState::Failed);
    assert_eq!(std::fs::read_to_string(settings.snapshot_path())?, "500\n");
    assert!(
        !backend.index_names().contains(&"complaints-v2".to_string()),
        "No backup should be taken after a failed stability check"
    );

    Ok(())
}

#[test]
fn test_missing_index_name_fails() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = run_indexer_command(dir.path(), &["-o", "localhost", "-p", "9200", "--quiet"])?;

    assert!(!output.status.success(), "Expected a non-zero exit status");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("index_name"),
        "Error should name the missing setting: {}",
        stderr
    );
    assert_eq!(
        stderr.matches("Missing required setting").count(),
        1,
        "Error should be reported once: {}",
        stderr
    );

    Ok(())
}

#[test]
fn test_unreachable_cluster_reported_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let output = run_indexer_command(
        dir.path(),
        &["-o", "127.0.0.1", "-p", "1", "-i", "complaints", "--timeout-secs", "5", "--quiet"],
    )?;

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(
        stderr.matches("Connection error").count(),
        1,
        "Error should be reported once: {}",
        stderr
    );
    assert!(
        !dir.path().join("complaints").exists(),
        "Nothing should be fetched when the cluster is unreachable"
    );

    Ok(())
}

#[test]
fn test_dump_config_reports_sources() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("config.toml"),
        "es_port = 9201\nindex_name = \"from-file\"\n",
    )?;

    let output = run_indexer_command(
        dir.path(),
        &["--dump-config", "-o", "es.internal", "-a", "secret"],
    )?;

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = |key: &str| {
        stdout
            .lines()
            .find(|l| l.starts_with(key))
            .unwrap_or_default()
            .to_string()
    };
    assert!(line("es_host").contains("es.internal"));
    assert!(line("es_host").contains("(command line)"));
    assert!(line("es_port").contains("9201"));
    assert!(line("es_port").contains("(config file)"));
    assert!(line("index_name").contains("from-file"));
    assert!(line("bulk_chunk_size").contains("(default)"));
    assert!(line("es_password").contains("********"));
    assert!(!stdout.contains("secret"));

    Ok(())
}

#[test]
fn test_save_config_round_trips() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let saved = dir.path().join("saved.toml");
    let output = run_indexer_command(
        dir.path(),
        &[
            "-o",
            "localhost",
            "-p",
            "9200",
            "-i",
            "complaints",
            "--check-stability",
            "--save-config",
            saved.to_str().unwrap(),
        ],
    )?;
    assert!(output.status.success());

    let config = FileConfig::parse(&std::fs::read_to_string(&saved)?)?;
    assert_eq!(config.es_host.as_deref(), Some("localhost"));
    assert_eq!(config.index_name.as_deref(), Some("complaints"));
    assert_eq!(config.check_stability, Some(true));
    assert_eq!(config.bulk_chunk_size, Some(500));

    Ok(())
}

#[cfg(feature = "es_integration_test")]
mod live {
    use super::*;
    use complaints_indexer::backend::SearchBackend;
    use complaints_indexer::elasticsearch::ElasticsearchBackend;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const TEST_INDEX_PREFIX: &str = "complaints_indexer_test";

    // Static counter to ensure unique index names for parallel test execution
    static INDEX_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn get_unique_test_index() -> String {
        let counter = INDEX_COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("{}_{}_{}", TEST_INDEX_PREFIX, std::process::id(), counter)
    }

    // Wait for Elasticsearch at localhost:9200 to answer a ping
    async fn wait_for_elasticsearch(backend: &ElasticsearchBackend) -> Result<()> {
        for attempt in 1..=5 {
            println!(
                "Attempting to connect to Elasticsearch (attempt {})",
                attempt
            );
            match backend.ping().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt == 5 => {
                    return Err(anyhow::anyhow!(
                        "Failed to connect to Elasticsearch: {}",
                        err
                    ));
                }
                Err(err) => {
                    println!("Connection failed: {}. Retrying in 2 seconds...", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
        unreachable!()
    }

    async fn cleanup(backend: &ElasticsearchBackend, settings: &Settings) {
        let _ = backend.delete_index(&settings.primary_index()).await;
        let _ = backend.delete_index(&settings.backup_index()).await;
    }

    #[tokio::test]
    async fn test_live_versioned_rebuild() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_dataset(dir.path(), rows(120))?;
        let settings = settings_for(dir.path(), &get_unique_test_index())?;
        let backend = ElasticsearchBackend::connect(&settings)?;
        wait_for_elasticsearch(&backend).await?;

        let first = Pipeline::new(&settings, &backend).run().await?;
        assert_eq!(first.documents_indexed, 120);
        assert_eq!(backend.count(settings.alias()).await?, Some(123));

        let second = Pipeline::new(&settings, &backend).run().await?;
        assert_eq!(second.documents_backed_up, Some(123));
        assert_eq!(
            backend.alias_targets(settings.alias()).await?,
            vec![settings.primary_index()]
        );
        assert_eq!(backend.count(&settings.backup_index()).await?, Some(123));
        assert_eq!(backend.count(settings.alias()).await?, Some(123));

        cleanup(&backend, &settings).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_live_stability_violation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_dataset(dir.path(), rows(5))?;
        let settings = settings_for(dir.path(), &get_unique_test_index())?;
        let backend = ElasticsearchBackend::connect(&settings)?;
        wait_for_elasticsearch(&backend).await?;

        Pipeline::new(&settings, &backend).run().await?;
        std::fs::write(settings.snapshot_path(), "100000\n")?;

        let mut pipeline = Pipeline::new(&settings, &backend);
        assert!(pipeline.run().await.is_err());
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(
            std::fs::read_to_string(settings.snapshot_path())?,
            "100000\n"
        );

        cleanup(&backend, &settings).await;
        Ok(())
    }
}
