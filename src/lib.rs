pub mod backend;
pub mod cli;
pub mod elasticsearch;
pub mod error;
pub mod fetch;
pub mod indexer;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod settings;
pub mod stability;

pub use error::{PipelineError, PipelineResult};

fn init_logging(args: &cli::Cli) {
    // Configure logger based on debug flag
    if args.debug {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::debug!("Debug logging enabled");
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .init();
    }
}

pub async fn run() -> anyhow::Result<()> {
    use anyhow::Context;
    use clap::Parser;

    let args = cli::Cli::parse();
    init_logging(&args);

    // Enable colors if not in quiet mode
    if !args.quiet {
        console::set_colors_enabled(true);
        log::debug!("Console colors enabled");
    }

    let settings = settings::Settings::load(&args)?;

    if args.dump_config {
        print!("{}", settings.format_values());
        return Ok(());
    }

    if let Some(path) = &args.save_config {
        settings
            .save(path)
            .with_context(|| format!("Failed to save config to {}", path.display()))?;
        return Ok(());
    }

    log::info!(
        "Indexing complaints into alias {} at {}",
        settings.alias(),
        settings.es_url()
    );

    // Set up Elasticsearch client
    let backend = elasticsearch::ElasticsearchBackend::connect(&settings)?;

    let mut pipeline = pipeline::Pipeline::new(&settings, &backend);
    let report = pipeline.run().await?;

    log::info!(
        "Run complete: {} records fetched, {} complaints indexed, {} taxonomy terms indexed",
        report.records_fetched,
        report.documents_indexed,
        report
            .taxonomy_indexed
            .map_or_else(|| "no".to_string(), |n| n.to_string())
    );
    Ok(())
}
