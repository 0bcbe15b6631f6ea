use clap::Parser;
use std::path::PathBuf;

/// Command line flags; all optional so the config file and environment can fill gaps
#[derive(Parser, Debug, Clone, Default)]
#[clap(
    author,
    version,
    about = "Download consumer complaints and index them in Elasticsearch"
)]
pub struct Cli {
    /// TOML config file (default: ./config.toml when it exists)
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Print resolved config values and their source, then exit
    #[clap(long)]
    pub dump_config: bool,

    /// Write resolved config values to a TOML file, then exit
    #[clap(long, value_name = "PATH")]
    pub save_config: Option<PathBuf>,

    /// Elasticsearch host [env: ES_HOST]
    #[clap(short = 'o', long)]
    pub es_host: Option<String>,

    /// Elasticsearch port [env: ES_PORT]
    #[clap(short = 'p', long)]
    pub es_port: Option<String>,

    /// Elasticsearch username [env: ES_USERNAME]
    #[clap(short = 'u', long)]
    pub es_username: Option<String>,

    /// Elasticsearch password [env: ES_PASSWORD]
    #[clap(short = 'a', long)]
    pub es_password: Option<String>,

    /// Elasticsearch index alias; versions are created as <name>-v1 and <name>-v2
    #[clap(short = 'i', long)]
    pub index_name: Option<String>,

    /// Dataset URL (http, https or file) or local path of a rows.json document
    #[clap(long)]
    pub dataset_url: Option<String>,

    /// Where the normalized dataset is written before indexing
    #[clap(long)]
    pub output_file: Option<PathBuf>,

    /// Index settings JSON document
    #[clap(long)]
    pub settings_file: Option<PathBuf>,

    /// Field mapping JSON document
    #[clap(long)]
    pub mapping_file: Option<PathBuf>,

    /// Taxonomy text file, one term per line
    #[clap(long)]
    pub taxonomy_file: Option<PathBuf>,

    /// Directory holding the document count snapshot
    #[clap(long)]
    pub state_dir: Option<PathBuf>,

    /// Fail the run if the live index holds fewer documents than last time
    #[clap(long)]
    pub check_stability: bool,

    /// Do not index the taxonomy file
    #[clap(long)]
    pub skip_taxonomy: bool,

    /// Number of documents per bulk request
    #[clap(long)]
    pub bulk_chunk_size: Option<usize>,

    /// Elasticsearch request timeout in seconds
    #[clap(long)]
    pub timeout_secs: Option<u64>,

    /// Quiet mode, suppress progress output
    #[clap(long)]
    pub quiet: bool,

    /// Debug mode, enable verbose logging
    #[clap(long)]
    pub debug: bool,
}
