use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::cli::Cli;
use crate::error::{PipelineError, PipelineResult};

pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const DEFAULT_DATASET_URL: &str =
    "https://data.consumerfinance.gov/api/views/s6ew-h6mp/rows.json";
pub const DEFAULT_OUTPUT_FILE: &str = "complaints/ccdb/ccdb_output.json";
pub const DEFAULT_SETTINGS_FILE: &str = "complaints/settings.json";
pub const DEFAULT_MAPPING_FILE: &str = "complaints/ccdb/ccdb_mapping.json";
pub const DEFAULT_TAXONOMY_FILE: &str = "complaints/taxonomy/taxonomy.txt";
pub const DEFAULT_BULK_CHUNK_SIZE: usize = 500;
pub const DEFAULT_TIMEOUT_SECS: u64 = 1000;

/// Fixed document type attached to every indexed record
pub const DOC_TYPE_NAME: &str = "complaint";

const ENV_HOST: &str = "ES_HOST";
const ENV_PORT: &str = "ES_PORT";
const ENV_USERNAME: &str = "ES_USERNAME";
const ENV_PASSWORD: &str = "ES_PASSWORD";
const ENV_INDEX_NAME: &str = "INDEX_NAME";

/// Where a resolved value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    CommandLine,
    ConfigFile,
    Environment(&'static str),
    Default,
}

impl fmt::Display for ValueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueSource::CommandLine => write!(f, "command line"),
            ValueSource::ConfigFile => write!(f, "config file"),
            ValueSource::Environment(key) => write!(f, "environment variable {}", key),
            ValueSource::Default => write!(f, "default"),
        }
    }
}

/// A port may be written as `9200` or `"9200"` in the config file
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum PortValue {
    Number(u64),
    Text(String),
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::Number(n) => write!(f, "{}", n),
            PortValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Contents of the TOML config file. Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_port: Option<PortValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub es_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxonomy_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_stability: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_taxonomy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulk_chunk_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Load the config file; only an explicitly named file has to exist
    pub fn load(explicit: Option<&Path>) -> PipelineResult<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    log::debug!("No {} found, skipping config file", DEFAULT_CONFIG_FILE);
                    return Ok(Self::default());
                }
                default
            }
        };

        log::debug!("Loading config file: {}", path.display());
        let content = std::fs::read_to_string(&path).map_err(|e| {
            PipelineError::configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content).map_err(|e| {
            PipelineError::configuration(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// One line of `--dump-config` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedValue {
    pub key: &'static str,
    pub value: String,
    pub source: ValueSource,
}

/// Fully resolved settings for one run
#[derive(Debug, Clone)]
pub struct Settings {
    pub es_host: String,
    pub es_port: u16,
    pub es_username: String,
    pub es_password: String,
    pub index_name: String,
    pub dataset_url: String,
    pub output_file: PathBuf,
    pub settings_file: PathBuf,
    pub mapping_file: PathBuf,
    pub taxonomy_file: PathBuf,
    pub state_dir: PathBuf,
    pub check_stability: bool,
    pub index_taxonomy: bool,
    pub bulk_chunk_size: usize,
    pub timeout_secs: u64,
    /// Suppress progress bars; command line only
    pub quiet: bool,
    resolved: Vec<ResolvedValue>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Tracks each value's source while walking the precedence chain
struct Resolver<'a, E: Fn(&str) -> Option<String>> {
    env: &'a E,
    resolved: Vec<ResolvedValue>,
}

impl<E: Fn(&str) -> Option<String>> Resolver<'_, E> {
    fn pick<T: ToString>(
        &mut self,
        key: &'static str,
        cli: Option<T>,
        file: Option<T>,
        env_key: Option<&'static str>,
        parse_env: impl Fn(String) -> Option<T>,
    ) -> Option<(T, ValueSource)> {
        let picked = cli
            .map(|v| (v, ValueSource::CommandLine))
            .or_else(|| file.map(|v| (v, ValueSource::ConfigFile)))
            .or_else(|| {
                env_key.and_then(|k| {
                    non_empty((self.env)(k))
                        .and_then(&parse_env)
                        .map(|v| (v, ValueSource::Environment(k)))
                })
            });
        if let Some((value, source)) = &picked {
            self.record(key, value.to_string(), *source);
        }
        picked
    }

    fn or_default<T: ToString>(
        &mut self,
        key: &'static str,
        picked: Option<(T, ValueSource)>,
        default: T,
    ) -> T {
        match picked {
            Some((value, _)) => value,
            None => {
                self.record(key, default.to_string(), ValueSource::Default);
                default
            }
        }
    }

    fn record(&mut self, key: &'static str, value: String, source: ValueSource) {
        self.resolved.push(ResolvedValue { key, value, source });
    }
}

struct DisplayPath(PathBuf);

impl fmt::Display for DisplayPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl Settings {
    /// Resolve settings from the command line, config file and process environment
    pub fn load(cli: &Cli) -> PipelineResult<Self> {
        let file = FileConfig::load(cli.config.as_deref())?;
        Self::resolve(cli, &file, |key| std::env::var(key).ok())
    }

    /// Resolve settings from explicit sources; `env` looks up variables by name
    pub fn resolve<E>(cli: &Cli, file: &FileConfig, env: E) -> PipelineResult<Self>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut r = Resolver {
            env: &env,
            resolved: Vec::new(),
        };

        let es_host = r
            .pick(
                "es_host",
                non_empty(cli.es_host.clone()),
                non_empty(file.es_host.clone()),
                Some(ENV_HOST),
                Some,
            )
            .map(|(v, _)| v)
            .ok_or_else(|| missing("es_host", "--es-host", Some(ENV_HOST)))?;

        let port_raw = r
            .pick(
                "es_port",
                non_empty(cli.es_port.clone()),
                non_empty(file.es_port.as_ref().map(|p| p.to_string())),
                Some(ENV_PORT),
                Some,
            )
            .map(|(v, _)| v)
            .ok_or_else(|| missing("es_port", "--es-port", Some(ENV_PORT)))?;
        let es_port = parse_port(&port_raw)?;

        let username = r.pick(
            "es_username",
            cli.es_username.clone(),
            file.es_username.clone(),
            Some(ENV_USERNAME),
            Some,
        );
        let es_username = r.or_default("es_username", username, String::new());

        let password = r.pick(
            "es_password",
            cli.es_password.clone(),
            file.es_password.clone(),
            Some(ENV_PASSWORD),
            Some,
        );
        let es_password = r.or_default("es_password", password, String::new());

        let index_name = r
            .pick(
                "index_name",
                non_empty(cli.index_name.clone()),
                non_empty(file.index_name.clone()),
                Some(ENV_INDEX_NAME),
                Some,
            )
            .map(|(v, _)| v)
            .ok_or_else(|| missing("index_name", "--index-name", Some(ENV_INDEX_NAME)))?;
        validate_index_name(&index_name)?;

        let dataset_url = r.pick(
            "dataset_url",
            cli.dataset_url.clone(),
            file.dataset_url.clone(),
            None,
            Some,
        );
        let dataset_url =
            r.or_default("dataset_url", dataset_url, DEFAULT_DATASET_URL.to_string());

        let output_file = path_setting(
            &mut r,
            "output_file",
            &cli.output_file,
            &file.output_file,
            DEFAULT_OUTPUT_FILE,
        );
        let settings_file = path_setting(
            &mut r,
            "settings_file",
            &cli.settings_file,
            &file.settings_file,
            DEFAULT_SETTINGS_FILE,
        );
        let mapping_file = path_setting(
            &mut r,
            "mapping_file",
            &cli.mapping_file,
            &file.mapping_file,
            DEFAULT_MAPPING_FILE,
        );
        let taxonomy_file = path_setting(
            &mut r,
            "taxonomy_file",
            &cli.taxonomy_file,
            &file.taxonomy_file,
            DEFAULT_TAXONOMY_FILE,
        );
        let state_dir = path_setting(&mut r, "state_dir", &cli.state_dir, &file.state_dir, ".");

        // Boolean flags only override when they are present on the command line
        let check_stability = r.pick(
            "check_stability",
            cli.check_stability.then_some(true),
            file.check_stability,
            None,
            |_| None,
        );
        let check_stability = r.or_default("check_stability", check_stability, false);

        let index_taxonomy = r.pick(
            "index_taxonomy",
            cli.skip_taxonomy.then_some(false),
            file.index_taxonomy,
            None,
            |_| None,
        );
        let index_taxonomy = r.or_default("index_taxonomy", index_taxonomy, true);

        let bulk_chunk_size = r.pick(
            "bulk_chunk_size",
            cli.bulk_chunk_size,
            file.bulk_chunk_size,
            None,
            |_| None,
        );
        let bulk_chunk_size =
            r.or_default("bulk_chunk_size", bulk_chunk_size, DEFAULT_BULK_CHUNK_SIZE);
        if bulk_chunk_size == 0 {
            return Err(PipelineError::configuration("bulk_chunk_size must be > 0"));
        }

        let timeout_secs = r.pick(
            "timeout_secs",
            cli.timeout_secs,
            file.timeout_secs,
            None,
            |_| None,
        );
        let timeout_secs = r.or_default("timeout_secs", timeout_secs, DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(PipelineError::configuration("timeout_secs must be > 0"));
        }

        Ok(Settings {
            es_host,
            es_port,
            es_username,
            es_password,
            index_name,
            dataset_url,
            output_file,
            settings_file,
            mapping_file,
            taxonomy_file,
            state_dir,
            check_stability,
            index_taxonomy,
            bulk_chunk_size,
            timeout_secs,
            quiet: cli.quiet,
            resolved: r.resolved,
        })
    }

    /// The alias consumers query; it is the configured index name
    pub fn alias(&self) -> &str {
        &self.index_name
    }

    /// Physical index holding the current data
    pub fn primary_index(&self) -> String {
        format!("{}-v1", self.index_name)
    }

    /// Physical index holding the previous data for rollback
    pub fn backup_index(&self) -> String {
        format!("{}-v2", self.index_name)
    }

    pub fn es_url(&self) -> String {
        format!("http://{}:{}", self.es_host, self.es_port)
    }

    /// Count snapshot file, named after the index
    pub fn snapshot_path(&self) -> PathBuf {
        self.state_dir
            .join(format!("{}_count.txt", self.index_name))
    }

    pub fn resolved_values(&self) -> &[ResolvedValue] {
        &self.resolved
    }

    /// Render resolved values and their sources, masking the password
    pub fn format_values(&self) -> String {
        let width = self
            .resolved
            .iter()
            .map(|v| v.key.len())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        for v in &self.resolved {
            let value = if v.key == "es_password" && !v.value.is_empty() {
                "********".to_string()
            } else {
                v.value.clone()
            };
            out.push_str(&format!(
                "{:width$} = {}  ({})\n",
                v.key,
                value,
                v.source,
                width = width
            ));
        }
        out
    }

    /// Config file equivalent of these settings
    pub fn to_file_config(&self) -> FileConfig {
        FileConfig {
            es_host: Some(self.es_host.clone()),
            es_port: Some(PortValue::Number(u64::from(self.es_port))),
            es_username: Some(self.es_username.clone()),
            es_password: Some(self.es_password.clone()),
            index_name: Some(self.index_name.clone()),
            dataset_url: Some(self.dataset_url.clone()),
            output_file: Some(self.output_file.clone()),
            settings_file: Some(self.settings_file.clone()),
            mapping_file: Some(self.mapping_file.clone()),
            taxonomy_file: Some(self.taxonomy_file.clone()),
            state_dir: Some(self.state_dir.clone()),
            check_stability: Some(self.check_stability),
            index_taxonomy: Some(self.index_taxonomy),
            bulk_chunk_size: Some(self.bulk_chunk_size),
            timeout_secs: Some(self.timeout_secs),
        }
    }

    /// Write these settings as a TOML config file
    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let content = toml::to_string_pretty(&self.to_file_config()).map_err(|e| {
            PipelineError::configuration(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        log::info!("Saved config to {}", path.display());
        Ok(())
    }
}

fn path_setting<E: Fn(&str) -> Option<String>>(
    r: &mut Resolver<'_, E>,
    key: &'static str,
    cli: &Option<PathBuf>,
    file: &Option<PathBuf>,
    default: &str,
) -> PathBuf {
    let picked = r.pick(
        key,
        cli.clone().map(DisplayPath),
        file.clone().map(DisplayPath),
        None,
        |_| None,
    );
    r.or_default(key, picked, DisplayPath(PathBuf::from(default)))
        .0
}

fn missing(key: &str, flag: &str, env_key: Option<&str>) -> PipelineError {
    let env_hint = env_key
        .map(|k| format!(", {} environment variable", k))
        .unwrap_or_default();
    PipelineError::configuration(format!(
        "Missing required setting '{}' (set {}, '{}' in the config file{})",
        key, flag, key, env_hint
    ))
}

fn parse_port(raw: &str) -> PipelineResult<u16> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(PipelineError::configuration(format!(
            "Invalid es_port '{}': expected a number between 1 and 65535",
            raw
        ))),
        Ok(port) => Ok(port),
    }
}

/// Elasticsearch index names are lowercase and avoid a small set of characters
fn validate_index_name(name: &str) -> PipelineResult<()> {
    const FORBIDDEN: &[char] = &['\\', '/', '*', '?', '"', '<', '>', '|', ',', '#', ' ', ':'];
    let invalid = name != name.to_lowercase()
        || name.starts_with(['-', '_', '+'])
        || name == "."
        || name == ".."
        || name.contains(FORBIDDEN);
    if invalid {
        return Err(PipelineError::configuration(format!(
            "Invalid index_name '{}': must be lowercase and must not contain spaces or any of \\ / * ? \" < > | , # :",
            name
        )));
    }
    Ok(())
}
