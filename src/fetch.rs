use bytesize::ByteSize;
use serde::Deserialize;
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};
use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::error::{PipelineError, PipelineResult};
use crate::output::write_atomically_with;

/// Column carrying the externally assigned complaint identifier
pub const COMPLAINT_ID_FIELD: &str = "complaint_id";

/// One normalized complaint
pub type ComplaintRecord = Map<String, Value>;

#[derive(Debug, Clone, Deserialize)]
pub struct Column {
    #[serde(rename = "fieldName")]
    pub field_name: String,
}

impl Column {
    /// Socrata bookkeeping columns (`:sid`, `:created_at`, ...)
    fn is_system(&self) -> bool {
        self.field_name.starts_with(':')
    }
}

#[derive(Debug, Deserialize)]
struct View {
    columns: Vec<Column>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    view: View,
}

/// Result of a fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSummary {
    pub records: usize,
    pub source_bytes: u64,
}

/// Map one positional row to a record keyed by column field names
pub fn normalize_row(
    columns: &[Column],
    row_num: usize,
    row: Vec<Value>,
) -> Result<ComplaintRecord, String> {
    if row.len() != columns.len() {
        return Err(format!(
            "Row {} has {} values but the dataset declares {} columns",
            row_num,
            row.len(),
            columns.len()
        ));
    }
    Ok(columns
        .iter()
        .zip(row)
        .filter(|(column, _)| !column.is_system())
        .map(|(column, value)| (column.field_name.clone(), value))
        .collect())
}

/// Writes records as the elements of one JSON array
struct RecordWriter<W: Write> {
    writer: W,
    count: usize,
    io_error: Option<io::Error>,
}

impl<W: Write> RecordWriter<W> {
    fn new(writer: W) -> Self {
        Self {
            writer,
            count: 0,
            io_error: None,
        }
    }

    fn write_record(&mut self, record: &ComplaintRecord) -> io::Result<()> {
        let separator: &[u8] = if self.count == 0 { b"[" } else { b"," };
        self.writer.write_all(separator)?;
        serde_json::to_writer(&mut self.writer, record)?;
        self.count += 1;
        Ok(())
    }

    fn push<E: de::Error>(&mut self, record: &ComplaintRecord) -> Result<(), E> {
        self.write_record(record).map_err(|e| {
            let message = e.to_string();
            self.io_error = Some(e);
            E::custom(message)
        })
    }

    fn finish(mut self) -> io::Result<usize> {
        let closing: &[u8] = if self.count == 0 { b"[]" } else { b"]" };
        self.writer.write_all(closing)?;
        self.writer.flush()?;
        Ok(self.count)
    }
}

struct RowsSeed<'a, W: Write> {
    columns: &'a [Column],
    out: &'a mut RecordWriter<W>,
}

impl<'de, W: Write> DeserializeSeed<'de> for RowsSeed<'_, W> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, W: Write> Visitor<'de> for RowsSeed<'_, W> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an array of rows")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        let mut row_num = 0usize;
        while let Some(row) = seq.next_element::<Vec<Value>>()? {
            let record = normalize_row(self.columns, row_num, row)
                .map_err(<A::Error as de::Error>::custom)?;
            self.out.push::<A::Error>(&record)?;
            row_num += 1;
        }
        Ok(())
    }
}

struct DocumentVisitor<'a, W: Write> {
    out: &'a mut RecordWriter<W>,
}

impl<'de, W: Write> Visitor<'de> for DocumentVisitor<'_, W> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a rows.json document with `meta` and `data`")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let mut columns: Option<Vec<Column>> = None;
        let mut saw_data = false;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "meta" => columns = Some(map.next_value::<Meta>()?.view.columns),
                "data" => {
                    // Rows are written as they are parsed, so the columns must come first
                    let cols = columns.as_deref().ok_or_else(|| {
                        <A::Error as de::Error>::custom("`data` appears before `meta.view.columns`")
                    })?;
                    map.next_value_seed(RowsSeed {
                        columns: cols,
                        out: &mut *self.out,
                    })?;
                    saw_data = true;
                }
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        if columns.is_none() {
            return Err(de::Error::missing_field("meta"));
        }
        if !saw_data {
            return Err(de::Error::missing_field("data"));
        }
        Ok(())
    }
}

/// Stream a `rows.json` document into a JSON array of records, returning the count
pub fn normalize_stream<R: Read, W: Write>(reader: R, writer: W) -> PipelineResult<usize> {
    let mut out = RecordWriter::new(writer);
    let mut deserializer = serde_json::Deserializer::from_reader(reader);
    let parsed = (&mut deserializer)
        .deserialize_map(DocumentVisitor { out: &mut out })
        .and_then(|()| deserializer.end());

    if let Some(e) = out.io_error.take() {
        return Err(e.into());
    }
    parsed.map_err(|e| PipelineError::parse(format!("Malformed dataset JSON: {}", e)))?;
    Ok(out.finish()?)
}

fn normalize_file(input: &Path, dest: &Path) -> PipelineResult<usize> {
    let file = std::fs::File::open(input).map_err(|e| {
        PipelineError::fetch(format!("Failed to read {}: {}", input.display(), e))
    })?;
    write_atomically_with(dest, |writer| {
        normalize_stream(BufReader::new(file), writer)
    })
}

/// Where a downloaded payload waits for parsing
fn download_path_for(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(".download");
    PathBuf::from(name)
}

async fn download(url: &Url, path: &Path) -> PipelineResult<u64> {
    log::info!("Downloading dataset from {}", url);
    let mut response = reqwest::get(url.clone())
        .await
        .map_err(|e| PipelineError::fetch(format!("Request to {} failed: {}", url, e)))?
        .error_for_status()
        .map_err(|e| PipelineError::fetch(format!("Dataset request failed: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let mut file = fs::File::create(path).await?;
    let mut bytes = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| PipelineError::fetch(format!("Failed to read dataset body: {}", e)))?
    {
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(bytes)
}

/// Where the dataset is read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    Http(Url),
    File(PathBuf),
}

impl DatasetSource {
    pub fn parse(source: &str) -> PipelineResult<Self> {
        match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(DatasetSource::Http(url)),
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(DatasetSource::File)
                .map_err(|_| PipelineError::fetch(format!("Invalid file URL: {}", source))),
            // Anything else, including Windows drive letters parsed as schemes, is a path
            _ => Ok(DatasetSource::File(PathBuf::from(source))),
        }
    }

    /// Local file holding the payload, and its size
    async fn materialize(&self, dest: &Path) -> PipelineResult<(PathBuf, u64)> {
        match self {
            DatasetSource::Http(url) => {
                let path = download_path_for(dest);
                match download(url, &path).await {
                    Ok(bytes) => Ok((path, bytes)),
                    Err(e) => {
                        let _ = fs::remove_file(&path).await;
                        Err(e)
                    }
                }
            }
            DatasetSource::File(path) => {
                log::info!("Reading dataset from {}", path.display());
                let metadata = fs::metadata(path).await.map_err(|e| {
                    PipelineError::fetch(format!("Failed to read {}: {}", path.display(), e))
                })?;
                Ok((path.clone(), metadata.len()))
            }
        }
    }
}

/// Fetch the dataset and write its records to `dest`, which is untouched on error
pub async fn fetch_dataset(source: &str, dest: &Path) -> PipelineResult<FetchSummary> {
    let start = Instant::now();
    let source = DatasetSource::parse(source)?;
    let (input, source_bytes) = source.materialize(dest).await?;
    log::info!("Retrieved dataset ({})", ByteSize(source_bytes));

    let (input_path, dest_path) = (input.clone(), dest.to_path_buf());
    let records = tokio::task::spawn_blocking(move || normalize_file(&input_path, &dest_path))
        .await
        .map_err(|e| PipelineError::parse(format!("Dataset parser panicked: {}", e)));
    if matches!(source, DatasetSource::Http(_)) {
        let _ = fs::remove_file(&input).await;
    }
    let records = records??;

    let written = fs::metadata(dest).await?.len();
    log::info!(
        "Wrote {} complaints ({}) to {} in {:.2?}",
        records,
        ByteSize(written),
        dest.display(),
        start.elapsed()
    );
    Ok(FetchSummary {
        records,
        source_bytes,
    })
}
