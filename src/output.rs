use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::fs as tokio_fs;

use crate::error::PipelineResult;

/// Sibling temporary file used while `dest` is being replaced
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Replace `dest` through a temporary file and a rename
pub async fn write_atomically(dest: &Path, contents: &[u8]) -> PipelineResult<()> {
    log::debug!("Writing {} bytes to {}", contents.len(), dest.display());

    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio_fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path_for(dest);
    if let Err(e) = tokio_fs::write(&tmp, contents).await {
        let _ = tokio_fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio_fs::rename(&tmp, dest).await {
        let _ = tokio_fs::remove_file(&tmp).await;
        return Err(e.into());
    }

    log::debug!("Output file {} replaced", dest.display());
    Ok(())
}

/// Blocking, streaming variant of [`write_atomically`]
pub fn write_atomically_with<T>(
    dest: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> PipelineResult<T>,
) -> PipelineResult<T> {
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path_for(dest);
    let result: PipelineResult<T> = File::create(&tmp)
        .map_err(Into::into)
        .and_then(|file| {
            let mut writer = BufWriter::new(file);
            let value = write(&mut writer)?;
            writer.flush()?;
            Ok(value)
        })
        .and_then(|value| {
            std::fs::rename(&tmp, dest)?;
            Ok(value)
        });
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}
