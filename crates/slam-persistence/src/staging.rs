//! ---
//! slam_section: "03-persistence-logging"
//! slam_subsection: "module"
//! slam_type: "source"
//! slam_scope: "code"
//! slam_description: "Replace-on-success file writes through a staging file."
//! slam_version: "v0.0.0-prealpha"
//! slam_owner: "tbd"
//! ---
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Suffix of the file a write goes to before it is renamed into place.
pub const STAGING_SUFFIX: &str = ".partial";

/// Failure of [`replace_file`]: either the filesystem or the caller's writer.
#[derive(Debug, thiserror::Error)]
pub enum StagedWriteError<E> {
    /// Creating, flushing or renaming the staging file failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// The closure producing the contents failed.
    #[error("{0}")]
    Write(E),
}

/// Staging file used for `path`.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staging = OsString::from(path.as_os_str());
    staging.push(STAGING_SUFFIX);
    PathBuf::from(staging)
}

/// Replace `path` with the bytes produced by `write`.
///
/// Contents go to `<path>.partial` first and are renamed over `path` only
/// once `write` succeeded and the data is flushed. On failure the staging
/// file is removed and any existing `path` is left untouched. The parent
/// directory must exist.
pub fn replace_file<T, E, F>(path: &Path, write: F) -> Result<T, StagedWriteError<E>>
where
    F: FnOnce(&mut dyn Write) -> Result<T, E>,
{
    let staging = staging_path(path);
    let result = write_staging(&staging, write).and_then(|value| {
        fs::rename(&staging, path)?;
        Ok(value)
    });
    match &result {
        Ok(_) => debug!(path = %path.display(), "file replaced"),
        Err(_) => {
            let _ = fs::remove_file(&staging);
        }
    }
    result
}

fn write_staging<T, E, F>(staging: &Path, write: F) -> Result<T, StagedWriteError<E>>
where
    F: FnOnce(&mut dyn Write) -> Result<T, E>,
{
    let file = File::create(staging)?;
    let mut writer = BufWriter::new(file);
    let value = write(&mut writer).map_err(StagedWriteError::Write)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(value)
}
