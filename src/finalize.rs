//! Post-download checks and the final move into place.
//!
//! Data is always written to a staging path next to the destination. Only a
//! staging file whose size matches the advertised length is renamed onto the
//! destination; anything else is removed so no truncated file is left behind
//! under the final name.
use crate::error::{DownloadError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info, warn};

/// A range written to its own file instead of the shared output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartFile {
    pub range_index: usize,
    pub path: PathBuf,
}

/// `<dest>.part`, where data accumulates until it is verified.
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// `<dest>.part<index>`, the file for one range in the part-file layout.
pub fn part_path(dest: &Path, range_index: usize) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(format!(".part{}", range_index));
    PathBuf::from(name)
}

/// Checks the on-disk size of `path` against the expected length.
///
/// When `expected` is `None` there is nothing to compare and the actual size
/// is returned as is.
pub async fn verify_size(path: &Path, expected: Option<u64>) -> Result<u64> {
    let actual = fs::metadata(path).await?.len();
    match expected {
        Some(expected) if expected != actual => {
            Err(DownloadError::IncompleteDownload { expected, actual })
        }
        _ => Ok(actual),
    }
}

/// Concatenates part files into `dest` in ascending range order, then
/// deletes them.
///
/// The order comes from `range_index`, never from the order of `parts` or of a
/// directory listing. Each part is copied through a buffer of `chunk_size`
/// bytes.
pub async fn combine_parts(parts: &[PartFile], dest: &Path, chunk_size: usize) -> Result<u64> {
    let mut ordered = parts.to_vec();
    ordered.sort_by_key(|p| p.range_index);

    let mut out = BufWriter::with_capacity(chunk_size, File::create(dest).await?);
    let mut total = 0u64;

    for part in &ordered {
        let mut reader = BufReader::with_capacity(chunk_size, File::open(&part.path).await?);
        let copied = tokio::io::copy_buf(&mut reader, &mut out).await?;
        debug!("appended part {} ({} bytes)", part.range_index, copied);
        total += copied;
    }
    out.flush().await?;
    out.into_inner().sync_all().await?;

    for part in &ordered {
        fs::remove_file(&part.path).await?;
    }

    Ok(total)
}

/// Renames the verified staging file onto its final name.
pub async fn commit(staging: &Path, dest: &Path) -> Result<()> {
    fs::rename(staging, dest).await?;
    info!("saved {}", dest.display());
    Ok(())
}

/// Best-effort removal of leftovers after a failed run.
pub async fn discard(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path).await {
            Ok(()) => debug!("removed {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("could not remove {}: {}", path.display(), e),
        }
    }
}
