//! Spill management: the temporary-storage scope and run files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::sort::{EncoderCtor, SortError};

/// Acquires the temporary-storage scope exclusive to one sorter instance.
/// The scope and anything left in it are removed when it is dropped.
pub(crate) fn create_scope(parent: Option<&Path>) -> Result<tempfile::TempDir, SortError> {
    let tmp_dir = match parent {
        Some(parent) => tempfile::tempdir_in(parent),
        None => tempfile::tempdir(),
    }
    .map_err(|err| SortError::Resource(Arc::new(err)))?;

    log::info!("using {} as a temporary directory", tmp_dir.path().display());

    Ok(tmp_dir)
}

/// Writes one sorted batch out as a new run file and returns its path.
/// The encoder is closed exactly once; any encode or close failure aborts
/// the spill and is reported, never swallowed.
pub(crate) fn write_run<T>(
    scope: &tempfile::TempDir,
    seq: usize,
    records: impl Iterator<Item = T>,
    new_encoder: &EncoderCtor<T>,
    rw_buf_size: Option<usize>,
) -> Result<PathBuf, SortError> {
    let path = scope.path().join(format!("run-{}", seq));
    let file = fs::File::create(&path).map_err(|err| SortError::Resource(Arc::new(err)))?;
    let sink = match rw_buf_size {
        Some(buf_size) => io::BufWriter::with_capacity(buf_size, file),
        None => io::BufWriter::new(file),
    };

    let mut encoder = new_encoder(sink);
    let mut count: usize = 0;
    for record in records {
        encoder.encode(&record).map_err(|err| SortError::Codec(Arc::from(err)))?;
        count += 1;
    }
    encoder.close().map_err(|err| SortError::Codec(Arc::from(err)))?;

    log::debug!("spilled run {} ({} records)", path.display(), count);

    Ok(path)
}
