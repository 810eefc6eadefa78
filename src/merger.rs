//! Run readers and the recursive binary merge tree.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::vec;

use crate::codec::Decoder;
use crate::sort::{Compare, DecoderCtor, SortError};

/// Pulls records one at a time from a sorted run.
pub(crate) trait RunReader<T> {
    /// Returns the next record, `Ok(None)` once the run is exhausted.
    fn next(&mut self) -> Result<Option<T>, SortError>;
}

/// In-order reader over the sorted residual buffer.
pub(crate) struct BufferReader<T> {
    records: vec::IntoIter<T>,
}

impl<T> BufferReader<T> {
    pub(crate) fn new(records: Vec<T>) -> Self {
        BufferReader {
            records: records.into_iter(),
        }
    }
}

impl<T> RunReader<T> for BufferReader<T> {
    fn next(&mut self) -> Result<Option<T>, SortError> {
        Ok(self.records.next())
    }
}

/// Reader over one spill file. The file is opened lazily on the first pull
/// and removed once the decoder reports clean exhaustion.
pub(crate) struct FileReader<T> {
    path: PathBuf,
    new_decoder: DecoderCtor<T>,
    rw_buf_size: Option<usize>,
    decoder: Option<Box<dyn Decoder<T>>>,
    done: bool,
}

impl<T> FileReader<T> {
    pub(crate) fn new(path: PathBuf, new_decoder: DecoderCtor<T>, rw_buf_size: Option<usize>) -> Self {
        FileReader {
            path,
            new_decoder,
            rw_buf_size,
            decoder: None,
            done: false,
        }
    }
}

impl<T> RunReader<T> for FileReader<T> {
    fn next(&mut self) -> Result<Option<T>, SortError> {
        if self.done {
            return Ok(None);
        }

        let mut decoder = match self.decoder.take() {
            Some(decoder) => decoder,
            None => {
                let file = fs::File::open(&self.path).map_err(|err| SortError::Resource(Arc::new(err)))?;
                let source = match self.rw_buf_size {
                    Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
                    None => io::BufReader::new(file),
                };
                (self.new_decoder)(source)
            }
        };

        match decoder.decode() {
            Ok(Some(record)) => {
                self.decoder = Some(decoder);
                Ok(Some(record))
            }
            Ok(None) => {
                self.done = true;
                // the decoder holds the file handle, release it before removal
                drop(decoder);
                if let Err(err) = fs::remove_file(&self.path) {
                    log::warn!("couldn't remove spill file {}: {}", self.path.display(), err);
                }
                Ok(None)
            }
            Err(err) => Err(SortError::Codec(Arc::from(err))),
        }
    }
}

/// Binary composition of two readers keeping one lookahead record per child.
/// Ties go to the left child, which keeps the merge stable as long as older
/// runs sit to the left of newer ones.
pub(crate) struct MergeReader<T> {
    left: Box<dyn RunReader<T>>,
    right: Box<dyn RunReader<T>>,
    left_head: Option<T>,
    right_head: Option<T>,
    compare: Compare<T>,
}

impl<T: 'static> MergeReader<T> {
    /// Composes two readers into a single sorted one. The initial lookahead
    /// records are pulled here so that a failing leaf surfaces during tree
    /// construction rather than mid-stream. An immediately exhausted left
    /// child collapses the node to the right child itself.
    pub(crate) fn compose(
        mut left: Box<dyn RunReader<T>>,
        mut right: Box<dyn RunReader<T>>,
        compare: Compare<T>,
    ) -> Result<Box<dyn RunReader<T>>, SortError> {
        let left_head = left.next()?;
        if left_head.is_none() {
            return Ok(right);
        }
        let right_head = right.next()?;
        Ok(Box::new(MergeReader {
            left,
            right,
            left_head,
            right_head,
            compare,
        }))
    }
}

impl<T> RunReader<T> for MergeReader<T> {
    fn next(&mut self) -> Result<Option<T>, SortError> {
        let take_right = match (&self.left_head, &self.right_head) {
            (None, _) => return Ok(None),
            (Some(_), None) => {
                // the right side is exhausted, pass the left straight through
                let record = self.left_head.take();
                self.left_head = self.left.next()?;
                return Ok(record);
            }
            (Some(left), Some(right)) => (self.compare)(right, left) == Ordering::Less,
        };

        if take_right {
            let record = self.right_head.take();
            self.right_head = self.right.next()?;
            Ok(record)
        } else {
            let record = self.left_head.take();
            self.left_head = self.left.next()?;
            if self.left_head.is_none() {
                // left run ran out: promote the right child so its remaining
                // records pass through without further comparisons
                self.left_head = self.right_head.take();
                std::mem::swap(&mut self.left, &mut self.right);
            }
            Ok(record)
        }
    }
}

/// Builds a balanced binary merge tree over the leaf readers. Pairs merge
/// directly, longer lists split at the midpoint and each half is built
/// recursively first. A leaf failure propagates up as a [`SortError`].
pub(crate) fn build_tree<T: 'static>(
    mut leaves: Vec<Box<dyn RunReader<T>>>,
    compare: &Compare<T>,
) -> Result<Box<dyn RunReader<T>>, SortError> {
    if leaves.len() > 2 {
        let upper = build_tree(leaves.split_off(leaves.len() / 2), compare)?;
        let lower = build_tree(leaves, compare)?;
        return MergeReader::compose(lower, upper, Arc::clone(compare));
    }
    match (leaves.pop(), leaves.pop()) {
        (Some(right), Some(left)) => MergeReader::compose(left, right, Arc::clone(compare)),
        (Some(single), None) => Ok(single),
        _ => Ok(Box::new(BufferReader::new(Vec::new()))),
    }
}
