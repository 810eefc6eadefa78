//! External sorter: configuration, the public handle and the background worker.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel as channel;
use rayon::slice::ParallelSliceMut;

use crate::codec::{Decoder, Encoder, SpillReader, SpillWriter};
use crate::merger::{self, BufferReader, FileReader, RunReader};
use crate::spill;

/// Capacity of the input and output record channels. Bounds the number of
/// in-flight records independent of the spill threshold.
const CHANNEL_CAPACITY: usize = 4096;

/// Default number of records held in memory before a spill is triggered.
const DEFAULT_MAX_BUFFERED_RECORDS: usize = 1_048_576;

/// Total order over records. `Ordering::Less` means the first record comes
/// strictly before the second; anything else counts as "not less", so equal
/// ranked records keep their input order.
pub type Compare<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Constructs an encoder over a freshly created spill file.
pub type EncoderCtor<T> = Box<dyn Fn(SpillWriter) -> Box<dyn Encoder<T>> + Send>;

/// Constructs a decoder over a spill file opened for reading.
pub type DecoderCtor<T> = Arc<dyn Fn(SpillReader) -> Box<dyn Decoder<T>> + Send + Sync>;

/// Sorting error.
#[derive(Debug, Clone)]
pub enum SortError {
    /// A required construction option is missing.
    Config(String),
    /// Temporary directory or file creation/I/O error.
    Resource(Arc<io::Error>),
    /// Record encoding or decoding error.
    Codec(Arc<dyn Error + Send + Sync>),
}

impl Error for SortError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            SortError::Config(_) => None,
            SortError::Resource(err) => Some(err.as_ref()),
            SortError::Codec(err) => Some(err.as_ref()),
        }
    }
}

impl Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            SortError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            SortError::Resource(err) => write!(f, "temporary storage not available: {}", err),
            SortError::Codec(err) => write!(f, "record codec failed: {}", err),
        }
    }
}

/// External sorter builder. Provides methods for [`FileSorter`] initialization.
pub struct FileSorterBuilder<T> {
    /// Comparison function expressing the record order.
    compare: Option<Compare<T>>,
    /// Encoder constructor used for spilling sorted batches.
    new_encoder: Option<EncoderCtor<T>>,
    /// Decoder constructor used for reading spilled runs back.
    new_decoder: Option<DecoderCtor<T>>,
    /// Number of records buffered in memory before a spill.
    max_buffered_records: usize,
    /// Directory to be used to store temporary data.
    tmp_dir: Option<Box<Path>>,
    /// Number of threads to be used to sort buffered records in parallel.
    threads_number: Option<usize>,
    /// Spill file read/write buffer size.
    rw_buf_size: Option<usize>,
}

impl<T> FileSorterBuilder<T> {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        FileSorterBuilder::default()
    }

    /// Sets the comparison function expressing the total record order.
    pub fn with_compare<F>(mut self, compare: F) -> FileSorterBuilder<T>
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.compare = Some(Arc::new(compare));
        self
    }

    /// Sets the constructor building an encoder over a new spill file.
    pub fn with_encoder<E, F>(mut self, new_encoder: F) -> FileSorterBuilder<T>
    where
        E: Encoder<T> + 'static,
        F: Fn(SpillWriter) -> E + Send + 'static,
    {
        self.new_encoder = Some(Box::new(move |sink| Box::new(new_encoder(sink)) as Box<dyn Encoder<T>>));
        self
    }

    /// Sets the constructor building a decoder over a spilled run file.
    pub fn with_decoder<D, F>(mut self, new_decoder: F) -> FileSorterBuilder<T>
    where
        D: Decoder<T> + 'static,
        F: Fn(SpillReader) -> D + Send + Sync + 'static,
    {
        self.new_decoder = Some(Arc::new(move |source| {
            Box::new(new_decoder(source)) as Box<dyn Decoder<T>>
        }));
        self
    }

    /// Sets the maximum number of records held in memory before the buffer
    /// is sorted and spilled to disk.
    pub fn with_max_buffered_records(mut self, max_buffered_records: usize) -> FileSorterBuilder<T> {
        self.max_buffered_records = max_buffered_records;
        self
    }

    /// Sets directory to be used to store temporary data.
    pub fn with_tmp_dir(mut self, path: &Path) -> FileSorterBuilder<T> {
        self.tmp_dir = Some(path.into());
        self
    }

    /// Sets number of threads to be used to sort buffered records in parallel.
    pub fn with_threads_number(mut self, threads_number: usize) -> FileSorterBuilder<T> {
        self.threads_number = Some(threads_number);
        self
    }

    /// Sets spill file read/write buffer size.
    pub fn with_rw_buf_size(mut self, buf_size: usize) -> FileSorterBuilder<T> {
        self.rw_buf_size = Some(buf_size);
        self
    }

    /// Builds a [`FileSorter`] instance using provided configuration and
    /// starts its background worker. Fails with [`SortError::Config`] if the
    /// comparison function or either codec constructor is missing.
    pub fn build(self) -> Result<FileSorter<T>, SortError>
    where
        T: Send + 'static,
    {
        let compare = self
            .compare
            .ok_or_else(|| SortError::Config("comparison function is required".into()))?;
        let new_encoder = self
            .new_encoder
            .ok_or_else(|| SortError::Config("encoder constructor is required".into()))?;
        let new_decoder = self
            .new_decoder
            .ok_or_else(|| SortError::Config("decoder constructor is required".into()))?;

        let thread_pool = Self::init_thread_pool(self.threads_number)?;

        let (input_tx, input_rx) = channel::bounded(CHANNEL_CAPACITY);
        let (output_tx, output_rx) = channel::bounded(CHANNEL_CAPACITY);
        let error = Arc::new(OnceLock::new());

        let worker = SortWorker {
            input: input_rx,
            output: output_tx,
            compare,
            new_encoder,
            new_decoder,
            max_buffered_records: self.max_buffered_records,
            tmp_dir: self.tmp_dir,
            rw_buf_size: self.rw_buf_size,
            thread_pool,
            error: Arc::clone(&error),
        };
        thread::Builder::new()
            .name("filesort-worker".into())
            .spawn(move || worker.run())
            .map_err(|err| SortError::Resource(Arc::new(err)))?;

        Ok(FileSorter {
            input: Some(input_tx),
            output: output_rx,
            error,
        })
    }

    fn init_thread_pool(threads_number: Option<usize>) -> Result<rayon::ThreadPool, SortError> {
        let mut thread_pool_builder = rayon::ThreadPoolBuilder::new();

        if let Some(threads_number) = threads_number {
            log::info!("initializing thread-pool (threads: {})", threads_number);
            thread_pool_builder = thread_pool_builder.num_threads(threads_number);
        } else {
            log::info!("initializing thread-pool (threads: default)");
        }
        let thread_pool = thread_pool_builder
            .build()
            .map_err(|err| SortError::Resource(Arc::new(io::Error::new(io::ErrorKind::Other, err))))?;

        Ok(thread_pool)
    }
}

impl<T> Default for FileSorterBuilder<T> {
    fn default() -> Self {
        FileSorterBuilder {
            compare: None,
            new_encoder: None,
            new_decoder: None,
            max_buffered_records: DEFAULT_MAX_BUFFERED_RECORDS,
            tmp_dir: None,
            threads_number: None,
            rw_buf_size: None,
        }
    }
}

/// External sorter handle: a single sort pipe to which all the records are
/// first written and then read back in sorted order.
///
/// Records pushed with [`FileSorter::write`] are buffered in memory by a
/// background worker and spilled to sorted temporary run files once the
/// buffer threshold is reached. After [`FileSorter::close`] the worker merges
/// all runs and [`FileSorter::read`] yields the fully sorted stream.
pub struct FileSorter<T> {
    /// Input record channel; dropped on close to signal end of input.
    input: Option<channel::Sender<T>>,
    /// Sorted output record channel.
    output: channel::Receiver<T>,
    /// First failure captured anywhere in the worker.
    error: Arc<OnceLock<SortError>>,
}

impl<T> FileSorter<T> {
    /// Writes a record for sorting. Blocks while the input queue is full.
    /// Once the session has failed, returns the terminal error immediately
    /// without enqueuing the record.
    ///
    /// # Panics
    ///
    /// Panics if called after [`FileSorter::close`].
    pub fn write(&self, record: T) -> Result<(), SortError> {
        if let Some(err) = self.error.get() {
            return Err(err.clone());
        }
        let input = self.input.as_ref().expect("record written after closing the sorter");
        if input.send(record).is_err() {
            // the worker drains input until disconnect, so a failed send
            // means it died mid-session
            if let Some(err) = self.error.get() {
                return Err(err.clone());
            }
            panic!("sort worker terminated unexpectedly");
        }
        Ok(())
    }

    /// Signals that no further input follows. Non-blocking and idempotent;
    /// after this the sorted records can be read back.
    pub fn close(&mut self) {
        self.input = None;
    }

    /// Returns the next sorted record, blocking until one is available, or
    /// `Ok(None)` at the end of the stream. Note that the method blocks
    /// until the input has been closed. Once the stream is exhausted it
    /// keeps returning `Ok(None)`, or the terminal error if the session
    /// failed, so the final result must be checked rather than relying on
    /// the end sentinel alone.
    pub fn read(&self) -> Result<Option<T>, SortError> {
        match self.output.recv() {
            Ok(record) => Ok(Some(record)),
            Err(_) => match self.error.get() {
                Some(err) => Err(err.clone()),
                None => Ok(None),
            },
        }
    }
}

/// Background worker owning buffering, spilling and merging for one session.
struct SortWorker<T> {
    input: channel::Receiver<T>,
    output: channel::Sender<T>,
    compare: Compare<T>,
    new_encoder: EncoderCtor<T>,
    new_decoder: DecoderCtor<T>,
    max_buffered_records: usize,
    tmp_dir: Option<Box<Path>>,
    rw_buf_size: Option<usize>,
    thread_pool: rayon::ThreadPool,
    error: Arc<OnceLock<SortError>>,
}

impl<T> SortWorker<T>
where
    T: Send + 'static,
{
    /// Runs the session to completion. On failure the first error is stored
    /// in the terminal cell and the remaining input is drained and discarded
    /// so that a blocked writer is never deadlocked. Dropping the output
    /// sender on return always releases a blocked reader.
    fn run(self) {
        if let Err(err) = self.sort() {
            log::error!("sort session failed: {}", err);
            let _ = self.error.set(err);
            self.drain();
        }
    }

    fn sort(&self) -> Result<(), SortError> {
        let scope = spill::create_scope(self.tmp_dir.as_deref())?;

        let mut runs: Vec<PathBuf> = Vec::new();
        let mut buffer: Vec<T> = Vec::new();
        while let Ok(record) = self.input.recv() {
            buffer.push(record);
            if buffer.len() >= self.max_buffered_records {
                self.sort_buffer(&mut buffer);
                let run = spill::write_run(&scope, runs.len(), buffer.drain(..), &self.new_encoder, self.rw_buf_size)?;
                runs.push(run);
            }
        }

        self.sort_buffer(&mut buffer);
        self.merge(runs, buffer)
    }

    /// Stable-sorts the buffer inside the instance thread pool. Equal ranked
    /// records keep their relative input order.
    fn sort_buffer(&self, buffer: &mut Vec<T>) {
        let compare = &self.compare;
        self.thread_pool.install(|| buffer.par_sort_by(|a, b| compare(a, b)));
    }

    /// Merges all runs into the output channel: spill files in creation
    /// order first, the buffer residue last, so that the left-biased merge
    /// preserves input order among equal ranked records.
    fn merge(&self, runs: Vec<PathBuf>, buffer: Vec<T>) -> Result<(), SortError> {
        let mut leaves: Vec<Box<dyn RunReader<T>>> = Vec::with_capacity(runs.len() + 1);
        for run in runs {
            leaves.push(Box::new(FileReader::new(
                run,
                Arc::clone(&self.new_decoder),
                self.rw_buf_size,
            )));
        }
        if !buffer.is_empty() {
            leaves.push(Box::new(BufferReader::new(buffer)));
        }
        if leaves.is_empty() {
            return Ok(());
        }

        log::debug!("merging {} runs", leaves.len());

        let mut tree = merger::build_tree(leaves, &self.compare)?;
        while let Some(record) = tree.next()? {
            if self.output.send(record).is_err() {
                log::debug!("output receiver dropped, merge stopped");
                return Ok(());
            }
        }
        Ok(())
    }

    fn drain(&self) {
        while self.input.recv().is_ok() {}
    }
}

#[cfg(test)]
mod test {
    use std::cmp::Ordering;

    use rand::seq::SliceRandom;
    use rstest::*;

    use crate::codec::{CodecError, Encoder, LineDecoder, LineEncoder, RmpDecoder, RmpEncoder};

    use super::{FileSorter, FileSorterBuilder, SortError};

    fn line_sorter(max_buffered_records: usize) -> FileSorter<String> {
        FileSorterBuilder::new()
            .with_compare(|a: &String, b: &String| a.cmp(b))
            .with_encoder(LineEncoder::new)
            .with_decoder(LineDecoder::new)
            .with_max_buffered_records(max_buffered_records)
            .build()
            .unwrap()
    }

    fn read_all<T>(sorter: &FileSorter<T>) -> Vec<T> {
        let mut records = Vec::new();
        while let Some(record) = sorter.read().unwrap() {
            records.push(record);
        }
        records
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(100)]
    fn test_sorts_regardless_of_threshold(#[case] max_buffered_records: usize) {
        let mut sorter = line_sorter(max_buffered_records);

        let words = ["one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten"];
        for word in words {
            sorter.write(word.to_string()).unwrap();
        }
        sorter.close();

        assert_eq!(
            read_all(&sorter),
            vec!["eight", "five", "four", "nine", "one", "seven", "six", "ten", "three", "two"]
        );
        // the stream stays exhausted
        assert_eq!(sorter.read().unwrap(), None);
        assert_eq!(sorter.read().unwrap(), None);
    }

    #[rstest]
    fn test_sorted_permutation_of_shuffled_input() {
        let mut input = Vec::from_iter(0..100);
        input.shuffle(&mut rand::thread_rng());

        let mut sorter: FileSorter<i32> = FileSorterBuilder::new()
            .with_compare(|a: &i32, b: &i32| a.cmp(b))
            .with_encoder(RmpEncoder::new)
            .with_decoder(RmpDecoder::new)
            .with_max_buffered_records(8)
            .with_threads_number(2)
            .build()
            .unwrap();

        for record in input {
            sorter.write(record).unwrap();
        }
        sorter.close();

        assert_eq!(read_all(&sorter), Vec::from_iter(0..100));
    }

    #[rstest]
    fn test_stability_under_constant_comparator() {
        let mut sorter = FileSorterBuilder::new()
            .with_compare(|_: &String, _: &String| Ordering::Equal)
            .with_encoder(LineEncoder::new)
            .with_decoder(LineDecoder::new)
            .with_max_buffered_records(3)
            .build()
            .unwrap();

        let input = Vec::from_iter((0..100).map(|n| n.to_string()));
        for record in &input {
            sorter.write(record.clone()).unwrap();
        }
        sorter.close();

        assert_eq!(read_all(&sorter), input);
    }

    #[rstest]
    fn test_rows_sorted_by_age_then_name() {
        let mut sorter: FileSorter<Vec<String>> = FileSorterBuilder::new()
            .with_compare(|a: &Vec<String>, b: &Vec<String>| (&a[1], &a[0]).cmp(&(&b[1], &b[0])))
            .with_encoder(RmpEncoder::new)
            .with_decoder(RmpDecoder::new)
            .with_max_buffered_records(2)
            .build()
            .unwrap();

        let rows = ["Danny,35,66", "Alice,35,70", "Charly,35,93", "Bob,7,84"];
        for row in rows {
            let fields = Vec::from_iter(row.split(',').map(str::to_string));
            sorter.write(fields).unwrap();
        }
        sorter.close();

        let sorted = Vec::from_iter(read_all(&sorter).into_iter().map(|fields| fields.join(",")));
        assert_eq!(sorted, vec!["Alice,35,70", "Charly,35,93", "Danny,35,66", "Bob,7,84"]);
    }

    #[rstest]
    fn test_empty_input() {
        let mut sorter = line_sorter(3);

        sorter.close();

        assert_eq!(sorter.read().unwrap(), None);
        assert_eq!(sorter.read().unwrap(), None);
    }

    #[rstest]
    fn test_missing_configuration() {
        let result = FileSorterBuilder::<String>::new()
            .with_compare(|a: &String, b: &String| a.cmp(b))
            .build();
        assert!(matches!(result, Err(SortError::Config(_))));

        let result = FileSorterBuilder::<String>::new()
            .with_encoder(LineEncoder::new)
            .with_decoder(LineDecoder::new)
            .build();
        assert!(matches!(result, Err(SortError::Config(_))));
    }

    struct FailingEncoder;

    impl Encoder<String> for FailingEncoder {
        fn encode(&mut self, _record: &String) -> Result<(), CodecError> {
            Err("injected encoder failure".into())
        }

        fn close(self: Box<Self>) -> Result<(), CodecError> {
            Ok(())
        }
    }

    fn failing_sorter(max_buffered_records: usize) -> FileSorter<String> {
        FileSorterBuilder::new()
            .with_compare(|a: &String, b: &String| a.cmp(b))
            .with_encoder(|_sink| FailingEncoder)
            .with_decoder(LineDecoder::new)
            .with_max_buffered_records(max_buffered_records)
            .build()
            .unwrap()
    }

    #[rstest]
    fn test_spill_failure_surfaces_on_read() {
        let mut sorter = failing_sorter(2);

        for n in 0..10 {
            // writes may start failing once the spill error is captured
            let _ = sorter.write(n.to_string());
        }
        sorter.close();

        let err = sorter.read().unwrap_err();
        assert!(matches!(err, SortError::Codec(_)));
        assert!(err.to_string().contains("injected encoder failure"));

        // the error is permanent for the session
        assert!(sorter.read().is_err());
    }

    #[rstest]
    fn test_spill_failure_fails_writes_fast() {
        let sorter = failing_sorter(1);

        let mut write_failed = false;
        for n in 0..100_000 {
            if sorter.write(n.to_string()).is_err() {
                write_failed = true;
                break;
            }
        }

        assert!(write_failed, "writes kept succeeding after the session failed");
    }
}
