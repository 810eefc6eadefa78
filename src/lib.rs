//! `filesort` is an external merge sort for record streams that may not fit in memory.
//!
//! Records are written into a sort pipe one by one. A background worker buffers them
//! and, once an in-memory threshold is reached, stable-sorts the batch and spills it
//! to a temporary run file using a client supplied codec. When the input is closed
//! the worker merges all runs through a balanced binary merge tree and the sorted
//! stream is read back from the pipe. For more information see
//! [External Sorting](https://en.wikipedia.org/wiki/External_sorting).
//!
//! # Overview
//!
//! `filesort` supports the following features:
//!
//! * **Record agnostic:**
//!   the engine never inspects a record, it only routes it through the comparison
//!   function and the codec, so any owned type can be sorted.
//! * **Codec agnostic:**
//!   spilled batches are persisted through the [`Encoder`]/[`Decoder`] pair supplied
//!   at construction. Newline-delimited string and MessagePack reference codecs are
//!   included, any custom binary layout can be plugged in instead.
//! * **Streaming pipeline:**
//!   writing, sorting/spilling and reading happen concurrently over bounded queues,
//!   so memory stays bounded independent of the input size and a slow reader simply
//!   applies backpressure.
//! * **Stable order:**
//!   records that compare equal are returned in the order they were written.
//!
//! # Example
//!
//! ```no_run
//! use filesort::{FileSorterBuilder, LineDecoder, LineEncoder};
//!
//! fn main() {
//!     let mut sorter = FileSorterBuilder::new()
//!         .with_compare(|a: &String, b: &String| a.cmp(b))
//!         .with_encoder(LineEncoder::new)
//!         .with_decoder(LineDecoder::new)
//!         .with_max_buffered_records(100_000)
//!         .build()
//!         .unwrap();
//!
//!     for line in ["two", "one", "three"] {
//!         sorter.write(line.to_string()).unwrap();
//!     }
//!     sorter.close();
//!
//!     while let Some(line) = sorter.read().unwrap() {
//!         println!("{}", line);
//!     }
//! }
//! ```

pub mod codec;
pub mod sort;

mod merger;
mod spill;

pub use codec::{
    CodecError, Decoder, Encoder, LineDecoder, LineEncoder, RmpDecoder, RmpEncoder, SpillReader, SpillWriter,
};
pub use sort::{Compare, DecoderCtor, EncoderCtor, FileSorter, FileSorterBuilder, SortError};
