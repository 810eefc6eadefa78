//! Record codec interfaces and reference codec implementations.

use std::error::Error;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::marker::PhantomData;

/// Sink handed to an encoder constructor: a buffered writer over one freshly
/// created spill file.
pub type SpillWriter = io::BufWriter<fs::File>;

/// Source handed to a decoder constructor: a buffered reader over one
/// previously written spill file.
pub type SpillReader = io::BufReader<fs::File>;

/// Codec failure, other than the canonical end-of-source condition.
pub type CodecError = Box<dyn Error + Send + Sync>;

/// Record encoder. The sorter calls [`Encoder::encode`] once per record of a
/// sorted batch, in order, and then [`Encoder::close`] exactly once. No
/// encode call occurs after close.
pub trait Encoder<T> {
    /// Encodes a single record and writes it out.
    fn encode(&mut self, record: &T) -> Result<(), CodecError>;

    /// Flushes buffered data and releases the underlying sink.
    fn close(self: Box<Self>) -> Result<(), CodecError>;
}

/// Record decoder. [`Decoder::decode`] must yield records in exactly the
/// order they were encoded and return `Ok(None)` once the source is
/// exhausted, distinguishing clean exhaustion from a genuine failure.
pub trait Decoder<T> {
    /// Decodes the next record, `Ok(None)` on end of source.
    fn decode(&mut self) -> Result<Option<T>, CodecError>;
}

/// Encoder that stores strings separated by newlines. Records must not
/// contain the LF character, otherwise the data is corrupted on decoding.
pub struct LineEncoder {
    sink: SpillWriter,
}

impl LineEncoder {
    pub fn new(sink: SpillWriter) -> Self {
        LineEncoder { sink }
    }
}

impl Encoder<String> for LineEncoder {
    fn encode(&mut self, record: &String) -> Result<(), CodecError> {
        self.sink.write_all(record.as_bytes())?;
        self.sink.write_all(b"\n")?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), CodecError> {
        self.sink.flush()?;
        Ok(())
    }
}

/// Decoder that reads LF separated strings written by [`LineEncoder`].
pub struct LineDecoder {
    source: SpillReader,
}

impl LineDecoder {
    pub fn new(source: SpillReader) -> Self {
        LineDecoder { source }
    }
}

impl Decoder<String> for LineDecoder {
    fn decode(&mut self) -> Result<Option<String>, CodecError> {
        let mut line = String::new();
        if self.source.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(Some(line))
    }
}

/// MessagePack encoder for any serde serializable record type.
/// For more information see <https://msgpack.org/>.
pub struct RmpEncoder<T> {
    sink: SpillWriter,

    record_type: PhantomData<T>,
}

impl<T> RmpEncoder<T> {
    pub fn new(sink: SpillWriter) -> Self {
        RmpEncoder {
            sink,
            record_type: PhantomData,
        }
    }
}

impl<T> Encoder<T> for RmpEncoder<T>
where
    T: serde::ser::Serialize,
{
    fn encode(&mut self, record: &T) -> Result<(), CodecError> {
        rmp_serde::encode::write(&mut self.sink, record)?;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<(), CodecError> {
        self.sink.flush()?;
        Ok(())
    }
}

/// MessagePack decoder counterpart of [`RmpEncoder`].
pub struct RmpDecoder<T> {
    source: SpillReader,

    record_type: PhantomData<T>,
}

impl<T> RmpDecoder<T> {
    pub fn new(source: SpillReader) -> Self {
        RmpDecoder {
            source,
            record_type: PhantomData,
        }
    }
}

impl<T> Decoder<T> for RmpDecoder<T>
where
    T: serde::de::DeserializeOwned,
{
    fn decode(&mut self) -> Result<Option<T>, CodecError> {
        if self.source.fill_buf()?.is_empty() {
            return Ok(None);
        }
        let record = rmp_serde::decode::from_read(&mut self.source)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod test {
    use std::fs;
    use std::io;

    use rstest::*;

    use super::{Decoder, Encoder, LineDecoder, LineEncoder, RmpDecoder, RmpEncoder};

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_line_codec(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("lines");

        let mut encoder = Box::new(LineEncoder::new(io::BufWriter::new(
            fs::File::create(&path).unwrap(),
        )));
        encoder.encode(&"one".to_string()).unwrap();
        encoder.encode(&"two".to_string()).unwrap();
        encoder.close().unwrap();

        let mut decoder = LineDecoder::new(io::BufReader::new(fs::File::open(&path).unwrap()));
        assert_eq!(decoder.decode().unwrap(), Some("one".to_string()));
        assert_eq!(decoder.decode().unwrap(), Some("two".to_string()));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[rstest]
    fn test_rmp_codec(tmp_dir: tempfile::TempDir) {
        let path = tmp_dir.path().join("records");
        let saved = Vec::from_iter(0..100);

        let mut encoder = Box::new(RmpEncoder::new(io::BufWriter::new(
            fs::File::create(&path).unwrap(),
        )));
        for record in &saved {
            encoder.encode(record).unwrap();
        }
        encoder.close().unwrap();

        let mut decoder: RmpDecoder<i32> =
            RmpDecoder::new(io::BufReader::new(fs::File::open(&path).unwrap()));
        let mut restored = Vec::new();
        while let Some(record) = decoder.decode().unwrap() {
            restored.push(record);
        }

        assert_eq!(restored, saved);
    }
}
