use std::fmt;
use std::io;

use csvbind_core::{Emitter, EmitterBuilder, QuoteStyle, Terminator};

use crate::bind::{CsvRecord, FieldSink};
use crate::error::{Error, ErrorKind, IntoInnerError, Result};
use crate::reader::CancelToken;

/// Builds a CSV writer with various configuration knobs.
#[derive(Clone, Debug)]
pub struct WriterBuilder {
    delimiter: u8,
    quote: u8,
    style: QuoteStyle,
    terminator: Terminator,
    buffer_size: usize,
    has_headers: bool,
    flexible: bool,
    cancel: Option<CancelToken>,
}

impl Default for WriterBuilder {
    fn default() -> WriterBuilder {
        WriterBuilder {
            delimiter: b',',
            quote: b'"',
            style: QuoteStyle::default(),
            terminator: Terminator::default(),
            buffer_size: 8 * (1 << 10),
            has_headers: true,
            flexible: false,
            cancel: None,
        }
    }
}

impl WriterBuilder {
    /// Create a new builder for configuring CSV writing.
    pub fn new() -> WriterBuilder {
        WriterBuilder::default()
    }

    /// Build a CSV writer from this configuration that writes to `wtr`.
    ///
    /// The CSV writer does its own buffering, so wrapping `wtr` in a
    /// `io::BufWriter` is unnecessary.
    pub fn from_writer<W: io::Write>(&self, wtr: W) -> Writer<W> {
        Writer::new(self, wtr)
    }

    /// The field delimiter to use when writing CSV.
    ///
    /// The default is `b','`.
    pub fn delimiter(&mut self, delimiter: u8) -> &mut WriterBuilder {
        self.delimiter = delimiter;
        self
    }

    /// The quote character to use when writing CSV.
    ///
    /// The default is `b'"'`.
    pub fn quote(&mut self, quote: u8) -> &mut WriterBuilder {
        self.quote = quote;
        self
    }

    /// The quoting style. The default is minimal quoting.
    pub fn quote_style(&mut self, style: QuoteStyle) -> &mut WriterBuilder {
        self.style = style;
        self
    }

    /// The record terminator: `\n` by default, or CRLF.
    pub fn terminator(&mut self, terminator: Terminator) -> &mut WriterBuilder {
        self.terminator = terminator;
        self
    }

    /// The flush threshold of the internal buffer, in bytes.
    pub fn buffer_size(&mut self, size: usize) -> &mut WriterBuilder {
        assert!(size > 0, "buffer size must be positive");
        self.buffer_size = size;
        self
    }

    /// Whether schema-bound writes emit a header record first.
    ///
    /// Enabled by default.
    pub fn has_headers(&mut self, yes: bool) -> &mut WriterBuilder {
        self.has_headers = yes;
        self
    }

    /// Whether records of varying field counts are allowed.
    pub fn flexible(&mut self, yes: bool) -> &mut WriterBuilder {
        self.flexible = yes;
        self
    }

    /// Attach a cancellation token, checked between records.
    pub fn cancel(&mut self, token: CancelToken) -> &mut WriterBuilder {
        self.cancel = Some(token);
        self
    }

    /// Apply the record-level options of `T`'s schema.
    pub fn schema_defaults<T: CsvRecord>(&mut self) -> &mut WriterBuilder {
        let options = T::schema().options();
        self.delimiter = options.delimiter_byte();
        self.has_headers = options.headers();
        self
    }
}

/// A streaming CSV writer over a byte sink.
///
/// Fields and record terminators accumulate in an internal buffer that is
/// flushed to the sink once it exceeds the configured size, and always
/// when the writer is flushed, consumed or dropped. Write-side errors are
/// always fail-fast.
pub struct Writer<W: io::Write> {
    wtr: Option<W>,
    emitter: Emitter,
    buf: Vec<u8>,
    scratch: Vec<u8>,
    buffer_size: usize,
    has_headers: bool,
    header_written: bool,
    flexible: bool,
    expected_fields: Option<u64>,
    cancel: Option<CancelToken>,
}

impl<W: io::Write> fmt::Debug for Writer<W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Writer")
            .field("buffered", &self.buf.len())
            .field("has_headers", &self.has_headers)
            .finish()
    }
}

impl<W: io::Write> Writer<W> {
    fn new(builder: &WriterBuilder, wtr: W) -> Writer<W> {
        let emitter = EmitterBuilder::new()
            .delimiter(builder.delimiter)
            .quote(builder.quote)
            .quote_style(builder.style)
            .terminator(builder.terminator)
            .build();
        Writer {
            wtr: Some(wtr),
            emitter,
            buf: Vec::with_capacity(builder.buffer_size),
            scratch: Vec::new(),
            buffer_size: builder.buffer_size,
            has_headers: builder.has_headers,
            header_written: false,
            flexible: builder.flexible,
            expected_fields: None,
            cancel: builder.cancel.clone(),
        }
    }

    /// Write a single record of raw byte fields.
    pub fn write_record<I, F>(&mut self, record: I) -> Result<()>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        self.check_cancelled()?;
        let mut count = 0u64;
        for field in record {
            self.emitter.write_field(field.as_ref(), &mut self.buf);
            count += 1;
        }
        self.emitter.write_terminator(&mut self.buf);
        self.check_field_count(count)?;
        self.maybe_flush()
    }

    /// Write a record decoded from its schema binding.
    ///
    /// When the writer is configured with headers, the first call emits a
    /// header record derived from the schema's csv names.
    pub fn write_bound<T: CsvRecord>(&mut self, record: &T) -> Result<()> {
        self.check_cancelled()?;
        if self.has_headers && !self.header_written {
            self.header_written = true;
            let mut count = 0u64;
            for field in T::schema().fields() {
                self.emitter
                    .write_field(field.name().as_bytes(), &mut self.buf);
                count += 1;
            }
            self.emitter.write_terminator(&mut self.buf);
            self.check_field_count(count)?;
        }
        let checkpoint = self.buf.len();
        let result = {
            let mut sink = FieldSink::new(
                &mut self.emitter,
                &mut self.buf,
                &mut self.scratch,
                T::schema(),
            );
            record.emit_record(&mut sink)
        };
        if let Err(err) = result {
            // Roll the half-written record back so it never reaches the
            // sink.
            self.buf.truncate(checkpoint);
            self.emitter.reset();
            return Err(err);
        }
        self.emitter.write_terminator(&mut self.buf);
        self.check_field_count(T::schema().len() as u64)?;
        self.maybe_flush()
    }

    /// Write every record of an iterator through the schema binding.
    pub fn write_all<'a, T, I>(&mut self, records: I) -> Result<()>
    where
        T: CsvRecord + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        for record in records {
            self.write_bound(record)?;
        }
        Ok(())
    }

    /// Flush the internal buffer and the underlying sink.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buf()?;
        if let Some(ref mut wtr) = self.wtr {
            wtr.flush().map_err(Error::from)?;
        }
        Ok(())
    }

    /// Flush and return the underlying sink.
    pub fn into_inner(mut self) -> std::result::Result<W, IntoInnerError<Writer<W>>> {
        match self.flush() {
            Ok(()) => Ok(self.wtr.take().expect("writer is present until consumed")),
            Err(err) => {
                let io_err = match err.into_kind() {
                    ErrorKind::Io(err) => err,
                    other => io::Error::new(
                        io::ErrorKind::Other,
                        Error::new(other),
                    ),
                };
                Err(IntoInnerError::new(self, io_err))
            }
        }
    }

    fn check_cancelled(&mut self) -> Result<()> {
        if let Some(ref token) = self.cancel {
            if token.is_cancelled() {
                return Err(Error::new(ErrorKind::Cancelled));
            }
        }
        Ok(())
    }

    fn check_field_count(&mut self, got: u64) -> Result<()> {
        if self.flexible {
            return Ok(());
        }
        match self.expected_fields {
            None => {
                self.expected_fields = Some(got);
                Ok(())
            }
            Some(expected) if expected != got => {
                Err(Error::new(ErrorKind::FieldCountMismatch {
                    pos: None,
                    expected,
                    got,
                }))
            }
            Some(_) => Ok(()),
        }
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.buf.len() > self.buffer_size {
            self.flush_buf()?;
        }
        Ok(())
    }

    fn flush_buf(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if let Some(ref mut wtr) = self.wtr {
            wtr.write_all(&self.buf).map_err(Error::from)?;
        }
        self.buf.clear();
        Ok(())
    }
}

impl<W: io::Write> Drop for Writer<W> {
    fn drop(&mut self) {
        if self.wtr.is_some() {
            let _ = self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use csvbind_core::{QuoteStyle, Terminator};

    use crate::error::ErrorKind;
    use crate::reader::CancelToken;

    use super::WriterBuilder;

    fn written(configure: impl FnOnce(&mut WriterBuilder), records: &[&[&str]]) -> String {
        let mut builder = WriterBuilder::new();
        configure(&mut builder);
        let mut wtr = builder.from_writer(Vec::new());
        for record in records {
            wtr.write_record(record.iter()).unwrap();
        }
        String::from_utf8(wtr.into_inner().unwrap()).unwrap()
    }

    #[test]
    fn simple_records() {
        let got = written(|_| {}, &[&["a", "b"], &["c", "d"]]);
        assert_eq!("a,b\nc,d\n", got);
    }

    #[test]
    fn crlf_terminator() {
        let got = written(
            |b| {
                b.terminator(Terminator::CRLF);
            },
            &[&["a", "b"]],
        );
        assert_eq!("a,b\r\n", got);
    }

    #[test]
    fn minimal_quoting() {
        let got = written(|_| {}, &[&["a,b", "plain", "say \"hi\""]]);
        assert_eq!("\"a,b\",plain,\"say \"\"hi\"\"\"\n", got);
    }

    #[test]
    fn quote_all_style(){
        let got = written(
            |b| {
                b.quote_style(QuoteStyle::All);
            },
            &[&["a", "1"]],
        );
        assert_eq!("\"a\",\"1\"\n", got);
    }

    #[test]
    fn field_count_is_checked() {
        let mut wtr = WriterBuilder::new().from_writer(Vec::new());
        wtr.write_record(["a", "b"].iter()).unwrap();
        let err = wtr.write_record(["c"].iter()).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::FieldCountMismatch { expected: 2, got: 1, .. }
        ));
    }

    #[test]
    fn flexible_allows_ragged_records() {
        let mut builder = WriterBuilder::new();
        builder.flexible(true);
        let mut wtr = builder.from_writer(Vec::new());
        wtr.write_record(["a", "b"].iter()).unwrap();
        wtr.write_record(["c"].iter()).unwrap();
        assert_eq!(b"a,b\nc\n", &*wtr.into_inner().unwrap());
    }

    #[test]
    fn buffered_until_threshold() {
        let mut builder = WriterBuilder::new();
        builder.buffer_size(1 << 20);
        let mut wtr = builder.from_writer(Vec::new());
        wtr.write_record(["a"].iter()).unwrap();
        // Nothing reaches the sink until a flush.
        assert_eq!(b"a\n", &*wtr.into_inner().unwrap());
    }

    #[test]
    fn cancellation_between_records() {
        let token = CancelToken::new();
        let mut builder = WriterBuilder::new();
        builder.cancel(token.clone());
        let mut wtr = builder.from_writer(Vec::new());
        wtr.write_record(["a"].iter()).unwrap();
        token.cancel();
        let err = wtr.write_record(["b"].iter()).unwrap_err();
        assert!(err.is_cancelled());
    }
}
