use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bstr::BString;
use csvbind_core::{
    find_record_end, starts_with_bom, skip_whitespace, BoundaryState,
    ParseMode, ScanStep, TokenizeErrorKind, TokenizerBuilder,
};

use crate::bind::{CsvRecord, FieldStream, HeaderBinding};
use crate::byte_record::{ByteRecord, Position};
use crate::error::{
    Error, ErrorAction, ErrorKind, ErrorLog, ErrorMode, Result,
};
use crate::string_record::StringRecord;

/// A cancellation signal shared between a session and its owner.
///
/// The signal is checked between records on the read side and between
/// record flushes on the write side; a session never observes cancellation
/// in the middle of a record.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a new, unsignalled token.
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// True once cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

type ErrorCallback = Box<dyn FnMut(&Error) -> ErrorAction + Send>;

/// Builds a CSV reader with various configuration knobs.
///
/// This builder can be used to tweak the field delimiter, record
/// terminator handling, error policy and more. Once a CSV `Reader` is
/// built, its configuration cannot be changed.
pub struct ReaderBuilder {
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    mode: ParseMode,
    trim: bool,
    comment: Option<u8>,
    has_headers: bool,
    skip_empty_lines: bool,
    flexible: bool,
    capacity: usize,
    error_mode: ErrorMode,
    max_error_count: usize,
    on_error: Option<ErrorCallback>,
    cancel: Option<CancelToken>,
}

impl Default for ReaderBuilder {
    fn default() -> ReaderBuilder {
        ReaderBuilder {
            delimiter: b',',
            quote: b'"',
            escape: None,
            mode: ParseMode::default(),
            trim: false,
            comment: None,
            has_headers: true,
            skip_empty_lines: false,
            flexible: false,
            capacity: 8 * (1 << 10),
            error_mode: ErrorMode::default(),
            max_error_count: 100,
            on_error: None,
            cancel: None,
        }
    }
}

impl fmt::Debug for ReaderBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ReaderBuilder")
            .field("delimiter", &self.delimiter)
            .field("quote", &self.quote)
            .field("escape", &self.escape)
            .field("mode", &self.mode)
            .field("trim", &self.trim)
            .field("comment", &self.comment)
            .field("has_headers", &self.has_headers)
            .field("skip_empty_lines", &self.skip_empty_lines)
            .field("flexible", &self.flexible)
            .field("capacity", &self.capacity)
            .field("error_mode", &self.error_mode)
            .field("max_error_count", &self.max_error_count)
            .finish()
    }
}

impl ReaderBuilder {
    /// Create a new builder for configuring CSV parsing.
    ///
    /// To convert a builder into a reader, call one of the methods
    /// starting with `from_`.
    pub fn new() -> ReaderBuilder {
        ReaderBuilder::default()
    }

    /// Build a CSV reader from this configuration that reads data from
    /// `rdr`.
    ///
    /// The CSV reader does its own buffering, so wrapping `rdr` in a
    /// `io::BufReader` is unnecessary.
    pub fn from_reader<R: io::Read>(&mut self, rdr: R) -> Reader<R> {
        Reader::new(self, rdr)
    }

    /// Build a CSV reader over an in-memory byte slice.
    pub fn from_slice<'a>(&mut self, data: &'a [u8]) -> Reader<&'a [u8]> {
        self.from_reader(data)
    }

    /// The field delimiter to use when parsing CSV.
    ///
    /// The default is `b','`.
    pub fn delimiter(&mut self, delimiter: u8) -> &mut ReaderBuilder {
        self.delimiter = delimiter;
        self
    }

    /// The quote character to use when parsing CSV.
    ///
    /// The default is `b'"'`.
    pub fn quote(&mut self, quote: u8) -> &mut ReaderBuilder {
        self.quote = quote;
        self
    }

    /// The escape character used inside quoted fields.
    ///
    /// `None` (the default) selects RFC 4180 quote doubling.
    pub fn escape(&mut self, escape: Option<u8>) -> &mut ReaderBuilder {
        self.escape = escape;
        self
    }

    /// The parse mode: strict, lenient or quote-ignoring.
    ///
    /// The default is `ParseMode::Strict`.
    pub fn mode(&mut self, mode: ParseMode) -> &mut ReaderBuilder {
        self.mode = mode;
        self
    }

    /// Trim ASCII space and tab from both ends of unquoted fields.
    pub fn trim(&mut self, yes: bool) -> &mut ReaderBuilder {
        self.trim = yes;
        self
    }

    /// Treat lines starting (after optional blanks) with the given byte as
    /// comments. Passing `Some(b'#')` enables the conventional form.
    pub fn comment(&mut self, comment: Option<u8>) -> &mut ReaderBuilder {
        self.comment = comment;
        self
    }

    /// Whether the first record is a header record.
    ///
    /// When enabled (the default), the first record is not returned by the
    /// record iterators and is used to bind columns to schema fields by
    /// name.
    pub fn has_headers(&mut self, yes: bool) -> &mut ReaderBuilder {
        self.has_headers = yes;
        self
    }

    /// Skip records that consist of nothing but ASCII blanks.
    ///
    /// When disabled (the default), an empty line in the middle of the
    /// stream is preserved as a record with a single empty field.
    pub fn skip_empty_lines(&mut self, yes: bool) -> &mut ReaderBuilder {
        self.skip_empty_lines = yes;
        self
    }

    /// Whether the number of fields in records is allowed to change.
    ///
    /// When disabled (the default), a record with a number of fields
    /// different from the first record's is an error.
    pub fn flexible(&mut self, yes: bool) -> &mut ReaderBuilder {
        self.flexible = yes;
        self
    }

    /// Set the capacity (in bytes) of the internal refill buffer.
    pub fn buffer_capacity(&mut self, capacity: usize) -> &mut ReaderBuilder {
        assert!(capacity > 0, "buffer capacity must be positive");
        self.capacity = capacity;
        self
    }

    /// The error propagation policy. The default is fail-fast.
    pub fn error_mode(&mut self, mode: ErrorMode) -> &mut ReaderBuilder {
        self.error_mode = mode;
        self
    }

    /// The bound of the error log in `ErrorMode::Collect`. Exceeding it
    /// terminates the session.
    pub fn max_error_count(&mut self, max: usize) -> &mut ReaderBuilder {
        self.max_error_count = max;
        self
    }

    /// Install a callback that runs for every record-level error before
    /// the error mode is applied. Returning `ErrorAction::Stop` terminates
    /// the session regardless of mode.
    pub fn on_error(
        &mut self,
        callback: impl FnMut(&Error) -> ErrorAction + Send + 'static,
    ) -> &mut ReaderBuilder {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Attach a cancellation token, checked between records.
    pub fn cancel(&mut self, token: CancelToken) -> &mut ReaderBuilder {
        self.cancel = Some(token);
        self
    }

    /// Apply the record-level options of `T`'s schema: delimiter, header
    /// handling, strictness and trimming.
    pub fn schema_defaults<T: CsvRecord>(&mut self) -> &mut ReaderBuilder {
        let options = T::schema().options();
        self.delimiter = options.delimiter_byte();
        self.has_headers = options.headers();
        self.trim = options.is_trim();
        if !options.is_strict() {
            self.mode = ParseMode::Lenient;
        }
        self
    }
}

/// A streaming CSV reader over a byte source.
///
/// The reader owns a refill buffer, slices complete records out of it
/// (carrying quote context across refills), and tokenizes each record
/// slice in place. Records are yielded in source order.
pub struct Reader<R> {
    rdr: R,
    buf: Vec<u8>,
    /// Start of the current record within `buf`.
    start: usize,
    /// End of valid bytes within `buf`.
    end: usize,
    /// Absolute stream offset of `buf[0]`.
    abs0: u64,
    source_eof: bool,
    primed: bool,
    eof_done: bool,
    line: u64,
    record_index: u64,
    headers_done: bool,
    headers: Option<ByteRecord>,
    string_headers: Option<StringRecord>,
    expected_fields: Option<u64>,
    error_log: ErrorLog,
    scratch: Vec<u8>,
    // configuration
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    mode: ParseMode,
    trim: bool,
    comment: Option<u8>,
    has_headers: bool,
    skip_empty_lines: bool,
    flexible: bool,
    error_mode: ErrorMode,
    on_error: Option<ErrorCallback>,
    cancel: Option<CancelToken>,
}

impl<R> fmt::Debug for Reader<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reader")
            .field("line", &self.line)
            .field("record_index", &self.record_index)
            .field("mode", &self.mode)
            .field("has_headers", &self.has_headers)
            .finish()
    }
}

impl<R: io::Read> Reader<R> {
    /// Create a new CSV reader given a builder and a source of underlying
    /// bytes.
    fn new(builder: &mut ReaderBuilder, rdr: R) -> Reader<R> {
        let escape = match builder.escape {
            Some(esc) if esc == builder.quote => None,
            other => other,
        };
        assert!(
            builder.delimiter != builder.quote,
            "delimiter and quote must differ",
        );
        if let Some(esc) = escape {
            assert!(
                builder.delimiter != esc,
                "delimiter and escape must differ",
            );
        }
        Reader {
            rdr,
            buf: vec![0; builder.capacity],
            start: 0,
            end: 0,
            abs0: 0,
            source_eof: false,
            primed: false,
            eof_done: false,
            line: 1,
            record_index: 0,
            headers_done: false,
            headers: None,
            string_headers: None,
            expected_fields: None,
            error_log: ErrorLog::bounded(builder.max_error_count),
            scratch: Vec::new(),
            delimiter: builder.delimiter,
            quote: builder.quote,
            escape,
            mode: builder.mode,
            trim: builder.trim,
            comment: builder.comment,
            has_headers: builder.has_headers,
            skip_empty_lines: builder.skip_empty_lines,
            flexible: builder.flexible,
            error_mode: builder.error_mode,
            on_error: builder.on_error.take(),
            cancel: builder.cancel.clone(),
        }
    }

    /// The current position of the reader: the start of the next record.
    pub fn position(&self) -> Position {
        let mut pos = Position::new();
        pos.set_byte(self.abs0 + self.start as u64)
            .set_line(self.line)
            .set_record(self.record_index)
            .set_col(0);
        pos
    }

    /// True once the underlying source is exhausted or the session has
    /// terminated.
    pub fn is_done(&self) -> bool {
        self.eof_done
    }

    /// The errors collected so far under `ErrorMode::Collect`.
    pub fn error_log(&self) -> &ErrorLog {
        &self.error_log
    }

    /// Return the header record, reading it if it has not been read yet.
    ///
    /// Fails when the reader was configured without headers.
    pub fn headers(&mut self) -> Result<&StringRecord> {
        self.require_headers()?;
        self.ensure_headers()?;
        if self.string_headers.is_none() {
            let record = self.headers.clone().unwrap_or_default();
            let record =
                StringRecord::from_byte_record(record).map_err(|err| {
                    Error::new(ErrorKind::Utf8 {
                        pos: None,
                        err: err.utf8_error().clone(),
                    })
                })?;
            self.string_headers = Some(record);
        }
        Ok(self.string_headers.as_ref().expect("headers were just cached"))
    }

    /// Return the raw header record, reading it if it has not been read
    /// yet.
    pub fn byte_headers(&mut self) -> Result<&ByteRecord> {
        self.require_headers()?;
        self.ensure_headers()?;
        Ok(self.headers.as_ref().expect("headers were just cached"))
    }

    fn require_headers(&self) -> Result<()> {
        if self.has_headers {
            return Ok(());
        }
        Err(Error::new(ErrorKind::InvalidHeader {
            reason: "reader was configured without headers".to_string(),
        }))
    }

    /// Read the next record into `record`, applying the configured error
    /// policy. Returns false at end of stream.
    pub fn read_byte_record(
        &mut self,
        record: &mut ByteRecord,
    ) -> Result<bool> {
        self.ensure_headers()?;
        loop {
            match self.read_one_record(record) {
                Ok(got) => return Ok(got),
                Err(err) => match self.handle_error(err) {
                    Some(err) => return Err(err),
                    None => continue,
                },
            }
        }
    }

    /// Read the next record as a `StringRecord`, applying the configured
    /// error policy.
    pub fn read_record(
        &mut self,
        record: &mut StringRecord,
    ) -> Result<bool> {
        let mut raw = ByteRecord::new();
        loop {
            if !self.read_byte_record(&mut raw)? {
                return Ok(false);
            }
            match StringRecord::from_byte_record(std::mem::take(&mut raw)) {
                Ok(rec) => {
                    *record = rec;
                    return Ok(true);
                }
                Err(err) => {
                    let utf8 = err.utf8_error().clone();
                    let pos = err.into_byte_record().position().cloned();
                    let err = Error::new(ErrorKind::Utf8 { pos, err: utf8 });
                    match self.handle_error(err) {
                        Some(err) => return Err(err),
                        None => continue,
                    }
                }
            }
        }
    }

    /// An iterator over the records of this reader as raw byte records.
    pub fn byte_records(&mut self) -> ByteRecordsIter<'_, R> {
        ByteRecordsIter { rdr: self }
    }

    /// An iterator over the records of this reader as UTF-8 validated
    /// string records.
    pub fn records(&mut self) -> StringRecordsIter<'_, R> {
        StringRecordsIter { rdr: self }
    }

    /// An iterator over the records of this reader decoded into `T` via
    /// its schema binding.
    ///
    /// When the reader has headers, columns are bound to schema fields by
    /// name; otherwise they are bound by position.
    pub fn bound<T: CsvRecord>(&mut self) -> BoundIter<'_, R, T> {
        BoundIter {
            rdr: self,
            binding: None,
            record: ByteRecord::new(),
            done: false,
            _record_type: PhantomData,
        }
    }

    /// Read every remaining record into a vector, decoded into `T`.
    ///
    /// This is the batch entry point: it either returns the full record
    /// sequence or the first terminal error.
    pub fn read_all<T: CsvRecord>(&mut self) -> Result<Vec<T>> {
        self.bound::<T>().collect()
    }

    /// Consume the header record when configured to do so.
    fn ensure_headers(&mut self) -> Result<()> {
        if self.headers_done {
            return Ok(());
        }
        self.headers_done = true;
        if !self.has_headers {
            return Ok(());
        }
        let mut record = ByteRecord::new();
        let got = loop {
            match self.read_one_record(&mut record) {
                Ok(got) => break got,
                Err(err) => match self.handle_error(err) {
                    Some(err) => return Err(err),
                    None => continue,
                },
            }
        };
        if !got {
            record.clear();
        }
        self.headers = Some(record);
        Ok(())
    }

    /// Handle a record-level error: run the callback, then apply the
    /// configured mode. `None` means parsing continues with the next
    /// record.
    pub(crate) fn handle_error(&mut self, err: Error) -> Option<Error> {
        if err.is_io_error() || err.is_cancelled() {
            self.eof_done = true;
            return Some(err);
        }
        if let Some(ref mut callback) = self.on_error {
            if callback(&err) == ErrorAction::Stop {
                self.eof_done = true;
                return Some(err);
            }
        }
        match self.error_mode {
            ErrorMode::FailFast => {
                self.eof_done = true;
                Some(err)
            }
            ErrorMode::SkipRecord => None,
            ErrorMode::Collect => {
                if self.error_log.push(err) {
                    None
                } else {
                    self.eof_done = true;
                    let pos = self.position();
                    Some(Error::new(ErrorKind::Parse {
                        pos,
                        msg: "maximum error count exceeded".to_string(),
                    }))
                }
            }
        }
    }

    pub(crate) fn is_lenient(&self) -> bool {
        self.mode == ParseMode::Lenient
    }

    pub(crate) fn has_headers_configured(&self) -> bool {
        self.has_headers
    }

    /// Read exactly one record, without applying the error policy. The
    /// cursor always advances past the offending bytes before an error is
    /// returned, so a caller that swallows the error resumes at the next
    /// record boundary.
    fn read_one_record(&mut self, record: &mut ByteRecord) -> Result<bool> {
        record.clear();
        if self.eof_done {
            return Ok(false);
        }
        if let Some(ref token) = self.cancel {
            if token.is_cancelled() {
                self.eof_done = true;
                return Err(Error::new(ErrorKind::Cancelled));
            }
        }
        self.prime()?;
        loop {
            let (rec_end, term_len) = self.next_boundary()?;
            if rec_end == self.start && term_len == 0 {
                // Nothing left in the stream.
                self.eof_done = true;
                return Ok(false);
            }
            if self.is_comment_line(rec_end) {
                self.advance_past(rec_end, term_len);
                continue;
            }
            if self.skip_empty_lines && self.is_blank_line(rec_end) {
                self.advance_past(rec_end, term_len);
                continue;
            }
            let pos = self.position();
            let result = self.tokenize_record(rec_end, term_len, record);
            self.advance_past(rec_end, term_len);
            match result {
                Ok(()) => {}
                Err(err) => return Err(err),
            }
            if !self.flexible {
                let got = record.len() as u64;
                match self.expected_fields {
                    None => self.expected_fields = Some(got),
                    Some(expected) if expected != got => {
                        return Err(Error::new(
                            ErrorKind::FieldCountMismatch {
                                pos: Some(pos),
                                expected,
                                got,
                            },
                        ));
                    }
                    Some(_) => {}
                }
            }
            record.set_position(Some(pos));
            self.record_index += 1;
            return Ok(true);
        }
    }

    /// Find the end of the record at `self.start`, refilling the buffer
    /// as needed and carrying quote context across refills.
    fn next_boundary(&mut self) -> Result<(usize, usize)> {
        let mut state = BoundaryState::default();
        let mut scan_pos = self.start;
        loop {
            let step = find_record_end(
                &self.buf[..self.end],
                scan_pos,
                self.delimiter,
                self.quote,
                self.escape,
                self.mode,
                self.source_eof,
                &mut state,
            );
            match step {
                ScanStep::Complete { end, term_len } => {
                    if term_len == 0 && state.in_quote() {
                        // The source ended inside an open quote. Strict
                        // mode reports it; lenient closes the quote
                        // implicitly during tokenizing.
                        if self.mode == ParseMode::Strict {
                            let err = self.eof_in_quote_error(end);
                            self.advance_past(end, 0);
                            return Err(err);
                        }
                    }
                    return Ok((end, term_len));
                }
                ScanStep::NeedMore { resume_at } => {
                    scan_pos = resume_at;
                    let shift = self.refill()?;
                    scan_pos -= shift;
                }
            }
        }
    }

    /// Read more bytes from the source, compacting the buffer first.
    /// Returns the number of bytes the buffer contents shifted left.
    fn refill(&mut self) -> Result<usize> {
        let mut shift = 0;
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.abs0 += self.start as u64;
            self.end -= self.start;
            shift = self.start;
            self.start = 0;
        }
        if self.end == self.buf.len() {
            let grown = std::cmp::max(4, self.buf.len() * 2);
            self.buf.resize(grown, 0);
        }
        loop {
            match self.rdr.read(&mut self.buf[self.end..]) {
                Ok(0) => {
                    self.source_eof = true;
                    break;
                }
                Ok(n) => {
                    self.end += n;
                    break;
                }
                Err(ref err)
                    if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(Error::from(err)),
            }
        }
        Ok(shift)
    }

    /// Fill the buffer for the first time and strip a byte order mark.
    fn prime(&mut self) -> Result<()> {
        if self.primed {
            return Ok(());
        }
        self.primed = true;
        while self.end < 3 && !self.source_eof {
            self.refill()?;
        }
        if starts_with_bom(&self.buf[..self.end]) {
            self.start = 3;
        }
        Ok(())
    }

    fn is_comment_line(&self, rec_end: usize) -> bool {
        let Some(prefix) = self.comment else {
            return false;
        };
        let slice = &self.buf[self.start..rec_end];
        let ws = skip_whitespace(slice, 0);
        ws < slice.len() && slice[ws] == prefix
    }

    fn is_blank_line(&self, rec_end: usize) -> bool {
        let slice = &self.buf[self.start..rec_end];
        skip_whitespace(slice, 0) == slice.len()
    }

    fn advance_past(&mut self, rec_end: usize, term_len: usize) {
        self.start = rec_end + term_len;
        if term_len > 0 {
            self.line += 1;
        }
    }

    /// Tokenize the complete record slice `[start, rec_end)` into
    /// `record`, unescaping quoted content as needed.
    fn tokenize_record(
        &mut self,
        rec_end: usize,
        term_len: usize,
        record: &mut ByteRecord,
    ) -> Result<()> {
        let slice = &self.buf[self.start..rec_end];
        let mut tok = TokenizerBuilder::new()
            .delimiter(self.delimiter)
            .quote(self.quote)
            .escape(self.escape)
            .trim(self.trim)
            .mode(self.mode)
            .bom(false)
            .build(slice);
        loop {
            match tok.read_field() {
                Ok(Some(view)) => {
                    record.push_field(view.unescape_into(&mut self.scratch));
                }
                Ok(None) => break,
                Err(err) => {
                    let offset = err.position();
                    let mut pos = self.position();
                    pos.set_byte(self.abs0 + (self.start + offset) as u64)
                        .set_col(offset as u64);
                    let kind = match err.kind() {
                        TokenizeErrorKind::UnterminatedQuote
                            if term_len == 0 && self.source_eof =>
                        {
                            ErrorKind::UnexpectedEof { pos }
                        }
                        _ => ErrorKind::MalformedField {
                            pos,
                            field: None,
                            raw_line: Some(BString::from(slice)),
                            msg: err.to_string(),
                        },
                    };
                    record.clear();
                    return Err(Error::new(kind));
                }
            }
        }
        if self.mode == ParseMode::Strict {
            if let Some(offset) = tok.stray_quote() {
                let mut pos = self.position();
                pos.set_byte(self.abs0 + (self.start + offset) as u64)
                    .set_col(offset as u64);
                record.clear();
                return Err(Error::new(ErrorKind::MalformedField {
                    pos,
                    field: None,
                    raw_line: Some(BString::from(slice)),
                    msg: "quote in unquoted field".to_string(),
                }));
            }
        }
        Ok(())
    }

    fn eof_in_quote_error(&self, rec_end: usize) -> Error {
        let mut pos = self.position();
        pos.set_byte(self.abs0 + rec_end as u64);
        Error::new(ErrorKind::UnexpectedEof { pos })
    }
}

/// An iterator over records as raw byte records.
pub struct ByteRecordsIter<'r, R> {
    rdr: &'r mut Reader<R>,
}

impl<'r, R: io::Read> Iterator for ByteRecordsIter<'r, R> {
    type Item = Result<ByteRecord>;

    fn next(&mut self) -> Option<Result<ByteRecord>> {
        let mut record = ByteRecord::new();
        match self.rdr.read_byte_record(&mut record) {
            Ok(true) => Some(Ok(record)),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// An iterator over records as UTF-8 validated string records.
pub struct StringRecordsIter<'r, R> {
    rdr: &'r mut Reader<R>,
}

impl<'r, R: io::Read> Iterator for StringRecordsIter<'r, R> {
    type Item = Result<StringRecord>;

    fn next(&mut self) -> Option<Result<StringRecord>> {
        let mut record = StringRecord::new();
        match self.rdr.read_record(&mut record) {
            Ok(true) => Some(Ok(record)),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// An iterator over records decoded into a schema-bound record type.
pub struct BoundIter<'r, R, T> {
    rdr: &'r mut Reader<R>,
    binding: Option<HeaderBinding>,
    record: ByteRecord,
    done: bool,
    _record_type: PhantomData<T>,
}

impl<'r, R: io::Read, T: CsvRecord> BoundIter<'r, R, T> {
    fn bind(&mut self) -> Result<()> {
        if self.binding.is_some() {
            return Ok(());
        }
        let binding = if self.rdr.has_headers_configured() {
            let lenient = self.rdr.is_lenient();
            let headers = self.rdr.byte_headers()?.clone();
            HeaderBinding::from_headers(&headers, T::schema(), lenient)?
        } else {
            HeaderBinding::positional(T::schema())
        };
        self.binding = Some(binding);
        Ok(())
    }
}

impl<'r, R: io::Read, T: CsvRecord> Iterator for BoundIter<'r, R, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }
        if let Err(err) = self.bind() {
            self.done = true;
            return Some(Err(err));
        }
        loop {
            match self.rdr.read_byte_record(&mut self.record) {
                Ok(false) => return None,
                Ok(true) => {}
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
            let parsed = {
                let binding =
                    self.binding.as_ref().expect("binding established above");
                let mut stream = FieldStream::new(
                    &self.record,
                    binding,
                    T::schema(),
                    self.rdr.is_lenient(),
                );
                T::parse_record(&mut stream)
            };
            match parsed {
                Ok(value) => return Some(Ok(value)),
                Err(err) => match self.rdr.handle_error(err) {
                    None => continue,
                    Some(err) => {
                        self.done = true;
                        return Some(Err(err));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::byte_record::ByteRecord;
    use crate::error::{ErrorAction, ErrorKind, ErrorMode};
    use csvbind_core::ParseMode;

    use super::{CancelToken, ReaderBuilder};

    fn collect_rows(data: &str, configure: impl FnOnce(&mut ReaderBuilder)) -> Vec<Vec<String>> {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        configure(&mut builder);
        let mut rdr = builder.from_slice(data.as_bytes());
        let mut rows = Vec::new();
        let mut record = ByteRecord::new();
        while rdr.read_byte_record(&mut record).unwrap() {
            rows.push(
                record
                    .iter()
                    .map(|f| String::from_utf8(f.to_vec()).unwrap())
                    .collect(),
            );
        }
        rows
    }

    #[test]
    fn simple_rows() {
        let rows = collect_rows("a,b,c\nx,y,z\n", |_| {});
        assert_eq!(vec![vec!["a", "b", "c"], vec!["x", "y", "z"]], rows);
    }

    #[test]
    fn tiny_buffer_forces_refills() {
        let rows = collect_rows("aaaa,bbbb\ncccc,dddd\n", |b| {
            b.buffer_capacity(2);
        });
        assert_eq!(vec![vec!["aaaa", "bbbb"], vec!["cccc", "dddd"]], rows);
    }

    #[test]
    fn quoted_field_spans_refills() {
        let rows = collect_rows("\"long\nvalue,with\nstuff\",x\nnext,y\n", |b| {
            b.buffer_capacity(3);
        });
        assert_eq!(
            vec![
                vec!["long\nvalue,with\nstuff".to_string(), "x".to_string()],
                vec!["next".to_string(), "y".to_string()],
            ],
            rows
        );
    }

    #[test]
    fn bom_is_stripped_once() {
        let rows = collect_rows("\u{FEFF}a,b\n", |_| {});
        assert_eq!(vec![vec!["a", "b"]], rows);
    }

    #[test]
    fn comment_lines_are_skipped() {
        let rows = collect_rows("# note\na,b\n  # indented\nc,d\n", |b| {
            b.comment(Some(b'#'));
        });
        assert_eq!(vec![vec!["a", "b"], vec!["c", "d"]], rows);
    }

    #[test]
    fn empty_line_is_a_single_empty_field_by_default() {
        let rows = collect_rows("a\n\nb\n", |_| {});
        assert_eq!(vec![vec!["a"], vec![""], vec!["b"]], rows);
    }

    #[test]
    fn skip_empty_lines_drops_blank_records() {
        let rows = collect_rows("a\n\n   \nb\n", |b| {
            b.skip_empty_lines(true);
        });
        assert_eq!(vec![vec!["a"], vec!["b"]], rows);
    }

    #[test]
    fn line_counter_across_records() {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        let mut rdr = builder.from_slice(b"A,B\r\nC,D\nE,F\r");
        let mut record = ByteRecord::new();
        assert!(rdr.read_byte_record(&mut record).unwrap());
        assert_eq!(1, record.position().unwrap().line());
        assert!(rdr.read_byte_record(&mut record).unwrap());
        assert_eq!(2, record.position().unwrap().line());
        assert!(rdr.read_byte_record(&mut record).unwrap());
        assert_eq!(3, record.position().unwrap().line());
        assert!(!rdr.read_byte_record(&mut record).unwrap());
        assert_eq!(4, rdr.position().line());
    }

    #[test]
    fn multiline_quoted_field_advances_line_once() {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        let mut rdr = builder.from_slice(b"\"a\nb\nc\",x\nlast\n");
        let mut record = ByteRecord::new();
        assert!(rdr.read_byte_record(&mut record).unwrap());
        assert!(rdr.read_byte_record(&mut record).unwrap());
        assert_eq!(2, record.position().unwrap().line());
    }

    #[test]
    fn strict_unterminated_quote_is_eof_error() {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        let mut rdr = builder.from_slice(b"\"open");
        let mut record = ByteRecord::new();
        let err = rdr.read_byte_record(&mut record).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnexpectedEof { .. }));
    }

    #[test]
    fn lenient_unterminated_quote_yields_field() {
        let rows = collect_rows("\"open", |b| {
            b.mode(ParseMode::Lenient);
        });
        assert_eq!(vec![vec!["open"]], rows);
    }

    #[test]
    fn strict_stray_quote_is_malformed() {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        let mut rdr = builder.from_slice(b"a\"b\",c\n");
        let mut record = ByteRecord::new();
        let err = rdr.read_byte_record(&mut record).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedField { .. }));
    }

    #[test]
    fn field_count_mismatch() {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        let mut rdr = builder.from_slice(b"a,b\nc\n");
        let mut record = ByteRecord::new();
        assert!(rdr.read_byte_record(&mut record).unwrap());
        let err = rdr.read_byte_record(&mut record).unwrap_err();
        match err.kind() {
            ErrorKind::FieldCountMismatch { expected, got, .. } => {
                assert_eq!((2, 1), (*expected, *got));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn flexible_allows_ragged_records() {
        let rows = collect_rows("a,b\nc\n", |b| {
            b.flexible(true);
        });
        assert_eq!(vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]], rows);
    }

    #[test]
    fn skip_record_mode_resumes_after_bad_record() {
        let rows = collect_rows("good,1\nbad\"q\",2\nalso good,3\n", |b| {
            b.error_mode(ErrorMode::SkipRecord);
        });
        assert_eq!(
            vec![
                vec!["good".to_string(), "1".to_string()],
                vec!["also good".to_string(), "3".to_string()],
            ],
            rows
        );
    }

    #[test]
    fn collect_mode_logs_errors() {
        let mut builder = ReaderBuilder::new();
        builder
            .has_headers(false)
            .error_mode(ErrorMode::Collect)
            .max_error_count(10);
        let mut rdr = builder.from_slice(b"ok,1\nbad\"q\",2\nok,3\n");
        let mut record = ByteRecord::new();
        let mut yielded = 0;
        while rdr.read_byte_record(&mut record).unwrap() {
            yielded += 1;
        }
        assert_eq!(2, yielded);
        assert_eq!(1, rdr.error_log().len());
    }

    #[test]
    fn collect_mode_overflow_terminates() {
        let mut builder = ReaderBuilder::new();
        builder
            .has_headers(false)
            .error_mode(ErrorMode::Collect)
            .max_error_count(1);
        let mut rdr =
            builder.from_slice(b"bad\"a\",1\nbad\"b\",2\nbad\"c\",3\nok,4\n");
        let mut record = ByteRecord::new();
        let err = rdr.read_byte_record(&mut record).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Parse { .. }));
        assert_eq!(1, rdr.error_log().len());
    }

    #[test]
    fn error_callback_can_stop_the_session() {
        let mut builder = ReaderBuilder::new();
        builder
            .has_headers(false)
            .error_mode(ErrorMode::SkipRecord)
            .on_error(|_| ErrorAction::Stop);
        let mut rdr = builder.from_slice(b"bad\"q\",2\nok,3\n");
        let mut record = ByteRecord::new();
        assert!(rdr.read_byte_record(&mut record).is_err());
        assert!(rdr.is_done());
    }

    #[test]
    fn cancellation_between_records() {
        let token = CancelToken::new();
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false).cancel(token.clone());
        let mut rdr = builder.from_slice(b"a\nb\n");
        let mut record = ByteRecord::new();
        assert!(rdr.read_byte_record(&mut record).unwrap());
        token.cancel();
        let err = rdr.read_byte_record(&mut record).unwrap_err();
        assert!(err.is_cancelled());
        assert!(!rdr.read_byte_record(&mut record).unwrap());
    }

    #[test]
    fn headers_are_consumed_and_cached() {
        let mut builder = ReaderBuilder::new();
        let mut rdr = builder.from_slice(b"Name,Age\nAlice,30\n");
        assert_eq!(
            vec!["Name", "Age"],
            rdr.headers().unwrap().iter().collect::<Vec<_>>()
        );
        let mut record = ByteRecord::new();
        assert!(rdr.read_byte_record(&mut record).unwrap());
        assert_eq!(Some(&b"Alice"[..]), record.get(0));
        assert!(!rdr.read_byte_record(&mut record).unwrap());
    }

    #[test]
    fn headers_unavailable_without_configuration() {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        let mut rdr = builder.from_slice(b"a,b\n");
        assert!(rdr.headers().is_err());
    }

    #[test]
    fn record_positions_are_absolute() {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        let mut rdr = builder.from_slice(b"aa,bb\ncc,dd\n");
        let mut record = ByteRecord::new();
        assert!(rdr.read_byte_record(&mut record).unwrap());
        let pos = record.position().unwrap();
        assert_eq!((0, 1, 0), (pos.byte(), pos.line(), pos.record()));
        assert!(rdr.read_byte_record(&mut record).unwrap());
        let pos = record.position().unwrap();
        assert_eq!((6, 2, 1), (pos.byte(), pos.line(), pos.record()));
    }

    #[test]
    fn string_records_iterate() {
        let mut builder = ReaderBuilder::new();
        builder.has_headers(false);
        let mut rdr = builder.from_slice(b"x,y\n");
        let rows: Vec<_> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(1, rows.len());
        assert_eq!(Some("x"), rows[0].get(0));
    }
}
