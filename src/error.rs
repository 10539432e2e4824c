use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::result;

use bstr::{BString, ByteSlice};

use crate::byte_record::{ByteRecord, Position};
use crate::value::ConvertError;

/// A type alias for `Result<T, csvbind::Error>`.
pub type Result<T> = result::Result<T, Error>;

/// An error that can occur when processing CSV data.
///
/// This error can happen when reading or writing CSV data.
///
/// The kind is boxed to keep `Result<T>` a single machine word on the happy
/// path.
#[derive(Debug)]
pub struct Error(Box<ErrorKind>);

impl Error {
    /// A crate private constructor for `Error`.
    pub(crate) fn new(kind: ErrorKind) -> Error {
        Error(Box::new(kind))
    }

    /// Return the specific type of this error.
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Unwrap this error into its underlying type.
    pub fn into_kind(self) -> ErrorKind {
        *self.0
    }

    /// Returns true if this is an I/O error.
    ///
    /// If this is true, the underlying `ErrorKind` is guaranteed to be
    /// `ErrorKind::Io`.
    pub fn is_io_error(&self) -> bool {
        matches!(*self.0, ErrorKind::Io(_))
    }

    /// Returns true if this error terminated the session because its
    /// cancellation signal fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.0, ErrorKind::Cancelled)
    }

    /// Return the position at which this error occurred, if available.
    pub fn position(&self) -> Option<&Position> {
        match *self.0 {
            ErrorKind::Utf8 { ref pos, .. } => pos.as_ref(),
            ErrorKind::MalformedField { ref pos, .. } => Some(pos),
            ErrorKind::TypeConversion { ref pos, .. } => Some(pos),
            ErrorKind::MissingField { ref pos, .. } => pos.as_ref(),
            ErrorKind::FieldCountMismatch { ref pos, .. } => pos.as_ref(),
            ErrorKind::UnexpectedEof { ref pos } => Some(pos),
            ErrorKind::Parse { ref pos, .. } => Some(pos),
            _ => None,
        }
    }
}

/// The specific type of an error.
#[derive(Debug)]
pub enum ErrorKind {
    /// An I/O error that occurred while reading or writing CSV data.
    Io(io::Error),
    /// A UTF-8 decoding error that occurred while reading CSV data into
    /// Rust `String`s.
    Utf8 {
        /// The position of the record in which this error occurred, if
        /// available.
        pos: Option<Position>,
        /// The corresponding UTF-8 error.
        err: Utf8Error,
    },
    /// A field violated the quoting rules of the configured parse mode.
    MalformedField {
        /// The position of the offending field.
        pos: Position,
        /// The name of the schema field being parsed, if known.
        field: Option<String>,
        /// The raw bytes of the offending line, if captured.
        raw_line: Option<BString>,
        /// A description of the violation.
        msg: String,
    },
    /// A field's bytes could not be decoded into the destination type.
    TypeConversion {
        /// The position of the offending record.
        pos: Position,
        /// The name of the schema field being parsed, if known.
        field: Option<String>,
        /// The underlying conversion error.
        err: ConvertError,
    },
    /// A required schema field had no corresponding column.
    MissingField {
        /// The position of the record, if available.
        pos: Option<Position>,
        /// The name of the missing schema field.
        field: String,
    },
    /// The header record could not be bound to the schema.
    InvalidHeader {
        /// Why the binding failed.
        reason: String,
    },
    /// Two records with an unequal number of fields were found. This error
    /// only occurs when the `flexible` option is disabled.
    FieldCountMismatch {
        /// The position of the record with the unexpected field count.
        pos: Option<Position>,
        /// The expected number of fields.
        expected: u64,
        /// The number of fields in the bad record.
        got: u64,
    },
    /// The input ended in the middle of a quoted field.
    UnexpectedEof {
        /// The position at which the open quote started.
        pos: Position,
    },
    /// A catch-all parsing failure.
    Parse {
        /// The position of the failure.
        pos: Position,
        /// A description of the failure.
        msg: String,
    },
    /// The session's cancellation signal fired between records.
    Cancelled,
    /// An error occurred on the write side, such as a custom converter
    /// producing invalid UTF-8.
    Write(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new(ErrorKind::Io(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, err)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self.0 {
            ErrorKind::Io(ref err) => Some(err),
            ErrorKind::Utf8 { ref err, .. } => Some(err),
            ErrorKind::TypeConversion { ref err, .. } => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self.0 {
            ErrorKind::Io(ref err) => err.fmt(f),
            ErrorKind::Utf8 { pos: None, ref err } => {
                write!(f, "CSV parse error: field {}: {}", err.field(), err)
            }
            ErrorKind::Utf8 { pos: Some(ref pos), ref err } => write!(
                f,
                "CSV parse error: record {} (line {}, field: {}, byte: {}): \
                 {}",
                pos.record(),
                pos.line(),
                err.field(),
                pos.byte(),
                err
            ),
            ErrorKind::MalformedField {
                ref pos,
                ref field,
                ref raw_line,
                ref msg,
            } => {
                write!(
                    f,
                    "CSV parse error: record {} (line {}, byte in line {}): \
                     {}",
                    pos.record(),
                    pos.line(),
                    pos.col(),
                    msg
                )?;
                if let Some(ref name) = *field {
                    write!(f, " in field '{}'", name)?;
                }
                if let Some(ref raw) = *raw_line {
                    write!(f, " on line {:?}", raw.as_bstr())?;
                }
                Ok(())
            }
            ErrorKind::TypeConversion { ref pos, ref field, ref err } => {
                write!(
                    f,
                    "CSV decode error: record {} (line {}, byte in line {})",
                    pos.record(),
                    pos.line(),
                    pos.col(),
                )?;
                if let Some(ref name) = *field {
                    write!(f, " field '{}'", name)?;
                }
                write!(f, ": {}", err)
            }
            ErrorKind::MissingField { pos: None, ref field } => {
                write!(f, "CSV error: missing required field '{}'", field)
            }
            ErrorKind::MissingField { pos: Some(ref pos), ref field } => {
                write!(
                    f,
                    "CSV error: record {} (line {}): missing required field \
                     '{}'",
                    pos.record(),
                    pos.line(),
                    field
                )
            }
            ErrorKind::InvalidHeader { ref reason } => {
                write!(f, "CSV header error: {}", reason)
            }
            ErrorKind::FieldCountMismatch { pos: None, expected, got } => {
                write!(
                    f,
                    "CSV error: found record with {} fields, but records \
                     have {} fields",
                    got, expected
                )
            }
            ErrorKind::FieldCountMismatch {
                pos: Some(ref pos),
                expected,
                got,
            } => write!(
                f,
                "CSV error: record {} (line: {}, byte: {}): found record \
                 with {} fields, but records have {} fields",
                pos.record(),
                pos.line(),
                pos.byte(),
                got,
                expected
            ),
            ErrorKind::UnexpectedEof { ref pos } => write!(
                f,
                "CSV parse error: record {} (line {}, byte in line {}): \
                 unexpected end of input inside a quoted field",
                pos.record(),
                pos.line(),
                pos.col(),
            ),
            ErrorKind::Parse { ref pos, ref msg } => write!(
                f,
                "CSV parse error: record {} (line {}): {}",
                pos.record(),
                pos.line(),
                msg
            ),
            ErrorKind::Cancelled => {
                write!(f, "CSV session cancelled")
            }
            ErrorKind::Write(ref msg) => {
                write!(f, "CSV write error: {}", msg)
            }
        }
    }
}

/// The error propagation policy of a read session.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ErrorMode {
    /// The first error aborts the session. This is the default.
    #[default]
    FailFast,
    /// On error, the current record is discarded and parsing resumes at the
    /// next record boundary outside quote context.
    SkipRecord,
    /// Like `SkipRecord`, but the error is recorded in the session's error
    /// log. The log is bounded; overflowing it terminates the session.
    Collect,
}

/// What an error callback wants the session to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorAction {
    /// Apply the configured error mode.
    Continue,
    /// Terminate the session regardless of mode.
    Stop,
}

/// A bounded accumulator of per-record errors, filled in
/// [`ErrorMode::Collect`].
#[derive(Debug)]
pub struct ErrorLog {
    errors: Vec<Error>,
    max: usize,
}

impl ErrorLog {
    pub(crate) fn bounded(max: usize) -> ErrorLog {
        ErrorLog { errors: Vec::new(), max }
    }

    /// Record an error. Returns false when the log is full; the session
    /// must then terminate.
    pub(crate) fn push(&mut self, err: Error) -> bool {
        if self.errors.len() >= self.max {
            return false;
        }
        self.errors.push(err);
        true
    }

    /// The number of collected errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// True when no errors were collected.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Iterate over the collected errors.
    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.errors.iter()
    }
}

/// A UTF-8 validation error during record conversion.
///
/// This occurs when attempting to convert a `ByteRecord` into a
/// `StringRecord`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FromUtf8Error {
    record: ByteRecord,
    err: Utf8Error,
}

impl FromUtf8Error {
    /// Create a new FromUtf8Error.
    pub(crate) fn new(record: ByteRecord, err: Utf8Error) -> FromUtf8Error {
        FromUtf8Error { record, err }
    }

    /// Access the underlying `ByteRecord` that failed UTF-8 validation.
    pub fn into_byte_record(self) -> ByteRecord {
        self.record
    }

    /// Access the underlying UTF-8 validation error.
    pub fn utf8_error(&self) -> &Utf8Error {
        &self.err
    }
}

impl fmt::Display for FromUtf8Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl StdError for FromUtf8Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.err)
    }
}

/// A UTF-8 validation error.
///
/// The error includes the index of the field that failed validation, and
/// the last byte at which valid UTF-8 was verified.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Utf8Error {
    /// The field index of a byte record in which UTF-8 validation failed.
    field: usize,
    /// The index into the given field up to which valid UTF-8 was verified.
    valid_up_to: usize,
}

/// Create a new UTF-8 error.
pub(crate) fn new_utf8_error(field: usize, valid_up_to: usize) -> Utf8Error {
    Utf8Error { field, valid_up_to }
}

impl Utf8Error {
    /// The field index of a byte record in which UTF-8 validation failed.
    pub fn field(&self) -> usize {
        self.field
    }

    /// The index into the given field up to which valid UTF-8 was verified.
    pub fn valid_up_to(&self) -> usize {
        self.valid_up_to
    }
}

impl StdError for Utf8Error {}

impl fmt::Display for Utf8Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "invalid utf-8: invalid UTF-8 in field {} near byte index {}",
            self.field, self.valid_up_to
        )
    }
}

/// `IntoInnerError` occurs when consuming a `Writer` fails.
///
/// Consuming the `Writer` causes a flush to happen. If the flush fails, then
/// this error is returned, which contains both the original `Writer` and
/// the error that occurred.
///
/// The type parameter `W` is the unconsumed writer.
pub struct IntoInnerError<W> {
    wtr: W,
    err: io::Error,
}

impl<W> IntoInnerError<W> {
    /// Creates a new `IntoInnerError`.
    pub(crate) fn new(wtr: W, err: io::Error) -> IntoInnerError<W> {
        IntoInnerError { wtr, err }
    }

    /// Returns the error which caused the call to `into_inner` to fail.
    ///
    /// This error was returned when attempting to flush the internal
    /// buffer.
    pub fn error(&self) -> &io::Error {
        &self.err
    }

    /// Returns the underlying writer which generated the error.
    ///
    /// The returned value can be used for error recovery, such as
    /// re-inspecting the buffer.
    pub fn into_inner(self) -> W {
        self.wtr
    }
}

impl<W: std::any::Any> StdError for IntoInnerError<W> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.err.source()
    }
}

impl<W> fmt::Display for IntoInnerError<W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.err.fmt(f)
    }
}

impl<W> fmt::Debug for IntoInnerError<W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.err.fmt(f)
    }
}
