use std::str;

use csvbind_core::{Emitter, QuoteStyle};

use crate::byte_record::{ByteRecord, Position};
use crate::error::{Error, ErrorKind, Result};
use crate::schema::{FieldSpec, Schema};
use crate::value::{ConvertResult, FieldDecode, FieldEncode};

/// A record type with a compile-time schema binding.
///
/// Implementations are normally generated by `#[derive(CsvRecord)]`, which
/// builds the schema once and emits straight-line parse and emit routines
/// walking the fields in ordinal order.
pub trait CsvRecord: Sized {
    /// The schema describing this record type.
    fn schema() -> &'static Schema;

    /// Parse one record from a field stream.
    fn parse_record(stream: &mut FieldStream<'_>) -> Result<Self>;

    /// Emit this record into a field sink.
    fn emit_record(&self, sink: &mut FieldSink<'_>) -> Result<()>;
}

/// A mapping from schema field index to source field index within a
/// record.
///
/// When all headers match the schema the mapping is a bijection; headers
/// with no schema counterpart become skip slots, making it merely
/// injective.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderBinding {
    slots: Vec<Option<usize>>,
}

impl HeaderBinding {
    /// Bind by position: schema field `i` reads source field `i`.
    pub fn positional(schema: &Schema) -> HeaderBinding {
        HeaderBinding { slots: (0..schema.len()).map(Some).collect() }
    }

    /// Bind by header names, matching each schema field's csv name against
    /// the header record.
    ///
    /// A schema field without a matching header is an error unless the
    /// field is nullable, or the binding is `lenient` and the field is not
    /// required.
    pub fn from_headers(
        headers: &ByteRecord,
        schema: &Schema,
        lenient: bool,
    ) -> Result<HeaderBinding> {
        let mut slots = Vec::with_capacity(schema.len());
        for field in schema.fields() {
            let found = headers
                .iter()
                .position(|h| h == field.name().as_bytes());
            if found.is_none()
                && !field.is_nullable()
                && (field.is_required() || !lenient)
            {
                return Err(Error::new(ErrorKind::InvalidHeader {
                    reason: format!(
                        "no column named '{}' for required field '{}' of \
                         record '{}'",
                        field.name(),
                        field.member(),
                        schema.record_name(),
                    ),
                }));
            }
            slots.push(found);
        }
        Ok(HeaderBinding { slots })
    }

    /// The source field index bound to the given schema field index.
    pub fn source_index(&self, schema_index: usize) -> Option<usize> {
        self.slots.get(schema_index).copied().flatten()
    }
}

/// Presents one record's fields to a parse routine in schema order,
/// applying the header binding.
pub struct FieldStream<'r> {
    record: &'r ByteRecord,
    binding: &'r HeaderBinding,
    schema: &'static Schema,
    pos: Position,
    lenient: bool,
}

impl<'r> FieldStream<'r> {
    /// Create a stream over one record.
    pub fn new(
        record: &'r ByteRecord,
        binding: &'r HeaderBinding,
        schema: &'static Schema,
        lenient: bool,
    ) -> FieldStream<'r> {
        let pos = record.position().cloned().unwrap_or_default();
        FieldStream { record, binding, schema, pos, lenient }
    }

    /// The position of the record being parsed.
    pub fn position(&self) -> &Position {
        &self.pos
    }

    /// The raw bytes of the source field bound to the given schema field
    /// index, or `None` when the record has no such field.
    pub fn raw(&self, index: usize) -> Option<&'r [u8]> {
        let source = self.binding.source_index(index)?;
        self.record.get(source)
    }

    /// Decode the field at the given schema field index.
    ///
    /// An empty field decodes to the field's default literal when one is
    /// attached, and to the value kind's zero value otherwise.
    pub fn decode<T: FieldDecode>(&mut self, index: usize) -> Result<T> {
        let spec = &self.schema.fields()[index];
        match self.raw(index) {
            Some(bytes) if !bytes.is_empty() => {
                T::decode(bytes, spec.format_hint())
                    .map_err(|err| self.conversion_error(spec, err))
            }
            Some(_) => self.empty_fallback(spec),
            None => {
                if spec.default_literal().is_none() && spec.is_required() {
                    return Err(self.missing(spec));
                }
                if spec.default_literal().is_none() && !self.lenient {
                    return Err(self.missing(spec));
                }
                self.empty_fallback(spec)
            }
        }
    }

    /// Decode the nullable field at the given schema field index.
    ///
    /// An empty or missing field decodes to the default literal when one
    /// is attached, and to `None` otherwise.
    pub fn decode_opt<T: FieldDecode>(
        &mut self,
        index: usize,
    ) -> Result<Option<T>> {
        let spec = &self.schema.fields()[index];
        match self.raw(index) {
            Some(bytes) if !bytes.is_empty() => {
                T::decode(bytes, spec.format_hint())
                    .map(Some)
                    .map_err(|err| self.conversion_error(spec, err))
            }
            Some(_) => self.default_opt(spec),
            None => {
                if spec.is_required() {
                    return Err(self.missing(spec));
                }
                self.default_opt(spec)
            }
        }
    }

    /// Decode the field at the given schema field index through a
    /// converter. The converter receives the raw field bytes, including
    /// empty ones.
    pub fn convert<T>(
        &mut self,
        index: usize,
        decode: fn(&[u8]) -> ConvertResult<T>,
    ) -> Result<T> {
        let spec = &self.schema.fields()[index];
        match self.raw(index) {
            Some(bytes) => {
                decode(bytes).map_err(|err| self.conversion_error(spec, err))
            }
            None if spec.is_required() || !self.lenient => {
                Err(self.missing(spec))
            }
            None => {
                decode(b"").map_err(|err| self.conversion_error(spec, err))
            }
        }
    }

    /// Decode the nullable field at the given schema field index through a
    /// converter. An empty or missing field decodes to `None`.
    pub fn convert_opt<T>(
        &mut self,
        index: usize,
        decode: fn(&[u8]) -> ConvertResult<T>,
    ) -> Result<Option<T>> {
        let spec = &self.schema.fields()[index];
        match self.raw(index) {
            Some(bytes) if !bytes.is_empty() => decode(bytes)
                .map(Some)
                .map_err(|err| self.conversion_error(spec, err)),
            Some(_) => Ok(None),
            None if spec.is_required() => Err(self.missing(spec)),
            None => Ok(None),
        }
    }

    fn empty_fallback<T: FieldDecode>(
        &self,
        spec: &'static FieldSpec,
    ) -> Result<T> {
        match spec.default_literal() {
            Some(default) => {
                T::decode(default.as_bytes(), spec.format_hint())
                    .map_err(|err| self.conversion_error(spec, err))
            }
            None => Ok(T::empty_value()),
        }
    }

    fn default_opt<T: FieldDecode>(
        &self,
        spec: &'static FieldSpec,
    ) -> Result<Option<T>> {
        match spec.default_literal() {
            Some(default) => T::decode(default.as_bytes(), spec.format_hint())
                .map(Some)
                .map_err(|err| self.conversion_error(spec, err)),
            None => Ok(None),
        }
    }

    fn conversion_error(
        &self,
        spec: &'static FieldSpec,
        err: crate::value::ConvertError,
    ) -> Error {
        Error::new(ErrorKind::TypeConversion {
            pos: self.pos.clone(),
            field: Some(spec.member().to_string()),
            err,
        })
    }

    fn missing(&self, spec: &'static FieldSpec) -> Error {
        Error::new(ErrorKind::MissingField {
            pos: Some(self.pos.clone()),
            field: spec.member().to_string(),
        })
    }
}

/// True when the byte can appear in the output of a plain typed encoder:
/// ASCII alphanumerics plus `+ - . :`.
fn in_plain_alphabet(byte: u8) -> bool {
    byte.is_ascii_alphanumeric()
        || matches!(byte, b'+' | b'-' | b'.' | b':')
}

/// Accepts one record's fields from an emit routine in schema order and
/// writes them through the core emitter.
pub struct FieldSink<'a> {
    emitter: &'a mut Emitter,
    buf: &'a mut Vec<u8>,
    scratch: &'a mut Vec<u8>,
    schema: &'static Schema,
    /// Plain typed output may skip the quoting scan. False when the
    /// quoting style is content-sensitive (`NonNumeric`) or when the
    /// configured delimiter or quote byte collides with the plain typed
    /// alphabet.
    fast_path: bool,
}

impl<'a> FieldSink<'a> {
    /// Create a sink that appends fields to `buf`.
    pub fn new(
        emitter: &'a mut Emitter,
        buf: &'a mut Vec<u8>,
        scratch: &'a mut Vec<u8>,
        schema: &'static Schema,
    ) -> FieldSink<'a> {
        let fast_path = emitter.quote_style() != QuoteStyle::NonNumeric
            && !in_plain_alphabet(emitter.delimiter())
            && !in_plain_alphabet(emitter.quote());
        FieldSink { emitter, buf, scratch, schema, fast_path }
    }

    /// Write the field at the given schema field index.
    ///
    /// Kinds whose output alphabet cannot contain a delimiter, quote or
    /// line break bypass the quoting scan; everything else goes through
    /// the emitter's quoting decision.
    pub fn write<T: FieldEncode>(
        &mut self,
        index: usize,
        value: &T,
    ) -> Result<()> {
        let spec = &self.schema.fields()[index];
        self.scratch.clear();
        value.encode(spec.format_hint(), self.scratch);
        if T::PLAIN && self.fast_path && spec.format_hint().is_none() {
            self.emitter.write_unquoted_field(self.scratch, self.buf);
        } else {
            self.emitter.write_field(self.scratch, self.buf);
        }
        Ok(())
    }

    /// Write the nullable field at the given schema field index. Absent
    /// values become an empty, unquoted field.
    pub fn write_opt<T: FieldEncode>(
        &mut self,
        index: usize,
        value: Option<&T>,
    ) -> Result<()> {
        match value {
            Some(value) => self.write(index, value),
            None => {
                self.emitter.write_absent_field(self.buf);
                Ok(())
            }
        }
    }

    /// Write the field at the given schema field index through a
    /// converter. The converter's bytes are written verbatim, wrapped in
    /// quotes only when the quoting policy demands it, and must be valid
    /// UTF-8.
    pub fn write_converted<T>(
        &mut self,
        index: usize,
        value: &T,
        encode: fn(&T, &mut Vec<u8>) -> ConvertResult<()>,
    ) -> Result<()> {
        let spec = &self.schema.fields()[index];
        self.scratch.clear();
        encode(value, self.scratch).map_err(|err| {
            Error::new(ErrorKind::Write(format!(
                "converter for field '{}' failed: {}",
                spec.member(),
                err
            )))
        })?;
        if str::from_utf8(self.scratch).is_err() {
            return Err(Error::new(ErrorKind::Write(format!(
                "converter for field '{}' produced invalid UTF-8",
                spec.member()
            ))));
        }
        self.emitter.write_field(self.scratch, self.buf);
        Ok(())
    }

    /// Write the nullable field at the given schema field index through a
    /// converter.
    pub fn write_converted_opt<T>(
        &mut self,
        index: usize,
        value: Option<&T>,
        encode: fn(&T, &mut Vec<u8>) -> ConvertResult<()>,
    ) -> Result<()> {
        match value {
            Some(value) => self.write_converted(index, value, encode),
            None => {
                self.emitter.write_absent_field(self.buf);
                Ok(())
            }
        }
    }
}
