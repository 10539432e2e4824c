use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use crate::bind::{CsvRecord, FieldSink, FieldStream};
use crate::error::{Error, ErrorKind, Result};

/// The value kinds natively supported by the schema binding.
///
/// Every kind also exists in a nullable variant, expressed as an `Option`
/// member on the record type.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValueKind {
    /// `bool`.
    Bool,
    /// `i8`.
    I8,
    /// `i16`.
    I16,
    /// `i32`.
    I32,
    /// `i64`.
    I64,
    /// `u8`.
    U8,
    /// `u16`.
    U16,
    /// `u32`.
    U32,
    /// `u64`.
    U64,
    /// `f32`.
    F32,
    /// `f64`.
    F64,
    /// `rust_decimal::Decimal`.
    Decimal,
    /// `char`.
    Char,
    /// `String`.
    String,
    /// `chrono::NaiveDateTime`.
    Instant,
    /// `chrono::DateTime<FixedOffset>`.
    InstantWithOffset,
    /// `uuid::Uuid`.
    Uuid,
    /// `chrono::TimeDelta`.
    Duration,
    /// A type handled entirely by a user-supplied converter.
    Custom,
}

/// One field of a record schema.
#[derive(Clone, Debug)]
pub struct FieldSpec {
    member_name: &'static str,
    csv_name: &'static str,
    ordinal: u32,
    kind: ValueKind,
    nullable: bool,
    required: bool,
    format: Option<&'static str>,
    default: Option<&'static str>,
    has_converter: bool,
}

impl FieldSpec {
    /// Create a field descriptor. The csv name defaults to the member
    /// name.
    pub fn new(
        member_name: &'static str,
        ordinal: u32,
        kind: ValueKind,
    ) -> FieldSpec {
        FieldSpec {
            member_name,
            csv_name: member_name,
            ordinal,
            kind,
            nullable: false,
            required: false,
            format: None,
            default: None,
            has_converter: false,
        }
    }

    /// Override the column header name.
    pub fn csv_name(mut self, name: &'static str) -> FieldSpec {
        self.csv_name = name;
        self
    }

    /// Mark the field as nullable; an empty field then decodes to absent.
    pub fn nullable(mut self, yes: bool) -> FieldSpec {
        self.nullable = yes;
        self
    }

    /// Mark the field as required; a record without it is an error even in
    /// lenient mode.
    pub fn required(mut self, yes: bool) -> FieldSpec {
        self.required = yes;
        self
    }

    /// Attach a date/time format hint.
    pub fn format(mut self, format: &'static str) -> FieldSpec {
        self.format = Some(format);
        self
    }

    /// Attach a default value, decoded when the field is empty or missing.
    pub fn default_value(mut self, default: &'static str) -> FieldSpec {
        self.default = Some(default);
        self
    }

    /// Mark the field as decoded and encoded by a user-supplied converter.
    pub fn converter(mut self) -> FieldSpec {
        self.has_converter = true;
        self
    }

    /// The identifier of the member in the record type.
    pub fn member(&self) -> &'static str {
        self.member_name
    }

    /// The column header name.
    pub fn name(&self) -> &'static str {
        self.csv_name
    }

    /// The field's ordinal, unique within the schema.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// The field's value kind.
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// True when an empty field decodes to absent.
    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    /// True when a record without this field is always an error.
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// The date/time format hint, if any.
    pub fn format_hint(&self) -> Option<&'static str> {
        self.format
    }

    /// The default value literal, if any.
    pub fn default_literal(&self) -> Option<&'static str> {
        self.default
    }

    /// True when a user-supplied converter handles this field.
    pub fn has_converter(&self) -> bool {
        self.has_converter
    }
}

/// Record-level parsing options attached to a schema.
#[derive(Clone, Copy, Debug)]
pub struct RecordOptions {
    delimiter: u8,
    has_headers: bool,
    strict: bool,
    trim: bool,
}

impl Default for RecordOptions {
    fn default() -> RecordOptions {
        RecordOptions {
            delimiter: b',',
            has_headers: true,
            strict: true,
            trim: false,
        }
    }
}

impl RecordOptions {
    /// Create options with the defaults: comma delimited, headers on,
    /// strict, no trimming.
    pub fn new() -> RecordOptions {
        RecordOptions::default()
    }

    /// Set the field delimiter.
    pub fn delimiter(mut self, delimiter: u8) -> RecordOptions {
        self.delimiter = delimiter;
        self
    }

    /// Set whether the data carries a header record.
    pub fn has_headers(mut self, yes: bool) -> RecordOptions {
        self.has_headers = yes;
        self
    }

    /// Set strict parsing.
    pub fn strict(mut self, yes: bool) -> RecordOptions {
        self.strict = yes;
        self
    }

    /// Set whitespace trimming of unquoted fields.
    pub fn trim(mut self, yes: bool) -> RecordOptions {
        self.trim = yes;
        self
    }

    /// The field delimiter.
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter
    }

    /// True when the data carries a header record.
    pub fn headers(&self) -> bool {
        self.has_headers
    }

    /// True when parsing is strict.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// True when unquoted fields are trimmed.
    pub fn is_trim(&self) -> bool {
        self.trim
    }
}

/// A validated, immutable record schema.
///
/// Built once per record type and shared freely afterwards; the fields are
/// sorted by ordinal.
#[derive(Clone, Debug)]
pub struct Schema {
    record_name: &'static str,
    options: RecordOptions,
    fields: Vec<FieldSpec>,
    warnings: Vec<SchemaDiagnostic>,
}

impl Schema {
    /// Start building a schema for the named record type.
    pub fn builder(record_name: &'static str) -> SchemaBuilder {
        SchemaBuilder {
            record_name,
            options: RecordOptions::default(),
            fields: Vec::new(),
        }
    }

    /// The name of the record type this schema describes.
    pub fn record_name(&self) -> &'static str {
        self.record_name
    }

    /// The record-level options.
    pub fn options(&self) -> &RecordOptions {
        &self.options
    }

    /// The field descriptors, sorted by ordinal.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// The number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when the schema has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Look up a field by its csv name. Returns the index into
    /// [`fields`](Schema::fields) and the descriptor.
    pub fn field_by_name(&self, name: &str) -> Option<(usize, &FieldSpec)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.csv_name == name)
    }

    /// Non-fatal diagnostics recorded while validating the schema.
    pub fn warnings(&self) -> &[SchemaDiagnostic] {
        &self.warnings
    }
}

/// A builder for a record schema.
#[derive(Clone, Debug)]
pub struct SchemaBuilder {
    record_name: &'static str,
    options: RecordOptions,
    fields: Vec<FieldSpec>,
}

impl SchemaBuilder {
    /// Set the record-level options.
    pub fn options(&mut self, options: RecordOptions) -> &mut SchemaBuilder {
        self.options = options;
        self
    }

    /// Add a field descriptor.
    pub fn field(&mut self, field: FieldSpec) -> &mut SchemaBuilder {
        self.fields.push(field);
        self
    }

    /// Validate and build the schema.
    ///
    /// Fatal violations (duplicate ordinals, empty csv names) fail the
    /// build; non-fatal ones (zero fields, duplicate csv names) are
    /// recorded as warnings on the schema.
    pub fn build(&self) -> std::result::Result<Schema, SchemaError> {
        let mut fields = self.fields.clone();
        fields.sort_by_key(FieldSpec::ordinal);
        let mut warnings = Vec::new();

        for pair in fields.windows(2) {
            if pair[0].ordinal == pair[1].ordinal {
                return Err(SchemaError {
                    code: DiagnosticCode::DuplicateOrdinal,
                    message: format!(
                        "record '{}': ordinal {} used by both '{}' and '{}'",
                        self.record_name,
                        pair[0].ordinal,
                        pair[0].member_name,
                        pair[1].member_name,
                    ),
                });
            }
        }
        for field in &fields {
            if field.csv_name.is_empty() {
                return Err(SchemaError {
                    code: DiagnosticCode::EmptyCsvName,
                    message: format!(
                        "record '{}': field '{}' has an empty csv name",
                        self.record_name, field.member_name,
                    ),
                });
            }
        }
        if fields.is_empty() {
            warnings.push(SchemaDiagnostic {
                code: DiagnosticCode::EmptyRecord,
                message: format!(
                    "record '{}' has no fields",
                    self.record_name
                ),
            });
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.csv_name == field.csv_name) {
                warnings.push(SchemaDiagnostic {
                    code: DiagnosticCode::DuplicateCsvName,
                    message: format!(
                        "record '{}': csv name '{}' is used more than once",
                        self.record_name, field.csv_name,
                    ),
                });
            }
        }

        Ok(Schema {
            record_name: self.record_name,
            options: self.options,
            fields,
            warnings,
        })
    }
}

/// The stable identifiers of schema diagnostics raised by runtime schema
/// validation.
///
/// Only conditions that can arise when a schema is assembled through
/// [`SchemaBuilder`] appear here. The rest of the stable `S-..` range —
/// S-01 (record type cannot carry a binding), S-03 (unsupported field
/// type), S-04 (composite field type), S-06 (negative ordinal), S-07
/// (invalid converter) and S-10 (not a struct) — concerns the shape of
/// the Rust type declaration itself and is reported exclusively at
/// build time by `#[derive(CsvRecord)]`, under the same identifiers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiagnosticCode {
    /// Two fields share an ordinal.
    DuplicateOrdinal,
    /// The record has no fields.
    EmptyRecord,
    /// A field's csv name is empty.
    EmptyCsvName,
    /// Two fields share a csv name.
    DuplicateCsvName,
}

impl DiagnosticCode {
    /// The stable identifier of this diagnostic.
    pub fn id(&self) -> &'static str {
        match *self {
            DiagnosticCode::DuplicateOrdinal => "S-02",
            DiagnosticCode::EmptyRecord => "S-05",
            DiagnosticCode::EmptyCsvName => "S-08",
            DiagnosticCode::DuplicateCsvName => "S-09",
        }
    }

    /// True for diagnostics that fail the build.
    pub fn is_error(&self) -> bool {
        !matches!(
            *self,
            DiagnosticCode::EmptyRecord | DiagnosticCode::DuplicateCsvName
        )
    }
}

/// A fatal schema validation failure.
#[derive(Clone, Debug)]
pub struct SchemaError {
    code: DiagnosticCode,
    message: String,
}

impl SchemaError {
    /// The stable diagnostic code of this failure.
    pub fn code(&self) -> DiagnosticCode {
        self.code
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code.id(), self.message)
    }
}

impl StdError for SchemaError {}

/// A non-fatal schema diagnostic.
#[derive(Clone, Debug)]
pub struct SchemaDiagnostic {
    code: DiagnosticCode,
    message: String,
}

impl SchemaDiagnostic {
    /// The stable diagnostic code.
    pub fn code(&self) -> DiagnosticCode {
        self.code
    }

    /// The human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for SchemaDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.code.id(), self.message)
    }
}

/// The compiled routines of one record type: its schema plus type-erased
/// parse and emit entry points.
pub struct RecordRoutines {
    schema: &'static Schema,
    parse: fn(&mut FieldStream<'_>) -> Result<Box<dyn Any + Send>>,
    emit: fn(&dyn Any, &mut FieldSink<'_>) -> Result<()>,
}

impl RecordRoutines {
    /// The record's schema.
    pub fn schema(&self) -> &'static Schema {
        self.schema
    }

    /// Parse one record from a field stream, type-erased.
    pub fn parse_dyn(
        &self,
        stream: &mut FieldStream<'_>,
    ) -> Result<Box<dyn Any + Send>> {
        (self.parse)(stream)
    }

    /// Emit one record into a field sink, type-erased. Fails when the
    /// value is not of this routine's record type.
    pub fn emit_dyn(
        &self,
        record: &dyn Any,
        sink: &mut FieldSink<'_>,
    ) -> Result<()> {
        (self.emit)(record, sink)
    }
}

impl fmt::Debug for RecordRoutines {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RecordRoutines")
            .field("schema", &self.schema.record_name())
            .finish()
    }
}

fn parse_erased<T: CsvRecord + Send + 'static>(
    stream: &mut FieldStream<'_>,
) -> Result<Box<dyn Any + Send>> {
    T::parse_record(stream).map(|r| Box::new(r) as Box<dyn Any + Send>)
}

fn emit_erased<T: CsvRecord + 'static>(
    record: &dyn Any,
    sink: &mut FieldSink<'_>,
) -> Result<()> {
    let record = record.downcast_ref::<T>().ok_or_else(|| {
        Error::new(ErrorKind::Write(format!(
            "record is not a '{}'",
            T::schema().record_name()
        )))
    })?;
    record.emit_record(sink)
}

/// A process-wide lookup from record type to its compiled routines.
///
/// The registry is immutable once built and can be shared across sessions
/// without locking.
#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<&'static str, RecordRoutines>,
    by_type: HashMap<TypeId, &'static str>,
}

impl Registry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder { registry: Registry::default() }
    }

    /// Look up a record type's routines by its name.
    pub fn get(&self, record_name: &str) -> Option<&RecordRoutines> {
        self.by_name.get(record_name)
    }

    /// Look up a record type's routines by its Rust type.
    pub fn of<T: CsvRecord + 'static>(&self) -> Option<&RecordRoutines> {
        let name = self.by_type.get(&TypeId::of::<T>())?;
        self.by_name.get(name)
    }

    /// The number of registered record types.
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// True when no record types are registered.
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Iterate over the registered record type names.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.by_name.keys().copied()
    }
}

/// Builds a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// Register a record type.
    pub fn register<T: CsvRecord + Send + 'static>(
        &mut self,
    ) -> &mut RegistryBuilder {
        let schema = T::schema();
        self.registry.by_name.insert(
            schema.record_name(),
            RecordRoutines {
                schema,
                parse: parse_erased::<T>,
                emit: emit_erased::<T>,
            },
        );
        self.registry
            .by_type
            .insert(TypeId::of::<T>(), schema.record_name());
        self
    }

    /// Finish the registry; it is immutable afterwards.
    pub fn build(&mut self) -> Registry {
        std::mem::take(&mut self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sorts_by_ordinal() {
        let schema = Schema::builder("Point")
            .field(FieldSpec::new("y", 1, ValueKind::F64))
            .field(FieldSpec::new("x", 0, ValueKind::F64))
            .build()
            .unwrap();
        assert_eq!("x", schema.fields()[0].member());
        assert_eq!("y", schema.fields()[1].member());
        assert!(schema.warnings().is_empty());
    }

    #[test]
    fn duplicate_ordinal_is_fatal() {
        let err = Schema::builder("Bad")
            .field(FieldSpec::new("a", 0, ValueKind::I32))
            .field(FieldSpec::new("b", 0, ValueKind::I32))
            .build()
            .unwrap_err();
        assert_eq!(DiagnosticCode::DuplicateOrdinal, err.code());
        assert_eq!("S-02", err.code().id());
    }

    #[test]
    fn empty_csv_name_is_fatal() {
        let err = Schema::builder("Bad")
            .field(FieldSpec::new("a", 0, ValueKind::I32).csv_name(""))
            .build()
            .unwrap_err();
        assert_eq!(DiagnosticCode::EmptyCsvName, err.code());
    }

    #[test]
    fn zero_fields_is_a_warning() {
        let schema = Schema::builder("Empty").build().unwrap();
        assert_eq!(1, schema.warnings().len());
        assert_eq!(
            DiagnosticCode::EmptyRecord,
            schema.warnings()[0].code()
        );
        assert!(!schema.warnings()[0].code().is_error());
    }

    #[test]
    fn duplicate_csv_name_is_a_warning() {
        let schema = Schema::builder("Dup")
            .field(FieldSpec::new("a", 0, ValueKind::I32).csv_name("n"))
            .field(FieldSpec::new("b", 1, ValueKind::I32).csv_name("n"))
            .build()
            .unwrap();
        assert_eq!(1, schema.warnings().len());
        assert_eq!(
            DiagnosticCode::DuplicateCsvName,
            schema.warnings()[0].code()
        );
    }

    #[test]
    fn field_lookup_by_name() {
        let schema = Schema::builder("Person")
            .field(FieldSpec::new("name", 0, ValueKind::String).csv_name("Name"))
            .field(FieldSpec::new("age", 1, ValueKind::I32).csv_name("Age"))
            .build()
            .unwrap();
        let (i, field) = schema.field_by_name("Age").unwrap();
        assert_eq!(1, i);
        assert_eq!("age", field.member());
        assert!(schema.field_by_name("City").is_none());
    }
}
