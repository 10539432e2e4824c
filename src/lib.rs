/*!
The `csvbind` crate provides a fast, streaming CSV reader and writer with a
compile-time schema binding.

The byte-level tokenizer and emitter live in the `csvbind-core` crate; this
crate layers record framing (headers, buffer refills, line accounting,
error policies, cancellation) and the schema binding on top.

# Reading typed records

Derive [`CsvRecord`] on a plain struct, give each field an ordinal, and the
reader decodes records straight into it:

```no_run
use csvbind::{CsvRecord, ReaderBuilder};

#[derive(CsvRecord)]
struct City {
    #[csv(ordinal = 0, name = "City")]
    name: String,
    #[csv(ordinal = 1, name = "Population")]
    population: u64,
}

# fn main() -> Result<(), Box<dyn std::error::Error>> {
let data = "City,Population\nBoston,4628910\n";
let mut rdr = ReaderBuilder::new().from_slice(data.as_bytes());
for city in rdr.bound::<City>() {
    let city = city?;
    println!("{}: {}", city.name, city.population);
}
# Ok(())
# }
```

Columns are bound to fields by header name, falling back to ordinal
position for headerless data. Untyped access is available through
[`ByteRecord`] and [`StringRecord`] iterators, mirroring the typed
surface.

# Error policies

A read session propagates errors in one of three modes: fail-fast (the
default), skip-record, or collect into a bounded [`ErrorLog`]. See
[`ErrorMode`].
*/

#![deny(missing_docs)]

pub use csvbind_core::{ParseMode, QuoteStyle, Terminator};

pub use crate::bind::{CsvRecord, FieldSink, FieldStream, HeaderBinding};
pub use crate::byte_record::{ByteRecord, ByteRecordIter, Position};
pub use crate::error::{
    Error, ErrorAction, ErrorKind, ErrorLog, ErrorMode, FromUtf8Error,
    IntoInnerError, Result, Utf8Error,
};
pub use crate::reader::{
    BoundIter, ByteRecordsIter, CancelToken, Reader, ReaderBuilder,
    StringRecordsIter,
};
pub use crate::schema::{
    DiagnosticCode, FieldSpec, RecordOptions, RecordRoutines, Registry,
    RegistryBuilder, Schema, SchemaBuilder, SchemaDiagnostic, SchemaError,
    ValueKind,
};
pub use crate::string_record::{StringRecord, StringRecordIter};
pub use crate::value::{
    Converter, ConvertError, ConvertResult, FieldDecode, FieldEncode,
};
pub use crate::writer::{Writer, WriterBuilder};

/// Derives [`CsvRecord`] for a struct with named fields.
///
/// Every field needs an `ordinal`; `name`, `format`, `converter`,
/// `required` and `default` are optional. `Option<T>` members map to
/// nullable fields.
pub use csvbind_derive::CsvRecord;

mod bind;
mod byte_record;
mod error;
mod reader;
mod schema;
mod string_record;
mod value;
mod writer;
