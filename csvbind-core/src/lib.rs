/*!
`csvbind-core` provides byte-level CSV tokenizing and emitting over borrowed
buffers, with `no_std` support.

The [`Tokenizer`] walks a borrowed byte span and yields [`FieldView`]s, one
record at a time, without copying field content. The [`Emitter`] appends
fields into a caller-supplied byte sink with configurable quoting. Both are
strictly synchronous; streaming over refillable buffers is layered on top by
the `csvbind` crate using [`find_record_end`] and [`BoundaryState`].

# Example

```
use csvbind_core::Tokenizer;

let mut tok = Tokenizer::new(b"city,pop\nBoston,4628910\n");
let mut scratch = Vec::new();
let mut fields = Vec::new();
while let Some(view) = tok.read_field()? {
    fields.push(view.unescape_into(&mut scratch).to_vec());
}
assert_eq!(fields, vec![b"city".to_vec(), b"pop".to_vec()]);
# Ok::<(), csvbind_core::TokenizeError>(())
```
*/

#![no_std]
#![deny(missing_docs)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub use crate::scan::{
    count_quotes, index_of_any, skip_whitespace, starts_with_bom,
};
pub use crate::tokenizer::{
    find_record_end, unescape, BoundaryState, FieldRange, FieldView,
    ParseMode, ScanStep, TokenizeError, TokenizeErrorKind, Tokenizer,
    TokenizerBuilder,
};
pub use crate::writer::{Emitter, EmitterBuilder, QuoteStyle, Terminator};

mod scan;
mod tokenizer;
mod writer;
