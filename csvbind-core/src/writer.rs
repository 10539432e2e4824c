use memchr::memchr;

use alloc::vec::Vec;

use crate::scan;

/// A record terminator.
///
/// On the write side, `CRLF` emits `\r\n` and `Any(b)` emits the byte given.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Terminator {
    /// `\r\n`.
    CRLF,
    /// The byte given, typically `\n`.
    Any(u8),
}

impl Default for Terminator {
    fn default() -> Terminator {
        Terminator::Any(b'\n')
    }
}

/// The quoting style to use when writing CSV data.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum QuoteStyle {
    /// Never write quotes, even when the field content would be ambiguous.
    Never,
    /// Quote a field only when it contains a delimiter, quote, CR or LF.
    ///
    /// This is the default.
    #[default]
    Minimal,
    /// Put quotes around every field.
    All,
    /// Quote every field that is not a plain decimal literal (optional
    /// sign, digits, at most one dot).
    NonNumeric,
}

/// A builder for configuring a CSV field emitter.
#[derive(Clone, Debug)]
pub struct EmitterBuilder {
    delimiter: u8,
    quote: u8,
    style: QuoteStyle,
    term: Terminator,
}

impl Default for EmitterBuilder {
    fn default() -> EmitterBuilder {
        EmitterBuilder {
            delimiter: b',',
            quote: b'"',
            style: QuoteStyle::default(),
            term: Terminator::default(),
        }
    }
}

impl EmitterBuilder {
    /// Create a new builder with the default configuration.
    pub fn new() -> EmitterBuilder {
        EmitterBuilder::default()
    }

    /// The field delimiter to use when writing. The default is `b','`.
    pub fn delimiter(&mut self, delimiter: u8) -> &mut EmitterBuilder {
        self.delimiter = delimiter;
        self
    }

    /// The quote byte to use when writing. The default is `b'"'`.
    pub fn quote(&mut self, quote: u8) -> &mut EmitterBuilder {
        self.quote = quote;
        self
    }

    /// The quoting style. The default is `QuoteStyle::Minimal`.
    pub fn quote_style(&mut self, style: QuoteStyle) -> &mut EmitterBuilder {
        self.style = style;
        self
    }

    /// The record terminator. The default is `Terminator::Any(b'\n')`.
    pub fn terminator(&mut self, term: Terminator) -> &mut EmitterBuilder {
        self.term = term;
        self
    }

    /// Build an emitter from this configuration.
    ///
    /// # Panics
    ///
    /// Panics when the delimiter equals the quote byte.
    pub fn build(&self) -> Emitter {
        assert!(self.delimiter != self.quote, "delimiter and quote must differ");
        Emitter {
            first_field: true,
            delimiter: self.delimiter,
            quote: self.quote,
            style: self.style,
            term: self.term,
        }
    }
}

/// A CSV field emitter.
///
/// Appends fields and record terminators to a caller-supplied byte sink.
/// The first field of a record is written without a leading delimiter;
/// every following field is prefixed with one. The internal
/// first-field-in-record flag is the only source of truth for that
/// decision.
#[derive(Clone, Debug)]
pub struct Emitter {
    first_field: bool,
    delimiter: u8,
    quote: u8,
    style: QuoteStyle,
    term: Terminator,
}

impl Default for Emitter {
    fn default() -> Emitter {
        EmitterBuilder::new().build()
    }
}

impl Emitter {
    /// Create an emitter with the default configuration.
    pub fn new() -> Emitter {
        Emitter::default()
    }

    /// The configured quote byte.
    pub fn quote(&self) -> u8 {
        self.quote
    }

    /// The configured field delimiter.
    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    /// The configured quoting style.
    pub fn quote_style(&self) -> QuoteStyle {
        self.style
    }

    /// True when the next field written starts a record.
    pub fn is_first_field(&self) -> bool {
        self.first_field
    }

    /// Returns true when the field must be wrapped in quotes under the
    /// configured style.
    pub fn should_quote(&self, field: &[u8]) -> bool {
        match self.style {
            QuoteStyle::Never => false,
            QuoteStyle::All => true,
            QuoteStyle::Minimal => {
                scan::index_of_any(
                    field,
                    &[self.delimiter, self.quote, b'\r', b'\n'],
                ) < field.len()
            }
            QuoteStyle::NonNumeric => !is_numeric_literal(field),
        }
    }

    /// Append one field to `out`, quoting per the configured style.
    pub fn write_field(&mut self, field: &[u8], out: &mut Vec<u8>) {
        if !self.first_field {
            out.push(self.delimiter);
        }
        self.first_field = false;
        if self.should_quote(field) {
            self.write_quoted(field, out);
        } else {
            out.extend_from_slice(field);
        }
    }

    /// Append one field that is known not to need quoting, skipping the
    /// quoting scan entirely.
    ///
    /// The caller guarantees the field contains neither the delimiter,
    /// the quote byte, CR nor LF. Under `QuoteStyle::All` the field is
    /// still wrapped in quotes (no doubling is needed, by the caller's
    /// guarantee); the `NonNumeric` decision is not applied here, so
    /// callers must route `NonNumeric` output through
    /// [`write_field`](Emitter::write_field) instead.
    pub fn write_unquoted_field(&mut self, field: &[u8], out: &mut Vec<u8>) {
        if !self.first_field {
            out.push(self.delimiter);
        }
        self.first_field = false;
        if self.style == QuoteStyle::All {
            out.reserve(field.len() + 2);
            out.push(self.quote);
            out.extend_from_slice(field);
            out.push(self.quote);
        } else {
            out.extend_from_slice(field);
        }
    }

    /// Append an absent field: nothing but the delimiter bookkeeping.
    ///
    /// Unlike an empty field under `QuoteStyle::All`, an absent field is
    /// never quoted.
    pub fn write_absent_field(&mut self, out: &mut Vec<u8>) {
        if !self.first_field {
            out.push(self.delimiter);
        }
        self.first_field = false;
    }

    /// Append the record terminator and reset the first-field flag.
    pub fn write_terminator(&mut self, out: &mut Vec<u8>) {
        match self.term {
            Terminator::CRLF => out.extend_from_slice(b"\r\n"),
            Terminator::Any(b) => out.push(b),
        }
        self.first_field = true;
    }

    /// Reset the first-field flag without writing anything.
    pub fn reset(&mut self) {
        self.first_field = true;
    }

    fn write_quoted(&self, field: &[u8], out: &mut Vec<u8>) {
        // One exact reservation so the sink grows at most once per field.
        out.reserve(2 + field.len() + scan::count_quotes(field, self.quote));
        out.push(self.quote);
        let mut rest = field;
        while let Some(i) = memchr(self.quote, rest) {
            out.extend_from_slice(&rest[..i]);
            out.push(self.quote);
            out.push(self.quote);
            rest = &rest[i + 1..];
        }
        out.extend_from_slice(rest);
        out.push(self.quote);
    }
}

/// True for `[+-]? digits [. digits]` with at least one digit and at most
/// one dot.
fn is_numeric_literal(field: &[u8]) -> bool {
    let digits = match field {
        [b'+' | b'-', rest @ ..] => rest,
        all => all,
    };
    if digits.is_empty() {
        return false;
    }
    let mut seen_dot = false;
    let mut seen_digit = false;
    for &b in digits {
        match b {
            b'0'..=b'9' => seen_digit = true,
            b'.' if !seen_dot => seen_dot = true,
            _ => return false,
        }
    }
    seen_digit
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn emit(builder: &EmitterBuilder, records: &[&[&[u8]]]) -> Vec<u8> {
        let mut emitter = builder.build();
        let mut out = Vec::new();
        for record in records {
            for field in *record {
                emitter.write_field(field, &mut out);
            }
            emitter.write_terminator(&mut out);
        }
        out
    }

    macro_rules! writes_to {
        ($name:ident, $records:expr, $expected:expr) => {
            writes_to!($name, $records, $expected, |builder| builder);
        };
        ($name:ident, $records:expr, $expected:expr, $config:expr) => {
            #[test]
            fn $name() {
                let mut builder = EmitterBuilder::new();
                #[allow(clippy::redundant_closure_call)]
                let _ = ($config)(&mut builder);
                let records: &[&[&[u8]]] = $records;
                let got = emit(&builder, records);
                assert_eq!($expected.as_bytes(), &*got);
            }
        };
    }

    writes_to!(plain, &[&[b"a", b"b", b"c"]], "a,b,c\n");
    writes_to!(two_records, &[&[b"a"], &[b"b"]], "a\nb\n");
    writes_to!(empty_fields, &[&[b"", b"", b""]], ",,\n");
    writes_to!(quotes_delimiter, &[&[b"a,b", b"c"]], "\"a,b\",c\n");
    writes_to!(quotes_newline, &[&[b"a\nb"]], "\"a\nb\"\n");
    writes_to!(doubles_quotes, &[&[b"He said \"Hi\""]], "\"He said \"\"Hi\"\"\"\n");
    writes_to!(
        crlf_terminator,
        &[&[b"a", b"b"]],
        "a,b\r\n",
        |b: &mut EmitterBuilder| { b.terminator(Terminator::CRLF); }
    );
    writes_to!(
        style_all,
        &[&[b"a", b"1"]],
        "\"a\",\"1\"\n",
        |b: &mut EmitterBuilder| { b.quote_style(QuoteStyle::All); }
    );
    writes_to!(
        style_never,
        &[&[b"a,b"]],
        "a,b\n",
        |b: &mut EmitterBuilder| { b.quote_style(QuoteStyle::Never); }
    );
    writes_to!(
        style_non_numeric,
        &[&[b"12.5", b"-3", b"x", b"1.2.3"]],
        "12.5,-3,\"x\",\"1.2.3\"\n",
        |b: &mut EmitterBuilder| { b.quote_style(QuoteStyle::NonNumeric); }
    );
    writes_to!(
        custom_delimiter,
        &[&[b"a;b", b"c"]],
        "\"a;b\";c\n",
        |b: &mut EmitterBuilder| { b.delimiter(b';'); }
    );

    #[test]
    fn minimal_quoting_is_byte_preserving() {
        // When should_quote says no, the emitted field equals the input.
        let emitter = Emitter::new();
        for field in [&b"plain"[..], b"", b"a b", b"1;2"] {
            assert!(!emitter.should_quote(field));
            let mut out = Vec::new();
            let mut e = Emitter::new();
            e.write_field(field, &mut out);
            assert_eq!(field, &*out);
        }
    }

    #[test]
    fn first_field_flag_resets_on_terminator() {
        let mut emitter = Emitter::new();
        let mut out = Vec::new();
        assert!(emitter.is_first_field());
        emitter.write_field(b"a", &mut out);
        assert!(!emitter.is_first_field());
        emitter.write_terminator(&mut out);
        assert!(emitter.is_first_field());
        emitter.write_field(b"b", &mut out);
        assert_eq!(b"a\nb", &*out);
    }

    #[test]
    fn numeric_literal_classification() {
        for yes in ["0", "123", "-4", "+4", "1.5", "-0.25", "3."] {
            assert!(is_numeric_literal(yes.as_bytes()), "{}", yes);
        }
        for no in ["", "-", "+", ".", "1e5", "1.2.3", "a1", " 1", "1 "] {
            assert!(!is_numeric_literal(no.as_bytes()), "{}", no);
        }
    }

    #[test]
    fn unquoted_fast_path_matches_generic_path() {
        for field in [&b"1234"[..], b"-2.5", b"true", b"PT1M30S"] {
            let mut out_fast = Vec::new();
            let mut out_slow = Vec::new();
            let mut fast = Emitter::new();
            let mut slow = Emitter::new();
            fast.write_unquoted_field(field, &mut out_fast);
            slow.write_field(field, &mut out_slow);
            assert_eq!(out_slow, out_fast);
        }
    }

    #[test]
    fn unquoted_fast_path_honors_quote_all() {
        let mut emitter =
            EmitterBuilder::new().quote_style(QuoteStyle::All).build();
        let mut out = Vec::new();
        emitter.write_unquoted_field(b"42", &mut out);
        emitter.write_unquoted_field(b"7", &mut out);
        emitter.write_terminator(&mut out);
        assert_eq!(b"\"42\",\"7\"\n", &*out);
    }

    #[test]
    fn quoted_reservation_is_exact() {
        let mut emitter = Emitter::new();
        let mut out = Vec::new();
        emitter.write_field(b"a\"b\"c,", &mut out);
        assert_eq!(b"\"a\"\"b\"\"c,\"", &*out);
    }
}
