use core::fmt;
use core::ops::Range;

use alloc::vec::Vec;

use crate::scan;

/// How the tokenizer treats quoting and malformed input.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ParseMode {
    /// RFC 4180 quoting; malformed quoting is an error.
    #[default]
    Strict,
    /// Malformed quoting is recovered from: an unterminated quote yields the
    /// field content seen so far, stray bytes after a closing quote join the
    /// field.
    Lenient,
    /// Quote bytes carry no meaning and are ordinary field content.
    IgnoreQuotes,
}

/// An error produced while tokenizing a field.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TokenizeError {
    kind: TokenizeErrorKind,
    line: u64,
    pos: usize,
}

/// The specific kind of a tokenize error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenizeErrorKind {
    /// A quoted field was still open when the input span ended.
    UnterminatedQuote,
    /// An unexpected byte followed the closing quote of a quoted field.
    UnexpectedByte(u8),
}

impl TokenizeError {
    fn new(kind: TokenizeErrorKind, line: u64, pos: usize) -> TokenizeError {
        TokenizeError { kind, line, pos }
    }

    /// The specific kind of this error.
    pub fn kind(&self) -> &TokenizeErrorKind {
        &self.kind
    }

    /// The 1-based line on which the offending record starts.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// The 0-based byte offset of the error within the input span.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl fmt::Display for TokenizeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            TokenizeErrorKind::UnterminatedQuote => write!(
                f,
                "unterminated quoted field (line {}, byte {})",
                self.line, self.pos
            ),
            TokenizeErrorKind::UnexpectedByte(b) => write!(
                f,
                "unexpected byte 0x{:02X} after closing quote \
                 (line {}, byte {})",
                b, self.line, self.pos
            ),
        }
    }
}

impl core::error::Error for TokenizeError {}

/// A borrowed view of one field.
///
/// The view borrows from the tokenizer's input span. For quoted fields the
/// view covers the content between the quotes; when the raw content still
/// contains escape sequences, `needs_unescape` is set and `unescape_into`
/// materializes the decoded bytes into a caller-supplied scratch buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FieldView<'a> {
    bytes: &'a [u8],
    start: usize,
    needs_unescape: bool,
    quoted: bool,
    quote: u8,
    escape: Option<u8>,
}

impl<'a> FieldView<'a> {
    /// The raw bytes of this field, escapes not yet folded.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// The 0-based offset of this field within the input span.
    pub fn start(&self) -> usize {
        self.start
    }

    /// True when the raw bytes still contain escape sequences.
    pub fn needs_unescape(&self) -> bool {
        self.needs_unescape
    }

    /// True when the field was wrapped in quotes in the input.
    pub fn was_quoted(&self) -> bool {
        self.quoted
    }

    /// The decoded bytes of this field.
    ///
    /// Borrows directly from the input when no escapes are present,
    /// otherwise decodes into `scratch` and borrows from there.
    pub fn unescape_into<'s>(&self, scratch: &'s mut Vec<u8>) -> &'s [u8]
    where
        'a: 's,
    {
        if !self.needs_unescape {
            return self.bytes;
        }
        scratch.clear();
        unescape(self.bytes, self.quote, self.escape, scratch);
        scratch
    }
}

/// Decodes the raw content of a quoted field into `out`.
///
/// Doubled quotes (or escape-byte pairs when an escape byte is configured)
/// fold to a single quote. A lone quote byte is dropped; this is what makes
/// lenient recovery of stray bytes after a closing quote work, since the
/// raw span then contains the closing quote in the middle.
pub fn unescape(field: &[u8], quote: u8, escape: Option<u8>, out: &mut Vec<u8>) {
    let mut i = 0;
    while i < field.len() {
        let b = field[i];
        if let Some(esc) = escape {
            if b == esc {
                if i + 1 < field.len() {
                    out.push(field[i + 1]);
                }
                i += 2;
                continue;
            }
        }
        if b == quote {
            if escape.is_none() && i + 1 < field.len() && field[i + 1] == quote
            {
                out.push(quote);
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        out.push(b);
        i += 1;
    }
}

/// The offsets of one field within the tokenizer's input span.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FieldRange {
    /// Start of the field content (for quoted fields, after the opening
    /// quote).
    pub start: usize,
    /// End of the field content, exclusive.
    pub end: usize,
    /// True when the raw bytes still contain escape sequences.
    pub needs_unescape: bool,
    /// True when the field was quoted in the input.
    pub quoted: bool,
}

/// Builds a tokenizer with various configuration knobs.
#[derive(Clone, Debug)]
pub struct TokenizerBuilder {
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    trim: bool,
    comment: Option<u8>,
    mode: ParseMode,
    bom: bool,
}

impl Default for TokenizerBuilder {
    fn default() -> TokenizerBuilder {
        TokenizerBuilder {
            delimiter: b',',
            quote: b'"',
            escape: None,
            trim: false,
            comment: None,
            mode: ParseMode::default(),
            bom: true,
        }
    }
}

impl TokenizerBuilder {
    /// Create a new builder with the default configuration.
    pub fn new() -> TokenizerBuilder {
        TokenizerBuilder::default()
    }

    /// The field delimiter. The default is `b','`.
    pub fn delimiter(&mut self, delimiter: u8) -> &mut TokenizerBuilder {
        self.delimiter = delimiter;
        self
    }

    /// The quote byte. The default is `b'"'`.
    pub fn quote(&mut self, quote: u8) -> &mut TokenizerBuilder {
        self.quote = quote;
        self
    }

    /// The escape byte used inside quoted fields.
    ///
    /// `None` (the default) selects RFC 4180 quote doubling. Setting this to
    /// the quote byte is equivalent to `None`.
    pub fn escape(&mut self, escape: Option<u8>) -> &mut TokenizerBuilder {
        self.escape = escape;
        self
    }

    /// Trim ASCII space and tab from both ends of unquoted fields. Content
    /// inside quotes is preserved exactly.
    pub fn trim(&mut self, yes: bool) -> &mut TokenizerBuilder {
        self.trim = yes;
        self
    }

    /// Treat lines whose first non-blank byte equals the given byte as
    /// comments. Disabled by default.
    pub fn comment(&mut self, comment: Option<u8>) -> &mut TokenizerBuilder {
        self.comment = comment;
        self
    }

    /// The parse mode. The default is `ParseMode::Strict`.
    pub fn mode(&mut self, mode: ParseMode) -> &mut TokenizerBuilder {
        self.mode = mode;
        self
    }

    /// Whether a UTF-8 byte order mark at the start of the span is
    /// consumed. Enabled by default; callers handing the tokenizer slices
    /// from the middle of a stream turn this off.
    pub fn bom(&mut self, yes: bool) -> &mut TokenizerBuilder {
        self.bom = yes;
        self
    }

    /// Build a tokenizer over the given input span.
    ///
    /// # Panics
    ///
    /// Panics when the delimiter collides with the quote or escape byte.
    pub fn build<'a>(&self, input: &'a [u8]) -> Tokenizer<'a> {
        assert!(
            self.delimiter != self.quote,
            "delimiter and quote must differ",
        );
        if let Some(esc) = self.escape {
            assert!(
                self.delimiter != esc,
                "delimiter and escape must differ",
            );
        }
        let escape = match self.escape {
            Some(esc) if esc == self.quote => None,
            other => other,
        };
        Tokenizer {
            input,
            pos: 0,
            line: 1,
            record_start: 0,
            at_record_end: false,
            pending_field: false,
            need_prelude: true,
            done: false,
            stray_quote: None,
            delimiter: self.delimiter,
            quote: self.quote,
            escape,
            trim: self.trim,
            comment: self.comment,
            mode: self.mode,
            bom: self.bom,
        }
    }
}

/// A single-pass CSV field tokenizer over a borrowed byte span.
///
/// The tokenizer yields borrowed field views one record at a time and never
/// copies field content; decoding escaped content is deferred to
/// [`FieldView::unescape_into`].
#[derive(Clone, Debug)]
pub struct Tokenizer<'a> {
    input: &'a [u8],
    /// Cursor position, `0 <= pos <= input.len()`.
    pos: usize,
    /// 1-based line counter; advances once per record terminator consumed
    /// outside quote context.
    line: u64,
    record_start: usize,
    at_record_end: bool,
    pending_field: bool,
    need_prelude: bool,
    done: bool,
    stray_quote: Option<usize>,
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    trim: bool,
    comment: Option<u8>,
    mode: ParseMode,
    bom: bool,
}

impl<'a> Tokenizer<'a> {
    /// Create a tokenizer over `input` with the default configuration.
    pub fn new(input: &'a [u8]) -> Tokenizer<'a> {
        TokenizerBuilder::new().build(input)
    }

    /// The 1-based line number of the cursor.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// The 0-based byte position of the cursor.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The byte offset at which the current record started.
    pub fn record_start(&self) -> usize {
        self.record_start
    }

    /// True once the input span is exhausted.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The offset of the first stray quote seen in an unquoted field of the
    /// current record, if any. Only tracked in strict mode; recovery policy
    /// belongs to the caller.
    pub fn stray_quote(&self) -> Option<usize> {
        self.stray_quote
    }

    /// Rewind the tokenizer to the start of its input span.
    pub fn reset(&mut self) {
        self.pos = 0;
        self.line = 1;
        self.record_start = 0;
        self.at_record_end = false;
        self.pending_field = false;
        self.need_prelude = true;
        self.done = false;
        self.stray_quote = None;
    }

    /// Read the next field of the current record.
    ///
    /// Consumes a trailing delimiter when present. Returns `None` at the end
    /// of the current record (the terminator is left unconsumed; use
    /// [`read_record`](Tokenizer::read_record) or
    /// [`skip_record`](Tokenizer::skip_record) to advance) and at the end of
    /// the input span.
    pub fn read_field(
        &mut self,
    ) -> Result<Option<FieldView<'a>>, TokenizeError> {
        if self.done {
            return Ok(None);
        }
        if self.need_prelude {
            self.prelude();
            if self.done {
                return Ok(None);
            }
        }
        if self.at_record_end {
            return Ok(None);
        }
        if self.pos >= self.input.len() {
            if self.pending_field {
                self.pending_field = false;
                self.at_record_end = true;
                let end = self.input.len();
                return Ok(Some(self.view(end..end, false, false)));
            }
            self.done = true;
            return Ok(None);
        }
        self.pending_field = false;
        let byte = self.input[self.pos];
        if byte == self.quote && self.mode != ParseMode::IgnoreQuotes {
            self.quoted_field().map(Some)
        } else {
            Ok(Some(self.unquoted_field()))
        }
    }

    /// Read all fields of the next record into `out` and consume the record
    /// terminator. Returns the field count, or `None` at end of stream.
    pub fn read_record(
        &mut self,
        out: &mut Vec<FieldRange>,
    ) -> Result<Option<usize>, TokenizeError> {
        out.clear();
        while let Some(view) = self.read_field()? {
            out.push(FieldRange {
                start: view.start,
                end: view.start + view.bytes.len(),
                needs_unescape: view.needs_unescape,
                quoted: view.quoted,
            });
        }
        if out.is_empty() && self.done {
            return Ok(None);
        }
        self.consume_terminator();
        Ok(Some(out.len()))
    }

    /// Skip the remainder of the current record, including its terminator.
    /// Returns false at end of stream.
    pub fn skip_record(&mut self) -> Result<bool, TokenizeError> {
        let mut any = false;
        while self.read_field()?.is_some() {
            any = true;
        }
        if !any && self.done {
            return Ok(false);
        }
        self.consume_terminator();
        Ok(true)
    }

    /// Decode the bytes of a previously returned field range.
    pub fn field_bytes<'s>(
        &self,
        range: &FieldRange,
        scratch: &'s mut Vec<u8>,
    ) -> &'s [u8]
    where
        'a: 's,
    {
        let raw = &self.input[range.start..range.end];
        if !range.needs_unescape {
            return raw;
        }
        scratch.clear();
        unescape(raw, self.quote, self.escape, scratch);
        scratch
    }

    /// Handles the start of a record: the byte order mark (first record
    /// only) and any run of comment lines.
    fn prelude(&mut self) {
        self.need_prelude = false;
        self.stray_quote = None;
        if self.bom && self.pos == 0 && scan::starts_with_bom(self.input) {
            self.pos = 3;
            self.record_start = 3;
        }
        let Some(prefix) = self.comment else { return };
        loop {
            debug_assert_eq!(self.pos, self.record_start);
            let ws_end = scan::skip_whitespace(self.input, self.pos);
            if ws_end >= self.input.len() || self.input[ws_end] != prefix {
                return;
            }
            let rel =
                scan::index_of_any(&self.input[ws_end..], &[b'\r', b'\n']);
            let term = ws_end + rel;
            if term >= self.input.len() {
                self.pos = self.input.len();
                self.record_start = self.pos;
                self.done = true;
                return;
            }
            self.pos = term;
            self.eat_terminator_bytes();
            self.line += 1;
            self.record_start = self.pos;
            if self.pos >= self.input.len() {
                self.done = true;
                return;
            }
        }
    }

    fn unquoted_field(&mut self) -> FieldView<'a> {
        let start = self.pos;
        let rel = if self.mode == ParseMode::Strict {
            scan::index_of_any(
                &self.input[start..],
                &[self.delimiter, self.quote, b'\r', b'\n'],
            )
        } else {
            scan::index_of_any(
                &self.input[start..],
                &[self.delimiter, b'\r', b'\n'],
            )
        };
        let i = start + rel;
        let end;
        if i >= self.input.len() {
            end = self.input.len();
            self.pos = end;
            self.at_record_end = true;
        } else if self.input[i] == self.delimiter {
            end = i;
            self.pos = i + 1;
            self.pending_field = true;
        } else if self.input[i] == b'\r' || self.input[i] == b'\n' {
            end = i;
            self.pos = i;
            self.at_record_end = true;
        } else {
            // Stray quote in strict mode. Truncate here; the next field
            // starts at the quote, and the caller decides whether the
            // record is acceptable.
            self.stray_quote = Some(i);
            end = i;
            self.pos = i;
        }
        let (s, e) = if self.trim {
            self.trim_range(start, end)
        } else {
            (start, end)
        };
        self.view(s..e, false, false)
    }

    fn quoted_field(&mut self) -> Result<FieldView<'a>, TokenizeError> {
        let field_start = self.pos;
        let content_start = self.pos + 1;
        self.pos = content_start;
        let mut needs_unescape = false;
        let content_end;
        loop {
            if self.pos >= self.input.len() {
                if self.mode == ParseMode::Strict {
                    return Err(TokenizeError::new(
                        TokenizeErrorKind::UnterminatedQuote,
                        self.line,
                        field_start,
                    ));
                }
                self.at_record_end = true;
                let end = self.input.len();
                return Ok(self.view(content_start..end, needs_unescape, true));
            }
            let i = match self.escape {
                None => {
                    self.pos
                        + scan::index_of_any(
                            &self.input[self.pos..],
                            &[self.quote],
                        )
                }
                Some(esc) => {
                    self.pos
                        + scan::index_of_any(
                            &self.input[self.pos..],
                            &[self.quote, esc],
                        )
                }
            };
            if i >= self.input.len() {
                self.pos = self.input.len();
                continue;
            }
            if let Some(esc) = self.escape {
                if self.input[i] == esc {
                    needs_unescape = true;
                    self.pos = i + 2;
                    if self.pos > self.input.len() {
                        self.pos = self.input.len();
                    }
                    continue;
                }
            }
            if self.escape.is_none()
                && i + 1 < self.input.len()
                && self.input[i + 1] == self.quote
            {
                needs_unescape = true;
                self.pos = i + 2;
                continue;
            }
            content_end = i;
            self.pos = i + 1;
            break;
        }
        if self.trim {
            self.pos = scan::skip_whitespace(self.input, self.pos);
        }
        if self.pos >= self.input.len() {
            self.at_record_end = true;
            return Ok(self.view(
                content_start..content_end,
                needs_unescape,
                true,
            ));
        }
        let byte = self.input[self.pos];
        if byte == self.delimiter {
            self.pos += 1;
            self.pending_field = true;
            Ok(self.view(content_start..content_end, needs_unescape, true))
        } else if byte == b'\r' || byte == b'\n' {
            self.at_record_end = true;
            Ok(self.view(content_start..content_end, needs_unescape, true))
        } else if self.mode == ParseMode::Strict {
            Err(TokenizeError::new(
                TokenizeErrorKind::UnexpectedByte(byte),
                self.line,
                self.pos,
            ))
        } else {
            // Lenient: the stray bytes join the field. The raw span now
            // contains the closing quote, which unescaping drops.
            let rel = scan::index_of_any(
                &self.input[self.pos..],
                &[self.delimiter, b'\r', b'\n'],
            );
            let j = self.pos + rel;
            if j >= self.input.len() {
                self.pos = self.input.len();
                self.at_record_end = true;
            } else if self.input[j] == self.delimiter {
                self.pos = j + 1;
                self.pending_field = true;
            } else {
                self.pos = j;
                self.at_record_end = true;
            }
            Ok(self.view(content_start..j.min(self.input.len()), true, true))
        }
    }

    /// Consume the record terminator under the cursor, if any, and prepare
    /// for the next record. Only meaningful once
    /// [`read_field`](Tokenizer::read_field) has returned `None` for the
    /// current record.
    pub fn consume_terminator(&mut self) {
        if self.pos < self.input.len() {
            self.eat_terminator_bytes();
            self.line += 1;
        }
        self.at_record_end = false;
        self.pending_field = false;
        self.record_start = self.pos;
        self.need_prelude = true;
        if self.pos >= self.input.len() {
            self.done = true;
        }
    }

    /// Advance past one CR, LF or CRLF at the cursor.
    fn eat_terminator_bytes(&mut self) {
        match self.input[self.pos] {
            b'\r' => {
                self.pos += 1;
                if self.pos < self.input.len()
                    && self.input[self.pos] == b'\n'
                {
                    self.pos += 1;
                }
            }
            b'\n' => self.pos += 1,
            _ => {}
        }
    }

    fn trim_range(&self, mut s: usize, mut e: usize) -> (usize, usize) {
        while s < e && matches!(self.input[s], b' ' | b'\t') {
            s += 1;
        }
        while e > s && matches!(self.input[e - 1], b' ' | b'\t') {
            e -= 1;
        }
        (s, e)
    }

    fn view(
        &self,
        range: Range<usize>,
        needs_unescape: bool,
        quoted: bool,
    ) -> FieldView<'a> {
        FieldView {
            bytes: &self.input[range.start..range.end],
            start: range.start,
            needs_unescape,
            quoted,
            quote: self.quote,
            escape: self.escape,
        }
    }
}

/// Persistent state of the record boundary scan, carried across buffer
/// refills by a streaming caller.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BoundaryState {
    phase: BoundaryPhase,
}

impl BoundaryState {
    /// True while the scan is inside an open quoted field.
    pub fn in_quote(&self) -> bool {
        self.phase == BoundaryPhase::Quoted
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum BoundaryPhase {
    #[default]
    FieldStart,
    Unquoted,
    Quoted,
    AfterClose,
}

/// Outcome of one boundary scan step.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanStep {
    /// A record's content ends at `end`; its terminator occupies the
    /// following `term_len` bytes (0 at end of input).
    Complete {
        /// Offset where the record's content ends.
        end: usize,
        /// Length in bytes of the terminator following the content (0 at end of input).
        term_len: usize,
    },
    /// The span ended before the record did; rescan from `resume_at` once
    /// more input is available.
    NeedMore {
        /// Offset to resume scanning from once more input is available.
        resume_at: usize,
    },
}

/// Finds the end of the record starting at or before `pos`, honoring quote
/// context. Mirrors the tokenizer's field states so that a streaming caller
/// can slice complete records out of a refillable buffer and tokenize each
/// slice in isolation.
///
/// `is_final` tells the scan that no further input will arrive, resolving
/// the lookahead cases (CR at end of span, quote at end of span).
pub fn find_record_end(
    input: &[u8],
    mut pos: usize,
    delimiter: u8,
    quote: u8,
    escape: Option<u8>,
    mode: ParseMode,
    is_final: bool,
    state: &mut BoundaryState,
) -> ScanStep {
    loop {
        if pos >= input.len() {
            return if is_final {
                ScanStep::Complete { end: input.len(), term_len: 0 }
            } else {
                ScanStep::NeedMore { resume_at: input.len() }
            };
        }
        match state.phase {
            BoundaryPhase::FieldStart => {
                let byte = input[pos];
                if byte == quote && mode != ParseMode::IgnoreQuotes {
                    state.phase = BoundaryPhase::Quoted;
                    pos += 1;
                } else if byte == delimiter {
                    pos += 1;
                } else if byte == b'\r' || byte == b'\n' {
                    return complete_at(input, pos, is_final);
                } else {
                    state.phase = BoundaryPhase::Unquoted;
                    pos += 1;
                }
            }
            BoundaryPhase::Unquoted => {
                let i = if mode == ParseMode::Strict {
                    pos + scan::index_of_any(
                        &input[pos..],
                        &[delimiter, quote, b'\r', b'\n'],
                    )
                } else {
                    pos + scan::index_of_any(
                        &input[pos..],
                        &[delimiter, b'\r', b'\n'],
                    )
                };
                if i >= input.len() {
                    pos = input.len();
                    continue;
                }
                let byte = input[i];
                if byte == delimiter {
                    state.phase = BoundaryPhase::FieldStart;
                    pos = i + 1;
                } else if byte == b'\r' || byte == b'\n' {
                    state.phase = BoundaryPhase::FieldStart;
                    return complete_at(input, i, is_final);
                } else {
                    // Stray quote in strict mode re-enters quoted context,
                    // matching the tokenizer's recovery.
                    state.phase = BoundaryPhase::Quoted;
                    pos = i + 1;
                }
            }
            BoundaryPhase::Quoted => {
                let i = match escape {
                    None => pos + scan::index_of_any(&input[pos..], &[quote]),
                    Some(esc) => {
                        pos + scan::index_of_any(&input[pos..], &[quote, esc])
                    }
                };
                if i >= input.len() {
                    pos = input.len();
                    continue;
                }
                if let Some(esc) = escape {
                    if input[i] == esc {
                        if i + 1 < input.len() {
                            pos = i + 2;
                            continue;
                        }
                        if is_final {
                            return ScanStep::Complete {
                                end: input.len(),
                                term_len: 0,
                            };
                        }
                        return ScanStep::NeedMore { resume_at: i };
                    }
                    state.phase = BoundaryPhase::AfterClose;
                    pos = i + 1;
                    continue;
                }
                if i + 1 < input.len() {
                    if input[i + 1] == quote {
                        pos = i + 2;
                    } else {
                        state.phase = BoundaryPhase::AfterClose;
                        pos = i + 1;
                    }
                    continue;
                }
                if is_final {
                    state.phase = BoundaryPhase::AfterClose;
                    return ScanStep::Complete {
                        end: input.len(),
                        term_len: 0,
                    };
                }
                return ScanStep::NeedMore { resume_at: i };
            }
            BoundaryPhase::AfterClose => {
                let i = pos
                    + scan::index_of_any(
                        &input[pos..],
                        &[delimiter, b'\r', b'\n'],
                    );
                if i >= input.len() {
                    pos = input.len();
                    continue;
                }
                if input[i] == delimiter {
                    state.phase = BoundaryPhase::FieldStart;
                    pos = i + 1;
                } else {
                    state.phase = BoundaryPhase::FieldStart;
                    return complete_at(input, i, is_final);
                }
            }
        }
    }
}

fn complete_at(input: &[u8], term_pos: usize, is_final: bool) -> ScanStep {
    if input[term_pos] == b'\n' {
        return ScanStep::Complete { end: term_pos, term_len: 1 };
    }
    // CR: look one byte ahead for CRLF.
    if term_pos + 1 < input.len() {
        let len = if input[term_pos + 1] == b'\n' { 2 } else { 1 };
        ScanStep::Complete { end: term_pos, term_len: len }
    } else if is_final {
        ScanStep::Complete { end: term_pos, term_len: 1 }
    } else {
        ScanStep::NeedMore { resume_at: term_pos }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::vec::Vec;

    use super::*;

    type Csv = Vec<Vec<String>>;

    macro_rules! csv {
        ($([$($field:expr),*]),*) => {{
            let mut csv = Csv::new();
            $(
                let mut row: Vec<String> = Vec::new();
                $(
                    row.push(String::from($field));
                )*
                csv.push(row);
            )*
            csv
        }}
    }

    macro_rules! parses_to {
        ($name:ident, $data:expr, $expected:expr) => {
            parses_to!($name, $data, $expected, |builder| builder);
        };
        ($name:ident, $data:expr, $expected:expr, $config:expr) => {
            #[test]
            fn $name() {
                let mut builder = TokenizerBuilder::new();
                #[allow(clippy::redundant_closure_call)]
                let _ = ($config)(&mut builder);
                let got = parse(&builder, $data.as_bytes());
                let expected: Csv = $expected;
                assert_eq!(expected, got);
            }
        };
    }

    fn parse(builder: &TokenizerBuilder, data: &[u8]) -> Csv {
        let mut tok = builder.build(data);
        let mut csv = Csv::new();
        let mut scratch = Vec::new();
        loop {
            let mut row: Vec<String> = Vec::new();
            let mut got_field = false;
            while let Some(view) = tok.read_field().unwrap() {
                got_field = true;
                let bytes = view.unescape_into(&mut scratch);
                row.push(String::from_utf8(bytes.to_vec()).unwrap());
            }
            if !got_field && tok.is_done() {
                break;
            }
            tok.consume_terminator();
            csv.push(row);
        }
        csv
    }

    parses_to!(one_row_one_field, "a", csv![["a"]]);
    parses_to!(one_row_many_fields, "a,b,c", csv![["a", "b", "c"]]);
    parses_to!(one_row_trailing_comma, "a,b,", csv![["a", "b", ""]]);
    parses_to!(one_row_one_field_lf, "a\n", csv![["a"]]);
    parses_to!(one_row_many_fields_lf, "a,b,c\n", csv![["a", "b", "c"]]);
    parses_to!(one_row_one_field_crlf, "a\r\n", csv![["a"]]);
    parses_to!(one_row_one_field_cr, "a\r", csv![["a"]]);
    parses_to!(all_empty_fields, ",,,", csv![["", "", "", ""]]);
    parses_to!(lone_delimiter, ",", csv![["", ""]]);

    parses_to!(many_rows, "a,b\nx,y", csv![["a", "b"], ["x", "y"]]);
    parses_to!(many_rows_lf, "a,b\nx,y\n", csv![["a", "b"], ["x", "y"]]);
    parses_to!(
        many_rows_crlf,
        "a,b\r\nx,y\r\n",
        csv![["a", "b"], ["x", "y"]]
    );
    parses_to!(many_rows_cr, "a,b\rx,y\r", csv![["a", "b"], ["x", "y"]]);
    parses_to!(
        mixed_terminators,
        "A,B\r\nC,D\nE,F\r",
        csv![["A", "B"], ["C", "D"], ["E", "F"]]
    );

    parses_to!(empty, "", csv![]);
    parses_to!(empty_line_is_empty_record, "\n", csv![[""]]);
    parses_to!(
        empty_lines_preserved,
        "a\n\nb\n",
        csv![["a"], [""], ["b"]]
    );

    parses_to!(quote_empty, "\"\"", csv![[""]]);
    parses_to!(quote_space, "\" \"", csv![[" "]]);
    parses_to!(quote_comma, "\"a,b\"", csv![["a,b"]]);
    parses_to!(quote_newline, "\"a\nb\",c", csv![["a\nb", "c"]]);
    parses_to!(quote_doubled, "\"a\"\"b\"", csv![["a\"b"]]);
    parses_to!(
        quote_doubled_example,
        "\"He said \"\"Hi\"\"\"",
        csv![["He said \"Hi\""]]
    );
    parses_to!(quote_outer_space, "  \"a\"  ", csv![["  \"a\"  "]],
               |b: &mut TokenizerBuilder| { b.mode(ParseMode::Lenient); });
    parses_to!(quote_change, "zaz", csv![["a"]],
               |b: &mut TokenizerBuilder| { b.quote(b'z'); });
    parses_to!(quote_escape_backslash, r#""a\"b""#, csv![["a\"b"]],
               |b: &mut TokenizerBuilder| { b.escape(Some(b'\\')); });

    parses_to!(ignore_quotes, "\"a,b\"", csv![["\"a", "b\""]],
               |b: &mut TokenizerBuilder| { b.mode(ParseMode::IgnoreQuotes); });

    parses_to!(
        lenient_unterminated,
        "\"open",
        csv![["open"]],
        |b: &mut TokenizerBuilder| { b.mode(ParseMode::Lenient); }
    );
    parses_to!(
        lenient_stray_after_close,
        "\"a\"b,c",
        csv![["ab", "c"]],
        |b: &mut TokenizerBuilder| { b.mode(ParseMode::Lenient); }
    );
    parses_to!(
        lenient_embedded_quote_is_content,
        "a\"b,c",
        csv![["a\"b", "c"]],
        |b: &mut TokenizerBuilder| { b.mode(ParseMode::Lenient); }
    );

    parses_to!(
        trim_unquoted,
        "  a  , b ,c",
        csv![["a", "b", "c"]],
        |b: &mut TokenizerBuilder| { b.trim(true); }
    );
    parses_to!(
        trim_preserves_quoted,
        "\" a \", b",
        csv![[" a ", "b"]],
        |b: &mut TokenizerBuilder| { b.trim(true); }
    );
    parses_to!(
        trim_after_closing_quote,
        "\"a\"  ,b",
        csv![["a", "b"]],
        |b: &mut TokenizerBuilder| {
            b.trim(true).mode(ParseMode::Lenient);
        }
    );

    parses_to!(
        comments_skipped,
        "# one\na,b\n  # two\nc,d\n",
        csv![["a", "b"], ["c", "d"]],
        |b: &mut TokenizerBuilder| { b.comment(Some(b'#')); }
    );
    parses_to!(
        comment_prefix_off_is_content,
        "#a,b\n",
        csv![["#a", "b"]]
    );

    parses_to!(bom_stripped, "\u{FEFF}a,b", csv![["a", "b"]]);

    parses_to!(
        delimiter_semicolon,
        "a;b\nc;d",
        csv![["a", "b"], ["c", "d"]],
        |b: &mut TokenizerBuilder| { b.delimiter(b';'); }
    );

    #[test]
    fn strict_unterminated_quote_fails() {
        let mut tok = Tokenizer::new(b"\"open");
        let err = tok.read_field().unwrap_err();
        assert_eq!(*err.kind(), TokenizeErrorKind::UnterminatedQuote);
        assert_eq!(1, err.line());
        assert_eq!(0, err.position());
    }

    #[test]
    fn strict_stray_byte_after_quote_fails() {
        let mut tok = Tokenizer::new(b"\"a\"b,c");
        let err = tok.read_field().unwrap_err();
        assert_eq!(*err.kind(), TokenizeErrorKind::UnexpectedByte(b'b'));
    }

    #[test]
    fn strict_stray_quote_is_flagged() {
        let mut tok = Tokenizer::new(b"a\"b\"");
        let view = tok.read_field().unwrap().unwrap();
        assert_eq!(b"a", view.as_bytes());
        assert_eq!(Some(1), tok.stray_quote());
    }

    #[test]
    fn needs_unescape_flag() {
        let mut tok = Tokenizer::new(b"\"a\"\"b\",\"plain\"");
        let view = tok.read_field().unwrap().unwrap();
        assert!(view.needs_unescape());
        let view = tok.read_field().unwrap().unwrap();
        assert!(!view.needs_unescape());
        assert_eq!(b"plain", view.as_bytes());
    }

    #[test]
    fn line_counter_tracks_terminators_only() {
        let data = b"A,B\r\nC,D\nE,F\r";
        let mut tok = Tokenizer::new(data);
        let mut ranges = Vec::new();
        assert_eq!(Some(2), tok.read_record(&mut ranges).unwrap());
        assert_eq!(2, tok.line());
        assert_eq!(Some(2), tok.read_record(&mut ranges).unwrap());
        assert_eq!(3, tok.line());
        assert_eq!(Some(2), tok.read_record(&mut ranges).unwrap());
        assert_eq!(4, tok.line());
        assert_eq!(None, tok.read_record(&mut ranges).unwrap());
        assert_eq!(4, tok.line());
    }

    #[test]
    fn embedded_newline_does_not_advance_line() {
        let mut tok = Tokenizer::new(b"\"a\nb\",c\nd\n");
        let mut ranges = Vec::new();
        assert_eq!(Some(2), tok.read_record(&mut ranges).unwrap());
        assert_eq!(2, tok.line());
        assert_eq!(Some(1), tok.read_record(&mut ranges).unwrap());
        assert_eq!(3, tok.line());
    }

    #[test]
    fn cursor_accounting_is_exact() {
        // All bytes are attributed to fields, delimiters or terminators.
        let data = b"ab,cd\r\n\"e,f\",\n";
        let mut tok = Tokenizer::new(data);
        while tok.skip_record().unwrap() {}
        assert_eq!(data.len(), tok.position());
    }

    #[test]
    fn skip_record_advances() {
        let mut tok = Tokenizer::new(b"a,b\nc,d\n");
        assert!(tok.skip_record().unwrap());
        let view = tok.read_field().unwrap().unwrap();
        assert_eq!(b"c", view.as_bytes());
    }

    #[test]
    fn reset_rewinds() {
        let mut tok = Tokenizer::new(b"a\nb\n");
        assert!(tok.skip_record().unwrap());
        assert!(tok.skip_record().unwrap());
        assert!(tok.is_done());
        tok.reset();
        let view = tok.read_field().unwrap().unwrap();
        assert_eq!(b"a", view.as_bytes());
    }

    fn boundary(
        data: &[u8],
        mode: ParseMode,
        is_final: bool,
    ) -> (ScanStep, BoundaryState) {
        let mut state = BoundaryState::default();
        let step = find_record_end(
            data, 0, b',', b'"', None, mode, is_final, &mut state,
        );
        (step, state)
    }

    #[test]
    fn boundary_simple() {
        let (step, _) = boundary(b"a,b\nc,d\n", ParseMode::Strict, false);
        assert_eq!(ScanStep::Complete { end: 3, term_len: 1 }, step);
    }

    #[test]
    fn boundary_crlf() {
        let (step, _) = boundary(b"a,b\r\nc", ParseMode::Strict, false);
        assert_eq!(ScanStep::Complete { end: 3, term_len: 2 }, step);
    }

    #[test]
    fn boundary_quoted_newline() {
        let (step, _) = boundary(b"\"a\nb\",c\nd", ParseMode::Strict, false);
        assert_eq!(ScanStep::Complete { end: 7, term_len: 1 }, step);
    }

    #[test]
    fn boundary_needs_more_in_quote() {
        let (step, state) = boundary(b"\"open", ParseMode::Strict, false);
        assert_eq!(ScanStep::NeedMore { resume_at: 5 }, step);
        assert!(state.in_quote());
    }

    #[test]
    fn boundary_cr_at_end_needs_lookahead() {
        let (step, _) = boundary(b"a\r", ParseMode::Strict, false);
        assert_eq!(ScanStep::NeedMore { resume_at: 1 }, step);
        let (step, _) = boundary(b"a\r", ParseMode::Strict, true);
        assert_eq!(ScanStep::Complete { end: 1, term_len: 1 }, step);
    }

    #[test]
    fn boundary_quote_at_end_needs_lookahead() {
        // The trailing quote could still be the first half of a doubled
        // quote.
        let (step, _) = boundary(b"\"a\"", ParseMode::Strict, false);
        assert_eq!(ScanStep::NeedMore { resume_at: 2 }, step);
        let (step, _) = boundary(b"\"a\"", ParseMode::Strict, true);
        assert_eq!(ScanStep::Complete { end: 3, term_len: 0 }, step);
    }

    #[test]
    fn boundary_lenient_embedded_quote() {
        // In lenient mode a quote inside an unquoted field is content, so
        // the newline ends the record.
        let (step, _) = boundary(b"a\"b\nc", ParseMode::Lenient, false);
        assert_eq!(ScanStep::Complete { end: 3, term_len: 1 }, step);
    }

    #[test]
    fn boundary_strict_embedded_quote_reenters() {
        // In strict mode the tokenizer recovers by treating the stray quote
        // as an opening quote, so the newline is swallowed.
        let (step, _) = boundary(b"a\"b\nc\",d\ne", ParseMode::Strict, false);
        assert_eq!(ScanStep::Complete { end: 8, term_len: 1 }, step);
    }

    #[test]
    fn boundary_resume_after_refill() {
        // Simulates a refill: first chunk ends inside a quote, the second
        // completes the record.
        let mut state = BoundaryState::default();
        let chunk = b"\"a,b";
        let step = find_record_end(
            chunk, 0, b',', b'"', None, ParseMode::Strict, false, &mut state,
        );
        assert_eq!(ScanStep::NeedMore { resume_at: 4 }, step);
        let full = b"\"a,b\",c\nd";
        let step = find_record_end(
            full, 4, b',', b'"', None, ParseMode::Strict, false, &mut state,
        );
        assert_eq!(ScanStep::Complete { end: 7, term_len: 1 }, step);
    }
}
