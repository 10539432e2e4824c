use proptest::prelude::*;

use csvbind::{ParseMode, ReaderBuilder, WriterBuilder};
use csvbind_core::{Emitter, Tokenizer, TokenizerBuilder};

/// Field content drawn from the interesting alphabet: letters, blanks,
/// delimiters, quotes and both line break bytes.
fn field_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z ,\"\r\n]{0,12}").expect("valid regex")
}

fn rows_strategy() -> impl Strategy<Value = Vec<Vec<String>>> {
    proptest::collection::vec(
        proptest::collection::vec(field_strategy(), 1..5),
        0..8,
    )
}

proptest! {
    /// Whatever the writer produces, the reader parses back unchanged.
    #[test]
    fn write_then_read_round_trips(rows in rows_strategy()) {
        let mut builder = WriterBuilder::new();
        builder.has_headers(false).flexible(true);
        let mut wtr = builder.from_writer(Vec::new());
        for row in &rows {
            wtr.write_record(row.iter()).unwrap();
        }
        let bytes = wtr.into_inner().unwrap();

        let mut builder = ReaderBuilder::new();
        builder.has_headers(false).flexible(true);
        let mut rdr = builder.from_slice(&bytes);
        let parsed: Vec<Vec<String>> = rdr
            .records()
            .map(|r| {
                r.unwrap().iter().map(str::to_string).collect()
            })
            .collect();
        prop_assert_eq!(rows, parsed);
    }

    /// The tokenizer terminates on arbitrary bytes and accounts for every
    /// byte of its input: fields, delimiters and terminators together
    /// advance the cursor to the end of the span.
    #[test]
    fn lenient_tokenizer_consumes_all_bytes(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut builder = TokenizerBuilder::new();
        builder.mode(ParseMode::Lenient);
        let mut tok = builder.build(&data);
        let mut ranges = Vec::new();
        while tok.read_record(&mut ranges).unwrap().is_some() {}
        prop_assert!(tok.is_done());
        prop_assert_eq!(data.len(), tok.position());
    }

    /// Same accounting in quote-ignoring mode, where no byte is special
    /// except delimiters and terminators.
    #[test]
    fn ignore_quotes_tokenizer_consumes_all_bytes(data in proptest::collection::vec(any::<u8>(), 0..256)) {
        let mut builder = TokenizerBuilder::new();
        builder.mode(ParseMode::IgnoreQuotes);
        let mut tok = builder.build(&data);
        let mut ranges = Vec::new();
        while tok.read_record(&mut ranges).unwrap().is_some() {}
        prop_assert!(tok.is_done());
        prop_assert_eq!(data.len(), tok.position());
    }

    /// Minimal quoting never rewrites a field that needs no quotes.
    #[test]
    fn minimal_quoting_is_idempotent(field in "[a-z0-9 .;|-]{0,24}") {
        let mut emitter = Emitter::new();
        prop_assert!(!emitter.should_quote(field.as_bytes()));
        let mut out = Vec::new();
        emitter.write_field(field.as_bytes(), &mut out);
        prop_assert_eq!(field.as_bytes(), &*out);
    }

    /// Line counting equals the number of record terminators plus one,
    /// regardless of content.
    #[test]
    fn line_counter_matches_terminators(data in "[a-z,\n]{0,64}") {
        let mut tok = Tokenizer::new(data.as_bytes());
        let mut ranges = Vec::new();
        while tok.read_record(&mut ranges).unwrap().is_some() {}
        let terminators =
            data.bytes().filter(|&b| b == b'\n').count() as u64;
        prop_assert_eq!(terminators + 1, tok.line());
    }
}
