use std::fmt;
use std::ops;
use std::str;

use crate::byte_record::{ByteRecord, ByteRecordIter, Position};
use crate::error::FromUtf8Error;

/// A single CSV record stored as valid UTF-8 strings.
///
/// A string record is a thin wrapper around a [`ByteRecord`] whose fields
/// have been validated as UTF-8 exactly once, at construction.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct StringRecord(ByteRecord);

impl StringRecord {
    /// Create a new empty `StringRecord`.
    pub fn new() -> StringRecord {
        StringRecord(ByteRecord::new())
    }

    /// Create a new empty `StringRecord` with the given capacity settings.
    pub fn with_capacity(buffer: usize, fields: usize) -> StringRecord {
        StringRecord(ByteRecord::with_capacity(buffer, fields))
    }

    /// Create a new `StringRecord` from a `ByteRecord`, validating its
    /// fields as UTF-8.
    ///
    /// On failure, the byte record is handed back inside the error.
    pub fn from_byte_record(
        record: ByteRecord,
    ) -> Result<StringRecord, FromUtf8Error> {
        match record.validate_utf8() {
            Ok(()) => Ok(StringRecord(record)),
            Err(err) => Err(FromUtf8Error::new(record, err)),
        }
    }

    /// Lossily create a new `StringRecord` from a `ByteRecord`, replacing
    /// invalid UTF-8 sequences with the replacement character.
    pub fn from_byte_record_lossy(record: ByteRecord) -> StringRecord {
        if record.validate_utf8().is_ok() {
            return StringRecord(record);
        }
        let mut out = ByteRecord::with_capacity(record.byte_len(), record.len());
        for field in &record {
            out.push_field(String::from_utf8_lossy(field).as_bytes());
        }
        out.set_position(record.position().cloned());
        StringRecord(out)
    }

    /// Add a new field to this record.
    pub fn push_field(&mut self, field: &str) {
        self.0.push_field(field.as_bytes());
    }

    /// Return the field at index `i`.
    pub fn get(&self, i: usize) -> Option<&str> {
        self.0.get(i).map(|field| {
            debug_assert!(str::from_utf8(field).is_ok());
            // Fields were validated at construction.
            unsafe { str::from_utf8_unchecked(field) }
        })
    }

    /// Returns true if and only if this record is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of fields in this record.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Clear this record so that it has zero fields.
    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Return the position of this record, if available.
    pub fn position(&self) -> Option<&Position> {
        self.0.position()
    }

    /// Set the position of this record.
    pub fn set_position(&mut self, pos: Option<Position>) {
        self.0.set_position(pos);
    }

    /// Returns an iterator over all fields in this record.
    pub fn iter(&self) -> StringRecordIter<'_> {
        StringRecordIter(self.0.iter())
    }

    /// Return this record as a raw `ByteRecord`.
    pub fn as_byte_record(&self) -> &ByteRecord {
        &self.0
    }

    /// Convert this record into a raw `ByteRecord`.
    pub fn into_byte_record(self) -> ByteRecord {
        self.0
    }
}

impl fmt::Debug for StringRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fields: Vec<&str> = self.iter().collect();
        write!(f, "StringRecord({:?})", fields)
    }
}

impl ops::Index<usize> for StringRecord {
    type Output = str;
    fn index(&self, i: usize) -> &str {
        self.get(i).unwrap()
    }
}

impl<T: AsRef<str>> From<Vec<T>> for StringRecord {
    fn from(fields: Vec<T>) -> StringRecord {
        StringRecord::from_iter(fields)
    }
}

impl<T: AsRef<str>> FromIterator<T> for StringRecord {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> StringRecord {
        let mut record = StringRecord::new();
        for field in iter {
            record.push_field(field.as_ref());
        }
        record
    }
}

impl<'r> IntoIterator for &'r StringRecord {
    type IntoIter = StringRecordIter<'r>;
    type Item = &'r str;
    fn into_iter(self) -> StringRecordIter<'r> {
        self.iter()
    }
}

/// An iterator over the fields in a string record.
pub struct StringRecordIter<'r>(ByteRecordIter<'r>);

impl<'r> Iterator for StringRecordIter<'r> {
    type Item = &'r str;

    fn next(&mut self) -> Option<&'r str> {
        self.0.next().map(|field| {
            // Fields were validated at construction.
            unsafe { str::from_utf8_unchecked(field) }
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0.size_hint()
    }
}

impl<'r> ExactSizeIterator for StringRecordIter<'r> {}

#[cfg(test)]
mod tests {
    use crate::byte_record::ByteRecord;

    use super::StringRecord;

    #[test]
    fn from_byte_record_validates() {
        let rec = ByteRecord::from(vec!["a", "b"]);
        let rec = StringRecord::from_byte_record(rec).unwrap();
        assert_eq!(Some("a"), rec.get(0));
        assert_eq!(Some("b"), rec.get(1));

        let bad = ByteRecord::from(vec![&b"\xFF"[..]]);
        let err = StringRecord::from_byte_record(bad).unwrap_err();
        assert_eq!(0, err.utf8_error().field());
    }

    #[test]
    fn lossy_replaces_invalid_sequences() {
        let bad = ByteRecord::from(vec![&b"a\xFFb"[..]]);
        let rec = StringRecord::from_byte_record_lossy(bad);
        assert_eq!(Some("a\u{FFFD}b"), rec.get(0));
    }

    #[test]
    fn iteration() {
        let rec = StringRecord::from(vec!["x", "y"]);
        let fields: Vec<&str> = rec.iter().collect();
        assert_eq!(vec!["x", "y"], fields);
    }
}
