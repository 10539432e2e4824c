use std::error::Error as StdError;
use std::fmt;
use std::io::Write as _;
use std::str;

use bstr::ByteSlice;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta};
use rust_decimal::Decimal;
use uuid::Uuid;

/// An error produced while converting field bytes to or from a typed
/// value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConvertError {
    target: &'static str,
    detail: String,
}

impl ConvertError {
    /// A conversion error for a field whose raw bytes could not be decoded
    /// as `target`.
    pub fn new(target: &'static str, field: &[u8]) -> ConvertError {
        ConvertError {
            target,
            detail: format!("cannot parse {:?}", field.as_bstr()),
        }
    }

    /// A conversion error with a bespoke message.
    pub fn with_message(
        target: &'static str,
        msg: impl Into<String>,
    ) -> ConvertError {
        ConvertError { target, detail: msg.into() }
    }

    /// The name of the destination type.
    pub fn target(&self) -> &'static str {
        self.target
    }
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} as {}", self.detail, self.target)
    }
}

impl StdError for ConvertError {}

/// A type alias for conversion results.
pub type ConvertResult<T> = Result<T, ConvertError>;

/// Decoding of one field's bytes into a typed value.
///
/// `format` is the optional format hint attached to the schema field; only
/// the date/time kinds consult it.
pub trait FieldDecode: Sized {
    /// Decode a non-empty field.
    fn decode(field: &[u8], format: Option<&str>) -> ConvertResult<Self>;

    /// The value an empty field decodes to when the destination is not
    /// nullable.
    fn empty_value() -> Self;
}

/// Encoding of a typed value into field bytes.
///
/// Implementations append the raw field content to `out`; quoting is the
/// emitter's concern.
pub trait FieldEncode {
    /// True when, absent a format hint, every byte this type can emit
    /// lies in the plain typed alphabet: ASCII alphanumerics plus
    /// `+ - . :`. Such output can never contain a default delimiter,
    /// quote or line break, which lets the field sink skip the quoting
    /// scan.
    const PLAIN: bool = false;

    /// Append this value's field bytes to `out`.
    fn encode(&self, format: Option<&str>, out: &mut Vec<u8>);
}

/// A user-supplied codec pair attached to a schema field.
///
/// The decode side receives the raw field bytes; the encode side produces
/// bytes that are written verbatim, wrapped in quotes only when the
/// configured quoting policy demands it. Encoded bytes must be valid
/// UTF-8.
pub trait Converter<T> {
    /// Decode the raw field bytes into a value.
    fn decode(field: &[u8]) -> ConvertResult<T>;

    /// Encode a value into field bytes.
    fn encode(value: &T, out: &mut Vec<u8>) -> ConvertResult<()>;
}

fn utf8<'a>(field: &'a [u8], target: &'static str) -> ConvertResult<&'a str> {
    str::from_utf8(field).map_err(|_| ConvertError::new(target, field))
}

impl FieldDecode for bool {
    fn decode(field: &[u8], _format: Option<&str>) -> ConvertResult<bool> {
        if field.eq_ignore_ascii_case(b"true") || field == b"1" {
            Ok(true)
        } else if field.eq_ignore_ascii_case(b"false") || field == b"0" {
            Ok(false)
        } else {
            Err(ConvertError::new("bool", field))
        }
    }

    fn empty_value() -> bool {
        false
    }
}

impl FieldEncode for bool {
    const PLAIN: bool = true;

    fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
        out.extend_from_slice(if *self { b"true" } else { b"false" });
    }
}

macro_rules! int_kind {
    ($ty:ty) => {
        impl FieldDecode for $ty {
            fn decode(
                field: &[u8],
                _format: Option<&str>,
            ) -> ConvertResult<$ty> {
                // atoi_simd does not accept an explicit plus sign.
                let digits = match field {
                    [b'+', rest @ ..] if !rest.starts_with(b"-") => rest,
                    all => all,
                };
                atoi_simd::parse::<$ty>(digits)
                    .map_err(|_| ConvertError::new(stringify!($ty), field))
            }

            fn empty_value() -> $ty {
                0
            }
        }

        impl FieldEncode for $ty {
            const PLAIN: bool = true;

            fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
                let mut buf = itoa::Buffer::new();
                out.extend_from_slice(buf.format(*self).as_bytes());
            }
        }
    };
}

int_kind!(i8);
int_kind!(i16);
int_kind!(i32);
int_kind!(i64);
int_kind!(u8);
int_kind!(u16);
int_kind!(u32);
int_kind!(u64);

macro_rules! float_kind {
    ($ty:ty) => {
        impl FieldDecode for $ty {
            fn decode(
                field: &[u8],
                _format: Option<&str>,
            ) -> ConvertResult<$ty> {
                fast_float2::parse::<$ty, _>(field)
                    .map_err(|_| ConvertError::new(stringify!($ty), field))
            }

            fn empty_value() -> $ty {
                0.0
            }
        }

        impl FieldEncode for $ty {
            const PLAIN: bool = true;

            fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
                let mut buf = ryu::Buffer::new();
                out.extend_from_slice(buf.format(*self).as_bytes());
            }
        }
    };
}

float_kind!(f32);
float_kind!(f64);

impl FieldDecode for Decimal {
    fn decode(field: &[u8], _format: Option<&str>) -> ConvertResult<Decimal> {
        utf8(field, "Decimal")?
            .parse::<Decimal>()
            .map_err(|_| ConvertError::new("Decimal", field))
    }

    fn empty_value() -> Decimal {
        Decimal::ZERO
    }
}

impl FieldEncode for Decimal {
    const PLAIN: bool = true;

    fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
        let _ = write!(out, "{}", self);
    }
}

impl FieldDecode for char {
    fn decode(field: &[u8], _format: Option<&str>) -> ConvertResult<char> {
        let s = utf8(field, "char")?;
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(ConvertError::with_message(
                "char",
                "expected exactly one character",
            )),
        }
    }

    fn empty_value() -> char {
        '\0'
    }
}

impl FieldEncode for char {
    fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
        let mut buf = [0u8; 4];
        out.extend_from_slice(self.encode_utf8(&mut buf).as_bytes());
    }
}

impl FieldDecode for String {
    fn decode(field: &[u8], _format: Option<&str>) -> ConvertResult<String> {
        utf8(field, "String").map(str::to_owned)
    }

    fn empty_value() -> String {
        String::new()
    }
}

impl FieldEncode for String {
    fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl FieldEncode for &str {
    fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

/// The formats accepted for instants without an offset, in order.
const INSTANT_FORMATS: &[&str] =
    &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

impl FieldDecode for NaiveDateTime {
    fn decode(
        field: &[u8],
        format: Option<&str>,
    ) -> ConvertResult<NaiveDateTime> {
        let s = utf8(field, "instant")?;
        if let Some(fmt) = format {
            return NaiveDateTime::parse_from_str(s, fmt)
                .or_else(|_| {
                    NaiveDate::parse_from_str(s, fmt)
                        .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
                })
                .map_err(|_| ConvertError::new("instant", field));
        }
        for fmt in INSTANT_FORMATS {
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                return Ok(dt);
            }
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default())
            .map_err(|_| ConvertError::new("instant", field))
    }

    fn empty_value() -> NaiveDateTime {
        NaiveDateTime::default()
    }
}

impl FieldEncode for NaiveDateTime {
    const PLAIN: bool = true;

    fn encode(&self, format: Option<&str>, out: &mut Vec<u8>) {
        let fmt = format.unwrap_or("%Y-%m-%dT%H:%M:%S%.f");
        let _ = write!(out, "{}", self.format(fmt));
    }
}

impl FieldDecode for DateTime<FixedOffset> {
    fn decode(
        field: &[u8],
        format: Option<&str>,
    ) -> ConvertResult<DateTime<FixedOffset>> {
        let s = utf8(field, "instant with offset")?;
        let parsed = match format {
            Some(fmt) => DateTime::parse_from_str(s, fmt),
            None => DateTime::parse_from_rfc3339(s),
        };
        parsed.map_err(|_| ConvertError::new("instant with offset", field))
    }

    fn empty_value() -> DateTime<FixedOffset> {
        DateTime::<chrono::Utc>::UNIX_EPOCH.fixed_offset()
    }
}

impl FieldEncode for DateTime<FixedOffset> {
    const PLAIN: bool = true;

    fn encode(&self, format: Option<&str>, out: &mut Vec<u8>) {
        match format {
            Some(fmt) => {
                let _ = write!(out, "{}", self.format(fmt));
            }
            None => {
                let _ = write!(
                    out,
                    "{}",
                    self.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
                );
            }
        }
    }
}

impl FieldDecode for Uuid {
    fn decode(field: &[u8], _format: Option<&str>) -> ConvertResult<Uuid> {
        Uuid::try_parse_ascii(field)
            .map_err(|_| ConvertError::new("uuid", field))
    }

    fn empty_value() -> Uuid {
        Uuid::nil()
    }
}

impl FieldEncode for Uuid {
    const PLAIN: bool = true;

    fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
        let mut buf = [0u8; 36];
        out.extend_from_slice(
            self.hyphenated().encode_lower(&mut buf).as_bytes(),
        );
    }
}

impl FieldDecode for TimeDelta {
    fn decode(field: &[u8], _format: Option<&str>) -> ConvertResult<TimeDelta> {
        let s = utf8(field, "duration")?;
        parse_duration(s).ok_or_else(|| ConvertError::new("duration", field))
    }

    fn empty_value() -> TimeDelta {
        TimeDelta::zero()
    }
}

impl FieldEncode for TimeDelta {
    const PLAIN: bool = true;

    fn encode(&self, _format: Option<&str>, out: &mut Vec<u8>) {
        encode_duration(*self, out);
    }
}

/// Parses an ISO-8601 duration (the `P[nD]T[nH][nM][n[.f]S]` subset) or a
/// clock-style `[d.]HH:MM:SS[.f]` duration. A leading `-` negates either
/// form.
fn parse_duration(s: &str) -> Option<TimeDelta> {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let delta = if body.starts_with('P') {
        parse_iso_duration(body)?
    } else {
        parse_clock_duration(body)?
    };
    Some(if neg { -delta } else { delta })
}

fn parse_iso_duration(s: &str) -> Option<TimeDelta> {
    let body = s.strip_prefix('P')?;
    let (date_part, time_part) = match body.split_once('T') {
        Some((d, t)) => (d, t),
        None => (body, ""),
    };
    let mut total = TimeDelta::zero();
    let mut num = String::new();
    for c in date_part.chars() {
        if c.is_ascii_digit() {
            num.push(c);
        } else if c == 'D' {
            let days: i64 = num.parse().ok()?;
            total = total + TimeDelta::days(days);
            num.clear();
        } else {
            return None;
        }
    }
    if !num.is_empty() {
        return None;
    }
    for c in time_part.chars() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
        } else {
            match c {
                'H' => {
                    total = total + TimeDelta::hours(num.parse().ok()?);
                }
                'M' => {
                    total = total + TimeDelta::minutes(num.parse().ok()?);
                }
                'S' => {
                    total = total + seconds_with_fraction(&num)?;
                }
                _ => return None,
            }
            num.clear();
        }
    }
    if !num.is_empty() {
        return None;
    }
    Some(total)
}

fn parse_clock_duration(s: &str) -> Option<TimeDelta> {
    let (days, clock) = match s.split_once('.') {
        // Disambiguate `d.HH:MM:SS` from a fractional seconds dot.
        Some((d, rest)) if rest.contains(':') => (d.parse::<i64>().ok()?, rest),
        _ => (0, s),
    };
    let mut parts = clock.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds = seconds_with_fraction(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(
        TimeDelta::days(days)
            + TimeDelta::hours(hours)
            + TimeDelta::minutes(minutes)
            + seconds,
    )
}

fn seconds_with_fraction(s: &str) -> Option<TimeDelta> {
    let (whole, frac) = match s.split_once('.') {
        Some((w, f)) => (w, f),
        None => (s, ""),
    };
    let secs: i64 = whole.parse().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let mut n: u32 = frac.parse().ok()?;
        for _ in frac.len()..9 {
            n *= 10;
        }
        n
    };
    Some(TimeDelta::seconds(secs) + TimeDelta::nanoseconds(nanos as i64))
}

fn encode_duration(delta: TimeDelta, out: &mut Vec<u8>) {
    let mut delta = delta;
    if delta < TimeDelta::zero() {
        out.push(b'-');
        delta = -delta;
    }
    let total_secs = delta.num_seconds();
    let nanos = delta.subsec_nanos();
    if total_secs == 0 && nanos == 0 {
        out.extend_from_slice(b"PT0S");
        return;
    }
    out.push(b'P');
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = total_secs % 60;
    if days > 0 {
        let _ = write!(out, "{}D", days);
    }
    if hours > 0 || minutes > 0 || seconds > 0 || nanos > 0 {
        out.push(b'T');
        if hours > 0 {
            let _ = write!(out, "{}H", hours);
        }
        if minutes > 0 {
            let _ = write!(out, "{}M", minutes);
        }
        if nanos > 0 {
            let frac = format!("{:09}", nanos);
            let _ = write!(out, "{}.{}S", seconds, frac.trim_end_matches('0'));
        } else if seconds > 0 {
            let _ = write!(out, "{}S", seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeDelta};
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::*;

    fn decode<T: FieldDecode>(field: &str) -> ConvertResult<T> {
        T::decode(field.as_bytes(), None)
    }

    fn encode<T: FieldEncode>(value: &T) -> String {
        let mut out = Vec::new();
        value.encode(None, &mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn booleans() {
        assert_eq!(Ok(true), decode::<bool>("true"));
        assert_eq!(Ok(true), decode::<bool>("TRUE"));
        assert_eq!(Ok(true), decode::<bool>("1"));
        assert_eq!(Ok(false), decode::<bool>("false"));
        assert_eq!(Ok(false), decode::<bool>("0"));
        assert!(decode::<bool>("yes").is_err());
        assert_eq!("true", encode(&true));
        assert_eq!("false", encode(&false));
    }

    #[test]
    fn integers() {
        assert_eq!(Ok(30), decode::<i32>("30"));
        assert_eq!(Ok(-7), decode::<i64>("-7"));
        assert_eq!(Ok(42u8), decode::<u8>("42"));
        assert_eq!(Ok(7), decode::<i32>("+7"));
        assert!(decode::<i32>("x").is_err());
        assert!(decode::<u8>("256").is_err());
        assert!(decode::<u32>("-1").is_err());
        assert_eq!("-1234", encode(&-1234i32));
        assert_eq!("0", encode(&0u64));
    }

    #[test]
    fn floats() {
        assert_eq!(Ok(1.5f64), decode::<f64>("1.5"));
        assert_eq!(Ok(-2.5e3f32), decode::<f32>("-2.5e3"));
        assert!(decode::<f64>("one").is_err());
        assert_eq!("1.5", encode(&1.5f64));
    }

    #[test]
    fn decimals() {
        assert_eq!(
            Ok(Decimal::new(12345, 2)),
            decode::<Decimal>("123.45")
        );
        assert!(decode::<Decimal>("12,3").is_err());
        assert_eq!("123.45", encode(&Decimal::new(12345, 2)));
    }

    #[test]
    fn chars() {
        assert_eq!(Ok('x'), decode::<char>("x"));
        assert_eq!(Ok('é'), decode::<char>("é"));
        assert!(decode::<char>("xy").is_err());
        assert_eq!("x", encode(&'x'));
    }

    #[test]
    fn instants() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 45)
            .unwrap();
        assert_eq!(Ok(expected), decode("2024-03-01T12:30:45"));
        assert_eq!(Ok(expected), decode("2024-03-01 12:30:45"));
        let midnight = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(Ok(midnight), decode("2024-03-01"));
        assert_eq!("2024-03-01T12:30:45", encode(&expected));

        let with_fmt = NaiveDateTime::decode(
            b"01/03/2024 12:30",
            Some("%d/%m/%Y %H:%M"),
        )
        .unwrap();
        assert_eq!(
            NaiveDate::from_ymd_opt(2024, 3, 1)
                .unwrap()
                .and_hms_opt(12, 30, 0)
                .unwrap(),
            with_fmt
        );
    }

    #[test]
    fn instants_with_offset() {
        let dt = decode::<DateTime<FixedOffset>>("2024-03-01T12:30:45+02:00")
            .unwrap();
        assert_eq!("2024-03-01T12:30:45+02:00", encode(&dt));
        assert!(decode::<DateTime<FixedOffset>>("2024-03-01").is_err());
    }

    #[test]
    fn uuids() {
        let id = "67e55044-10b1-426f-9247-bb680e5fe0c8";
        let got = decode::<Uuid>(id).unwrap();
        assert_eq!(id, encode(&got));
        assert!(decode::<Uuid>("not-a-uuid").is_err());
    }

    #[test]
    fn durations_iso() {
        assert_eq!(Ok(TimeDelta::seconds(90)), decode("PT1M30S"));
        assert_eq!(
            Ok(TimeDelta::days(1) + TimeDelta::hours(2)),
            decode("P1DT2H")
        );
        assert_eq!(
            Ok(TimeDelta::seconds(1) + TimeDelta::milliseconds(500)),
            decode("PT1.5S")
        );
        assert_eq!(Ok(-TimeDelta::minutes(15)), decode("-PT15M"));
        assert!(decode::<TimeDelta>("P1W").is_err());
    }

    #[test]
    fn durations_clock() {
        assert_eq!(
            Ok(TimeDelta::hours(1)
                + TimeDelta::minutes(2)
                + TimeDelta::seconds(3)),
            decode("01:02:03")
        );
        assert_eq!(
            Ok(TimeDelta::days(2) + TimeDelta::hours(1)),
            decode("2.01:00:00")
        );
        assert!(decode::<TimeDelta>("1:2").is_err());
    }

    #[test]
    fn duration_round_trip() {
        for text in ["PT0S", "PT1M30S", "P1DT2H", "PT1.5S", "-PT15M"] {
            let delta: TimeDelta = decode(text).unwrap();
            assert_eq!(text, encode(&delta), "{}", text);
        }
    }

    #[test]
    fn plain_alphabet_kinds_are_marked() {
        assert!(<bool as FieldEncode>::PLAIN);
        assert!(<i64 as FieldEncode>::PLAIN);
        assert!(<f64 as FieldEncode>::PLAIN);
        assert!(<Decimal as FieldEncode>::PLAIN);
        assert!(<Uuid as FieldEncode>::PLAIN);
        assert!(<NaiveDateTime as FieldEncode>::PLAIN);
        assert!(<DateTime<FixedOffset> as FieldEncode>::PLAIN);
        assert!(<TimeDelta as FieldEncode>::PLAIN);
        // A char or string can itself be a delimiter, quote or newline.
        assert!(!<char as FieldEncode>::PLAIN);
        assert!(!<String as FieldEncode>::PLAIN);
    }

    #[test]
    fn empty_values_are_zeroish() {
        assert!(!bool::empty_value());
        assert_eq!(0, i64::empty_value());
        assert_eq!(0.0, f64::empty_value());
        assert_eq!(String::new(), String::empty_value());
        assert_eq!(Uuid::nil(), Uuid::empty_value());
        assert_eq!(TimeDelta::zero(), TimeDelta::empty_value());
    }
}
