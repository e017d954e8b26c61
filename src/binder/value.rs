//! String → typed conversions for route and query values.
//!
//! Every type parses its invariant (locale-free) representation first. Date
//! and time types then fall back to a few lenient day-first/month-first forms
//! that clients commonly send. `format_param` always writes the invariant
//! form, so parse → format is stable for values written by `format_param`.

use chrono::{
    DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, TimeDelta, Utc,
};
use thiserror::Error;
use uuid::Uuid;

/// A raw value could not be converted to the parameter type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot convert {value:?} to {target}")]
pub struct ConversionError {
    pub value: String,
    pub target: &'static str,
}

impl ConversionError {
    pub fn new(value: impl Into<String>, target: &'static str) -> Self {
        Self {
            value: value.into(),
            target,
        }
    }
}

/// A type that can be bound from a route or query value.
pub trait ParamValue: Sized + Send + 'static {
    /// Parses `raw`.
    ///
    /// # Errors
    ///
    /// [`ConversionError`] when `raw` is not a valid representation.
    fn parse_param(raw: &str) -> Result<Self, ConversionError>;

    /// Writes the invariant representation.
    fn format_param(&self) -> String;
}

impl ParamValue for String {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        Ok(raw.to_owned())
    }

    fn format_param(&self) -> String {
        self.clone()
    }
}

impl ParamValue for bool {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("true") {
            Ok(true)
        } else if raw.eq_ignore_ascii_case("false") {
            Ok(false)
        } else {
            Err(ConversionError::new(raw, "bool"))
        }
    }

    fn format_param(&self) -> String {
        self.to_string()
    }
}

macro_rules! impl_param_value_via_from_str {
    ($($ty:ty),* $(,)?) => {
        $(
            impl ParamValue for $ty {
                fn parse_param(raw: &str) -> Result<Self, ConversionError> {
                    raw.trim()
                        .parse::<$ty>()
                        .map_err(|_| ConversionError::new(raw, stringify!($ty)))
                }

                fn format_param(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_param_value_via_from_str!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64
);

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];
const LENIENT_DATE_TIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d"];
const LENIENT_DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%d.%m.%Y"];
const TIME_FORMATS: &[&str] = &["%H:%M:%S%.f", "%H:%M"];
const LENIENT_TIME_FORMATS: &[&str] = &["%I:%M:%S %p", "%I:%M %p"];

fn first_match<T>(
    raw: &str,
    formats: &[&str],
    parse: impl Fn(&str, &str) -> Option<T>,
) -> Option<T> {
    formats.iter().find_map(|fmt| parse(raw, fmt))
}

fn parse_naive_date_time(raw: &str) -> Option<NaiveDateTime> {
    let parse = |s: &str, f: &str| NaiveDateTime::parse_from_str(s, f).ok();
    first_match(raw, DATE_TIME_FORMATS, parse)
        .or_else(|| parse_naive_date(raw).and_then(|d| d.and_hms_opt(0, 0, 0)))
        .or_else(|| first_match(raw, LENIENT_DATE_TIME_FORMATS, parse))
}

fn parse_naive_date(raw: &str) -> Option<NaiveDate> {
    let parse = |s: &str, f: &str| NaiveDate::parse_from_str(s, f).ok();
    first_match(raw, DATE_FORMATS, parse).or_else(|| first_match(raw, LENIENT_DATE_FORMATS, parse))
}

fn parse_offset_date_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok().or_else(|| {
        ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f %:z", "%m/%d/%Y %H:%M:%S %:z"]
            .iter()
            .find_map(|fmt| DateTime::parse_from_str(raw, fmt).ok())
    })
}

impl ParamValue for NaiveDateTime {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        parse_naive_date_time(raw.trim()).ok_or_else(|| ConversionError::new(raw, "NaiveDateTime"))
    }

    fn format_param(&self) -> String {
        self.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
    }
}

impl ParamValue for NaiveDate {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        parse_naive_date(raw.trim()).ok_or_else(|| ConversionError::new(raw, "NaiveDate"))
    }

    fn format_param(&self) -> String {
        self.format("%Y-%m-%d").to_string()
    }
}

impl ParamValue for NaiveTime {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        let raw = raw.trim();
        let parse = |s: &str, f: &str| NaiveTime::parse_from_str(s, f).ok();
        first_match(raw, TIME_FORMATS, parse)
            .or_else(|| first_match(raw, LENIENT_TIME_FORMATS, parse))
            .ok_or_else(|| ConversionError::new(raw, "NaiveTime"))
    }

    fn format_param(&self) -> String {
        self.format("%H:%M:%S%.f").to_string()
    }
}

impl ParamValue for DateTime<FixedOffset> {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        parse_offset_date_time(raw.trim())
            .ok_or_else(|| ConversionError::new(raw, "DateTime<FixedOffset>"))
    }

    fn format_param(&self) -> String {
        self.to_rfc3339_opts(SecondsFormat::AutoSi, false)
    }
}

impl ParamValue for DateTime<Utc> {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        let raw = raw.trim();
        parse_offset_date_time(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| parse_naive_date_time(raw).map(|naive| naive.and_utc()))
            .ok_or_else(|| ConversionError::new(raw, "DateTime<Utc>"))
    }

    fn format_param(&self) -> String {
        self.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }
}

/// `[-][d.]hh:mm[:ss[.fffffffff]]`, or a bare whole number of days.
impl ParamValue for TimeDelta {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        parse_time_span(raw.trim()).ok_or_else(|| ConversionError::new(raw, "TimeDelta"))
    }

    fn format_param(&self) -> String {
        format_time_span(*self)
    }
}

fn parse_time_span(raw: &str) -> Option<TimeDelta> {
    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let parts: Vec<&str> = body.split(':').collect();
    let magnitude = match parts.as_slice() {
        [days] => TimeDelta::try_days(parse_digits(days)?)?,
        [head, minutes] | [head, minutes, _] => {
            let (days, hours) = match head.split_once('.') {
                Some((d, h)) => (parse_digits(d)?, parse_digits(h)?),
                None => (0, parse_digits(head)?),
            };
            let minutes = parse_digits(minutes)?;
            let (seconds, nanos) = match parts.get(2) {
                Some(sec) => parse_seconds(sec)?,
                None => (0, 0),
            };
            if hours > 23 || minutes > 59 || seconds > 59 {
                return None;
            }
            TimeDelta::try_days(days)?
                .checked_add(&TimeDelta::try_hours(hours)?)?
                .checked_add(&TimeDelta::try_minutes(minutes)?)?
                .checked_add(&TimeDelta::try_seconds(seconds)?)?
                .checked_add(&TimeDelta::nanoseconds(nanos))?
        }
        _ => return None,
    };

    Some(if negative { -magnitude } else { magnitude })
}

fn parse_digits(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_seconds(s: &str) -> Option<(i64, i64)> {
    let (whole, fraction) = match s.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (s, None),
    };
    let seconds = parse_digits(whole)?;
    let nanos = match fraction {
        None => 0,
        Some(f) if f.len() <= 9 => parse_digits(f)? * 10_i64.pow(9 - f.len() as u32),
        Some(_) => return None,
    };
    Some((seconds, nanos))
}

fn format_time_span(delta: TimeDelta) -> String {
    let sign = if delta < TimeDelta::zero() { "-" } else { "" };
    let magnitude = delta.abs();
    let total = magnitude.num_seconds();
    let nanos = magnitude.subsec_nanos();

    let (days, rest) = (total / 86_400, total % 86_400);
    let (hours, minutes, seconds) = (rest / 3600, rest % 3600 / 60, rest % 60);

    let mut out = String::with_capacity(24);
    out.push_str(sign);
    if days > 0 {
        out.push_str(&format!("{days}."));
    }
    out.push_str(&format!("{hours:02}:{minutes:02}:{seconds:02}"));
    if nanos != 0 {
        if nanos % 100 == 0 {
            out.push_str(&format!(".{:07}", nanos / 100));
        } else {
            out.push_str(&format!(".{nanos:09}"));
        }
    }
    out
}

impl ParamValue for Uuid {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        Uuid::parse_str(raw.trim()).map_err(|_| ConversionError::new(raw, "Uuid"))
    }

    fn format_param(&self) -> String {
        self.hyphenated().to_string()
    }
}

/// Nullable values: an empty string binds to `None`.
impl<T: ParamValue> ParamValue for Option<T> {
    fn parse_param(raw: &str) -> Result<Self, ConversionError> {
        if raw.trim().is_empty() {
            Ok(None)
        } else {
            T::parse_param(raw).map(Some)
        }
    }

    fn format_param(&self) -> String {
        self.as_ref().map(ParamValue::format_param).unwrap_or_default()
    }
}

/// Implements [`ParamValue`] for a fieldless enum, matching variant names
/// case-insensitively.
///
/// ```
/// use rawserve::binder::ParamValue;
///
/// #[derive(Debug, PartialEq)]
/// enum Sort { Asc, Desc }
/// rawserve::param_enum!(Sort { Asc, Desc });
///
/// assert_eq!(Sort::parse_param("desc").unwrap(), Sort::Desc);
/// assert_eq!(Sort::Asc.format_param(), "Asc");
/// ```
#[macro_export]
macro_rules! param_enum {
    ($ty:ident { $($variant:ident),+ $(,)? }) => {
        impl $crate::binder::ParamValue for $ty {
            fn parse_param(
                raw: &str,
            ) -> ::std::result::Result<Self, $crate::binder::ConversionError> {
                let trimmed = raw.trim();
                $(
                    if trimmed.eq_ignore_ascii_case(stringify!($variant)) {
                        return Ok($ty::$variant);
                    }
                )+
                Err($crate::binder::ConversionError::new(raw, stringify!($ty)))
            }

            fn format_param(&self) -> ::std::string::String {
                match self {
                    $($ty::$variant => stringify!($variant).to_owned(),)+
                }
            }
        }
    };
}
