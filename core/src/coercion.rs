//! Conversion of loosely typed values into a column's declared type.
//!
//! The same resolver converts rule values once at compile time and row values
//! during evaluation, so preview and streaming interpret data identically.

use crate::error::CoercionError;
use crate::rule::RawValue;
use crate::schema::ColumnType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use std::borrow::Cow;
use std::cmp::Ordering;

/// Formats tried, in order, after RFC 3339.
pub const DEFAULT_DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y/%m/%d",
    "%d/%m/%Y",
];

/// A typed value after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Number(f64),
    Date(NaiveDateTime),
}

impl Scalar {
    /// Ordering between two values of the same category. Text, or mixed
    /// categories, have no ordering.
    pub fn partial_cmp_ordinal(&self, other: &Scalar) -> Option<Ordering> {
        match (self, other) {
            (Scalar::Number(a), Scalar::Number(b)) => a.partial_cmp(b),
            (Scalar::Date(a), Scalar::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// A single field value as found in a row, before coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell<'a> {
    Null,
    Text(Cow<'a, str>),
    Number(f64),
    Bool(bool),
}

impl<'a> Cell<'a> {
    /// Empty strings are treated as missing values, matching how delimited
    /// files encode nulls.
    pub fn from_text(s: &'a str) -> Self {
        if s.is_empty() {
            Cell::Null
        } else {
            Cell::Text(Cow::Borrowed(s))
        }
    }

    pub fn from_json(value: Option<&'a serde_json::Value>) -> Self {
        match value {
            None | Some(serde_json::Value::Null) => Cell::Null,
            Some(serde_json::Value::String(s)) => Cell::from_text(s),
            Some(serde_json::Value::Number(n)) => n.as_f64().map_or(Cell::Null, Cell::Number),
            Some(serde_json::Value::Bool(b)) => Cell::Bool(*b),
            Some(other) => Cell::Text(Cow::Owned(other.to_string())),
        }
    }

    /// An empty text value is null however the row reader built it.
    pub fn is_null(&self) -> bool {
        match self {
            Cell::Null => true,
            Cell::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    /// Lossless textual rendering, used for error messages and text coercion.
    pub fn render(&self) -> Cow<'_, str> {
        match self {
            Cell::Null => Cow::Borrowed(""),
            Cell::Text(s) => Cow::Borrowed(s.as_ref()),
            Cell::Number(n) => Cow::Owned(n.to_string()),
            Cell::Bool(b) => Cow::Owned(b.to_string()),
        }
    }
}

/// A non-null row value that could not be read as the column's type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidCell;

#[derive(Debug, Clone)]
pub struct TypeCoercionResolver {
    date_formats: Vec<String>,
}

impl Default for TypeCoercionResolver {
    fn default() -> Self {
        Self::new(DEFAULT_DATE_FORMATS.iter().map(|f| f.to_string()).collect())
    }
}

impl TypeCoercionResolver {
    pub fn new(date_formats: Vec<String>) -> Self {
        Self { date_formats }
    }

    pub fn date_formats(&self) -> &[String] {
        &self.date_formats
    }

    /// Coerce a rule value for `field` into `target`.
    pub fn coerce(
        &self,
        field: &str,
        raw: &RawValue,
        target: ColumnType,
    ) -> Result<Scalar, CoercionError> {
        let fail = |reason: &str| CoercionError {
            field: field.to_string(),
            value: raw.to_string(),
            target,
            reason: reason.to_string(),
        };

        match (target, raw) {
            (ColumnType::Text, RawValue::Text(s)) => Ok(Scalar::Text(s.clone())),
            (ColumnType::Text, RawValue::Number(n)) => Ok(Scalar::Text(n.to_string())),
            (ColumnType::Text, RawValue::Bool(b)) => Ok(Scalar::Text(b.to_string())),
            (ColumnType::Number, RawValue::Number(n)) if n.is_finite() => Ok(Scalar::Number(*n)),
            (ColumnType::Number, RawValue::Number(_)) => Err(fail("not a finite number")),
            (ColumnType::Number, RawValue::Text(s)) => {
                parse_number(s).map(Scalar::Number).ok_or_else(|| fail("not numeric"))
            }
            (ColumnType::Number, RawValue::Bool(_)) => Err(fail("booleans are not numeric")),
            (ColumnType::Date, RawValue::Text(s)) => self
                .parse_date(s)
                .map(Scalar::Date)
                .ok_or_else(|| fail("does not match any accepted date format")),
            (ColumnType::Date, _) => Err(fail("dates must be given as text")),
        }
    }

    /// Coerce a row value. `Ok(None)` means the value is null.
    pub fn coerce_cell(
        &self,
        cell: &Cell<'_>,
        target: ColumnType,
    ) -> Result<Option<Scalar>, InvalidCell> {
        if cell.is_null() {
            return Ok(None);
        }
        match (target, cell) {
            (ColumnType::Text, other) => Ok(Some(Scalar::Text(other.render().into_owned()))),
            (ColumnType::Number, Cell::Number(n)) if n.is_finite() => Ok(Some(Scalar::Number(*n))),
            (ColumnType::Number, Cell::Text(s)) => {
                parse_number(s).map(|n| Some(Scalar::Number(n))).ok_or(InvalidCell)
            }
            (ColumnType::Date, Cell::Text(s)) => {
                self.parse_date(s).map(|d| Some(Scalar::Date(d))).ok_or(InvalidCell)
            }
            _ => Err(InvalidCell),
        }
    }

    fn parse_date(&self, s: &str) -> Option<NaiveDateTime> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.naive_utc());
        }
        self.date_formats.iter().find_map(|format| {
            NaiveDateTime::parse_from_str(s, format).ok().or_else(|| {
                NaiveDate::parse_from_str(s, format)
                    .ok()
                    .map(|d| d.and_time(NaiveTime::MIN))
            })
        })
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}
