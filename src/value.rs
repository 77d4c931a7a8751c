use std::{fmt, sync::OnceLock};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::Value as JsonValue;

/// A related record as fetched from its dataset: a JSON object keyed by field.
pub type Record = serde_json::Map<String, JsonValue>;

/// A CSV cell after tokenizer-level type inference.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Null,
    Boolean(bool),
    Number(f64),
    Text(String),
}

impl RawCell {
    /// Infers a cell the way the tokenizer's dynamic typing does: empty cells
    /// become null, `true`/`false` become booleans and plain decimal literals
    /// become numbers. Everything else stays text.
    pub fn infer(raw: &str) -> Self {
        if raw.is_empty() {
            return RawCell::Null;
        }
        if raw.eq_ignore_ascii_case("true") {
            return RawCell::Boolean(true);
        }
        if raw.eq_ignore_ascii_case("false") {
            return RawCell::Boolean(false);
        }
        if numeric_literal().is_match(raw)
            && let Ok(parsed) = raw.trim().parse::<f64>()
            && parsed.is_finite()
        {
            return RawCell::Number(parsed);
        }
        RawCell::Text(raw.to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawCell::Null)
    }

    pub fn as_display(&self) -> String {
        match self {
            RawCell::Null => String::new(),
            RawCell::Boolean(b) => b.to_string(),
            RawCell::Number(n) => format_number(*n),
            RawCell::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for RawCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

/// A cell coerced to the representation its field definition asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    List(Vec<String>),
    Json(JsonValue),
}

impl FieldValue {

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// ISO-8601 rendering with millisecond precision and a `Z` suffix.
    pub fn as_iso_date(&self) -> Option<String> {
        match self {
            FieldValue::Date(dt) => Some(iso_timestamp(dt)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Text(s) => JsonValue::String(s.clone()),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Boolean(b) => JsonValue::Bool(*b),
            FieldValue::Date(dt) => JsonValue::String(iso_timestamp(dt)),
            FieldValue::List(items) => {
                JsonValue::Array(items.iter().cloned().map(JsonValue::String).collect())
            }
            FieldValue::Json(value) => value.clone(),
        }
    }
}

impl From<RawCell> for FieldValue {
    fn from(cell: RawCell) -> Self {
        match cell {
            RawCell::Null => FieldValue::Null,
            RawCell::Boolean(b) => FieldValue::Boolean(b),
            RawCell::Number(n) => FieldValue::Number(n),
            RawCell::Text(s) => FieldValue::Text(s),
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

pub fn iso_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        (value as i64).to_string()
    } else {
        value.to_string()
    }
}

fn numeric_literal() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*-?(\d+\.?|\.\d+|\d+\.\d+)([eE][-+]?\d+)?\s*$").expect("valid regex")
    })
}

fn leading_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+\.?\d*|\.\d+)([eE][+-]?\d+)?").expect("valid regex")
    })
}

/// Parses the leading numeric portion of `value` after stripping `%`, `,` and
/// `$`. Mirrors lenient float parsing: `"12kg"` yields `12`.
pub fn parse_number_like(value: &str) -> Option<f64> {
    let cleaned: String = value
        .chars()
        .filter(|c| !matches!(c, '%' | ',' | '$'))
        .collect();
    let trimmed = cleaned.trim();
    let literal = leading_number().find(trimmed)?.as_str();
    literal.parse::<f64>().ok().filter(|n| n.is_finite())
}

pub fn is_truthy_token(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "yes" | "1" | "y" | "t"
    )
}

struct DatePattern {
    regex: Regex,
    year: usize,
    month: usize,
    day: usize,
}

fn date_patterns() -> &'static [DatePattern] {
    static PATTERNS: OnceLock<Vec<DatePattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            DatePattern {
                regex: Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})$").expect("valid regex"),
                year: 3,
                month: 1,
                day: 2,
            },
            DatePattern {
                regex: Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})$").expect("valid regex"),
                year: 1,
                month: 2,
                day: 3,
            },
            DatePattern {
                regex: Regex::new(r"^(\d{1,2})-(\d{1,2})-(\d{4})$").expect("valid regex"),
                year: 3,
                month: 1,
                day: 2,
            },
        ]
    })
}

/// Matches the explicit numeric layouts in priority order: `M/D/YYYY`,
/// `YYYY-M-D`, `M-D-YYYY`.
pub fn parse_numeric_date(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    for pattern in date_patterns() {
        let Some(caps) = pattern.regex.captures(trimmed) else {
            continue;
        };
        let year = caps.get(pattern.year)?.as_str().parse().ok()?;
        let month = caps.get(pattern.month)?.as_str().parse().ok()?;
        let day = caps.get(pattern.day)?.as_str().parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }
    None
}

/// Fallback parsing for anything the numeric layouts do not cover. Naive
/// values are read as UTC so the calendar date survives unchanged.
pub fn parse_generic_datetime(value: &str) -> Option<DateTime<Utc>> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M",
    ];
    const DATE_FORMATS: &[&str] = &[
        "%B %d, %Y",
        "%b %d, %Y",
        "%B %d %Y",
        "%b %d %Y",
        "%d %B %Y",
        "%d %b %Y",
        "%Y/%m/%d",
        "%a, %d %b %Y",
    ];
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(parsed.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Some(midnight_utc(parsed));
        }
    }
    None
}

pub fn parse_flexible_datetime(value: &str) -> Option<DateTime<Utc>> {
    parse_numeric_date(value)
        .map(midnight_utc)
        .or_else(|| parse_generic_datetime(value))
}

pub fn parse_flexible_date(value: &str) -> Option<NaiveDate> {
    parse_flexible_datetime(value).map(|dt| dt.date_naive())
}

pub fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc()
}

/// Reads a calendar date out of a stored JSON value: date strings in any
/// supported layout, or epoch milliseconds.
pub fn json_to_date(value: &JsonValue) -> Option<NaiveDate> {
    match value {
        JsonValue::String(s) => parse_flexible_date(s),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|dt| dt.date_naive()),
        _ => None,
    }
}

/// Every textual form a date may be typed as, lower-cased: `yyyy-mm-dd`,
/// `m/d/yyyy`, `mm/dd/yyyy`, `m-d-yyyy` and `month d, yyyy`.
pub fn date_display_keys(date: NaiveDate) -> Vec<String> {
    let (y, m, d) = (date.year(), date.month(), date.day());
    vec![
        date.format("%Y-%m-%d").to_string(),
        format!("{m}/{d}/{y}"),
        format!("{m:02}/{d:02}/{y}"),
        format!("{m}-{d}-{y}"),
        format!("{} {d}, {y}", date.format("%B")).to_lowercase(),
    ]
}

/// Renders a stored JSON value for display matching. Objects, arrays and null
/// have no display form.
pub fn json_display(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(
            n.as_f64()
                .map(format_number)
                .unwrap_or_else(|| n.to_string()),
        ),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn record_id(record: &Record) -> Option<String> {
    record.get("id").and_then(json_display)
}

pub fn normalize_key(value: &str) -> String {
    value.trim().to_lowercase()
}
