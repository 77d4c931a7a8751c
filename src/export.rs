//! CSV export of stored records.
//!
//! Renders records for people rather than for re-import: headers use display
//! names, relations show the related record instead of its id, booleans read
//! `Yes`/`No`, and files collapse to placeholders.

use std::sync::OnceLock;

use csv::QuoteStyle;
use log::warn;
use regex::Regex;
use serde_json::Value as JsonValue;

use crate::{
    error::Result,
    io_utils,
    schema::{FieldDefinition, FieldType},
    value::{Record, format_number, json_display, json_to_date},
};

const FALLBACK_LABEL_KEYS: &[&str] = &["name", "title", "displayName", "label"];

/// Exports `records`, restricted to `visible_columns` when given.
pub fn export_csv(
    records: &[Record],
    fields: &[FieldDefinition],
    visible_columns: Option<&[String]>,
) -> Result<String> {
    if records.is_empty() {
        warn!("No data to export");
        return Ok(String::new());
    }
    let columns: Vec<&FieldDefinition> = fields
        .iter()
        .filter(|field| {
            visible_columns.is_none_or(|visible| {
                visible
                    .iter()
                    .any(|column| column.eq_ignore_ascii_case(&field.key))
            })
        })
        .collect();

    let mut writer = io_utils::csv_writer(QuoteStyle::Always);
    writer.write_record(columns.iter().map(|field| field.label()))?;
    for record in records {
        writer.write_record(columns.iter().map(|field| format_cell(record, field)))?;
    }
    io_utils::finish_writer(writer)
}

pub fn format_cell(record: &Record, field: &FieldDefinition) -> String {
    let value = record.get(&field.key).unwrap_or(&JsonValue::Null);
    if field.field_type == FieldType::File {
        return if is_present(value) {
            "[Image]".to_string()
        } else {
            String::new()
        };
    }
    if field.field_type == FieldType::FileMultiple {
        return match value {
            JsonValue::Array(items) if items.is_empty() => String::new(),
            JsonValue::Array(items) => format!("[{} files]", items.len()),
            other if is_present(other) => "[Multiple files]".to_string(),
            _ => String::new(),
        };
    }
    if field.is_relation {
        return format_relation(record, field, value);
    }
    match field.field_type {
        FieldType::Date => json_to_date(value)
            .map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or_default(),
        FieldType::Boolean => if is_truthy(value) { "Yes" } else { "No" }.to_string(),
        FieldType::Percentage => match value.as_f64() {
            Some(n) if value.is_number() && n < 1.0 => format!("{:.2}", n * 100.0),
            _ => plain(value),
        },
        FieldType::Markdown => match value {
            JsonValue::String(s) => markdown_syntax().replace_all(s, "").into_owned(),
            _ => String::new(),
        },
        _ => plain(value),
    }
}

fn format_relation(record: &Record, field: &FieldDefinition, value: &JsonValue) -> String {
    let related = match record.get(&format!("{}_data", field.key)) {
        Some(JsonValue::Object(related)) => related,
        _ => {
            return if is_truthy(value) {
                format!("ID: {}", plain(value))
            } else {
                String::new()
            };
        }
    };
    let shown = |name: Option<&str>| {
        name.and_then(|name| related.get(name))
            .filter(|v| is_truthy(v))
            .and_then(json_display)
    };
    if let Some(primary) = shown(field.display_field.as_deref()) {
        return match shown(field.secondary_display_field.as_deref()) {
            Some(secondary) => format!("{primary} ({secondary})"),
            None => primary,
        };
    }
    FALLBACK_LABEL_KEYS
        .iter()
        .find_map(|key| shown(Some(*key)))
        .or_else(|| {
            related
                .get("date")
                .and_then(json_to_date)
                .map(|date| date.format("%-m/%-d/%Y").to_string())
        })
        .unwrap_or_else(|| format!("ID: {}", plain(value)))
}

fn plain(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::Number(n) => n.as_f64().map(format_number).unwrap_or_else(|| n.to_string()),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .map(plain)
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Object(_) => value.to_string(),
    }
}

fn is_present(value: &JsonValue) -> bool {
    !matches!(value, JsonValue::Null) && is_truthy(value)
}

fn is_truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

fn markdown_syntax() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[#*_`\[\]()]").expect("valid regex"))
}
