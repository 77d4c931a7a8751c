//! CSV validate/parse/template facade.
//!
//! Every import is one linear run: decode the bytes, tokenize with header
//! normalization and dynamic typing, build the relation index for the
//! schema's relation fields, then coerce each row. Only an empty file or a
//! fatal tokenizer complaint aborts the run; everything else is reported in
//! the returned [`ImportReport`].

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use csv::QuoteStyle;
use encoding_rs::{Encoding, UTF_8};
use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    coerce::{ImportIssue, IssueKind, ProcessedRow, RawRow, RowCoercer},
    error::{ImportError, Result, is_fatal_tokenizer_message},
    io_utils,
    relation::build_relation_index,
    schema::{Coercion, FieldDefinition, FieldType, relation_fields},
    source::RecordSource,
    value::RawCell,
};

pub const DEFAULT_PREVIEW_ROWS: usize = 5;

#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Data rows read when validating headers.
    pub preview_rows: usize,
    pub encoding: &'static Encoding,
    /// Timestamp substituted for missing or invalid dates; defaults to the
    /// moment the import starts.
    pub now: Option<DateTime<Utc>>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            preview_rows: DEFAULT_PREVIEW_ROWS,
            encoding: UTF_8,
            now: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub missing_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub rows: Vec<ProcessedRow>,
    pub issues: Vec<ImportIssue>,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn issues_for_row(&self, row_index: usize) -> impl Iterator<Item = &ImportIssue> {
        self.issues
            .iter()
            .filter(move |issue| issue.row_index == Some(row_index))
    }
}

struct Tokenized {
    headers: Vec<String>,
    rows: Vec<RawRow>,
    skipped: Vec<ImportIssue>,
}

/// Reads the header and data rows. With a `limit` only that many rows are
/// read, and an unclosed quote only fails the read when it starts inside
/// them.
fn tokenize(text: &str, limit: Option<usize>) -> Result<Tokenized> {
    let unclosed_line = io_utils::find_unclosed_quote(text);
    let mut reader = io_utils::open_csv_reader(text.as_bytes(), true);
    let headers = io_utils::reader_headers(&mut reader)?;
    let mut rows = Vec::new();
    let mut skipped = Vec::new();
    let mut records = reader.records();
    let mut exhausted = false;
    let mut idx = 0usize;
    while limit.is_none_or(|max| rows.len() < max) {
        let Some(record) = records.next() else {
            exhausted = true;
            break;
        };
        idx += 1;
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                let message = err.to_string();
                if is_fatal_tokenizer_message(&message) {
                    return Err(ImportError::Tokenizer { message });
                }
                warn!("Skipping CSV record {}: {message}", idx + 1);
                skipped.push(ImportIssue {
                    row_index: None,
                    field_key: None,
                    kind: IssueKind::SkippedRecord { message },
                });
                continue;
            }
        };
        let mut row = RawRow::with_capacity(headers.len());
        for (header, value) in headers.iter().zip(record.iter()) {
            row.entry(header.clone())
                .or_insert_with(|| RawCell::infer(value));
        }
        if record.len() != headers.len() {
            debug!(
                "CSV record {} has {} field(s), header has {}",
                idx + 1,
                record.len(),
                headers.len()
            );
        }
        rows.push(row);
    }

    if let Some(line) = unclosed_line {
        let consumed_through = records.reader().position().line();
        if exhausted || (line as u64) < consumed_through {
            return Err(ImportError::Tokenizer {
                message: format!("Unclosed quoted field starting on line {line}"),
            });
        }
        debug!("Unclosed quote on line {line} lies beyond the {idx} row(s) read");
    }
    Ok(Tokenized {
        headers,
        rows,
        skipped,
    })
}

/// Checks that every expected key appears among the file's headers.
pub fn validate_csv(
    bytes: &[u8],
    expected_fields: &[String],
    options: &ImportOptions,
) -> Result<ValidationResult> {
    let text = io_utils::decode_input(bytes, options.encoding)?;
    let tokenized = tokenize(&text, Some(options.preview_rows))?;
    let headers: HashSet<&str> = tokenized.headers.iter().map(String::as_str).collect();
    let missing_fields: Vec<String> = expected_fields
        .iter()
        .filter(|field| !headers.contains(io_utils::normalize_header(field).as_str()))
        .cloned()
        .collect();
    debug!(
        "Validated {} header(s) against {} expected field(s); {} missing",
        headers.len(),
        expected_fields.len(),
        missing_fields.len()
    );
    Ok(ValidationResult {
        is_valid: missing_fields.is_empty(),
        missing_fields,
    })
}

/// Parses and coerces every row of `bytes` against `fields`, resolving
/// relation fields through records fetched from `source`.
pub fn parse_csv<S>(
    bytes: &[u8],
    fields: &[FieldDefinition],
    source: &S,
    options: &ImportOptions,
) -> Result<ImportReport>
where
    S: RecordSource + ?Sized,
{
    let text = io_utils::decode_input(bytes, options.encoding)?;
    let tokenized = tokenize(&text, None)?;
    if tokenized.rows.is_empty() {
        return Err(ImportError::EmptyFile);
    }
    let mut issues = tokenized.skipped;

    let relations = build_relation_index(&relation_fields(fields), source);
    for failure in relations.failures() {
        issues.push(ImportIssue {
            row_index: None,
            field_key: Some(failure.field_key.clone()),
            kind: IssueKind::RelationFetchFailed {
                dataset: failure.dataset.clone(),
                message: failure.message.clone(),
            },
        });
    }

    let now = options.now.unwrap_or_else(Utc::now);
    let coercer = RowCoercer::new(fields, &relations, now);
    let rows: Vec<ProcessedRow> = tokenized
        .rows
        .iter()
        .enumerate()
        .map(|(idx, raw)| coercer.coerce_row(raw, idx, &mut issues))
        .collect();

    info!(
        "Parsed {} row(s) across {} field(s) with {} issue(s)",
        rows.len(),
        fields.len(),
        issues.len()
    );
    Ok(ImportReport { rows, issues })
}

pub fn template_file_name(dataset_id: &str) -> String {
    format!("{dataset_id}_template.csv")
}

/// Builds a downloadable template: a header row of field keys, a row
/// describing each field, and a row of example values.
pub fn create_csv_template(fields: &[FieldDefinition]) -> Result<String> {
    let mut writer = io_utils::csv_writer(QuoteStyle::Necessary);
    writer.write_record(fields.iter().map(|field| field.key.as_str()))?;
    writer.write_record(fields.iter().map(describe_field))?;
    writer.write_record(fields.iter().map(example_value))?;
    io_utils::finish_writer(writer)
}

fn describe_field(field: &FieldDefinition) -> String {
    let mut description = match field_hint(field) {
        Some(hint) => format!("{} {hint}", field.label()),
        None => field.label().to_string(),
    };
    if field.is_optional {
        description.push_str(" [optional]");
    }
    description
}

fn field_hint(field: &FieldDefinition) -> Option<String> {
    if field.is_relation {
        let dataset = field.related_dataset.as_deref().unwrap_or_default();
        if field.displays_date() {
            return Some(
                "(Enter date, e.g. 2024-01-15 or 01/15/2024 - the system will match)".to_string(),
            );
        }
        let display = field.display_field.as_deref().unwrap_or("name");
        return Some(match field.secondary_display_field.as_deref() {
            Some(secondary) => format!(
                "(Enter the {display} of a {dataset} record, or \"{display} ({secondary})\" - the system will match)"
            ),
            None => format!("(Enter the {display} of a {dataset} record - the system will match)"),
        });
    }
    match field.field_type {
        FieldType::Boolean => Some("(Yes/No, True/False, or 1/0)".to_string()),
        FieldType::Date => Some("(YYYY-MM-DD, MM/DD/YYYY, or MM-DD-YYYY)".to_string()),
        FieldType::Percentage => Some("(0-100)".to_string()),
        FieldType::Number => Some(match field.unit.as_deref() {
            Some(unit) if !unit.is_empty() => format!("(Number in {unit})"),
            _ => "(Number)".to_string(),
        }),
        FieldType::Tags | FieldType::SelectMultiple => {
            Some("(Separate values with commas)".to_string())
        }
        FieldType::FileMultiple => Some("(Separate paths with semicolons)".to_string()),
        FieldType::Json => Some("(JSON)".to_string()),
        FieldType::Markdown => Some("(Markdown)".to_string()),
        FieldType::Text | FieldType::File | FieldType::Autocomplete | FieldType::SelectSingle => {
            None
        }
    }
}

fn example_value(field: &FieldDefinition) -> String {
    if field.is_relation {
        if field.displays_date() {
            return "2024-01-15".to_string();
        }
        return format!("Example {}", field.display_field.as_deref().unwrap_or("name"));
    }
    let first_labels = |count: usize| {
        field
            .options
            .iter()
            .take(count)
            .map(|option| option.label.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    match field.coercion() {
        Coercion::Number => "42".to_string(),
        Coercion::Percentage => "75".to_string(),
        Coercion::Boolean => "Yes".to_string(),
        Coercion::Date => "2024-01-15".to_string(),
        Coercion::Json => r#"{"key": "value"}"#.to_string(),
        Coercion::List if field.field_type == FieldType::FileMultiple => String::new(),
        Coercion::List if !field.options.is_empty() => first_labels(2),
        Coercion::List => "tag1, tag2".to_string(),
        Coercion::Text if field.field_type == FieldType::File => String::new(),
        Coercion::Text if !field.options.is_empty() => first_labels(1),
        Coercion::Text | Coercion::Relation => "Example text".to_string(),
    }
}
