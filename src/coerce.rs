//! Row coercion engine.
//!
//! Converts one tokenized CSV row into a [`ProcessedRow`] holding a value for
//! every field in the schema. Coercion never fails: a missing or malformed
//! cell becomes the field's default, and the problem is logged and recorded
//! as an [`ImportIssue`] for the caller to review.

use std::{collections::BTreeMap, collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    relation::RelationIndex,
    schema::{Coercion, FieldDefinition, FieldType, SelectOption},
    value::{
        FieldValue, RawCell, is_truthy_token, normalize_key, parse_flexible_datetime,
        parse_number_like,
    },
};

/// A tokenized row keyed by normalized header.
pub type RawRow = HashMap<String, RawCell>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    MissingValue,
    InvalidNumber { value: String },
    InvalidDate { value: String },
    InvalidJson { value: String },
    UnresolvedRelation { value: String, dataset: String },
    AmbiguousRelation { value: String, id: String },
    RelationFetchFailed { dataset: String, message: String },
    SkippedRecord { message: String },
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueKind::MissingValue => write!(f, "missing value, default substituted"),
            IssueKind::InvalidNumber { value } => {
                write!(f, "'{value}' is not a number, using 0")
            }
            IssueKind::InvalidDate { value } => {
                write!(f, "'{value}' is not a date, using the current time")
            }
            IssueKind::InvalidJson { value } => {
                write!(f, "'{value}' is not valid JSON, keeping the raw text")
            }
            IssueKind::UnresolvedRelation { value, dataset } => {
                write!(f, "no relation match for '{value}' in '{dataset}', keeping the raw value")
            }
            IssueKind::AmbiguousRelation { value, id } => {
                write!(f, "'{value}' matches several records, using '{id}'")
            }
            IssueKind::RelationFetchFailed { dataset, message } => {
                write!(f, "could not fetch '{dataset}': {message}")
            }
            IssueKind::SkippedRecord { message } => write!(f, "record skipped: {message}"),
        }
    }
}

/// A degraded value observed during import. `row_index` is the zero-based
/// data row; issues that concern the whole import carry no row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportIssue {
    pub row_index: Option<usize>,
    pub field_key: Option<String>,
    #[serde(flatten)]
    pub kind: IssueKind,
}

impl fmt::Display for ImportIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.row_index, &self.field_key) {
            (Some(row), Some(key)) => write!(f, "Row {} field '{key}': {}", row + 1, self.kind),
            (Some(row), None) => write!(f, "Row {}: {}", row + 1, self.kind),
            (None, Some(key)) => write!(f, "Field '{key}': {}", self.kind),
            (None, None) => write!(f, "{}", self.kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedRow {
    pub id: Uuid,
    #[serde(flatten)]
    pub values: BTreeMap<String, FieldValue>,
}

impl ProcessedRow {
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.values.get(key)
    }
}

/// Looks a cell up by exact key, then lower-cased, then upper-cased.
pub fn lookup_cell<'a>(row: &'a RawRow, key: &str) -> Option<&'a RawCell> {
    row.get(key)
        .or_else(|| row.get(&key.to_lowercase()))
        .or_else(|| row.get(&key.to_uppercase()))
}

pub fn default_value(field: &FieldDefinition, now: DateTime<Utc>) -> FieldValue {
    match field.coercion() {
        Coercion::Number | Coercion::Percentage => FieldValue::Number(0.0),
        Coercion::Boolean => FieldValue::Boolean(false),
        Coercion::Date => FieldValue::Date(now),
        Coercion::List => FieldValue::List(Vec::new()),
        Coercion::Json => FieldValue::Null,
        Coercion::Relation | Coercion::Text => FieldValue::Text(String::new()),
    }
}

pub struct RowCoercer<'a> {
    fields: &'a [FieldDefinition],
    relations: &'a RelationIndex,
    now: DateTime<Utc>,
}

impl<'a> RowCoercer<'a> {
    pub fn new(
        fields: &'a [FieldDefinition],
        relations: &'a RelationIndex,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            fields,
            relations,
            now,
        }
    }

    pub fn coerce_row(
        &self,
        raw: &RawRow,
        row_index: usize,
        issues: &mut Vec<ImportIssue>,
    ) -> ProcessedRow {
        let null = RawCell::Null;
        let mut values = BTreeMap::new();
        for field in self.fields {
            let cell = lookup_cell(raw, &field.key).unwrap_or(&null);
            let (value, issue) = self.coerce_field(field, cell);
            if let Some(kind) = issue {
                let issue = ImportIssue {
                    row_index: Some(row_index),
                    field_key: Some(field.key.clone()),
                    kind,
                };
                warn!("{issue}");
                issues.push(issue);
            }
            values.insert(field.key.clone(), value);
        }
        ProcessedRow {
            id: Uuid::new_v4(),
            values,
        }
    }

    fn coerce_field(
        &self,
        field: &FieldDefinition,
        cell: &RawCell,
    ) -> (FieldValue, Option<IssueKind>) {
        if cell.is_null() {
            let issue = (!field.is_optional).then_some(IssueKind::MissingValue);
            return (default_value(field, self.now), issue);
        }
        let coerced = match field.coercion() {
            Coercion::Relation => return self.coerce_relation(field, cell),
            Coercion::Number => coerce_number(cell),
            Coercion::Percentage => coerce_number(cell).map(clamp_percentage),
            Coercion::Boolean => Ok(coerce_boolean(cell)),
            Coercion::Date => coerce_date(cell),
            Coercion::List => Ok(coerce_list(cell, &field.options)),
            Coercion::Json => return coerce_json(cell),
            Coercion::Text => Ok(coerce_text(cell, field)),
        };
        match coerced {
            Ok(value) => (value, None),
            Err(kind) => (default_value(field, self.now), Some(kind)),
        }
    }

    fn coerce_relation(
        &self,
        field: &FieldDefinition,
        cell: &RawCell,
    ) -> (FieldValue, Option<IssueKind>) {
        let dataset = field.related_dataset.clone().unwrap_or_default();
        let resolved = self
            .relations
            .get(&field.key)
            .and_then(|entry| entry.resolve(cell));
        if let Some(found) = &resolved {
            debug!(
                "Field '{}' matched '{}' to {} '{}' by {}",
                field.key,
                cell.as_display(),
                dataset,
                found.id,
                found.strategy
            );
        }
        match resolved {
            Some(found) if found.ambiguous => {
                let issue = IssueKind::AmbiguousRelation {
                    value: cell.as_display(),
                    id: found.id.clone(),
                };
                (FieldValue::Text(found.id), Some(issue))
            }
            Some(found) => (FieldValue::Text(found.id), None),
            None => {
                let issue = IssueKind::UnresolvedRelation {
                    value: cell.as_display(),
                    dataset,
                };
                (FieldValue::from(cell.clone()), Some(issue))
            }
        }
    }
}

fn coerce_number(cell: &RawCell) -> Result<FieldValue, IssueKind> {
    match cell {
        RawCell::Number(n) => Ok(FieldValue::Number(*n)),
        RawCell::Boolean(b) => Ok(FieldValue::Number(if *b { 1.0 } else { 0.0 })),
        RawCell::Text(s) => parse_number_like(s)
            .map(FieldValue::Number)
            .ok_or_else(|| IssueKind::InvalidNumber { value: s.clone() }),
        RawCell::Null => Ok(FieldValue::Number(0.0)),
    }
}

fn clamp_percentage(value: FieldValue) -> FieldValue {
    match value {
        FieldValue::Number(n) => FieldValue::Number(n.clamp(0.0, 100.0)),
        other => other,
    }
}

fn coerce_boolean(cell: &RawCell) -> FieldValue {
    let truthy = match cell {
        RawCell::Boolean(b) => *b,
        RawCell::Number(n) => *n != 0.0,
        RawCell::Text(s) => is_truthy_token(s),
        RawCell::Null => false,
    };
    FieldValue::Boolean(truthy)
}

/// Numbers are epoch milliseconds; text goes through the date layouts.
fn coerce_date(cell: &RawCell) -> Result<FieldValue, IssueKind> {
    if let RawCell::Number(millis) = cell
        && millis.is_finite()
        && let Some(date) = DateTime::from_timestamp_millis(*millis as i64)
    {
        return Ok(FieldValue::Date(date));
    }
    let text = cell.as_display();
    parse_flexible_datetime(&text)
        .map(FieldValue::Date)
        .ok_or(IssueKind::InvalidDate { value: text })
}

fn option_id(options: &[SelectOption], value: &str) -> String {
    let normalized = normalize_key(value);
    options
        .iter()
        .find(|option| {
            normalize_key(&option.label) == normalized || normalize_key(&option.id) == normalized
        })
        .map(|option| option.id.clone())
        .unwrap_or_else(|| value.trim().to_string())
}

/// Splits on `;` when present, otherwise on `,`.
fn coerce_list(cell: &RawCell, options: &[SelectOption]) -> FieldValue {
    let text = cell.as_display();
    let separator = if text.contains(';') { ';' } else { ',' };
    let items = text
        .split(separator)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| option_id(options, item))
        .collect();
    FieldValue::List(items)
}

fn coerce_json(cell: &RawCell) -> (FieldValue, Option<IssueKind>) {
    match cell {
        RawCell::Text(s) => match serde_json::from_str(s) {
            Ok(parsed) => (FieldValue::Json(parsed), None),
            Err(_) => (
                FieldValue::Text(s.clone()),
                Some(IssueKind::InvalidJson { value: s.clone() }),
            ),
        },
        other => (FieldValue::Json(FieldValue::from(other.clone()).to_json()), None),
    }
}

fn coerce_text(cell: &RawCell, field: &FieldDefinition) -> FieldValue {
    let text = cell.as_display();
    if field.field_type == FieldType::SelectSingle && !field.options.is_empty() {
        return FieldValue::Text(option_id(&field.options, &text));
    }
    FieldValue::Text(text)
}
