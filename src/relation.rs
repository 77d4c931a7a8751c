//! Relation index construction and relation value resolution.
//!
//! A relation field stores the id of a record in another dataset, but CSV
//! files carry whatever a person typed: a name, a date, or a compound such as
//! `Lipid Panel (2024-01-15)`. Before coercing rows, [`build_relation_index`]
//! fetches each related dataset once and registers every plausible textual
//! form of every record. [`RelationIndexEntry::resolve`] then walks the match
//! strategies in order:
//!
//! 1. the value already is a known id
//! 2. date-aware lookup when the display field is a date
//! 3. exact lookup of the normalized text
//! 4. compound `primary (secondary)` lookup, then a record scan on both parts
//! 5. a record scan on the primary or the secondary field
//!
//! Keys are compared trimmed and lower-cased. When two records register the
//! same key the first one keeps it; the key is remembered as ambiguous so the
//! caller can report it.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::OnceLock,
};

use log::{debug, info, warn};
use regex::Regex;

use crate::{
    schema::FieldDefinition,
    source::RecordSource,
    value::{
        RawCell, Record, date_display_keys, json_display, json_to_date, normalize_key,
        parse_flexible_date, record_id,
    },
};

const FALLBACK_DISPLAY_KEYS: &[&str] = &["name", "title", "label", "displayName"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    KnownId,
    DateKey,
    DisplayKey,
    Compound,
    RecordScan,
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MatchStrategy::KnownId => "known id",
            MatchStrategy::DateKey => "date key",
            MatchStrategy::DisplayKey => "display key",
            MatchStrategy::Compound => "compound key",
            MatchStrategy::RecordScan => "record scan",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationMatch {
    pub id: String,
    pub strategy: MatchStrategy,
    /// Another record registered the same key and lost the tie-break.
    pub ambiguous: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RelationIndexEntry {
    dataset: String,
    display_field: Option<String>,
    display_is_date: bool,
    secondary_field: Option<String>,
    secondary_is_date: bool,
    id_set: HashSet<String>,
    display_to_id: HashMap<String, String>,
    ambiguous_keys: HashSet<String>,
    records: Vec<Record>,
}

impl RelationIndexEntry {
    pub fn empty(field: &FieldDefinition) -> Self {
        Self {
            dataset: field.related_dataset.clone().unwrap_or_default(),
            display_field: field.display_field.clone(),
            display_is_date: field.displays_date(),
            secondary_field: field.secondary_display_field.clone(),
            secondary_is_date: field.secondary_displays_date(),
            ..Self::default()
        }
    }

    pub fn from_records(field: &FieldDefinition, records: Vec<Record>) -> Self {
        let mut entry = Self::empty(field);
        for record in &records {
            entry.register_record(record);
        }
        entry.records = records;
        entry
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.display_to_id.len()
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.display_to_id
            .get(&normalize_key(key))
            .map(String::as_str)
    }

    fn register_record(&mut self, record: &Record) {
        let Some(id) = record_id(record) else {
            debug!(
                "Skipping '{}' record without an id while indexing",
                self.dataset
            );
            return;
        };
        self.id_set.insert(id.clone());

        let primary_forms =
            self.display_forms(record, self.display_field.as_deref(), self.display_is_date);
        let secondary_forms = self.display_forms(
            record,
            self.secondary_field.as_deref(),
            self.secondary_is_date,
        );
        for key in primary_forms.iter().chain(secondary_forms.iter()) {
            self.register(key, &id);
        }
        // A date primary combines in every layout; otherwise only its text.
        let combined_primaries = if self.display_is_date {
            &primary_forms[..]
        } else {
            &primary_forms[..primary_forms.len().min(1)]
        };
        for primary in combined_primaries {
            for secondary in &secondary_forms {
                self.register(&format!("{primary} - {secondary}"), &id);
                self.register(&format!("{primary} ({secondary})"), &id);
            }
        }
        for fallback in FALLBACK_DISPLAY_KEYS {
            if let Some(value) = record.get(*fallback).and_then(json_display) {
                self.register(&value, &id);
            }
        }
    }

    /// The normalized display value first, followed by every date layout when
    /// the field holds a date.
    fn display_forms(
        &self,
        record: &Record,
        field: Option<&str>,
        is_date: bool,
    ) -> Vec<String> {
        let Some(value) = field.and_then(|name| record.get(name)) else {
            return Vec::new();
        };
        let mut forms = Vec::new();
        if let Some(text) = json_display(value) {
            let normalized = normalize_key(&text);
            if !normalized.is_empty() {
                forms.push(normalized);
            }
        }
        if is_date && let Some(date) = json_to_date(value) {
            for key in date_display_keys(date) {
                if !forms.contains(&key) {
                    forms.push(key);
                }
            }
        }
        forms
    }

    fn register(&mut self, key: &str, id: &str) {
        let normalized = normalize_key(key);
        if normalized.is_empty() {
            return;
        }
        match self.display_to_id.get(&normalized) {
            Some(existing) if existing != id => {
                debug!(
                    "Display key '{normalized}' in '{}' already maps to '{existing}'; ignoring '{id}'",
                    self.dataset
                );
                self.ambiguous_keys.insert(normalized);
            }
            Some(_) => {}
            None => {
                self.display_to_id.insert(normalized, id.to_string());
            }
        }
    }

    fn keyed_match(&self, key: &str, strategy: MatchStrategy) -> Option<RelationMatch> {
        let normalized = normalize_key(key);
        self.display_to_id.get(&normalized).map(|id| RelationMatch {
            id: id.clone(),
            strategy,
            ambiguous: self.ambiguous_keys.contains(&normalized),
        })
    }

    pub fn resolve(&self, raw: &RawCell) -> Option<RelationMatch> {
        let display = raw.as_display();
        if !raw.is_null() && self.id_set.contains(&display) {
            return Some(RelationMatch {
                id: display,
                strategy: MatchStrategy::KnownId,
                ambiguous: false,
            });
        }
        let RawCell::Text(text) = raw else {
            return None;
        };
        let normalized = normalize_key(text);
        if normalized.is_empty() {
            return None;
        }

        if self.display_is_date
            && let Some(date) = parse_flexible_date(&normalized)
            && let Some(found) = date_display_keys(date)
                .iter()
                .find_map(|key| self.keyed_match(key, MatchStrategy::DateKey))
        {
            return Some(found);
        }

        if let Some(found) = self.keyed_match(&normalized, MatchStrategy::DisplayKey) {
            return Some(found);
        }

        if let Some(found) = self.resolve_compound(&normalized) {
            return Some(found);
        }

        self.records
            .iter()
            .find(|record| {
                self.primary_matches(record, &normalized)
                    || self.secondary_matches(record, &normalized)
            })
            .and_then(record_id)
            .map(|id| RelationMatch {
                id,
                strategy: MatchStrategy::RecordScan,
                ambiguous: false,
            })
    }

    fn resolve_compound(&self, normalized: &str) -> Option<RelationMatch> {
        let caps = compound_pattern()
            .captures(normalized)
            .or_else(|| dashed_pattern().captures(normalized))?;
        let primary = caps.get(1)?.as_str().trim();
        let secondary = caps.get(2)?.as_str().trim();
        if primary.is_empty() || secondary.is_empty() {
            return None;
        }

        let primaries = Self::typed_forms(primary, self.display_is_date);
        let secondaries = Self::typed_forms(secondary, self.secondary_is_date);
        let mut candidates = primaries.iter().flat_map(|p| {
            secondaries
                .iter()
                .map(move |s| format!("{p} ({s})"))
        });
        if let Some(found) =
            candidates.find_map(|key| self.keyed_match(&key, MatchStrategy::Compound))
        {
            return Some(found);
        }

        self.records
            .iter()
            .find(|record| {
                self.primary_matches(record, primary) && self.secondary_matches(record, secondary)
            })
            .and_then(record_id)
            .map(|id| RelationMatch {
                id,
                strategy: MatchStrategy::Compound,
                ambiguous: false,
            })
    }

    /// The typed text itself, plus every registered layout when it is a date.
    fn typed_forms(text: &str, is_date: bool) -> Vec<String> {
        let mut forms = vec![text.to_string()];
        if is_date && let Some(date) = parse_flexible_date(text) {
            forms.extend(
                date_display_keys(date)
                    .into_iter()
                    .filter(|key| key != text),
            );
        }
        forms
    }

    fn primary_matches(&self, record: &Record, normalized: &str) -> bool {
        field_matches(
            record,
            self.display_field.as_deref(),
            self.display_is_date,
            normalized,
        )
    }

    fn secondary_matches(&self, record: &Record, normalized: &str) -> bool {
        field_matches(
            record,
            self.secondary_field.as_deref(),
            self.secondary_is_date,
            normalized,
        )
    }
}

/// Compares a stored field to typed text: by calendar date for date fields,
/// by normalized text otherwise.
fn field_matches(record: &Record, field: Option<&str>, is_date: bool, normalized: &str) -> bool {
    let Some(value) = field.and_then(|name| record.get(name)) else {
        return false;
    };
    if is_date {
        return match (json_to_date(value), parse_flexible_date(normalized)) {
            (Some(stored), Some(typed)) => stored == typed,
            _ => false,
        };
    }
    json_display(value).is_some_and(|text| normalize_key(&text) == normalized)
}

fn compound_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\s*\((.+)\)$").expect("valid regex"))
}

fn dashed_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+?)\s+-\s+(.+)$").expect("valid regex"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub field_key: String,
    pub dataset: String,
    pub message: String,
}

/// Per-import relation lookups keyed by field key. Built fresh for every
/// import and dropped with it.
#[derive(Debug, Clone, Default)]
pub struct RelationIndex {
    entries: HashMap<String, RelationIndexEntry>,
    failures: Vec<FetchFailure>,
}

impl RelationIndex {
    pub fn get(&self, field_key: &str) -> Option<&RelationIndexEntry> {
        self.entries.get(field_key)
    }

    pub fn insert(&mut self, field_key: impl Into<String>, entry: RelationIndexEntry) {
        self.entries.insert(field_key.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn failures(&self) -> &[FetchFailure] {
        &self.failures
    }
}

/// Fetches each related dataset sequentially and indexes it. A failed fetch
/// leaves that field with an empty entry; it never fails the build.
pub fn build_relation_index<S>(fields: &[&FieldDefinition], source: &S) -> RelationIndex
where
    S: RecordSource + ?Sized,
{
    let mut index = RelationIndex::default();
    for field in fields.iter().filter(|field| field.is_resolvable_relation()) {
        let dataset = field.related_dataset.as_deref().unwrap_or_default();
        let entry = match source.fetch_records(dataset) {
            Ok(records) => {
                let entry = RelationIndexEntry::from_records(field, records);
                info!(
                    "Indexed {} '{}' record(s) with {} display key(s) for field '{}'",
                    entry.len(),
                    dataset,
                    entry.key_count(),
                    field.key
                );
                entry
            }
            Err(err) => {
                warn!(
                    "Failed to fetch related dataset '{}' for field '{}': {err:#}",
                    dataset, field.key
                );
                index.failures.push(FetchFailure {
                    field_key: field.key.clone(),
                    dataset: dataset.to_string(),
                    message: format!("{err:#}"),
                });
                RelationIndexEntry::empty(field)
            }
        };
        index.entries.insert(field.key.clone(), entry);
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema::FieldType, source::InMemorySource};
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn panel_field() -> FieldDefinition {
        FieldDefinition::relation("panel", "panels", "name")
            .with_secondary("date", Some(FieldType::Date))
    }

    fn panels() -> Vec<Record> {
        vec![
            record(json!({"id": "p1", "name": "Lipid Panel", "date": "2024-01-15"})),
            record(json!({"id": "p2", "name": "Lipid Panel", "date": "2024-06-01"})),
            record(json!({"id": "p3", "name": "CBC", "date": "2024-06-01"})),
        ]
    }

    #[test]
    fn known_ids_pass_through() {
        let entry = RelationIndexEntry::from_records(&panel_field(), panels());
        let found = entry.resolve(&RawCell::Text("p2".into())).unwrap();
        assert_eq!(found.id, "p2");
        assert_eq!(found.strategy, MatchStrategy::KnownId);
    }

    #[test]
    fn first_registered_record_wins_ties() {
        let entry = RelationIndexEntry::from_records(&panel_field(), panels());
        let found = entry.resolve(&RawCell::Text("lipid panel".into())).unwrap();
        assert_eq!(found.id, "p1");
        assert!(found.ambiguous);
    }

    #[test]
    fn compound_values_resolve_with_any_date_layout() {
        let entry = RelationIndexEntry::from_records(&panel_field(), panels());
        let found = entry
            .resolve(&RawCell::Text("Lipid Panel (06/01/2024)".into()))
            .unwrap();
        assert_eq!(found.id, "p2");
        assert_eq!(found.strategy, MatchStrategy::DisplayKey);

        let dashed = entry
            .resolve(&RawCell::Text("Lipid Panel - 2024-01-15".into()))
            .unwrap();
        assert_eq!(dashed.id, "p1");
    }

    #[test]
    fn compound_scan_handles_unregistered_date_layouts() {
        let entry = RelationIndexEntry::from_records(&panel_field(), panels());
        let found = entry
            .resolve(&RawCell::Text("CBC (June 1 2024)".into()))
            .unwrap();
        assert_eq!(found.id, "p3");
        assert_eq!(found.strategy, MatchStrategy::Compound);
    }

    #[test]
    fn date_display_fields_match_any_typed_layout() {
        let field = FieldDefinition::relation("visit", "visits", "date")
            .with_display_field_type(FieldType::Date);
        let entry = RelationIndexEntry::from_records(
            &field,
            vec![record(json!({"id": "v1", "date": "2024-01-15T00:00:00.000Z"}))],
        );
        for typed in ["01/15/2024", "2024-1-15", "January 15, 2024", "1-15-2024"] {
            let found = entry.resolve(&RawCell::Text(typed.into()));
            assert_eq!(found.map(|m| m.id), Some("v1".to_string()), "{typed}");
        }
    }

    #[test]
    fn date_primary_combines_with_secondary_in_every_layout() {
        let field = FieldDefinition::relation("test", "tests", "date")
            .with_display_field_type(FieldType::Date)
            .with_secondary("lab", None);
        let entry = RelationIndexEntry::from_records(
            &field,
            vec![
                record(json!({"id": "t1", "date": "2024-01-15T00:00:00.000Z", "lab": "Quest"})),
                record(json!({"id": "t2", "date": "2024-01-15T00:00:00.000Z", "lab": "LabCorp"})),
            ],
        );
        for typed in ["2024-01-15 (LabCorp)", "01/15/2024 - LabCorp", "1/15/2024 (labcorp)"] {
            let found = entry.resolve(&RawCell::Text(typed.into())).unwrap();
            assert_eq!(found.id, "t2", "{typed}");
            assert_eq!(found.strategy, MatchStrategy::DisplayKey, "{typed}");
            assert!(!found.ambiguous, "{typed}");
        }

        let found = entry
            .resolve(&RawCell::Text("Jan 15 2024 (Quest)".into()))
            .unwrap();
        assert_eq!(found.id, "t1");
        assert_eq!(found.strategy, MatchStrategy::Compound);
    }

    #[test]
    fn standalone_secondary_date_resolves_by_scanning_records() {
        let entry = RelationIndexEntry::from_records(&panel_field(), panels());
        assert_eq!(entry.lookup("june 1 2024"), None);
        let found = entry
            .resolve(&RawCell::Text("June 1 2024".into()))
            .unwrap();
        assert_eq!(found.id, "p2");
        assert_eq!(found.strategy, MatchStrategy::RecordScan);
    }

    #[test]
    fn fallback_keys_and_numeric_ids_are_indexed() {
        let field = FieldDefinition::relation("owner", "contacts", "email");
        let entry = RelationIndexEntry::from_records(
            &field,
            vec![record(json!({"id": 42, "email": "ada@example.com", "title": "Countess"}))],
        );
        assert_eq!(entry.lookup("COUNTESS"), Some("42"));
        assert_eq!(
            entry.resolve(&RawCell::Number(42.0)).map(|m| m.id),
            Some("42".to_string())
        );
    }

    #[test]
    fn unmatched_values_resolve_to_none() {
        let entry = RelationIndexEntry::from_records(&panel_field(), panels());
        assert!(entry.resolve(&RawCell::Text("Thyroid".into())).is_none());
        assert!(entry.resolve(&RawCell::Number(7.0)).is_none());
    }

    #[test]
    fn failed_fetch_degrades_to_empty_entry() {
        let good = FieldDefinition::relation("account", "accounts", "name");
        let bad = FieldDefinition::relation("category", "categories", "name");
        let source = InMemorySource::new().with_dataset(
            "accounts",
            vec![record(json!({"id": "a1", "name": "Checking"}))],
        );
        let index = build_relation_index(&[&good, &bad], &source);
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("account").unwrap().len(), 1);
        assert!(index.get("category").unwrap().is_empty());
        assert_eq!(index.failures().len(), 1);
        assert_eq!(index.failures()[0].dataset, "categories");
    }
}
