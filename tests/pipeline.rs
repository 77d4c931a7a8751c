mod common;

use chrono::{TimeZone, Utc};
use data_desktop_import::{
    coerce::IssueKind,
    error::ImportError,
    import::{ImportOptions, create_csv_template, parse_csv, validate_csv},
    schema::{DatasetSchema, FieldDefinition, FieldType},
    source::{InMemorySource, JsonDirectorySource},
    value::FieldValue,
};
use proptest::prelude::*;
use serde_json::json;

use common::{TestWorkspace, fixture_path, record};

fn options() -> ImportOptions {
    ImportOptions {
        now: Some(Utc.with_ymd_and_hms(2025, 6, 30, 9, 0, 0).unwrap()),
        ..ImportOptions::default()
    }
}

fn single_field(key: &str, ty: FieldType) -> Vec<FieldDefinition> {
    vec![FieldDefinition::new(key, ty)]
}

fn parse_one(fields: &[FieldDefinition], csv: &str) -> FieldValue {
    let report = parse_csv(csv.as_bytes(), fields, &InMemorySource::new(), &options())
        .expect("parse csv");
    report.rows[0].values[&fields[0].key].clone()
}

#[test]
fn template_example_row_coerces_to_declared_types() {
    let fields = vec![
        FieldDefinition::new("done", FieldType::Boolean),
        FieldDefinition::new("weight", FieldType::Number).with_unit("kg"),
        FieldDefinition::new("progress", FieldType::Percentage),
        FieldDefinition::new("logged_on", FieldType::Date),
        FieldDefinition::new("notes", FieldType::Markdown),
        FieldDefinition::new("labels", FieldType::Tags),
        FieldDefinition::new("extra", FieldType::Json),
    ];
    let template = create_csv_template(&fields).expect("template");
    let report = parse_csv(template.as_bytes(), &fields, &InMemorySource::new(), &options())
        .expect("parse template");

    // Row 0 is the description row; row 1 holds the examples.
    assert_eq!(report.rows.len(), 2);
    let example = &report.rows[1];
    assert_eq!(example.get("done"), Some(&FieldValue::Boolean(true)));
    assert_eq!(example.get("weight"), Some(&FieldValue::Number(42.0)));
    assert_eq!(example.get("progress"), Some(&FieldValue::Number(75.0)));
    assert!(
        example
            .get("logged_on")
            .and_then(FieldValue::as_iso_date)
            .unwrap()
            .starts_with("2024-01-15")
    );
    assert_eq!(
        example.get("labels"),
        Some(&FieldValue::List(vec!["tag1".into(), "tag2".into()]))
    );
    assert_eq!(
        example.get("extra"),
        Some(&FieldValue::Json(json!({"key": "value"})))
    );
    assert!(report.issues_for_row(1).next().is_none());
}

#[test]
fn empty_cells_take_documented_defaults() {
    let fields = vec![
        FieldDefinition::new("n", FieldType::Number),
        FieldDefinition::new("p", FieldType::Percentage),
        FieldDefinition::new("b", FieldType::Boolean),
        FieldDefinition::new("d", FieldType::Date),
        FieldDefinition::new("t", FieldType::Text),
        FieldDefinition::new("present", FieldType::Text),
    ];
    let report = parse_csv(
        b"n,p,b,d,t,present\n,,,,,x\n",
        &fields,
        &InMemorySource::new(),
        &options(),
    )
    .unwrap();
    let row = &report.rows[0];
    assert_eq!(row.get("n"), Some(&FieldValue::Number(0.0)));
    assert_eq!(row.get("p"), Some(&FieldValue::Number(0.0)));
    assert_eq!(row.get("b"), Some(&FieldValue::Boolean(false)));
    assert_eq!(
        row.get("d").and_then(FieldValue::as_iso_date).as_deref(),
        Some("2025-06-30T09:00:00.000Z")
    );
    assert_eq!(row.get("t"), Some(&FieldValue::Text(String::new())));
    let missing: Vec<_> = report
        .issues
        .iter()
        .filter(|issue| issue.kind == IssueKind::MissingValue)
        .collect();
    assert_eq!(missing.len(), 5);
}

#[test]
fn absent_columns_still_produce_values() {
    let fields = vec![
        FieldDefinition::new("name", FieldType::Text),
        FieldDefinition::new("count", FieldType::Number),
    ];
    let report = parse_csv(b"name\nwidget\n", &fields, &InMemorySource::new(), &options()).unwrap();
    assert_eq!(report.rows[0].get("count"), Some(&FieldValue::Number(0.0)));
}

#[test]
fn numbers_strip_formatting() {
    let fields = single_field("amount", FieldType::Number);
    assert_eq!(
        parse_one(&fields, "amount\n\"$1,234.50\"\n"),
        FieldValue::Number(1234.5)
    );
    assert_eq!(parse_one(&fields, "amount\n45%\n"), FieldValue::Number(45.0));
}

#[test]
fn boolean_strings_are_recognized() {
    let fields = single_field("done", FieldType::Boolean);
    for raw in ["true", "TRUE", "Yes", "1", "y", "T"] {
        assert_eq!(
            parse_one(&fields, &format!("done\n{raw}\n")),
            FieldValue::Boolean(true),
            "{raw}"
        );
    }
    for raw in ["false", "nope", "0"] {
        assert_eq!(
            parse_one(&fields, &format!("done\n{raw}\n")),
            FieldValue::Boolean(false),
            "{raw}"
        );
    }
}

#[test]
fn date_layouts_yield_the_same_iso_prefix() {
    let fields = single_field("date", FieldType::Date);
    for raw in ["01/15/2024", "2024-01-15", "01-15-2024"] {
        let value = parse_one(&fields, &format!("date\n{raw}\n"));
        assert!(
            value.as_iso_date().unwrap().starts_with("2024-01-15"),
            "{raw}"
        );
    }
}

#[test]
fn percentages_are_clamped() {
    let fields = single_field("pct", FieldType::Percentage);
    assert_eq!(parse_one(&fields, "pct\n150\n"), FieldValue::Number(100.0));
    assert_eq!(parse_one(&fields, "pct\n-5\n"), FieldValue::Number(0.0));
}

#[test]
fn relation_resolves_display_value_case_insensitively() {
    let fields = vec![FieldDefinition::relation("company", "companies", "name")];
    let source = InMemorySource::new().with_dataset(
        "companies",
        vec![record(json!({"id": "co-7", "name": "Acme"}))],
    );
    let report = parse_csv(b"company\nacme\n", &fields, &source, &options()).unwrap();
    assert_eq!(
        report.rows[0].get("company"),
        Some(&FieldValue::Text("co-7".into()))
    );
    assert!(report.is_clean());
}

#[test]
fn unmatched_relation_keeps_raw_value() {
    let fields = vec![FieldDefinition::relation("company", "companies", "name")];
    let source = InMemorySource::new().with_dataset(
        "companies",
        vec![record(json!({"id": "co-7", "name": "Acme"}))],
    );
    let report = parse_csv(b"company\nInitech\n", &fields, &source, &options()).unwrap();
    assert_eq!(
        report.rows[0].get("company"),
        Some(&FieldValue::Text("Initech".into()))
    );
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].field_key.as_deref(), Some("company"));
    assert!(matches!(
        report.issues[0].kind,
        IssueKind::UnresolvedRelation { .. }
    ));
}

#[test]
fn relation_fetch_failure_degrades_instead_of_failing() {
    let fields = vec![FieldDefinition::relation("company", "companies", "name")];
    let report = parse_csv(b"company\nAcme\n", &fields, &InMemorySource::new(), &options())
        .expect("fetch failures are not fatal");
    assert_eq!(
        report.rows[0].get("company"),
        Some(&FieldValue::Text("Acme".into()))
    );
    assert!(
        report
            .issues
            .iter()
            .any(|issue| matches!(issue.kind, IssueKind::RelationFetchFailed { .. }))
    );
}

#[test]
fn header_validation_reports_missing_key() {
    let expected = vec!["date".to_string(), "Amount".to_string(), "memo".to_string()];
    let result = validate_csv(b"DATE,amount\n2024-01-01,5\n", &expected, &options()).unwrap();
    assert!(!result.is_valid);
    assert_eq!(result.missing_fields, vec!["memo".to_string()]);
}

#[test]
fn header_only_file_is_fatal() {
    let fields = single_field("name", FieldType::Text);
    let err = parse_csv(b"name\n", &fields, &InMemorySource::new(), &options()).unwrap_err();
    assert!(matches!(err, ImportError::EmptyFile));
    let err = parse_csv(b"", &fields, &InMemorySource::new(), &options()).unwrap_err();
    assert!(matches!(err, ImportError::EmptyFile));
}

#[test]
fn unclosed_quote_is_fatal() {
    let fields = single_field("name", FieldType::Text);
    let err = parse_csv(
        b"name\n\"never closed\nnext\n",
        &fields,
        &InMemorySource::new(),
        &options(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("Unclosed quoted field"));
}

#[test]
fn fixture_import_resolves_accounts_from_disk() {
    let schema = DatasetSchema::load(&fixture_path("transactions.yaml")).unwrap();
    let bytes = std::fs::read(fixture_path("transactions.csv")).unwrap();
    let source = JsonDirectorySource::new(fixture_path("related"));

    let validation = validate_csv(&bytes, &schema.field_keys(), &options()).unwrap();
    assert!(validation.is_valid);

    let report = parse_csv(&bytes, &schema.fields, &source, &options()).unwrap();
    assert_eq!(report.rows.len(), 3);
    let accounts: Vec<_> = report
        .rows
        .iter()
        .map(|row| row.get("account").cloned().unwrap())
        .collect();
    assert_eq!(
        accounts,
        vec![
            FieldValue::Text("acc-1".into()),
            FieldValue::Text("acc-2".into()),
            FieldValue::Text("Brokerage".into()),
        ]
    );
    assert_eq!(report.rows[0].get("amount"), Some(&FieldValue::Number(1234.5)));
    assert_eq!(
        report.rows[0].get("tags"),
        Some(&FieldValue::List(vec!["food".into(), "weekly".into()]))
    );
    assert_eq!(report.rows[1].get("cleared"), Some(&FieldValue::Boolean(true)));
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].row_index, Some(2));
}

#[test]
fn legacy_encoded_files_decode_before_parsing() {
    let workspace = TestWorkspace::new();
    let path = workspace.path().join("latin1.csv");
    std::fs::write(&path, b"name\ncaf\xE9\n").unwrap();
    let fields = single_field("name", FieldType::Text);
    let options = ImportOptions {
        encoding: encoding_rs::WINDOWS_1252,
        ..options()
    };
    let bytes = std::fs::read(&path).unwrap();
    let report = parse_csv(&bytes, &fields, &InMemorySource::new(), &options).unwrap();
    assert_eq!(report.rows[0].get("name"), Some(&FieldValue::Text("café".into())));
}

proptest! {
    #[test]
    fn formatted_currency_round_trips(cents in 0u64..100_000_000) {
        let value = cents as f64 / 100.0;
        let whole = (cents / 100).to_string();
        let grouped = whole
            .as_bytes()
            .rchunks(3)
            .rev()
            .map(|chunk| std::str::from_utf8(chunk).unwrap())
            .collect::<Vec<_>>()
            .join(",");
        let formatted = format!("${grouped}.{:02}", cents % 100);
        let fields = single_field("amount", FieldType::Number);
        let parsed = parse_one(&fields, &format!("amount\n\"{formatted}\"\n"));
        let expected: f64 = format!("{whole}.{:02}", cents % 100).parse().unwrap();
        prop_assert_eq!(parsed.clone(), FieldValue::Number(expected));
        prop_assert!((value - parsed.as_number().unwrap()).abs() < 1e-6);
    }

    #[test]
    fn percentages_stay_in_range(raw in -1.0e6f64..1.0e6) {
        let fields = single_field("pct", FieldType::Percentage);
        let parsed = parse_one(&fields, &format!("pct\n{raw}\n")).as_number().unwrap();
        prop_assert!((0.0..=100.0).contains(&parsed));
    }
}
