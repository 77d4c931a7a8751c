//! Dataset schema model and YAML persistence.
//!
//! A [`DatasetSchema`] is the declarative description of one record type: its
//! dataset id, a display name, and an ordered list of [`FieldDefinition`]s.
//! Field definitions drive every other part of the crate:
//!
//! - header validation compares CSV headers against field keys
//! - the coercion engine picks one [`Coercion`] per field
//! - relation fields name the dataset whose records they reference
//! - templates and exports render display names and usage hints

use std::{fmt, fs::File, io::BufReader, path::Path, str::FromStr};

use anyhow::{Context, Result, anyhow, ensure};
use heck::ToTitleCase;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    Text,
    Number,
    Boolean,
    Date,
    Percentage,
    File,
    FileMultiple,
    Tags,
    Autocomplete,
    Markdown,
    Json,
    SelectSingle,
    SelectMultiple,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Percentage => "percentage",
            FieldType::File => "file",
            FieldType::FileMultiple => "file-multiple",
            FieldType::Tags => "tags",
            FieldType::Autocomplete => "autocomplete",
            FieldType::Markdown => "markdown",
            FieldType::Json => "json",
            FieldType::SelectSingle => "select-single",
            FieldType::SelectMultiple => "select-multiple",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "text",
            "number",
            "boolean",
            "date",
            "percentage",
            "file",
            "file-multiple",
            "tags",
            "autocomplete",
            "markdown",
            "json",
            "select-single",
            "select-multiple",
        ]
    }

    pub fn is_date(&self) -> bool {
        matches!(self, FieldType::Date)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "text" | "string" => Ok(FieldType::Text),
            "number" | "float" | "integer" => Ok(FieldType::Number),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            "percentage" | "percent" => Ok(FieldType::Percentage),
            "file" => Ok(FieldType::File),
            "file-multiple" => Ok(FieldType::FileMultiple),
            "tags" => Ok(FieldType::Tags),
            "autocomplete" => Ok(FieldType::Autocomplete),
            "markdown" => Ok(FieldType::Markdown),
            "json" => Ok(FieldType::Json),
            "select-single" => Ok(FieldType::SelectSingle),
            "select-multiple" => Ok(FieldType::SelectMultiple),
            _ => Err(anyhow!(
                "Unknown field type '{value}'. Supported types: {}",
                FieldType::variants().join(", ")
            )),
        }
    }
}

/// The coercion branch applied to a field. Relation fields always take the
/// relation branch regardless of their nominal type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Relation,
    Number,
    Percentage,
    Boolean,
    Date,
    List,
    Json,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub key: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default)]
    pub is_optional: bool,
    #[serde(default)]
    pub is_relation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_dataset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_display_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_display_field_type: Option<FieldType>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<SelectOption>,
}

impl FieldDefinition {
    pub fn new(key: impl Into<String>, field_type: FieldType) -> Self {
        let key = key.into();
        Self {
            display_name: key.to_title_case(),
            key,
            field_type,
            description: None,
            unit: None,
            is_optional: false,
            is_relation: false,
            related_dataset: None,
            display_field: None,
            display_field_type: None,
            secondary_display_field: None,
            secondary_display_field_type: None,
            options: Vec::new(),
        }
    }

    /// Builder for a relation field referencing `dataset` by `display_field`.
    pub fn relation(
        key: impl Into<String>,
        dataset: impl Into<String>,
        display_field: impl Into<String>,
    ) -> Self {
        let mut field = Self::new(key, FieldType::Text);
        field.is_relation = true;
        field.related_dataset = Some(dataset.into());
        field.display_field = Some(display_field.into());
        field
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_display_field_type(mut self, field_type: FieldType) -> Self {
        self.display_field_type = Some(field_type);
        self
    }

    pub fn with_secondary(
        mut self,
        field: impl Into<String>,
        field_type: Option<FieldType>,
    ) -> Self {
        self.secondary_display_field = Some(field.into());
        self.secondary_display_field_type = field_type;
        self
    }

    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.key
        } else {
            &self.display_name
        }
    }

    /// A relation field only participates in relation resolution when it
    /// names the dataset it points at.
    pub fn is_resolvable_relation(&self) -> bool {
        self.is_relation
            && self
                .related_dataset
                .as_deref()
                .is_some_and(|dataset| !dataset.trim().is_empty())
    }

    pub fn displays_date(&self) -> bool {
        self.display_field_type.is_some_and(|ty| ty.is_date())
    }

    pub fn secondary_displays_date(&self) -> bool {
        self.secondary_display_field_type
            .is_some_and(|ty| ty.is_date())
    }

    pub fn coercion(&self) -> Coercion {
        if self.is_relation {
            return Coercion::Relation;
        }
        match self.field_type {
            FieldType::Number => Coercion::Number,
            FieldType::Percentage => Coercion::Percentage,
            FieldType::Boolean => Coercion::Boolean,
            FieldType::Date => Coercion::Date,
            FieldType::Tags | FieldType::SelectMultiple | FieldType::FileMultiple => {
                Coercion::List
            }
            FieldType::Json => Coercion::Json,
            FieldType::Text
            | FieldType::Markdown
            | FieldType::File
            | FieldType::Autocomplete
            | FieldType::SelectSingle => Coercion::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSchema {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub fields: Vec<FieldDefinition>,
}

impl DatasetSchema {
    pub fn new(id: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        let id = id.into();
        Self {
            name: id.to_title_case(),
            id,
            description: None,
            fields,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let reader = BufReader::new(file);
        let schema: DatasetSchema =
            serde_yaml::from_reader(reader).context("Parsing schema YAML")?;
        schema.ensure_valid()?;
        Ok(schema)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.ensure_valid()?;
        let file = File::create(path).with_context(|| format!("Creating schema file {path:?}"))?;
        serde_yaml::to_writer(file, self).context("Writing schema YAML")
    }

    pub fn ensure_valid(&self) -> Result<()> {
        ensure!(!self.id.trim().is_empty(), "Schema id must not be empty");
        for field in &self.fields {
            ensure!(
                !field.key.trim().is_empty(),
                "Schema '{}' contains a field with an empty key",
                self.id
            );
            if field.is_relation {
                ensure!(
                    field.is_resolvable_relation(),
                    "Relation field '{}' must name a related dataset",
                    field.key
                );
            }
        }
        let duplicates = self
            .fields
            .iter()
            .map(|field| field.key.to_ascii_lowercase())
            .duplicates()
            .collect::<Vec<_>>();
        ensure!(
            duplicates.is_empty(),
            "Schema '{}' repeats field key(s): {}",
            self.id,
            duplicates.join(", ")
        );
        Ok(())
    }

    pub fn field_keys(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.key.clone()).collect()
    }

    pub fn relation_fields(&self) -> Vec<&FieldDefinition> {
        relation_fields(&self.fields)
    }
}

pub fn relation_fields(fields: &[FieldDefinition]) -> Vec<&FieldDefinition> {
    fields
        .iter()
        .filter(|field| field.is_resolvable_relation())
        .collect()
}
