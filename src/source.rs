//! Collaborators that supply the records of related datasets.
//!
//! Relation fields reference records stored elsewhere. The import pipeline
//! only needs one operation from that storage: fetch every record of a
//! dataset. [`RecordSource`] is that seam; [`JsonDirectorySource`] serves
//! exported datasets from disk and [`InMemorySource`] serves fixtures.

use std::{
    collections::HashMap,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use serde_json::Value as JsonValue;

use crate::value::Record;

pub trait RecordSource {
    fn fetch_records(&self, dataset: &str) -> Result<Vec<Record>>;
}

impl<T: RecordSource + ?Sized> RecordSource for &T {
    fn fetch_records(&self, dataset: &str) -> Result<Vec<Record>> {
        (**self).fetch_records(dataset)
    }
}

/// Reads `{dir}/{dataset}.json`, a JSON array of record objects.
#[derive(Debug, Clone)]
pub struct JsonDirectorySource {
    root: PathBuf,
}

impl JsonDirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dataset_path(&self, dataset: &str) -> PathBuf {
        self.root.join(format!("{dataset}.json"))
    }
}

impl RecordSource for JsonDirectorySource {
    fn fetch_records(&self, dataset: &str) -> Result<Vec<Record>> {
        let path = self.dataset_path(dataset);
        load_records(&path).with_context(|| format!("Fetching dataset '{dataset}'"))
    }
}

pub fn load_records(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).with_context(|| format!("Opening records file {path:?}"))?;
    let value: JsonValue = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Parsing records JSON {path:?}"))?;
    let JsonValue::Array(items) = value else {
        bail!("Records file {path:?} must contain a JSON array");
    };
    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            JsonValue::Object(map) => Ok(map),
            other => bail!(
                "Record {} in {path:?} is not an object (found {})",
                idx + 1,
                json_kind(&other)
            ),
        })
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Datasets held in memory; unknown datasets fail like a missing endpoint.
#[derive(Debug, Clone, Default)]
pub struct InMemorySource {
    datasets: HashMap<String, Vec<Record>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>, records: Vec<Record>) -> Self {
        self.insert(dataset, records);
        self
    }

    pub fn insert(&mut self, dataset: impl Into<String>, records: Vec<Record>) {
        self.datasets.insert(dataset.into(), records);
    }
}

impl RecordSource for InMemorySource {
    fn fetch_records(&self, dataset: &str) -> Result<Vec<Record>> {
        match self.datasets.get(dataset) {
            Some(records) => Ok(records.clone()),
            None => bail!("Unknown dataset '{dataset}'"),
        }
    }
}
