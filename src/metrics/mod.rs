// Metrics module - metric rows, the per-probe metric collection and the flattening engine
//
// Result rows are turned into metric rows by `flatten`, grouped by metric family
// name in a `MetricList` and finally exported as Prometheus gauge vectors by the
// probe handler.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod flatten;
pub mod transform;

pub use flatten::flatten;

/// Metric families produced from one result row, keyed by metric name
pub type MetricFamilies = BTreeMap<String, Vec<MetricRow>>;

/// One exported sample: a label set plus an optional value
///
/// An absent value (`None`) is distinct from zero: it means the row carries no
/// usable number, e.g. because a `value` field was null or unparsable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub labels: BTreeMap<String, String>,
    pub value: Option<f64>,
}

impl MetricRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges labels into the row, overwriting existing values
    pub fn add_labels(&mut self, labels: &BTreeMap<String, String>) {
        for (name, value) in labels {
            self.labels.insert(name.clone(), value.clone());
        }
    }
}

/// Accumulator for all metric rows gathered during one probe
///
/// Rows are appended per metric family in arrival order. The list can be
/// serialized to bytes for the probe cache and restored without loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricList {
    list: BTreeMap<String, Vec<MetricRow>>,
}

impl MetricList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends rows to a metric family, creating the family if needed
    pub fn add(&mut self, name: &str, rows: impl IntoIterator<Item = MetricRow>) {
        self.list.entry(name.to_string()).or_default().extend(rows);
    }

    /// Appends every family produced by one `flatten` call
    pub fn extend(&mut self, families: MetricFamilies) {
        for (name, rows) in families {
            self.add(&name, rows);
        }
    }

    pub fn metric_names(&self) -> impl Iterator<Item = &str> {
        self.list.keys().map(String::as_str)
    }

    pub fn rows(&self, name: &str) -> &[MetricRow] {
        self.list.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    /// Union of all label names used by any row of a family, sorted
    pub fn label_names(&self, name: &str) -> Vec<String> {
        let names: BTreeSet<&String> = self
            .rows(name)
            .iter()
            .flat_map(|row| row.labels.keys())
            .collect();

        names.into_iter().cloned().collect()
    }

    /// Rows of a family with every missing label padded to an empty string
    ///
    /// Prometheus vectors require the same label dimensions on every sample.
    pub fn padded_rows(&self, name: &str) -> Vec<MetricRow> {
        let label_names = self.label_names(name);

        self.rows(name)
            .iter()
            .map(|row| {
                let mut row = row.clone();
                for label in &label_names {
                    row.labels.entry(label.clone()).or_default();
                }
                row
            })
            .collect()
    }

    /// Number of metric families
    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Total number of rows over all families
    pub fn row_count(&self) -> usize {
        self.list.values().map(Vec::len).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
