// Configuration module - query and field schema for the exporter
//
// This module is responsible for:
// 1. Reading the YAML query configuration from disk
// 2. Describing how each result row is turned into metrics (fields, filters, expand)
// 3. Validating the configuration once at startup, compiling filter regexes eagerly
// 4. Answering classification questions for the flattening engine

use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Errors that can occur while loading or validating the configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read configuration file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("unable to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("no queries found")]
    NoQueries,

    #[error("no metric name set")]
    MissingMetricName,

    #[error("no query set")]
    MissingQuery,

    #[error("no field name set")]
    MissingFieldName,

    #[error("unsupported type \"{0}\"")]
    UnsupportedFieldType(String),

    #[error("no type name set")]
    MissingFilterType,

    #[error("filter \"{0}\" not supported")]
    UnsupportedFilter(String),

    #[error("no regexp for filter set")]
    MissingRegexp,

    #[error("invalid regexp: {0}")]
    InvalidRegexp(#[from] regex::Error),

    #[error("query \"{metric}\": {source}")]
    Query {
        metric: String,
        source: Box<ConfigError>,
    },

    #[error("field \"{field}\": {source}")]
    Field {
        field: String,
        source: Box<ConfigError>,
    },
}

/// Root of the YAML configuration file
///
/// # Example
/// ```yaml
/// queries:
///   - module: resources
///     metric: azurerm_resource
///     query: |-
///       Resources | project id, name, location
///     fields:
///       - name: id
///         type: id
///       - name: location
///     defaultField:
///       type: ignore
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queries: Vec<QueryConfig>,
}

/// One configured query and the metric it produces
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryConfig {
    /// Metric layout, inlined next to the query keys
    #[serde(flatten)]
    pub metric_config: MetricConfig,

    /// Name of the main metric family
    #[serde(default)]
    pub metric: String,

    /// Module name matched against the `module` probe parameter
    #[serde(default)]
    pub module: String,

    /// Resource graph (Kusto) query text
    #[serde(default)]
    pub query: String,

    /// Subscriptions to query; falls back to the exporter-wide list when unset
    #[serde(default)]
    pub subscriptions: Option<Vec<String>>,
}

/// How one result row (or one expanded sub-row) becomes metrics
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    /// Fixed value for the main row, overridden by a `value` field
    #[serde(default)]
    pub value: Option<f64>,

    #[serde(default)]
    pub fields: Vec<FieldConfig>,

    /// Static labels added to the main row
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Policy for row keys without a field configuration
    #[serde(default)]
    pub default_field: FieldConfig,

    /// Whether the main row of this level is emitted (default: true)
    #[serde(default)]
    pub publish: Option<bool>,
}

/// Configuration of a single row key
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FieldConfig {
    #[serde(default)]
    pub name: String,

    /// Dedicated metric family for this field's output
    #[serde(default)]
    pub metric: Option<String>,

    /// Row key to read instead of `name`
    #[serde(default)]
    pub source: Option<String>,

    /// Label name to write instead of `name`
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default, rename = "type")]
    pub kind: FieldType,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub filters: Vec<FieldFilter>,

    /// Nested layout for `expand` fields
    #[serde(default)]
    pub expand: Option<Box<MetricConfig>>,
}

/// Role of a field inside a metric row
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum FieldType {
    /// Plain label (`string`, also used when no type is given)
    #[default]
    String,
    /// Label normalized to `true`/`false` (`bool` or `boolean`)
    Bool,
    /// Label propagated into every row derived from the same result row
    Id,
    /// Numeric metric value
    Value,
    Ignore,
    /// Nested object/array decomposed into its own metric family
    Expand,
    Unknown(String),
}

impl From<String> for FieldType {
    fn from(value: String) -> Self {
        match value.to_lowercase().as_str() {
            "" | "string" => FieldType::String,
            "bool" | "boolean" => FieldType::Bool,
            "id" => FieldType::Id,
            "value" => FieldType::Value,
            "ignore" => FieldType::Ignore,
            "expand" => FieldType::Expand,
            _ => FieldType::Unknown(value),
        }
    }
}

/// Value transform applied to a field before it is stored
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "FilterSpec")]
pub struct FieldFilter {
    pub kind: FilterKind,
    pub regexp: Option<String>,
    pub replacement: String,
    compiled: Option<Regex>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    ToLower,
    ToUpper,
    ToTitle,
    Regexp,
    ToUnixtime,
    Unknown(String),
}

impl From<&str> for FilterKind {
    fn from(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "tolower" => FilterKind::ToLower,
            "toupper" => FilterKind::ToUpper,
            "totitle" => FilterKind::ToTitle,
            "regexp" => FilterKind::Regexp,
            "tounixtime" => FilterKind::ToUnixtime,
            _ => FilterKind::Unknown(value.to_string()),
        }
    }
}

/// Filters are written either as a bare name (`- tolower`) or as an object
#[derive(Deserialize)]
#[serde(untagged)]
enum FilterSpec {
    Name(String),
    Full {
        #[serde(rename = "type", default)]
        kind: String,
        #[serde(default)]
        regexp: Option<String>,
        #[serde(default)]
        replacement: String,
    },
}

impl From<FilterSpec> for FieldFilter {
    fn from(spec: FilterSpec) -> Self {
        match spec {
            FilterSpec::Name(name) => FieldFilter::new(FilterKind::from(name.as_str())),
            FilterSpec::Full {
                kind,
                regexp,
                replacement,
            } => FieldFilter {
                kind: FilterKind::from(kind.as_str()),
                regexp,
                replacement,
                compiled: None,
            },
        }
    }
}

impl FieldFilter {
    pub fn new(kind: FilterKind) -> Self {
        FieldFilter {
            kind,
            regexp: None,
            replacement: String::new(),
            compiled: None,
        }
    }

    /// Builds an already validated `regexp` filter
    #[cfg(test)]
    pub fn regexp(pattern: &str, replacement: &str) -> Result<Self, ConfigError> {
        let mut filter = FieldFilter {
            kind: FilterKind::Regexp,
            regexp: Some(pattern.to_string()),
            replacement: replacement.to_string(),
            compiled: None,
        };
        filter.validate()?;
        Ok(filter)
    }

    /// Compiled pattern, present only after successful validation
    pub fn compiled_regexp(&self) -> Option<&Regex> {
        self.compiled.as_ref()
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        match &self.kind {
            FilterKind::Unknown(name) if name.is_empty() => Err(ConfigError::MissingFilterType),
            FilterKind::Unknown(name) => Err(ConfigError::UnsupportedFilter(name.clone())),
            FilterKind::Regexp => {
                let pattern = self
                    .regexp
                    .as_deref()
                    .filter(|pattern| !pattern.is_empty())
                    .ok_or(ConfigError::MissingRegexp)?;
                self.compiled = Some(Regex::new(pattern)?);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl Config {
    /// Reads and parses the configuration file without validating it
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("reading configuration from file {}", path.display());

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        info!("parsing configuration");
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Reads, parses and validates the configuration file
    ///
    /// # Returns
    /// * `Ok(Config)` - Validated configuration, regexes compiled
    /// * `Err(ConfigError)` - Unreadable file, YAML error or validation failure
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.validate()?;

        info!("loaded {} query configuration(s)", config.queries.len());
        for query in &config.queries {
            info!(
                "  module '{}' - metric '{}', {} field(s)",
                query.module,
                query.metric,
                query.metric_config.fields.len()
            );
        }

        Ok(config)
    }

    /// Validates every query, compiling filter regexes in place
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.queries.is_empty() {
            return Err(ConfigError::NoQueries);
        }

        for query in &mut self.queries {
            query.validate().map_err(|err| ConfigError::Query {
                metric: query.metric.clone(),
                source: Box::new(err),
            })?;
        }

        Ok(())
    }

    /// Queries that belong to a probe module
    pub fn queries_for_module<'a>(&'a self, module: &'a str) -> impl Iterator<Item = &'a QueryConfig> {
        self.queries.iter().filter(move |query| query.module == module)
    }
}

impl QueryConfig {
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.metric.is_empty() {
            return Err(ConfigError::MissingMetricName);
        }
        if self.query.trim().is_empty() {
            return Err(ConfigError::MissingQuery);
        }

        self.metric_config.validate()
    }
}

impl MetricConfig {
    /// Validates the default field, every field and nested expand layouts
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        // the default field never has a name of its own
        self.default_field.validate_named("default")?;

        for field in &mut self.fields {
            field.validate()?;
        }

        Ok(())
    }

    pub fn is_published(&self) -> bool {
        self.publish.unwrap_or(true)
    }

    /// Groups field configurations by the row key they read
    ///
    /// Every field name is registered as a key, even when the field reads a
    /// different `source` key, so an aliased name never falls back to the
    /// default field.
    pub fn field_map(&self) -> HashMap<&str, Vec<&FieldConfig>> {
        let mut map: HashMap<&str, Vec<&FieldConfig>> = HashMap::new();

        for field in &self.fields {
            map.entry(field.name.as_str()).or_default();
            map.entry(field.source_field()).or_default().push(field);
        }

        map
    }
}

impl FieldConfig {
    #[cfg(test)]
    pub fn named(name: &str, kind: FieldType) -> Self {
        FieldConfig {
            name: name.to_string(),
            kind,
            ..Default::default()
        }
    }

    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingFieldName);
        }
        let name = self.name.clone();
        self.validate_named(&name)
    }

    fn validate_named(&mut self, name: &str) -> Result<(), ConfigError> {
        let wrap = |err: ConfigError| ConfigError::Field {
            field: name.to_string(),
            source: Box::new(err),
        };

        if let FieldType::Unknown(kind) = &self.kind {
            return Err(wrap(ConfigError::UnsupportedFieldType(kind.clone())));
        }

        for filter in &mut self.filters {
            filter.validate().map_err(wrap)?;
        }

        if let Some(expand) = self.expand.as_deref_mut() {
            expand.validate().map_err(wrap)?;
        }

        Ok(())
    }

    /// Row key this field reads
    pub fn source_field(&self) -> &str {
        match self.source.as_deref() {
            Some(source) if !source.is_empty() => source,
            _ => &self.name,
        }
    }

    /// Label name written for this field: `target`, then `name`, then the raw row key
    pub fn target_label<'a>(&'a self, row_key: &'a str) -> &'a str {
        match self.target.as_deref() {
            Some(target) if !target.is_empty() => target,
            _ if !self.name.is_empty() => &self.name,
            _ => row_key,
        }
    }

    /// Dedicated metric family, if the field is routed away from its parent row
    pub fn dedicated_metric(&self) -> Option<&str> {
        self.metric.as_deref().filter(|metric| !metric.is_empty())
    }

    pub fn is_ignore(&self) -> bool {
        self.kind == FieldType::Ignore
    }

    pub fn is_id(&self) -> bool {
        self.kind == FieldType::Id
    }

    pub fn is_value(&self) -> bool {
        self.kind == FieldType::Value
    }

    pub fn is_bool(&self) -> bool {
        self.kind == FieldType::Bool
    }

    /// Expand either by type or because a nested layout is attached
    pub fn is_expand(&self) -> bool {
        self.kind == FieldType::Expand || self.expand.is_some()
    }
}
