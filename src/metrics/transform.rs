// Value coercion - turns one result row value into a label or a metric value
//
// Handles numeric formatting, boolean normalization and the per-field filter
// chain (case folding, regex replacement, unix timestamp parsing).

use chrono::{DateTime, NaiveDateTime};

use super::MetricRow;
use crate::config::{FieldConfig, FieldFilter, FilterKind};
use crate::value::RowValue;

/// Timestamp layouts accepted by the `tounixtime` filter, in order of preference
enum TimeFormat {
    /// RFC3339 with optional fractional seconds
    Rfc3339,
    /// Layout that ends in a numeric offset
    Offset(&'static str),
    /// Layout followed by a zone abbreviation such as `UTC` or `MST`
    Zoned(&'static str),
    /// Layout without any zone, read as UTC
    Naive(&'static str),
}

const TIME_FORMATS: &[TimeFormat] = &[
    TimeFormat::Rfc3339,
    // human formats
    TimeFormat::Offset("%Y-%m-%d %H:%M:%S %:z"),
    TimeFormat::Zoned("%Y-%m-%d %H:%M:%S"),
    TimeFormat::Naive("%Y-%m-%d %H:%M:%S"),
    // RFC822, RFC822Z
    TimeFormat::Zoned("%d %b %y %H:%M"),
    TimeFormat::Offset("%d %b %y %H:%M %z"),
    // RFC850
    TimeFormat::Zoned("%A, %d-%b-%y %H:%M:%S"),
    // RFC1123, RFC1123Z
    TimeFormat::Zoned("%a, %d %b %Y %H:%M:%S"),
    TimeFormat::Offset("%a, %d %b %Y %H:%M:%S %z"),
];

impl TimeFormat {
    fn parse(&self, value: &str) -> Option<i64> {
        match self {
            TimeFormat::Rfc3339 => DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|ts| ts.timestamp()),
            TimeFormat::Offset(layout) => DateTime::parse_from_str(value, layout)
                .ok()
                .map(|ts| ts.timestamp()),
            TimeFormat::Zoned(layout) => {
                let (head, zone) = value.rsplit_once(' ')?;
                let offset = zone_offset(zone)?;
                NaiveDateTime::parse_from_str(head, layout)
                    .ok()
                    .map(|ts| ts.and_utc().timestamp() - offset)
            }
            TimeFormat::Naive(layout) => NaiveDateTime::parse_from_str(value, layout)
                .ok()
                .map(|ts| ts.and_utc().timestamp()),
        }
    }
}

/// Offset in seconds east of UTC for a zone abbreviation
///
/// The RFC 2822 North American zones are honoured; any other alphabetic
/// abbreviation is read as UTC.
fn zone_offset(zone: &str) -> Option<i64> {
    if zone.is_empty() || zone.len() > 5 || !zone.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }

    let hours = match zone.to_ascii_uppercase().as_str() {
        "EST" => -5,
        "EDT" => -4,
        "CST" => -6,
        "CDT" => -5,
        "MST" => -7,
        "MDT" => -6,
        "PST" => -8,
        "PDT" => -7,
        _ => 0,
    };

    Some(hours * 3600)
}

/// Parses a timestamp string into unix epoch seconds
///
/// The first format that matches with a positive epoch wins.
pub fn parse_unixtime(value: &str) -> Option<i64> {
    TIME_FORMATS
        .iter()
        .find_map(|format| format.parse(value).filter(|ts| *ts > 0))
}

fn normalize_bool(value: &str) -> &'static str {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => "true",
        _ => "false",
    }
}

fn apply_filter(filter: &FieldFilter, value: String) -> String {
    match &filter.kind {
        FilterKind::ToLower => value.to_lowercase(),
        FilterKind::ToUpper => value.to_uppercase(),
        // per-character title case, which is uppercase for every cased script in practice
        FilterKind::ToTitle => value.to_uppercase(),
        FilterKind::Regexp => match filter.compiled_regexp() {
            Some(regex) => regex.replace_all(&value, filter.replacement.as_str()).into_owned(),
            None => value,
        },
        FilterKind::ToUnixtime => match parse_unixtime(&value) {
            Some(ts) => ts.to_string(),
            None => value,
        },
        FilterKind::Unknown(_) => value,
    }
}

/// Runs boolean normalization and the filter chain of a field over a string
pub fn transform_string(field: &FieldConfig, value: &str) -> String {
    let value = if field.is_bool() {
        normalize_bool(value).to_string()
    } else {
        value.to_string()
    };

    field
        .filters
        .iter()
        .fold(value, |value, filter| apply_filter(filter, value))
}

/// Shortest decimal form without exponent, `20.0` becomes `"20"`
pub fn format_float(value: f64) -> String {
    value.to_string()
}

/// Writes one row value into a metric row, as label or as value
///
/// # Arguments
/// * `row_key` - Result row key the value was read from
/// * `value` - The raw value
/// * `field` - Field configuration deciding label name, type and filters
/// * `metric` - Target metric row
///
/// # Behavior
/// - `value` fields set the numeric value; strings that do not parse after
///   filtering and nulls leave the value absent
/// - all other fields set the label named by `FieldConfig::target_label`
/// - nulls become empty labels without running the filters
/// - nested objects and arrays are left to expand handling and skipped here
pub fn assign(row_key: &str, value: &RowValue, field: &FieldConfig, metric: &mut MetricRow) {
    let (label, number) = match value {
        RowValue::Object(_) | RowValue::Array(_) => return,
        RowValue::Null => (String::new(), None),
        RowValue::String(v) => {
            let label = transform_string(field, v);
            let number = label.parse::<f64>().ok();
            (label, number)
        }
        RowValue::Int(v) => (transform_string(field, &v.to_string()), Some(*v as f64)),
        RowValue::UInt(v) => (transform_string(field, &v.to_string()), Some(*v as f64)),
        RowValue::Float(v) => (transform_string(field, &format_float(*v)), Some(*v)),
        RowValue::Bool(v) => {
            let label = transform_string(field, if *v { "true" } else { "false" });
            (label, Some(if *v { 1.0 } else { 0.0 }))
        }
    };

    if field.is_value() {
        metric.value = number;
    } else {
        metric
            .labels
            .insert(field.target_label(row_key).to_string(), label);
    }
}
