// Metric flattening engine
//
// Walks one result row against one metric configuration and produces the
// metric families derived from it. Nested objects and arrays configured as
// `expand` fields are flattened recursively into their own families.
//
// The engine is pure: no shared state, no I/O, one call per result row.

use std::collections::BTreeMap;

use super::transform::assign;
use super::{MetricFamilies, MetricRow};
use crate::config::{FieldConfig, MetricConfig};
use crate::value::Row;

/// Builds all metric families for one result row
///
/// # Arguments
/// * `name` - Metric family name of this level
/// * `config` - Metric configuration of this level
/// * `row` - The result row (or nested sub-row for expand recursion)
///
/// # Behavior
/// 1. Flat fields are written into the main row, or into a fresh row of their
///    dedicated metric family when `metric` is set. Keys without a field
///    configuration use the default field unless it is `ignore`.
/// 2. Expand fields are flattened recursively, once per nested object, under
///    the field's `metric` name or `{name}_{key}`.
/// 3. The main row is emitted only when the configuration is published;
///    dedicated rows and expanded families are always emitted.
/// 4. `id` labels found on the main row are copied onto every emitted row.
///
/// Rows are returned in this order per family: dedicated rows, expanded rows,
/// main row.
pub fn flatten(name: &str, config: &MetricConfig, row: &Row) -> MetricFamilies {
    let mut list = MetricFamilies::new();
    let mut id_labels: BTreeMap<String, String> = BTreeMap::new();
    let field_map = config.field_map();

    let mut main = MetricRow::new();
    main.value = config.value;
    main.add_labels(&config.labels);

    // flat fields
    for (key, value) in row {
        let Some(fields) = field_map.get(key.as_str()) else {
            let default_field = &config.default_field;
            if !default_field.is_ignore() {
                assign(key, value, default_field, &mut main);
            }
            continue;
        };

        for field in fields.iter().filter(|field| !field.is_ignore() && !field.is_expand()) {
            match field.dedicated_metric() {
                Some(metric) => {
                    let mut dedicated = MetricRow::new();
                    assign(key, value, field, &mut dedicated);
                    dedicated.add_labels(&field.labels);

                    if let Some((label, id)) = id_candidate(key, field, &main, &dedicated) {
                        id_labels.insert(label, id);
                    }

                    list.entry(metric.to_string()).or_default().push(dedicated);
                }
                None => {
                    assign(key, value, field, &mut main);
                    main.add_labels(&field.labels);

                    if let Some((label, id)) = id_candidate(key, field, &main, &main) {
                        id_labels.insert(label, id);
                    }
                }
            }
        }
    }

    // sub metrics (expand)
    let empty_config = MetricConfig::default();
    for (key, value) in row {
        let Some(fields) = field_map.get(key.as_str()) else {
            continue;
        };

        for field in fields.iter().filter(|field| field.is_expand() && !field.is_ignore()) {
            let sub_name = field
                .dedicated_metric()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{name}_{key}"));
            let sub_config = field.expand.as_deref().unwrap_or(&empty_config);

            for nested in value.nested_rows() {
                for (sub_metric, rows) in flatten(&sub_name, sub_config, nested) {
                    list.entry(sub_metric).or_default().extend(rows);
                }
            }
        }
    }

    if config.is_published() {
        list.entry(name.to_string()).or_default().push(main);
    }

    if !id_labels.is_empty() {
        for row in list.values_mut().flatten() {
            row.add_labels(&id_labels);
        }
    }

    list
}

/// Label/value pair to propagate when an `id` field's label exists on the main row
fn id_candidate(
    key: &str,
    field: &FieldConfig,
    main: &MetricRow,
    target: &MetricRow,
) -> Option<(String, String)> {
    if !field.is_id() {
        return None;
    }

    let label = field.target_label(key);
    if !main.labels.contains_key(label) {
        return None;
    }

    let id = target.labels.get(label).cloned().unwrap_or_default();
    Some((label.to_string(), id))
}
