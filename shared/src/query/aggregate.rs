//! Aggregation and bucketing pipeline.
//!
//! [`aggregate`] groups merged rows by column(s) and reduces each group
//! with one or more aggregate functions. [`bucket`] partitions rows by a
//! derived hashable key (typically a time interval), aggregates each bucket
//! independently, and injects the key back as a column.

use crate::models::{CoercionError, Field, HashableField, Record};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised by the aggregation pipeline.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The requested function name is not recognized. Raised before any
    /// row is processed.
    #[error("unsupported aggregate function '{0}'")]
    UnsupportedFunction(String),

    /// A column fed to a numeric function held a non-numeric value.
    /// A corrupted numeric column invalidates the whole group result, so
    /// the run is aborted rather than the row skipped.
    #[error("column '{column}' is not numeric: {source}")]
    NonNumericColumn {
        /// The offending source column.
        column: String,
        /// The underlying accessor failure.
        source: CoercionError,
    },
}

/// One requested aggregate: a function name, an optional source column,
/// and an optional output alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Function name: one of first, last, count, sum, avg, min, max.
    pub function: String,

    /// Source column the function reads, when it needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,

    /// Output column name; defaults to `function(column)` or the bare
    /// function name when no column is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl AggregateSpec {
    /// Creates a spec with no alias.
    #[must_use]
    pub fn new(function: impl Into<String>, column: Option<&str>) -> Self {
        Self {
            function: function.into(),
            column: column.map(ToString::to_string),
            alias: None,
        }
    }

    /// Returns the output column name for this spec.
    #[must_use]
    pub fn output_name(&self) -> String {
        if let Some(ref alias) = self.alias {
            return alias.clone();
        }
        match self.column {
            Some(ref column) => format!("{}({column})", self.function),
            None => self.function.clone(),
        }
    }
}

/// The supported aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateFunction {
    First,
    Last,
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    fn parse(name: &str) -> Result<Self, AggregateError> {
        match name {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(AggregateError::UnsupportedFunction(other.to_string())),
        }
    }
}

/// Result of an aggregation or bucketing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// One output row per group (or per bucket × group).
    pub data: Vec<Record>,

    /// All output columns: group-by columns first, then aggregated columns
    /// in declaration order.
    pub columns: Vec<String>,

    /// The grouping columns, in request order.
    pub group_by_columns: Vec<String>,

    /// The aggregated output column names, in declaration order.
    pub aggregated_columns: Vec<String>,
}

/// Groups rows and reduces each group with the requested functions.
///
/// When `group_by` is given, the grouping key is the comma-joined display
/// string of each group column; otherwise all rows form the single implicit
/// group `"all"`. Group columns are copied verbatim from each group's first
/// row.
///
/// # Errors
///
/// Returns [`AggregateError::UnsupportedFunction`] before processing any
/// row when a function name is unknown, and
/// [`AggregateError::NonNumericColumn`] when a numeric function meets a
/// defined non-numeric value.
pub fn aggregate(
    rows: &[Record],
    specs: &[AggregateSpec],
    group_by: Option<&[String]>,
) -> Result<AggregationResult, AggregateError> {
    // Parse every function up front so a bad name fails fast.
    let parsed: Vec<(AggregateFunction, &AggregateSpec, String)> = specs
        .iter()
        .map(|spec| {
            AggregateFunction::parse(&spec.function).map(|f| (f, spec, spec.output_name()))
        })
        .collect::<Result<_, _>>()?;

    let group_by_columns: Vec<String> = group_by.map(<[String]>::to_vec).unwrap_or_default();
    let aggregated_columns: Vec<String> = parsed.iter().map(|(_, _, name)| name.clone()).collect();

    let groups = partition_by_key(rows, group_by);

    let mut data = Vec::with_capacity(groups.len());
    for group in groups {
        let mut columns = HashMap::new();

        // Group columns come verbatim from the group's first row.
        if let Some(first) = group.first() {
            for column in &group_by_columns {
                if let Some(field) = first.get(column) {
                    columns.insert(column.clone(), field.clone());
                }
            }
        }

        for (function, spec, output_name) in &parsed {
            let value = reduce_group(&group, *function, spec.column.as_deref())?;
            columns.insert(output_name.clone(), value);
        }

        data.push(Record::from_columns(columns));
    }

    let mut columns = group_by_columns.clone();
    columns.extend(aggregated_columns.iter().cloned());

    Ok(AggregationResult {
        data,
        columns,
        group_by_columns,
        aggregated_columns,
    })
}

/// Partitions rows by a derived bucket key and aggregates each bucket.
///
/// Rows whose key function yields `None` are dropped. The bucket key is
/// injected back into every output row as a column named `bucket_name`,
/// typed per the key's kind. Per-bucket column lists are unioned in
/// first-seen order and de-duplicated, with the bucket column first.
///
/// # Errors
///
/// Propagates any [`AggregateError`] from the per-bucket aggregation.
pub fn bucket<F>(
    rows: &[Record],
    bucket_name: &str,
    key_fn: F,
    specs: &[AggregateSpec],
    group_by: Option<&[String]>,
) -> Result<AggregationResult, AggregateError>
where
    F: Fn(&Record) -> Option<HashableField>,
{
    let mut order: Vec<HashableField> = Vec::new();
    let mut buckets: HashMap<HashableField, Vec<Record>> = HashMap::new();
    for row in rows {
        let Some(key) = key_fn(row) else {
            continue;
        };
        if !buckets.contains_key(&key) {
            order.push(key.clone());
        }
        buckets.entry(key).or_default().push(row.clone());
    }

    let mut data = Vec::new();
    let mut columns = vec![bucket_name.to_string()];
    let mut group_by_columns = group_by.map(<[String]>::to_vec).unwrap_or_default();
    let mut aggregated_columns = Vec::new();

    for key in order {
        let bucket_rows = &buckets[&key];
        let result = aggregate(bucket_rows, specs, group_by)?;

        for column in &result.columns {
            if !columns.contains(column) {
                columns.push(column.clone());
            }
        }
        group_by_columns = result.group_by_columns;
        aggregated_columns = result.aggregated_columns;

        let key_field = Field::from(key);
        for row in result.data {
            data.push(row.with_column(bucket_name, key_field.clone()));
        }
    }

    Ok(AggregationResult {
        data,
        columns,
        group_by_columns,
        aggregated_columns,
    })
}

/// Splits rows into groups keyed by the display string of the group
/// columns, preserving first-seen group order.
fn partition_by_key<'a>(
    rows: &'a [Record],
    group_by: Option<&[String]>,
) -> Vec<Vec<&'a Record>> {
    let Some(group_columns) = group_by.filter(|columns| !columns.is_empty()) else {
        // The single implicit group "all".
        return vec![rows.iter().collect()];
    };

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&Record>> = HashMap::new();
    for row in rows {
        let key = group_columns
            .iter()
            .map(|column| {
                row.get(column)
                    .map_or_else(|| Field::Null.display_string(), Field::display_string)
            })
            .collect::<Vec<_>>()
            .join(",");
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(row);
    }

    order.into_iter().map(|key| groups.remove(&key).unwrap_or_default()).collect()
}

/// Returns a row's column value when it is defined (present and non-null).
fn defined<'a>(row: &'a Record, column: Option<&str>) -> Option<&'a Field> {
    let field = row.get(column?)?;
    match field {
        Field::Null => None,
        _ => Some(field),
    }
}

/// Sums the defined values of a column across a group.
fn numeric_sum(group: &[&Record], column: Option<&str>) -> Result<f64, AggregateError> {
    let mut sum = 0.0;
    for row in group {
        if let Some(field) = defined(row, column) {
            sum += field
                .as_number()
                .map_err(|source| AggregateError::NonNumericColumn {
                    column: column.unwrap_or_default().to_string(),
                    source,
                })?;
        }
    }
    Ok(sum)
}

#[allow(clippy::cast_precision_loss)]
fn reduce_group(
    group: &[&Record],
    function: AggregateFunction,
    column: Option<&str>,
) -> Result<Field, AggregateError> {
    match function {
        AggregateFunction::First => Ok(group
            .iter()
            .find_map(|row| defined(row, column))
            .cloned()
            .unwrap_or(Field::Null)),
        AggregateFunction::Last => Ok(group
            .iter()
            .rev()
            .find_map(|row| defined(row, column))
            .cloned()
            .unwrap_or(Field::Null)),
        AggregateFunction::Count => Ok(Field::Number(group.len() as f64)),
        AggregateFunction::Sum => Ok(Field::Number(numeric_sum(group, column)?)),
        // Divides by the total group size, not the count of defined
        // values. Intended business logic.
        AggregateFunction::Avg => {
            Ok(Field::Number(numeric_sum(group, column)? / group.len() as f64))
        }
        AggregateFunction::Min | AggregateFunction::Max => {
            let mut extremum: Option<f64> = None;
            for row in group {
                if let Some(field) = defined(row, column) {
                    let value =
                        field
                            .as_number()
                            .map_err(|source| AggregateError::NonNumericColumn {
                                column: column.unwrap_or_default().to_string(),
                                source,
                            })?;
                    extremum = Some(match (extremum, function) {
                        (None, _) => value,
                        (Some(current), AggregateFunction::Min) => current.min(value),
                        (Some(current), _) => current.max(value),
                    });
                }
            }
            Ok(extremum.map_or(Field::Null, Field::Number))
        }
    }
}
