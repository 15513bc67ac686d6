//! Result row data model.
//!
//! A [`Record`] is one row of a query result: a column map from name to
//! [`Field`] plus a derived `message` string used for predicate matching.
//! Records are created once per source record by the owning provider
//! adapter and are immutable afterwards, except for bucket-key injection
//! during bucketing and column rewrites during aggregation (both of which
//! build replacement rows).

use super::field::Field;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved column holding the record's timestamp, required for ordering.
pub const TIME_COLUMN: &str = "_time";

/// Reserved column holding the raw source text of the log line.
pub const RAW_COLUMN: &str = "_raw";

/// Optional column overriding the merge sort key.
pub const SORT_COLUMN: &str = "_sortBy";

/// One result row.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use shared::models::{Field, Record};
///
/// let record = Record::new(Utc::now(), "level=info started")
///     .with_column("level", Field::Str("info".to_string()));
///
/// assert!(record.get("_time").is_some());
/// assert_eq!(record.message, "level=info started");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Column values keyed by column name. Always contains `_time` and
    /// `_raw`.
    pub columns: HashMap<String, Field>,

    /// Derived display message, matched by search predicates.
    pub message: String,
}

impl Record {
    /// Creates a record with the reserved `_time` and `_raw` columns set.
    ///
    /// The message defaults to the raw source text; adapters that decode
    /// structured lines override it with [`Record::with_message`].
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let mut columns = HashMap::new();
        columns.insert(TIME_COLUMN.to_string(), Field::from_timestamp(timestamp));
        columns.insert(RAW_COLUMN.to_string(), Field::Str(raw.clone()));
        Self {
            columns,
            message: raw,
        }
    }

    /// Creates a record from bare columns, with an empty message.
    ///
    /// Used for derived rows (aggregation output) that do not originate
    /// from a single source record.
    #[must_use]
    pub fn from_columns(columns: HashMap<String, Field>) -> Self {
        Self {
            columns,
            message: String::new(),
        }
    }

    /// Adds a column to the record.
    #[must_use]
    pub fn with_column(mut self, name: impl Into<String>, field: Field) -> Self {
        self.columns.insert(name.into(), field);
        self
    }

    /// Replaces the derived message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Returns the field stored under `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.columns.get(name)
    }

    /// Returns the merge/ordering key: the `_sortBy` column when present,
    /// otherwise `_time`, as epoch milliseconds.
    #[must_use]
    pub fn sort_key(&self) -> Option<i64> {
        let field = self.get(SORT_COLUMN).or_else(|| self.get(TIME_COLUMN))?;
        match field {
            Field::Date(millis) => Some(*millis),
            #[allow(clippy::cast_possible_truncation)]
            Field::Number(n) => Some(*n as i64),
            _ => None,
        }
    }

    /// Returns the record's timestamp, if `_time` holds a valid date.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.get(TIME_COLUMN)? {
            Field::Date(millis) => DateTime::from_timestamp_millis(*millis),
            _ => None,
        }
    }
}
