//! In-memory provider.
//!
//! The reference adapter: a fixed set of rows and dimensions held in
//! memory. Used as the baseline implementation of the provider contract
//! and as a test double for the engine. Unlike the container and remote
//! adapters it matches search tokens case-sensitively.

use super::{DimensionFilter, Dimensions, ProviderError, QueryOptions, QueryProvider};
use crate::models::Record;
use crate::query::{CaseSensitivity, Matcher, Search};
use std::collections::BTreeSet;

/// A provider over synthetic in-memory data.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use shared::models::Record;
/// use shared::providers::MemoryProvider;
///
/// let provider = MemoryProvider::new("fixture")
///     .with_record(Record::new(Utc::now(), "hello"))
///     .with_dimension("host", ["alpha", "beta"]);
/// ```
#[derive(Debug, Default)]
pub struct MemoryProvider {
    name: String,
    records: Vec<Record>,
    dimensions: Dimensions,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Vec::new(),
            dimensions: Dimensions::new(),
        }
    }

    /// Adds one record.
    #[must_use]
    pub fn with_record(mut self, record: Record) -> Self {
        self.records.push(record);
        self
    }

    /// Adds several records.
    #[must_use]
    pub fn with_records(mut self, records: impl IntoIterator<Item = Record>) -> Self {
        self.records.extend(records);
        self
    }

    /// Declares a dimension this provider recognizes, with its known
    /// values. Filters on declared dimensions are matched against the
    /// column of the same name; undeclared filter names are ignored.
    #[must_use]
    pub fn with_dimension<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        self.dimensions.insert(name.into(), values);
        self
    }

    fn matches_filters(&self, record: &Record, filters: &[DimensionFilter]) -> bool {
        filters.iter().all(|filter| {
            if !self.dimensions.contains_key(&filter.name) {
                // No semantics for this name here; ignore it.
                return true;
            }
            record
                .get(&filter.name)
                .is_some_and(|field| field.display_string() == filter.value)
        })
    }
}

#[async_trait::async_trait]
impl QueryProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_dimensions(&self) -> Dimensions {
        self.dimensions.clone()
    }

    async fn query(
        &self,
        filters: &[DimensionFilter],
        search: &Search,
        options: QueryOptions,
    ) -> Result<(), ProviderError> {
        if options.cancel.is_cancelled() {
            return Err(ProviderError::Canceled);
        }

        let matcher = Matcher::new(search, CaseSensitivity::Sensitive);
        let from = options.from.timestamp_millis();
        let to = options.to.timestamp_millis();

        let mut hits: Vec<Record> = Vec::new();
        for record in &self.records {
            if options.cancel.is_cancelled() {
                return Err(ProviderError::Canceled);
            }
            let Some(key) = record.sort_key() else {
                continue;
            };
            if key < from || key > to {
                continue;
            }
            if !self.matches_filters(record, filters) {
                continue;
            }
            if !matcher.matches(&record.message) {
                continue;
            }
            hits.push(record.clone());
        }

        hits.sort_by_key(|record| std::cmp::Reverse(record.sort_key()));
        hits.truncate(options.limit);
        options.emit(hits);
        Ok(())
    }
}
