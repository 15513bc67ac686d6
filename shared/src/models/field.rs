//! Field data model.
//!
//! Every datum flowing through the query pipeline is represented as a
//! [`Field`], a tagged value whose runtime representation always matches
//! its kind. Provider adapters coerce arbitrary decoded source values
//! (JSON objects, strings, numbers) into fields with [`Field::from_json`].

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::LazyLock;
use thiserror::Error;

/// Strings that look like plain decimal numbers are promoted to number
/// fields. Scientific notation and signs never match.
static NUMERIC_STRING: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^\d+(\.\d+)?$").expect("valid numeric-string pattern"));

/// Errors raised by typed field accessors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoercionError {
    /// The field's kind does not match the kind the accessor requires.
    #[error("expected a {expected} field, found {actual}")]
    KindMismatch {
        /// The kind the caller asked for.
        expected: &'static str,
        /// The kind the field actually has.
        actual: &'static str,
    },
}

/// A tagged value with a semantic kind.
///
/// `Date` stores epoch milliseconds. `Array` holds an ordered sequence of
/// fields; `Object` holds a mapping from string key to field (insertion
/// order is irrelevant).
///
/// # Example
///
/// ```
/// use shared::models::Field;
///
/// let field = Field::from_json(serde_json::json!("42"));
/// assert_eq!(field, Field::Number(42.0));
///
/// // Leading zeros are not promoted.
/// let field = Field::from_json(serde_json::json!("007"));
/// assert_eq!(field, Field::Str("007".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Field {
    /// A text value.
    #[serde(rename = "string")]
    Str(String),
    /// A numeric value.
    Number(f64),
    /// A boolean value.
    #[serde(rename = "boolean")]
    Bool(bool),
    /// A point in time, stored as epoch milliseconds.
    Date(i64),
    /// An ordered sequence of fields.
    Array(Vec<Field>),
    /// A mapping from string key to field.
    Object(HashMap<String, Field>),
    /// Absent or null value.
    Null,
}

impl Field {
    /// Returns the kind tag of this field as a static string.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Number(_) => "number",
            Self::Bool(_) => "boolean",
            Self::Date(_) => "date",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Null => "null",
        }
    }

    /// Coerces a decoded JSON value into a field.
    ///
    /// Coercion order, applied uniformly by every adapter: null becomes
    /// `Null`, numbers and booleans keep their kind, arrays and objects are
    /// coerced recursively, and strings that fully match `^\d+(\.\d+)?$`
    /// without leading zeros are promoted to numbers. Log fields are
    /// frequently stringified numbers, hence the promotion; leading-zero
    /// and scientific-notation strings stay strings.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => match promote_numeric(&s) {
                Some(n) => Self::Number(n),
                None => Self::Str(s),
            },
            serde_json::Value::Array(items) => {
                Self::Array(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(entries) => Self::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Self::from_json(value)))
                    .collect(),
            ),
        }
    }

    /// Creates a date field from a parsed timestamp.
    #[must_use]
    pub fn from_timestamp(timestamp: DateTime<chrono::Utc>) -> Self {
        Self::Date(timestamp.timestamp_millis())
    }

    /// Returns the numeric value of a number field.
    ///
    /// # Errors
    ///
    /// Returns [`CoercionError::KindMismatch`] if the field is not a number.
    pub fn as_number(&self) -> Result<f64, CoercionError> {
        match self {
            Self::Number(n) => Ok(*n),
            other => Err(CoercionError::KindMismatch {
                expected: "number",
                actual: other.kind(),
            }),
        }
    }

    /// Returns the text value of a string field.
    ///
    /// # Errors
    ///
    /// Returns [`CoercionError::KindMismatch`] if the field is not a string.
    pub fn as_str(&self) -> Result<&str, CoercionError> {
        match self {
            Self::Str(s) => Ok(s),
            other => Err(CoercionError::KindMismatch {
                expected: "string",
                actual: other.kind(),
            }),
        }
    }

    /// Renders any field kind to a stable display string.
    ///
    /// Object keys are sorted so the rendering is usable as a group key.
    /// A number field's display string re-promotes to the same numeric
    /// value through [`Field::from_json`].
    #[must_use]
    pub fn display_string(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Number(n) => format!("{n}"),
            Self::Bool(b) => b.to_string(),
            Self::Date(millis) => DateTime::from_timestamp_millis(*millis)
                .map_or_else(|| millis.to_string(), |dt| dt.to_rfc3339()),
            Self::Array(items) => {
                let rendered: Vec<String> = items.iter().map(Self::display_string).collect();
                format!("[{}]", rendered.join(", "))
            }
            Self::Object(entries) => {
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                let rendered: Vec<String> = keys
                    .into_iter()
                    .map(|key| format!("{key}: {}", entries[key].display_string()))
                    .collect();
                format!("{{{}}}", rendered.join(", "))
            }
            Self::Null => "null".to_string(),
        }
    }

    /// Returns the field as a grouping key, if its kind supports hashing.
    ///
    /// Arrays, objects and null values are not usable as grouping keys.
    #[must_use]
    pub fn as_hashable(&self) -> Option<HashableField> {
        match self {
            Self::Str(s) => Some(HashableField::Str(s.clone())),
            Self::Number(n) => Some(HashableField::Number(*n)),
            Self::Bool(b) => Some(HashableField::Bool(*b)),
            Self::Date(millis) => Some(HashableField::Date(*millis)),
            Self::Array(_) | Self::Object(_) | Self::Null => None,
        }
    }
}

/// The subset of field kinds usable as a grouping or bucket key.
#[derive(Debug, Clone, PartialEq)]
pub enum HashableField {
    /// A text key.
    Str(String),
    /// A numeric key, compared and hashed by bit pattern.
    Number(f64),
    /// A boolean key.
    Bool(bool),
    /// A date key in epoch milliseconds.
    Date(i64),
}

impl Eq for HashableField {}

impl Hash for HashableField {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Self::Str(s) => {
                state.write_u8(0);
                s.hash(state);
            }
            Self::Number(n) => {
                state.write_u8(1);
                state.write_u64(n.to_bits());
            }
            Self::Bool(b) => {
                state.write_u8(2);
                b.hash(state);
            }
            Self::Date(millis) => {
                state.write_u8(3);
                millis.hash(state);
            }
        }
    }
}

impl From<HashableField> for Field {
    fn from(key: HashableField) -> Self {
        match key {
            HashableField::Str(s) => Self::Str(s),
            HashableField::Number(n) => Self::Number(n),
            HashableField::Bool(b) => Self::Bool(b),
            HashableField::Date(millis) => Self::Date(millis),
        }
    }
}

/// Parses a string as a number if it qualifies for numeric promotion.
///
/// Leading zeros disqualify ("007" stays a string); a bare "0" and
/// fractions like "0.5" still promote.
fn promote_numeric(candidate: &str) -> Option<f64> {
    if !NUMERIC_STRING.is_match(candidate) {
        return None;
    }
    if candidate.len() > 1 && candidate.starts_with('0') && !candidate.starts_with("0.") {
        return None;
    }
    candidate.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_coerce_null() {
        assert_eq!(Field::from_json(serde_json::json!(null)), Field::Null);
    }

    #[test]
    fn test_coerce_primitives() {
        assert_eq!(Field::from_json(serde_json::json!(true)), Field::Bool(true));
        assert_eq!(
            Field::from_json(serde_json::json!(1.5)),
            Field::Number(1.5)
        );
        assert_eq!(
            Field::from_json(serde_json::json!("hello")),
            Field::Str("hello".to_string())
        );
    }

    #[test]
    fn test_numeric_string_promotion() {
        assert_eq!(Field::from_json(serde_json::json!("42")), Field::Number(42.0));
        assert_eq!(Field::from_json(serde_json::json!("0")), Field::Number(0.0));
        assert_eq!(
            Field::from_json(serde_json::json!("3.25")),
            Field::Number(3.25)
        );
        assert_eq!(
            Field::from_json(serde_json::json!("0.5")),
            Field::Number(0.5)
        );
    }

    #[test]
    fn test_numeric_string_promotion_rejects_leading_zeros() {
        assert_eq!(
            Field::from_json(serde_json::json!("007")),
            Field::Str("007".to_string())
        );
        assert_eq!(
            Field::from_json(serde_json::json!("01.5")),
            Field::Str("01.5".to_string())
        );
    }

    #[test]
    fn test_numeric_string_promotion_rejects_scientific_notation() {
        assert_eq!(
            Field::from_json(serde_json::json!("1e3")),
            Field::Str("1e3".to_string())
        );
        assert_eq!(
            Field::from_json(serde_json::json!("-5")),
            Field::Str("-5".to_string())
        );
    }

    #[test]
    fn test_coerce_nested() {
        let field = Field::from_json(serde_json::json!({"count": "12", "tags": ["a", null]}));
        let Field::Object(entries) = field else {
            panic!("expected an object field");
        };
        assert_eq!(entries["count"], Field::Number(12.0));
        assert_eq!(
            entries["tags"],
            Field::Array(vec![Field::Str("a".to_string()), Field::Null])
        );
    }

    #[test]
    fn test_as_number_mismatch() {
        let err = Field::Str("x".to_string()).as_number().unwrap_err();
        assert_eq!(
            err,
            CoercionError::KindMismatch {
                expected: "number",
                actual: "string",
            }
        );
    }

    #[test]
    fn test_as_str_mismatch() {
        assert!(Field::Number(1.0).as_str().is_err());
        assert_eq!(Field::Str("ok".to_string()).as_str().unwrap(), "ok");
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_number_display_round_trip() {
        for value in [0.0, 7.0, 3.25, 1234.0, 0.125] {
            let rendered = Field::Number(value).display_string();
            let reparsed = Field::from_json(serde_json::json!(rendered));
            assert_eq!(reparsed.as_number().unwrap(), value, "value {value}");
        }
    }

    #[test]
    fn test_display_string_is_stable_for_objects() {
        let field = Field::from_json(serde_json::json!({"b": 2, "a": 1}));
        assert_eq!(field.display_string(), "{a: 1, b: 2}");
    }

    #[test]
    fn test_display_string_for_arrays() {
        let field = Field::Array(vec![Field::Number(1.0), Field::Str("x".to_string())]);
        assert_eq!(field.display_string(), "[1, x]");
    }

    #[test]
    fn test_hashable_subset() {
        assert!(Field::Str("a".to_string()).as_hashable().is_some());
        assert!(Field::Number(1.0).as_hashable().is_some());
        assert!(Field::Bool(true).as_hashable().is_some());
        assert!(Field::Date(0).as_hashable().is_some());
        assert!(Field::Array(vec![]).as_hashable().is_none());
        assert!(Field::Object(HashMap::new()).as_hashable().is_none());
        assert!(Field::Null.as_hashable().is_none());
    }

    #[test]
    fn test_from_timestamp() {
        let now = Utc::now();
        let field = Field::from_timestamp(now);
        assert_eq!(field, Field::Date(now.timestamp_millis()));
    }
}
