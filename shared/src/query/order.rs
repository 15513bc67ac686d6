//! Order-by stage.
//!
//! A stable multi-key sort over typed fields, applied after aggregation.
//! Rules are consulted in order; the first rule that produces a non-tie
//! decides a pair.

use crate::models::{Field, Record};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort direction for one rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Smallest first.
    Asc,
    /// Largest first.
    Desc,
}

/// One sort rule: a column and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRule {
    /// The column to sort by.
    pub column: String,
    /// The sort direction.
    pub direction: Direction,
}

impl OrderRule {
    /// Creates a rule.
    #[must_use]
    pub fn new(column: impl Into<String>, direction: Direction) -> Self {
        Self {
            column: column.into(),
            direction,
        }
    }
}

/// Stable-sorts rows in place by the given rules.
///
/// Undefined is "largest": rows missing a rule's column sort to the end
/// ascending and to the start descending, so ties are deterministic. When
/// both sides are defined but of differing kind, the rule is skipped and
/// the next rule is consulted.
pub fn order_by(rows: &mut [Record], rules: &[OrderRule]) {
    if rules.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for rule in rules {
            let ordering = compare_rule(a, b, rule);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn compare_rule(a: &Record, b: &Record, rule: &OrderRule) -> Ordering {
    let left = defined(a, &rule.column);
    let right = defined(b, &rule.column);

    let base = match (left, right) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => match compare_fields(x, y) {
            // Differing kinds: tie, defer to the next rule.
            None => return Ordering::Equal,
            Some(ordering) => ordering,
        },
    };

    match rule.direction {
        Direction::Asc => base,
        Direction::Desc => base.reverse(),
    }
}

fn defined<'a>(row: &'a Record, column: &str) -> Option<&'a Field> {
    match row.get(column)? {
        Field::Null => None,
        field => Some(field),
    }
}

/// Compares two fields of the same kind; `None` when the kinds differ.
///
/// Arrays and objects compare by element/key count only. This shallow
/// comparison is deliberate and must be preserved.
fn compare_fields(a: &Field, b: &Field) -> Option<Ordering> {
    match (a, b) {
        (Field::Number(x), Field::Number(y)) => Some(x.partial_cmp(y).unwrap_or(Ordering::Equal)),
        (Field::Date(x), Field::Date(y)) => Some(x.cmp(y)),
        (Field::Str(x), Field::Str(y)) => Some(compare_strings(x, y)),
        // True orders before false; direction reversal applies on top.
        (Field::Bool(x), Field::Bool(y)) => Some(bool_rank(*x).cmp(&bool_rank(*y))),
        (Field::Array(x), Field::Array(y)) => Some(x.len().cmp(&y.len())),
        (Field::Object(x), Field::Object(y)) => Some(x.len().cmp(&y.len())),
        _ => None,
    }
}

/// Locale-style comparison: case-folded first, byte order as tiebreak.
fn compare_strings(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}

fn bool_rank(value: bool) -> u8 {
    u8::from(!value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn row(millis: i64, columns: &[(&str, Field)]) -> Record {
        let mut record = Record::new(
            Utc.timestamp_millis_opt(millis).single().unwrap(),
            format!("row@{millis}"),
        );
        for (name, field) in columns {
            record = record.with_column(*name, field.clone());
        }
        record
    }

    fn times(rows: &[Record]) -> Vec<i64> {
        rows.iter().map(|r| r.sort_key().unwrap()).collect()
    }

    #[test]
    fn test_order_by_time_descending() {
        let mut rows = vec![
            row(100, &[("x", Field::Number(1.0))]),
            row(50, &[("x", Field::Number(2.0))]),
            row(150, &[("x", Field::Number(3.0))]),
        ];

        order_by(&mut rows, &[OrderRule::new("_time", Direction::Desc)]);

        assert_eq!(times(&rows), vec![150, 100, 50]);
    }

    #[test]
    fn test_order_by_is_stable() {
        let mut rows = vec![
            row(1, &[("k", Field::Number(1.0)), ("tag", Field::Str("a".into()))]),
            row(2, &[("k", Field::Number(1.0)), ("tag", Field::Str("b".into()))]),
            row(3, &[("k", Field::Number(1.0)), ("tag", Field::Str("c".into()))]),
        ];
        let rules = [OrderRule::new("k", Direction::Asc)];

        order_by(&mut rows, &rules);
        let first_pass = rows.clone();
        order_by(&mut rows, &rules);

        assert_eq!(rows, first_pass);
        assert_eq!(times(&rows), vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_column_sorts_last_ascending() {
        let mut rows = vec![
            row(1, &[]),
            row(2, &[("x", Field::Number(5.0))]),
            row(3, &[("x", Field::Number(1.0))]),
        ];

        order_by(&mut rows, &[OrderRule::new("x", Direction::Asc)]);

        assert_eq!(times(&rows), vec![3, 2, 1]);
    }

    #[test]
    fn test_missing_column_sorts_first_descending() {
        let mut rows = vec![
            row(1, &[("x", Field::Number(5.0))]),
            row(2, &[]),
            row(3, &[("x", Field::Number(1.0))]),
        ];

        order_by(&mut rows, &[OrderRule::new("x", Direction::Desc)]);

        assert_eq!(times(&rows), vec![2, 1, 3]);
    }

    #[test]
    fn test_differing_kinds_fall_through_to_next_rule() {
        let mut rows = vec![
            row(1, &[("x", Field::Str("zzz".into())), ("y", Field::Number(2.0))]),
            row(2, &[("x", Field::Number(1.0)), ("y", Field::Number(1.0))]),
        ];

        order_by(
            &mut rows,
            &[
                OrderRule::new("x", Direction::Asc),
                OrderRule::new("y", Direction::Asc),
            ],
        );

        // The x rule is a tie (string vs number), y decides.
        assert_eq!(times(&rows), vec![2, 1]);
    }

    #[test]
    fn test_boolean_ordering() {
        let mut rows = vec![
            row(1, &[("ok", Field::Bool(false))]),
            row(2, &[("ok", Field::Bool(true))]),
        ];

        order_by(&mut rows, &[OrderRule::new("ok", Direction::Asc)]);
        assert_eq!(times(&rows), vec![2, 1]);

        order_by(&mut rows, &[OrderRule::new("ok", Direction::Desc)]);
        assert_eq!(times(&rows), vec![1, 2]);
    }

    #[test]
    fn test_arrays_compare_by_length_only() {
        let mut rows = vec![
            row(1, &[("a", Field::Array(vec![Field::Number(9.0), Field::Number(9.0)]))]),
            row(2, &[("a", Field::Array(vec![Field::Number(0.0)]))]),
        ];

        order_by(&mut rows, &[OrderRule::new("a", Direction::Asc)]);

        assert_eq!(times(&rows), vec![2, 1]);
    }

    #[test]
    fn test_strings_compare_case_folded() {
        let mut rows = vec![
            row(1, &[("s", Field::Str("Banana".into()))]),
            row(2, &[("s", Field::Str("apple".into()))]),
        ];

        order_by(&mut rows, &[OrderRule::new("s", Direction::Asc)]);

        assert_eq!(times(&rows), vec![2, 1]);
    }
}
