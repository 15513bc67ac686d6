//! Streaming merge of pre-sorted provider batches.
//!
//! Each active provider (or container within one) delivers its rows already
//! sorted descending by sort key. [`merge_batches`] interleaves those runs
//! into one globally time-descending sequence, truncated to the caller's
//! limit, in O(total · log k) via a binary heap.

use crate::models::Record;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// One heap entry: the head key of a run, tie-broken by input order.
struct Head {
    key: i64,
    source: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: larger key first; on ties the earlier input wins.
        self.key
            .cmp(&other.key)
            .then_with(|| other.source.cmp(&self.source))
    }
}

/// Merges already-descending-sorted runs into one descending sequence.
///
/// Ties are broken by input order, so the merge is stable. Empty runs and a
/// zero limit are tolerated; a zero limit yields an empty result. Merging
/// an already-merged sequence again is a no-op up to the limit.
#[must_use]
pub fn merge_batches(batches: Vec<Vec<Record>>, limit: usize) -> Vec<Record> {
    if limit == 0 {
        return Vec::new();
    }

    let mut runs: Vec<std::vec::IntoIter<Record>> =
        batches.into_iter().map(Vec::into_iter).collect();

    let mut heap = BinaryHeap::with_capacity(runs.len());
    let mut pending: Vec<Option<Record>> = Vec::with_capacity(runs.len());
    for (source, run) in runs.iter_mut().enumerate() {
        match run.next() {
            Some(record) => {
                heap.push(Head {
                    key: record.sort_key().unwrap_or(i64::MIN),
                    source,
                });
                pending.push(Some(record));
            }
            None => pending.push(None),
        }
    }

    let mut merged = Vec::with_capacity(limit.min(runs.iter().map(ExactSizeIterator::len).sum()));
    while let Some(head) = heap.pop() {
        let record = pending[head.source]
            .take()
            .unwrap_or_else(|| unreachable!("heap entry without a pending record"));
        merged.push(record);
        if merged.len() == limit {
            break;
        }
        if let Some(next) = runs[head.source].next() {
            heap.push(Head {
                key: next.sort_key().unwrap_or(i64::MIN),
                source: head.source,
            });
            pending[head.source] = Some(next);
        }
    }

    merged
}
