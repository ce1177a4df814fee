/*
    operations.rs - Pure helpers over operation sequences

    An operation with `skip = n` supersedes the `n` entries directly below its
    index. Garbage collection walks a sorted log backwards and drops superseded
    entries, leaving the effective history that reducers replay.
*/

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

use super::errors::IntegrityIssue;
use crate::core_store::Operation;

/// Anything positioned in a stream by `(index, skip)`
pub trait OperationIndex {
    fn index(&self) -> u64;
    fn skip(&self) -> u64;
}

impl OperationIndex for Operation {
    fn index(&self) -> u64 {
        self.index
    }

    fn skip(&self) -> u64 {
        self.skip
    }
}

/// A bare stream position, also the start point handed to a reshuffle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexPosition {
    pub index: u64,
    pub skip: u64,
}

impl IndexPosition {
    pub fn new(index: u64, skip: u64) -> Self {
        Self { index, skip }
    }
}

impl OperationIndex for IndexPosition {
    fn index(&self) -> u64 {
        self.index
    }

    fn skip(&self) -> u64 {
        self.skip
    }
}

/// Globally unique operation id for an action applied to a stream
pub fn derive_operation_id(document_id: &str, scope: &str, branch: &str, action_id: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [document_id, scope, branch, action_id] {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

/// Id for an operation re-appended at a new index by a reshuffle
pub fn derive_reshuffled_id(original_id: &str, index: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(original_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(&index.to_be_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Hex SHA-256 of a scope state.
///
/// `serde_json::Map` keeps keys sorted, so equal states hash equally.
pub fn hash_state(state: &Value) -> String {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Sort by index, then skip
pub fn sort_operations<T: OperationIndex + Clone>(operations: &[T]) -> Vec<T> {
    let mut sorted = operations.to_vec();
    sorted.sort_by_key(|op| (op.index(), op.skip()));
    sorted
}

/// Drop every entry superseded by a later skip.
///
/// Input must be sorted by index.
pub fn garbage_collect<T: OperationIndex + Clone>(sorted: &[T]) -> Vec<T> {
    let mut result = Vec::new();
    let mut end = sorted.len();

    while end > 0 {
        let op = &sorted[end - 1];
        result.push(op.clone());

        // Everything at or above this floor is superseded by `op`.
        let floor = op.index().saturating_sub(op.skip());
        let mut next = end - 1;
        while next > 0 && sorted[next - 1].index() >= floor {
            next -= 1;
        }
        end = next;
    }

    result.reverse();
    result
}

/// Verify a garbage-collected sequence has no gaps or overlaps
pub fn check_cleaned_operations_integrity<T: OperationIndex>(sorted: &[T]) -> Vec<IntegrityIssue> {
    let mut issues = Vec::new();
    // Index of the previous entry, offset by one so that "none yet" is 0.
    let mut expected: u64 = 0;

    for op in sorted {
        let effective = op.index() as i128 - op.skip() as i128;

        if effective != expected as i128 {
            let issue = if effective > expected as i128 {
                IntegrityIssue::MissingIndex {
                    expected,
                    index: op.index(),
                    skip: op.skip(),
                }
            } else {
                IntegrityIssue::DuplicatedIndex {
                    expected,
                    index: op.index(),
                    skip: op.skip(),
                }
            };
            issues.push(issue);
        }

        expected = op.index() + 1;
    }

    issues
}

/// Skip value that would undo the latest effective operation, or `None` when
/// there is nothing left to undo.
pub fn next_skip_number<T: OperationIndex + Clone>(sorted: &[T]) -> Option<u64> {
    let cleaned = garbage_collect(sorted);
    let last = cleaned.last()?;

    let mut next_skip = last.skip() + 1;
    if cleaned.len() > 1 {
        next_skip += cleaned[cleaned.len() - 2].skip();
    }

    if last.index() < next_skip {
        None
    } else {
        Some(next_skip)
    }
}

/// Whether `a` sorts strictly before `b` in a log
pub fn precedes(a: &Operation, b: &Operation) -> bool {
    a.index < b.index || (a.index == b.index && a.id == b.id && a.skip < b.skip)
}

/// Entries of `target` whose id does not appear in `source`
pub fn filter_duplicated_operations(target: &[Operation], source: &[Operation]) -> Vec<Operation> {
    let known: HashSet<&str> = source.iter().map(|op| op.id.as_str()).collect();
    target
        .iter()
        .filter(|op| !known.contains(op.id.as_str()))
        .cloned()
        .collect()
}

/// Split two sorted sequences into their common prefix and the two diverging tails
pub fn split<T: PartialEq + Clone>(target: &[T], merge: &[T]) -> (Vec<T>, Vec<T>, Vec<T>) {
    let common_len = target
        .iter()
        .zip(merge.iter())
        .take_while(|(a, b)| a == b)
        .count();

    (
        target[..common_len].to_vec(),
        target[common_len..].to_vec(),
        merge[common_len..].to_vec(),
    )
}

/// Merge a diverged log into `target`.
///
/// Both inputs are garbage-collected and split at their common prefix; the
/// diverging tails are reshuffled after the highest index either side has
/// used, superseding everything past the common prefix.
pub fn merge<F>(target: &[Operation], incoming: &[Operation], reshuffle: F) -> Vec<Operation>
where
    F: Fn(IndexPosition, &[Operation], &[Operation]) -> Vec<Operation>,
{
    let (common, target_tail, merge_tail) = split(&garbage_collect(target), &garbage_collect(incoming));

    let max_index = |ops: &[Operation]| ops.last().map(|op| op.index as i64).unwrap_or(-1);
    let max_common = max_index(&common);
    let next_index = 1 + max_common.max(max_index(&target_tail)).max(max_index(&merge_tail));

    let merge_tail = filter_duplicated_operations(&merge_tail, &target_tail);
    let start = IndexPosition::new(next_index as u64, (next_index - (max_common + 1)) as u64);

    let mut result = common;
    result.extend(reshuffle(start, &target_tail, &merge_tail));
    result
}
