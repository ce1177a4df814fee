//! Reshuffle: merge two operation sequences that diverged from a common
//! revision into one total order.
//!
//! Every operation of both inputs is kept. The merged sequence is renumbered
//! contiguously from `start.index`; its first entry carries `start.skip` so that
//! garbage collection drops the superseded tail of the local log, every other
//! entry gets `skip = 0`.

use std::cmp::Ordering;

use super::operations::IndexPosition;
use crate::core_store::Operation;

/// Merge by timestamp. Each side keeps its own relative order; when the two
/// heads share a timestamp the smaller action id goes first, so both reactors
/// pick the same order whichever side is `a`.
pub fn reshuffle_by_timestamp(start: IndexPosition, a: &[Operation], b: &[Operation]) -> Vec<Operation> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut left, mut right) = (a.iter().peekable(), b.iter().peekable());

    loop {
        let next = match (left.peek(), right.peek()) {
            (Some(x), Some(y)) => {
                let order = x
                    .timestamp_utc_ms
                    .cmp(&y.timestamp_utc_ms)
                    .then_with(|| x.action.id.cmp(&y.action.id));
                if order == Ordering::Greater {
                    right.next()
                } else {
                    left.next()
                }
            }
            (Some(_), None) => left.next(),
            (None, Some(_)) => right.next(),
            (None, None) => break,
        };
        merged.extend(next.cloned());
    }

    renumber(start, merged)
}

/// Order by timestamp, then by original index; remaining ties keep `a` before `b`.
pub fn reshuffle_by_timestamp_and_index(start: IndexPosition, a: &[Operation], b: &[Operation]) -> Vec<Operation> {
    let mut merged: Vec<Operation> = a.iter().chain(b.iter()).cloned().collect();
    // Stable: entries comparing equal stay in concatenation order.
    merged.sort_by(|x, y| {
        x.timestamp_utc_ms
            .cmp(&y.timestamp_utc_ms)
            .then_with(|| x.index.cmp(&y.index))
    });

    renumber(start, merged)
}

fn renumber(start: IndexPosition, mut merged: Vec<Operation>) -> Vec<Operation> {
    for (offset, op) in merged.iter_mut().enumerate() {
        op.index = start.index + offset as u64;
        op.skip = if offset == 0 { start.skip } else { 0 };
    }

    merged
}
