use std::collections::BTreeSet;

use bundlekit_core::{AppHandle, Progress};
use tracing::debug;

use crate::operation::{OpId, Operation};

/// Estimating progress above this is not surfaced; primitives tend to
/// overshoot while they size the download.
pub const ESTIMATING_THRESHOLD: u32 = 10;

const SCALE_LIMIT: u64 = u64::MAX / 100;

/// `root` plus every operation that reaches it through `related_to`,
/// skipped ones included, whether or not `root` itself is skipped.
pub fn related_set(ops: &[Operation], root: OpId) -> BTreeSet<OpId> {
    let mut related = BTreeSet::from([root]);
    let mut worklist = vec![root];
    while let Some(target) = worklist.pop() {
        for op in ops {
            if op.related_to.contains(&target) && related.insert(op.id) {
                worklist.push(op.id);
            }
        }
    }
    related
}

/// `start` and everything it is transitively related to. Terminates on
/// cyclic relations.
pub(crate) fn ancestors(ops: &[Operation], start: OpId) -> Vec<OpId> {
    let mut visited = BTreeSet::from([start]);
    let mut order = vec![start];
    let mut worklist = vec![start];
    while let Some(current) = worklist.pop() {
        let Some(op) = ops.get(current.0) else {
            continue;
        };
        for parent in &op.related_to {
            if visited.insert(*parent) {
                order.push(*parent);
                worklist.push(*parent);
            }
        }
    }
    order
}

/// Whole-percent progress of `root` while `current` has moved
/// `current_bytes`. Operations before `current` count as fully transferred.
pub fn aggregate_progress(ops: &[Operation], root: OpId, current: OpId, current_bytes: u64) -> u32 {
    let related = related_set(ops, root);

    let mut total = 0_u64;
    let mut prior = 0_u64;
    for id in &related {
        let Some(op) = ops.get(id.0) else {
            continue;
        };
        total = total.saturating_add(op.download_size);
        if *id < current {
            prior = prior.saturating_add(op.download_size);
        }
    }

    let current_bytes = if related.contains(&current) {
        current_bytes
    } else {
        0
    };
    let mut done = prior.saturating_add(current_bytes);
    if done > SCALE_LIMIT {
        done /= 100;
        total /= 100;
    }
    if total == 0 {
        return 0;
    }

    let percent = done.saturating_mul(100) / total;
    percent.min(100) as u32
}

/// Surfaces `percent` unless it would move the bar backwards. Returns
/// whether it was applied.
pub fn apply_progress(app: &AppHandle, percent: u32) -> bool {
    let percent = percent.min(100);
    if let Progress::Percent(previous) = app.progress() {
        if previous != 100 && percent < previous {
            debug!("ignoring progress {percent}% for {app}: already at {previous}%");
            return false;
        }
    }
    app.set_progress(Progress::Percent(percent));
    true
}
