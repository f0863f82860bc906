//! End-condition predicates over the progress aggregate
//!
//! Kept as free functions so the decision logic is testable without a
//! coordinator or a lock.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::session::{EndStatus, ProgressAggregate};

/// A session ends exactly once, when every member has signaled issuance
/// finished and either every action is accounted for or an abort landed.
pub fn is_ended(aggregate: &ProgressAggregate) -> bool {
    if aggregate.is_ended() {
        return false;
    }
    aggregate.all_members_completed()
        && (aggregate.all_actions_done() || aggregate.abort_requested())
}

/// One-way transition: stamp the end time and classify the outcome. An
/// abort that landed at any point dominates, even when all actions had
/// already completed.
pub fn seal(aggregate: &mut ProgressAggregate, now: DateTime<Utc>) -> (DateTime<Utc>, EndStatus) {
    let status = if aggregate.abort_requested() {
        EndStatus::Abortion
    } else {
        EndStatus::Regular
    };
    aggregate.ended_on = Some(now);
    aggregate.end_status = Some(status);
    (now, status)
}

/// Counters only ever increase and must stay inside their totals; an
/// overshoot means a reporting bug upstream, worth a log line but never a
/// stalled session.
pub fn check_counters(aggregate: &ProgressAggregate) {
    if aggregate.finished_actions + aggregate.errors > aggregate.total_actions {
        warn!(
            finished = aggregate.finished_actions,
            errors = aggregate.errors,
            total = aggregate.total_actions,
            "completion counters exceed the planned total"
        );
    }
}
