//! Thread sizing and backward offset computation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use batch_core::model::{
    duration_ms, grow_threads_for, hack_threads_for, weaken_threads_for,
};
use batch_core::types::{LandingOrder, OpKind, TargetSnapshot};

use crate::error::{PlanError, PlanResult};
use crate::policy::PlanPolicy;

/// One operation of a batch: thread count, start offset relative to the
/// batch anchor, and the predicted duration at plan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPlan {
    pub threads: u32,
    /// Offset from batch start, in ms. Zero means eligible immediately.
    pub start_offset_ms: i64,
    pub duration_ms: u64,
}

impl OpPlan {
    /// Predicted completion, relative to batch start.
    pub fn completion_ms(&self) -> i64 {
        self.start_offset_ms + self.duration_ms as i64
    }
}

/// A full batch plan for one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    pub target: String,
    pub weaken: OpPlan,
    pub grow: OpPlan,
    pub hack: OpPlan,
    pub spacing_ms: i64,
    pub landing_order: LandingOrder,
}

impl BatchPlan {
    pub fn op(&self, kind: OpKind) -> &OpPlan {
        match kind {
            OpKind::Weaken => &self.weaken,
            OpKind::Grow => &self.grow,
            OpKind::Hack => &self.hack,
        }
    }

    /// Total wall-clock window from batch start to the last landing of
    /// an operation that actually runs.
    pub fn window_ms(&self) -> i64 {
        OpKind::ALL
            .iter()
            .map(|k| self.op(*k))
            .filter(|op| op.threads > 0)
            .map(|op| op.completion_ms())
            .max()
            .unwrap_or(0)
    }

    /// Total threads across all three operations.
    pub fn total_threads(&self) -> u32 {
        self.weaken.threads + self.grow.threads + self.hack.threads
    }
}

/// Compute a batch plan for the target under the given policy.
pub fn plan(target: &TargetSnapshot, policy: &PlanPolicy) -> PlanResult<BatchPlan> {
    if policy.spacing_ms < 0 {
        return Err(PlanError::Infeasible(format!(
            "negative landing spacing: {} ms",
            policy.spacing_ms
        )));
    }
    if !(0.0..=1.0).contains(&policy.hack_fraction) {
        return Err(PlanError::Infeasible(format!(
            "hack fraction out of range: {}",
            policy.hack_fraction
        )));
    }
    if target.max_money <= 0.0 {
        return Err(PlanError::InvalidTarget(format!(
            "{} has no max money",
            target.hostname
        )));
    }
    if target.money < 0.0 || target.security < 0.0 {
        return Err(PlanError::InvalidTarget(format!(
            "{} has negative state",
            target.hostname
        )));
    }

    // Enough weaken to fully re-harden in one pass.
    let weaken_threads = weaken_threads_for(target.security - target.min_security);

    // Growth multiplier comes from the money ratio alone; the security
    // level after the weaken pass only affects durations.
    let ratio = target.max_money / target.money.max(1.0);
    let grow_threads = grow_threads_for(ratio);

    // Never hack an unprepared target.
    let hack_threads = if target.is_prepared(policy.prep_money_fraction) {
        hack_threads_for(policy.hack_fraction)
    } else {
        0
    };

    // Weaken runs against current hardening; grow and hack are timed at
    // the post-weaken security floor.
    let durations = |kind: OpKind| match kind {
        OpKind::Weaken => duration_ms(kind, target.security),
        OpKind::Grow | OpKind::Hack => duration_ms(kind, target.min_security),
    };

    let threads_for = |kind: OpKind| match kind {
        OpKind::Weaken => weaken_threads,
        OpKind::Grow => grow_threads,
        OpKind::Hack => hack_threads,
    };

    // Backward from a common completion anchor: the k-th landing
    // completes at anchor + k*spacing, so start = completion - duration.
    // Anchor is shifted so the earliest start sits at offset zero. Only
    // operations that actually run constrain the anchor; an idle
    // operation must not stretch the schedule.
    let sequence = policy.landing_order.sequence();
    let anchor = sequence
        .iter()
        .enumerate()
        .filter(|(_, kind)| threads_for(**kind) > 0)
        .map(|(k, kind)| durations(*kind) as i64 - k as i64 * policy.spacing_ms)
        .max()
        .unwrap_or(0);

    let mut ops = [OpPlan { threads: 0, start_offset_ms: 0, duration_ms: 0 }; 3];
    for (k, kind) in sequence.iter().enumerate() {
        let threads = threads_for(*kind);
        let duration = durations(*kind);
        let completion = anchor + k as i64 * policy.spacing_ms;
        // Idle operations are never dispatched; clamp their nominal
        // start so offsets stay non-negative.
        let start = if threads > 0 {
            completion - duration as i64
        } else {
            (completion - duration as i64).max(0)
        };
        let op = OpPlan {
            threads,
            start_offset_ms: start,
            duration_ms: duration,
        };
        let slot = match kind {
            OpKind::Weaken => 0,
            OpKind::Grow => 1,
            OpKind::Hack => 2,
        };
        ops[slot] = op;
    }

    let batch = BatchPlan {
        target: target.hostname.clone(),
        weaken: ops[0],
        grow: ops[1],
        hack: ops[2],
        spacing_ms: policy.spacing_ms,
        landing_order: policy.landing_order,
    };

    debug!(
        target = %batch.target,
        weaken = batch.weaken.threads,
        grow = batch.grow.threads,
        hack = batch.hack.threads,
        window_ms = batch.window_ms(),
        "batch planned"
    );
    Ok(batch)
}
