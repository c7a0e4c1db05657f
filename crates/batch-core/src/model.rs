//! The timed-operation model.
//!
//! Effects and durations of the three remote operations. Durations are
//! monotonic in the target's security level; hack is the fastest
//! operation and weaken the slowest (grow 3.2×, weaken 4× hack time).
//! All effect constants are per-thread and independent of elapsed time;
//! only the duration depends on target hardening.

use crate::types::OpKind;

/// Fixed memory overhead of any worker script, in GB.
pub const SCRIPT_BASE_GB: f64 = 1.6;

/// Security removed by one weaken thread.
pub const WEAKEN_SECURITY_PER_THREAD: f64 = 0.05;

/// Money multiplier contributed by one grow thread.
pub const GROW_MULTIPLIER_PER_THREAD: f64 = 1.02;

/// Fraction of max money extracted by one hack thread.
pub const HACK_FRACTION_PER_THREAD: f64 = 0.01;

/// Security added to the target by one grow thread.
pub const GROW_SECURITY_PER_THREAD: f64 = 0.004;

/// Security added to the target by one hack thread.
pub const HACK_SECURITY_PER_THREAD: f64 = 0.002;

/// Additional memory footprint of one declared capability, in GB.
///
/// A worker's capacity cost is computed from the union of everything it
/// *could* run, not what it happens to run — capacity is reserved up
/// front while the operation is chosen at runtime.
pub fn capability_footprint_gb(kind: OpKind) -> f64 {
    match kind {
        OpKind::Weaken => 0.15,
        OpKind::Grow => 0.15,
        OpKind::Hack => 0.10,
    }
}

/// Duration of one operation in milliseconds at a given security level.
pub fn duration_ms(kind: OpKind, security: f64) -> u64 {
    let hack = hack_duration_ms(security) as f64;
    let ms = match kind {
        OpKind::Hack => hack,
        OpKind::Grow => hack * 3.2,
        OpKind::Weaken => hack * 4.0,
    };
    ms.round() as u64
}

/// Hack duration in milliseconds; the base all other durations scale from.
fn hack_duration_ms(security: f64) -> u64 {
    let security = security.max(0.0);
    (5_000.0 * (1.0 + 0.3 * security)).round() as u64
}

/// Weaken threads needed to remove the given amount of security.
pub fn weaken_threads_for(security_delta: f64) -> u32 {
    if security_delta <= 0.0 {
        return 0;
    }
    (security_delta / WEAKEN_SECURITY_PER_THREAD).ceil() as u32
}

/// Grow threads needed to multiply money by `ratio` (>= 1.0).
pub fn grow_threads_for(ratio: f64) -> u32 {
    if ratio <= 1.0 {
        return 0;
    }
    (ratio.ln() / GROW_MULTIPLIER_PER_THREAD.ln()).ceil() as u32
}

/// Hack threads that extract the given fraction of max money.
pub fn hack_threads_for(fraction: f64) -> u32 {
    if fraction <= 0.0 {
        return 0;
    }
    (fraction / HACK_FRACTION_PER_THREAD).floor() as u32
}
