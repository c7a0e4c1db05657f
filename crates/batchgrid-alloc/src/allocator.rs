//! Greedy largest-fit packing and the stateful allocator.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use batch_core::epoch_ms;
use batchgrid_capacity::{Grid, Host, ReservationId};

use crate::error::{AllocError, AllocResult};
use crate::request::{LaunchPlan, LaunchRequest, ThreadCount};

/// A committed allocation: the sub-launches plus the reservation that
/// holds their memory until released.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub reservation: ReservationId,
    pub plans: Vec<LaunchPlan>,
}

impl Allocation {
    pub fn total_threads(&self) -> u32 {
        self.plans.iter().map(|p| p.threads).sum()
    }
}

/// Compute a placement for a request against a grid snapshot.
///
/// Pure: no reservations are taken. The returned plans' thread counts
/// sum to the resolved request count, or `InsufficientCapacity` carries
/// whatever partial plan was achievable.
pub fn pack(grid: &Grid, req: &LaunchRequest) -> AllocResult<Vec<LaunchPlan>> {
    if req.ram_per_thread_gb <= 0.0 {
        return Err(AllocError::InvalidRequest(format!(
            "non-positive ram per thread: {}",
            req.ram_per_thread_gb
        )));
    }

    let cost = req.ram_per_thread_gb;
    let requested = resolve_thread_count(grid, req);
    if requested == 0 {
        return match req.threads {
            // An explicit zero-thread request is a no-op.
            ThreadCount::Exact(0) => Ok(Vec::new()),
            // Max resolved to zero: not even one thread fits anywhere.
            _ => Err(AllocError::InsufficientCapacity {
                requested: 1,
                placed: Vec::new(),
            }),
        };
    }

    // Candidates sorted by descending available memory; preferred host
    // first so whole-request placement lands there when it fits.
    let mut candidates: Vec<&Host> = grid
        .hosts()
        .filter(|h| !req.options.exclude_hosts.contains(&h.name))
        .collect();
    candidates.sort_by(|a, b| {
        b.available_gb()
            .partial_cmp(&a.available_gb())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    if let Some(preferred) = &req.options.preferred_host {
        if let Some(pos) = candidates.iter().position(|h| &h.name == preferred) {
            let host = candidates.remove(pos);
            candidates.insert(0, host);
        }
    }

    // Whole-request fast path: one host that holds everything.
    let needed = cost * f64::from(requested);
    if let Some(host) = candidates.iter().find(|h| h.available_gb() >= needed) {
        return Ok(vec![LaunchPlan {
            host: host.name.clone(),
            threads: requested,
            args: req.args.clone(),
        }]);
    }

    if !req.options.allow_split {
        return Err(AllocError::InsufficientCapacity {
            requested,
            placed: Vec::new(),
        });
    }

    // Split path: repeatedly take the host with the most available
    // memory. Candidates are already in that order and availability
    // does not change during packing (one plan per host).
    let mut plans = Vec::new();
    let mut remaining = requested;
    for host in candidates {
        if remaining == 0 {
            break;
        }
        let fits = (host.available_gb() / cost).floor() as u32;
        let to_place = fits.min(remaining);
        if to_place == 0 {
            continue;
        }
        plans.push(LaunchPlan {
            host: host.name.clone(),
            threads: to_place,
            args: req.args.clone(),
        });
        remaining -= to_place;
    }

    if remaining > 0 {
        return Err(AllocError::InsufficientCapacity {
            requested,
            placed: plans,
        });
    }
    Ok(plans)
}

/// Resolve `ThreadCount::Max` against the grid per the split policy.
fn resolve_thread_count(grid: &Grid, req: &LaunchRequest) -> u32 {
    match req.threads {
        ThreadCount::Exact(n) => n,
        ThreadCount::Max => {
            let usable = |h: &Host| {
                if req.options.exclude_hosts.contains(&h.name) {
                    0u32
                } else {
                    (h.available_gb() / req.ram_per_thread_gb).floor() as u32
                }
            };
            if req.options.allow_split {
                grid.hosts().map(usable).sum()
            } else {
                grid.hosts().map(usable).max().unwrap_or(0)
            }
        }
    }
}

/// Tracks when each live reservation was committed, for the liveness
/// sweep that substitutes for direct exit observation.
struct AllocatorState {
    grid: Grid,
    live: HashMap<ReservationId, u64>,
}

/// The stateful allocator: owns the grid, commits reservations, and
/// releases them on exit observation or liveness timeout.
#[derive(Clone)]
pub struct Allocator {
    state: Arc<RwLock<AllocatorState>>,
    next_reservation: Arc<AtomicU64>,
}

impl Allocator {
    pub fn new(grid: Grid) -> Self {
        Self {
            state: Arc::new(RwLock::new(AllocatorState {
                grid,
                live: HashMap::new(),
            })),
            next_reservation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Place a request and commit the resulting reservation.
    pub async fn allocate(&self, req: &LaunchRequest) -> AllocResult<Allocation> {
        let mut state = self.state.write().await;
        let plans = pack(&state.grid, req)?;

        let reservation = self.next_reservation.fetch_add(1, Ordering::Relaxed);
        for plan in &plans {
            let amount = req.ram_per_thread_gb * f64::from(plan.threads);
            if let Some(host) = state.grid.get_mut(&plan.host) {
                host.reserve(reservation, amount);
            }
        }
        state.live.insert(reservation, epoch_ms());

        info!(
            script = %req.script,
            reservation,
            sub_launches = plans.len(),
            threads = plans.iter().map(|p| p.threads).sum::<u32>(),
            "allocation committed"
        );
        Ok(Allocation { reservation, plans })
    }

    /// Release an allocation's memory after its processes exited.
    pub async fn release(&self, reservation: ReservationId) -> AllocResult<f64> {
        let mut state = self.state.write().await;
        if state.live.remove(&reservation).is_none() {
            return Err(AllocError::UnknownReservation(reservation));
        }
        let freed = state.grid.release_everywhere(reservation);
        debug!(reservation, freed_gb = freed, "allocation released");
        Ok(freed)
    }

    /// Release every reservation older than `ttl_ms`.
    ///
    /// Used where the platform cannot observe process exits directly: a
    /// reservation outliving the longest plausible operation is treated
    /// as belonging to a dead process.
    pub async fn sweep_expired(&self, ttl_ms: u64) -> Vec<ReservationId> {
        let now = epoch_ms();
        let mut state = self.state.write().await;
        let expired: Vec<ReservationId> = state
            .live
            .iter()
            .filter(|(_, issued)| now.saturating_sub(**issued) > ttl_ms)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            state.live.remove(id);
            let freed = state.grid.release_everywhere(*id);
            warn!(reservation = id, freed_gb = freed, "expired reservation reclaimed");
        }
        expired
    }

    /// Largest thread count currently obtainable for the given cost.
    pub async fn max_threads(&self, ram_per_thread_gb: f64, allow_split: bool) -> u32 {
        let state = self.state.read().await;
        let mut req = LaunchRequest::new("", ram_per_thread_gb, ThreadCount::Max);
        req.options.allow_split = allow_split;
        resolve_thread_count(&state.grid, &req)
    }

    /// Point-in-time copy of the grid.
    pub async fn snapshot(&self) -> Grid {
        self.state.read().await.grid.clone()
    }

    /// Mutate the underlying grid (provision/decommission).
    pub async fn with_grid<R>(&self, f: impl FnOnce(&mut Grid) -> R) -> R {
        let mut state = self.state.write().await;
        f(&mut state.grid)
    }
}
