//! Batch dispatch: from a plan to awaited results.
//!
//! Dispatching a batch allocates capacity for every operation up front,
//! converts the plan's relative offsets to absolute start times, submits
//! one task per operation, and awaits the results in landing order.
//! Each operation's reservation is held for its full duration and
//! released as its result arrives.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use batch_core::config::BatchConfig;
use batch_core::epoch_ms;
use batch_core::types::{FailureKind, OpKind, TargetSnapshot, TaskId};
use batchgrid_alloc::{Allocator, LaunchRequest, ThreadCount};
use batchgrid_capacity::{ReservationId, script_cost_gb};
use batchgrid_planner::{BatchPlan, PlanPolicy, plan};
use batchgrid_pool::{PoolError, PoolHandle};

use crate::error::DispatchResult;

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub policy: PlanPolicy,
    /// Slack the workers grant a late start; awaiting mirrors it.
    pub start_slack_ms: u64,
    /// Extra wait beyond an operation's predicted completion before the
    /// result counts as timed out.
    pub result_margin: Duration,
}

impl DispatcherConfig {
    pub fn from_config(batch: &BatchConfig) -> Self {
        Self {
            policy: PlanPolicy::from(batch),
            start_slack_ms: batch.start_slack_ms,
            result_margin: Duration::from_secs(1),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&BatchConfig::default())
    }
}

/// Final disposition of one operation of a dispatched batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpStatus {
    /// Landed and reported its effect.
    Succeeded { value: f64, attempts: u32 },
    /// The plan gave this operation zero threads; nothing was run.
    Skipped,
    /// A worker picked it up too late and refused to start it.
    Abandoned { attempts: u32 },
    /// Executed and permanently failed.
    Failed { attempts: u32, error: String },
    /// The claiming worker disappeared and the requeue was spent.
    Lost,
    /// No result arrived within the predicted window plus margin.
    TimedOut,
}

/// One operation's report within a [`BatchReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpReport {
    pub kind: OpKind,
    pub threads: u32,
    pub task: Option<TaskId>,
    pub status: OpStatus,
}

/// Outcome of one dispatched batch, in landing order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub target: String,
    /// Absolute batch start (epoch ms) the offsets were anchored to.
    pub started_at_ms: u64,
    pub ops: Vec<OpReport>,
}

impl BatchReport {
    /// Every dispatched operation landed successfully.
    pub fn all_succeeded(&self) -> bool {
        self.ops
            .iter()
            .all(|op| matches!(op.status, OpStatus::Succeeded { .. } | OpStatus::Skipped))
    }

    /// Operations abandoned for missing their start window.
    pub fn abandoned(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op.status, OpStatus::Abandoned { .. }))
            .count()
    }

    pub fn status(&self, kind: OpKind) -> Option<&OpStatus> {
        self.ops.iter().find(|op| op.kind == kind).map(|op| &op.status)
    }
}

/// An allocated-and-submitted operation awaiting its result.
struct PendingOp {
    kind: OpKind,
    threads: u32,
    reservation: ReservationId,
    task: TaskId,
    deadline_ms: u64,
}

/// Drives full batches through the allocator and the pool.
#[derive(Clone)]
pub struct Dispatcher {
    allocator: Allocator,
    pool: PoolHandle,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(allocator: Allocator, pool: PoolHandle, config: DispatcherConfig) -> Self {
        Self { allocator, pool, config }
    }

    /// Plan a batch for the target and dispatch it.
    pub async fn run_target(&self, target: &TargetSnapshot) -> DispatchResult<BatchReport> {
        let plan = plan(target, &self.config.policy)?;
        self.dispatch_batch(&plan).await
    }

    /// Dispatch a prepared plan: allocate, schedule, await, release.
    ///
    /// Capacity is committed for every operation before anything is
    /// submitted, so a shortfall aborts the batch with nothing running
    /// and nothing reserved.
    pub async fn dispatch_batch(&self, plan: &BatchPlan) -> DispatchResult<BatchReport> {
        let sequence = plan.landing_order.sequence();

        let mut reservations: Vec<(OpKind, ReservationId)> = Vec::new();
        for kind in sequence {
            let threads = plan.op(kind).threads;
            if threads == 0 {
                continue;
            }
            let request = LaunchRequest::new(
                format!("{kind}.js"),
                script_cost_gb(&[kind]),
                ThreadCount::Exact(threads),
            );
            match self.allocator.allocate(&request).await {
                Ok(allocation) => reservations.push((kind, allocation.reservation)),
                Err(e) => {
                    warn!(target = %plan.target, %kind, %e, "batch aborted at allocation");
                    self.release_all(&mut reservations).await;
                    return Err(e.into());
                }
            }
        }

        // Anchor the relative offsets to now. Offsets are non-negative,
        // so every start time lies in the future or the present.
        let started_at_ms = epoch_ms();
        let mut pending: Vec<PendingOp> = Vec::new();
        for (kind, reservation) in &reservations {
            let op = plan.op(*kind);
            let start = started_at_ms + op.start_offset_ms as u64;
            let deadline_ms = started_at_ms
                + op.completion_ms() as u64
                + self.config.start_slack_ms
                + self.config.result_margin.as_millis() as u64;
            match self
                .pool
                .submit(*kind, plan.target.clone(), op.threads, Some(start))
                .await
            {
                Ok(task) => {
                    debug!(target = %plan.target, kind = %kind, task, start, "operation scheduled");
                    pending.push(PendingOp {
                        kind: *kind,
                        threads: op.threads,
                        reservation: *reservation,
                        task,
                        deadline_ms,
                    });
                }
                Err(e) => {
                    warn!(target = %plan.target, %kind, %e, "batch aborted at submission");
                    // Tasks already queued may still run; wait them out
                    // so their capacity stays reserved until they finish.
                    let submitted: Vec<ReservationId> =
                        pending.iter().map(|p| p.reservation).collect();
                    self.drain(std::mem::take(&mut pending)).await;
                    for (_, reservation) in reservations.drain(..) {
                        if !submitted.contains(&reservation) {
                            self.release(reservation).await;
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        let mut ops = Vec::new();
        for kind in sequence {
            if plan.op(kind).threads == 0 {
                ops.push(OpReport {
                    kind,
                    threads: 0,
                    task: None,
                    status: OpStatus::Skipped,
                });
                continue;
            }
            // Submitted in sequence order, so the fronts match.
            let Some(pos) = pending.iter().position(|p| p.kind == kind) else {
                continue;
            };
            let op = pending.remove(pos);
            let status = match self.await_op(&op).await {
                Ok(status) => status,
                Err(e) => {
                    self.release(op.reservation).await;
                    self.drain(std::mem::take(&mut pending)).await;
                    return Err(e);
                }
            };
            self.release(op.reservation).await;
            ops.push(OpReport {
                kind,
                threads: op.threads,
                task: Some(op.task),
                status,
            });
        }

        let report = BatchReport {
            target: plan.target.clone(),
            started_at_ms,
            ops,
        };
        info!(
            target = %report.target,
            succeeded = report.all_succeeded(),
            abandoned = report.abandoned(),
            "batch complete"
        );
        Ok(report)
    }

    /// Await one operation's result and classify it.
    async fn await_op(&self, op: &PendingOp) -> DispatchResult<OpStatus> {
        let wait = Duration::from_millis(op.deadline_ms.saturating_sub(epoch_ms()).max(1));
        match self.pool.await_result(op.task, wait).await {
            Ok(result) if result.success => Ok(OpStatus::Succeeded {
                value: result.value.unwrap_or(0.0),
                attempts: result.attempts,
            }),
            Ok(result) if result.failure == Some(FailureKind::StartMissed) => {
                warn!(task = op.task, kind = %op.kind, "operation abandoned by worker");
                Ok(OpStatus::Abandoned { attempts: result.attempts })
            }
            Ok(result) => Ok(OpStatus::Failed {
                attempts: result.attempts,
                error: result.error.unwrap_or_default(),
            }),
            Err(PoolError::WorkerLost(_)) => Ok(OpStatus::Lost),
            Err(PoolError::ResultTimeout(_)) => Ok(OpStatus::TimedOut),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, reservation: ReservationId) {
        if let Err(e) = self.allocator.release(reservation).await {
            warn!(reservation, %e, "release failed");
        }
    }

    async fn release_all(&self, reservations: &mut Vec<(OpKind, ReservationId)>) {
        for (_, reservation) in reservations.drain(..) {
            self.release(reservation).await;
        }
    }

    /// Abort path for operations already handed to the pool: wait each
    /// one out (its task may still run), then release its reservation.
    async fn drain(&self, pending: Vec<PendingOp>) {
        for op in pending {
            let wait = Duration::from_millis(op.deadline_ms.saturating_sub(epoch_ms()).max(1));
            if let Err(e) = self.pool.await_result(op.task, wait).await {
                debug!(task = op.task, %e, "drained without result");
            }
            self.release(op.reservation).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use batch_core::config::PortConfig;
    use batch_core::types::LandingOrder;
    use batchgrid_capacity::{Grid, Host};
    use batchgrid_planner::OpPlan;
    use batchgrid_pool::{SimExecutor, WorkerPool, WorkerPoolConfig};
    use batchgrid_port::PortBus;

    fn prepared_target() -> TargetSnapshot {
        TargetSnapshot {
            hostname: "alpha".to_string(),
            security: 1.0,
            min_security: 1.0,
            money: 1e7,
            max_money: 1e7,
        }
    }

    /// A plan with offsets and durations in single-digit milliseconds so
    /// tests finish quickly; thread counts stay realistic.
    fn quick_plan(weaken: u32, grow: u32, hack: u32) -> BatchPlan {
        let op = |threads: u32, offset: i64| OpPlan {
            threads,
            start_offset_ms: offset,
            duration_ms: 5,
        };
        BatchPlan {
            target: "alpha".to_string(),
            weaken: op(weaken, 10),
            grow: op(grow, 5),
            hack: op(hack, 0),
            spacing_ms: 5,
            landing_order: LandingOrder::HackGrowWeaken,
        }
    }

    fn big_grid() -> Grid {
        let mut grid = Grid::new();
        grid.provision(Host::new("h1", 512.0));
        grid.provision(Host::new("h2", 256.0));
        grid
    }

    async fn start_pool(workers: u32, slack_ms: u64) -> (WorkerPool, PoolHandle) {
        let config = WorkerPoolConfig {
            workers,
            poll_interval: Duration::from_millis(2),
            start_slack_ms: slack_ms,
            ..WorkerPoolConfig::default()
        };
        let executor = Arc::new(SimExecutor::new(vec![prepared_target()]).with_time_scale(0.0));
        let pool = WorkerPool::start(PortBus::new(), &PortConfig::default(), config, executor)
            .await
            .unwrap();
        let handle = pool.handle();
        (pool, handle)
    }

    fn dispatcher(handle: PoolHandle, grid: Grid) -> (Dispatcher, Allocator) {
        let allocator = Allocator::new(grid);
        let d = Dispatcher::new(allocator.clone(), handle, DispatcherConfig::default());
        (d, allocator)
    }

    #[tokio::test]
    async fn full_batch_succeeds_and_releases_capacity() {
        let (mut pool, handle) = start_pool(3, 5_000).await;
        let (dispatcher, allocator) = dispatcher(handle, big_grid());
        let before = allocator.snapshot().await.total_available_gb();

        let report = dispatcher.dispatch_batch(&quick_plan(10, 10, 10)).await.unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.abandoned(), 0);
        assert_eq!(report.ops.len(), 3);
        // Landing order: hack first, weaken last.
        assert_eq!(report.ops[0].kind, OpKind::Hack);
        assert_eq!(report.ops[2].kind, OpKind::Weaken);
        // All reservations released.
        assert_eq!(allocator.snapshot().await.total_available_gb(), before);

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn zero_thread_operation_is_skipped() {
        let (mut pool, handle) = start_pool(2, 5_000).await;
        let (dispatcher, _allocator) = dispatcher(handle, big_grid());

        let report = dispatcher.dispatch_batch(&quick_plan(10, 10, 0)).await.unwrap();

        assert_eq!(report.status(OpKind::Hack), Some(&OpStatus::Skipped));
        assert!(report.all_succeeded());
        let hack = report.ops.iter().find(|op| op.kind == OpKind::Hack).unwrap();
        assert_eq!(hack.task, None);

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn capacity_shortfall_aborts_with_nothing_reserved() {
        let (mut pool, handle) = start_pool(1, 5_000).await;
        let mut grid = Grid::new();
        // Room for the hack allocation but not the grow one.
        grid.provision(Host::new("h1", 40.0));
        let (dispatcher, allocator) = dispatcher(handle.clone(), grid);

        let err = dispatcher
            .dispatch_batch(&quick_plan(200, 200, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::DispatchError::Alloc(_)));

        // The partial allocation was rolled back and nothing submitted.
        assert_eq!(allocator.snapshot().await.total_available_gb(), 40.0);
        assert_eq!(handle.backlog().await.unwrap(), 0);

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn late_pickup_reported_as_abandoned() {
        // Zero slack: by the time a worker claims the task its start
        // time has already passed.
        let (mut pool, handle) = start_pool(1, 0).await;
        let (dispatcher, _allocator) = dispatcher(handle, big_grid());

        let mut plan = quick_plan(5, 0, 0);
        plan.weaken.start_offset_ms = 0;
        let report = dispatcher.dispatch_batch(&plan).await.unwrap();

        assert!(matches!(
            report.status(OpKind::Weaken),
            Some(OpStatus::Abandoned { .. })
        ));
        assert_eq!(report.abandoned(), 1);

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn run_target_plans_then_skips_hack_when_unprepared() {
        let (mut pool, handle) = start_pool(2, 5_000).await;
        let (dispatcher, _allocator) = dispatcher(handle, big_grid());

        // Prepared in the simulator, so planning yields hack threads
        // only; weaken and grow are skipped.
        let report = dispatcher.run_target(&prepared_target()).await.unwrap();
        assert_eq!(report.status(OpKind::Weaken), Some(&OpStatus::Skipped));
        assert_eq!(report.status(OpKind::Grow), Some(&OpStatus::Skipped));
        assert!(matches!(
            report.status(OpKind::Hack),
            Some(OpStatus::Succeeded { .. })
        ));

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn weaken_pass_rehardens_target_in_one_cycle() {
        // Planner-sized thread counts must land as one aggregate
        // effect: 80 weaken threads take security from 5.0 back to the
        // 1.0 floor in a single batch, not one thread's worth.
        let target = TargetSnapshot {
            hostname: "alpha".to_string(),
            security: 5.0,
            min_security: 1.0,
            money: 1e7,
            max_money: 1e7,
        };
        let sized = plan(&target, &PlanPolicy::default()).unwrap();
        assert_eq!(sized.weaken.threads, 80);

        let config = WorkerPoolConfig {
            workers: 2,
            poll_interval: Duration::from_millis(2),
            start_slack_ms: 5_000,
            ..WorkerPoolConfig::default()
        };
        let executor = Arc::new(SimExecutor::new(vec![target.clone()]).with_time_scale(0.0));
        let mut pool = WorkerPool::start(
            PortBus::new(),
            &PortConfig::default(),
            config,
            executor.clone(),
        )
        .await
        .unwrap();
        let (dispatcher, _allocator) = dispatcher(pool.handle(), big_grid());

        // Planner thread counts, test-sized offsets and durations.
        let report = dispatcher
            .dispatch_batch(&quick_plan(
                sized.weaken.threads,
                sized.grow.threads,
                sized.hack.threads,
            ))
            .await
            .unwrap();

        assert!(matches!(
            report.status(OpKind::Weaken),
            Some(OpStatus::Succeeded { value, .. }) if (value - 4.0).abs() < 1e-9
        ));
        let after = executor.target("alpha").await.unwrap();
        assert!((after.security - after.min_security).abs() < 1e-9);

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_against_stopped_pool_reserves_nothing() {
        let (mut pool, handle) = start_pool(1, 5_000).await;
        pool.stop(true).await.unwrap();
        let (dispatcher, allocator) = dispatcher(handle.clone(), big_grid());
        let before = allocator.snapshot().await.total_available_gb();

        let err = dispatcher.dispatch_batch(&quick_plan(10, 10, 10)).await.unwrap_err();
        assert!(matches!(err, crate::error::DispatchError::Pool(_)));

        // The submission abort released every reservation.
        assert_eq!(allocator.snapshot().await.total_available_gb(), before);
        assert_eq!(handle.backlog().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failing_operation_reported_not_fatal() {
        use batchgrid_pool::{FnExecutor, OpFuture};

        let config = WorkerPoolConfig {
            workers: 1,
            poll_interval: Duration::from_millis(2),
            max_requeues: 0,
            ..WorkerPoolConfig::default()
        };
        let executor = Arc::new(FnExecutor(|_kind, _target: String, _threads| -> OpFuture {
            Box::pin(async { Err("target unreachable".to_string()) })
        }));
        let mut pool =
            WorkerPool::start(PortBus::new(), &PortConfig::default(), config, executor)
                .await
                .unwrap();
        let (dispatcher, _allocator) = dispatcher(pool.handle(), big_grid());

        let report = dispatcher.dispatch_batch(&quick_plan(5, 0, 0)).await.unwrap();
        assert!(matches!(
            report.status(OpKind::Weaken),
            Some(OpStatus::Failed { error, .. }) if error == "target unreachable"
        ));
        assert!(!report.all_succeeded());

        pool.stop(true).await.unwrap();
    }
}
