//! The pool supervisor — starts workers, sweeps stale claims, stops
//! the pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use batch_core::config::{BatchConfig, PoolConfig, PortConfig};
use batch_core::epoch_ms;
use batch_core::types::{FailureKind, OpKind, Task, TaskId, TaskResult};
use batchgrid_port::PortBus;

use crate::error::{PoolError, PoolResult};
use crate::executor::Executor;
use crate::mailbox::{Mailbox, PoolState, QueuedTask};
use crate::worker::{Worker, WorkerConfig};

/// Poll interval while a caller waits for a result.
const RESULT_POLL: Duration = Duration::from_millis(10);

/// Assembled configuration for a pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: u32,
    pub capabilities: Vec<OpKind>,
    pub poll_interval: Duration,
    pub grace_window: Duration,
    pub heartbeat_timeout: Duration,
    pub max_requeues: u32,
    pub start_slack_ms: u64,
    /// Results nobody consumes within this window are pruned by the
    /// sweep.
    pub result_ttl: Duration,
}

impl WorkerPoolConfig {
    pub fn from_config(pool: &PoolConfig, batch: &BatchConfig) -> Self {
        Self {
            workers: pool.workers,
            capabilities: OpKind::ALL.to_vec(),
            poll_interval: Duration::from_millis(pool.poll_interval_ms),
            grace_window: Duration::from_millis(pool.grace_window_ms),
            heartbeat_timeout: Duration::from_millis(pool.heartbeat_timeout_ms),
            max_requeues: pool.max_requeues,
            start_slack_ms: batch.start_slack_ms,
            result_ttl: Duration::from_millis(pool.result_ttl_ms),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default(), &BatchConfig::default())
    }
}

/// Handle for dispatchers: submit tasks and await their results.
#[derive(Clone)]
pub struct PoolHandle {
    mailbox: Mailbox,
    next_task: Arc<AtomicU64>,
}

impl PoolHandle {
    /// Queue a task for the workers. Fails when the pool is stopped.
    pub async fn submit(
        &self,
        kind: OpKind,
        target: impl Into<String>,
        threads: u32,
        start_time_ms: Option<u64>,
    ) -> PoolResult<TaskId> {
        let state = self.state().await?;
        if !state.running {
            return Err(PoolError::NotRunning);
        }

        let id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let task = Task { id, kind, target: target.into(), threads, start_time_ms };
        self.mailbox.enqueue(&QueuedTask::new(task)).await?;
        Ok(id)
    }

    /// Suspend cooperatively until the result for `id` is posted, or
    /// the timeout elapses.
    pub async fn await_result(
        &self,
        id: TaskId,
        timeout: Duration,
    ) -> PoolResult<TaskResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(result) = self.mailbox.take_result(id).await? {
                if result.failure == Some(FailureKind::WorkerLost) {
                    return Err(PoolError::WorkerLost(id));
                }
                return Ok(result);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PoolError::ResultTimeout(id));
            }
            tokio::time::sleep(RESULT_POLL).await;
        }
    }

    /// Operator inspection: the pool state as persisted in the mailbox.
    pub async fn state(&self) -> PoolResult<PoolState> {
        self.mailbox
            .read_state()
            .await?
            .ok_or(PoolError::SupervisorLost)
    }

    /// Unclaimed task count.
    pub async fn backlog(&self) -> PoolResult<usize> {
        Ok(self.mailbox.backlog().await?)
    }
}

/// The supervisor: owns the worker join handles and the sweep loop.
pub struct WorkerPool {
    mailbox: Mailbox,
    config: WorkerPoolConfig,
    worker_handles: Vec<JoinHandle<PoolResult<()>>>,
    sweep_handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    next_task: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Initialize the mailbox, start the workers and the stale-claim
    /// sweep.
    pub async fn start(
        bus: PortBus,
        ports: &PortConfig,
        config: WorkerPoolConfig,
        executor: Arc<dyn Executor>,
    ) -> PoolResult<Self> {
        let mailbox = Mailbox::new(bus, ports.control, ports.tasks, ports.results);
        mailbox
            .init(&PoolState {
                running: true,
                supervisor_pid: u64::from(std::process::id()),
                workers: Default::default(),
            })
            .await?;

        let mut worker_handles = Vec::new();
        for id in 1..=config.workers {
            let worker = Worker::new(
                WorkerConfig {
                    id,
                    pid: u64::from(std::process::id()) * 1_000 + u64::from(id),
                    capabilities: config.capabilities.clone(),
                    poll_interval: config.poll_interval,
                    start_slack_ms: config.start_slack_ms,
                    max_requeues: config.max_requeues,
                },
                mailbox.clone(),
                executor.clone(),
            );
            worker_handles.push(tokio::spawn(worker.run()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let sweep_handle = tokio::spawn(sweep_loop(
            mailbox.clone(),
            config.heartbeat_timeout,
            config.result_ttl,
            stop_rx,
        ));

        info!(workers = config.workers, "worker pool started");
        Ok(Self {
            mailbox,
            config,
            worker_handles,
            sweep_handle,
            stop_tx,
            next_task: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Dispatcher-facing handle. Cheap to clone.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            mailbox: self.mailbox.clone(),
            next_task: self.next_task.clone(),
        }
    }

    /// Stop the pool.
    ///
    /// Graceful: flip the running flags and wait for every worker to
    /// exit at its next poll boundary; an in-flight operation finishes
    /// first. Returns `ShutdownTimeout` when workers outlive the grace
    /// window.
    ///
    /// Forced: after the same grace window, kill the surviving worker
    /// tasks outright, requeue or fail their claims, and clean the
    /// registry. Always succeeds; the degraded shutdown is logged.
    pub async fn stop(&mut self, graceful: bool) -> PoolResult<()> {
        self.mailbox
            .update_state(|s| {
                s.running = false;
                for w in s.workers.values_mut() {
                    w.running = false;
                }
            })
            .await?;
        let _ = self.stop_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.grace_window;
        loop {
            let remaining = match self.mailbox.read_state().await? {
                Some(state) => state.workers.len(),
                None => 0,
            };
            if remaining == 0 {
                info!("worker pool stopped");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                if graceful {
                    warn!(remaining, "graceful stop timed out");
                    return Err(PoolError::ShutdownTimeout);
                }
                break;
            }
            tokio::time::sleep(RESULT_POLL).await;
        }

        // Forced path: kill survivors and reclaim their claims.
        warn!("forcing worker shutdown after grace window");
        self.sweep_handle.abort();
        for handle in &self.worker_handles {
            handle.abort();
        }
        let state = self.mailbox.read_state().await?.unwrap_or_default();
        for (worker_id, record) in state.workers {
            if let Some(claim) = record.current {
                reclaim(&self.mailbox, claim).await?;
            }
            self.mailbox.remove_worker(worker_id).await?;
        }
        info!("worker pool stopped (degraded)");
        Ok(())
    }
}

/// Requeue a claim abandoned by a dead worker, at most once; after
/// that the task is surfaced as lost.
async fn reclaim(mailbox: &Mailbox, mut claim: QueuedTask) -> PoolResult<()> {
    if claim.lost_requeues == 0 {
        claim.lost_requeues = 1;
        warn!(task = claim.task.id, "requeuing task from lost worker");
        mailbox.enqueue(&claim).await?;
    } else {
        warn!(task = claim.task.id, "task lost twice, surfacing failure");
        mailbox
            .post_result(&TaskResult::lost(claim.task.id, claim.attempts))
            .await?;
    }
    Ok(())
}

/// Periodically requeue claims whose workers stopped heartbeating, and
/// prune results that outlived their consumption window.
async fn sweep_loop(
    mailbox: Mailbox,
    heartbeat_timeout: Duration,
    result_ttl: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let period = (heartbeat_timeout / 4).max(Duration::from_millis(10));
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        tokio::time::sleep(period).await;

        match mailbox.prune_results(result_ttl.as_millis() as u64).await {
            Ok(pruned) if pruned > 0 => {
                debug!(pruned, "dropped unconsumed results");
            }
            _ => {}
        }

        let state = match mailbox.read_state().await {
            Ok(Some(state)) => state,
            _ => continue,
        };
        let now = epoch_ms();
        let timeout_ms = heartbeat_timeout.as_millis() as u64;

        for (worker_id, record) in state.workers {
            if now.saturating_sub(record.last_heartbeat_ms) <= timeout_ms {
                continue;
            }
            warn!(
                worker = worker_id,
                stale_ms = now - record.last_heartbeat_ms,
                "worker heartbeat stale, removing"
            );
            if let Some(claim) = record.current {
                if reclaim(&mailbox, claim).await.is_err() {
                    continue;
                }
            }
            if mailbox.remove_worker(worker_id).await.is_err() {
                debug!(worker = worker_id, "sweep could not remove worker record");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    use batch_core::types::TargetSnapshot;

    use crate::executor::{FnExecutor, OpFuture, OpOutcome, SimExecutor};
    use crate::mailbox::WorkerRecord;

    fn prepared_target() -> TargetSnapshot {
        TargetSnapshot {
            hostname: "alpha".to_string(),
            security: 1.0,
            min_security: 1.0,
            money: 1e7,
            max_money: 1e7,
        }
    }

    fn fast_sim() -> Arc<SimExecutor> {
        Arc::new(SimExecutor::new(vec![prepared_target()]).with_time_scale(0.0))
    }

    fn test_config(workers: u32) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers,
            poll_interval: Duration::from_millis(5),
            grace_window: Duration::from_millis(300),
            heartbeat_timeout: Duration::from_millis(200),
            ..WorkerPoolConfig::default()
        }
    }

    async fn start_pool(workers: u32, executor: Arc<dyn Executor>) -> WorkerPool {
        WorkerPool::start(
            PortBus::new(),
            &PortConfig::default(),
            test_config(workers),
            executor,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn five_tasks_three_workers_each_result_once() {
        let mut pool = start_pool(3, fast_sim()).await;
        let handle = pool.handle();

        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(handle.submit(OpKind::Weaken, "alpha", 1, None).await.unwrap());
        }

        let mut seen = HashSet::new();
        for id in &ids {
            let result = handle.await_result(*id, Duration::from_secs(5)).await.unwrap();
            assert!(result.success);
            assert_eq!(result.attempts, 1);
            assert!(seen.insert(result.id), "duplicate result for task {}", result.id);
        }
        assert_eq!(seen.len(), 5);

        // Ids are retired once consumed.
        for id in &ids {
            assert!(matches!(
                handle.await_result(*id, Duration::from_millis(30)).await,
                Err(PoolError::ResultTimeout(_))
            ));
        }

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn workers_register_and_deregister() {
        let mut pool = start_pool(3, fast_sim()).await;
        let handle = pool.handle();

        // Wait for registration.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if handle.state().await.unwrap().workers.len() == 3 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "workers never registered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pool.stop(true).await.unwrap();
        assert!(handle.state().await.unwrap().workers.is_empty());
        assert!(!handle.state().await.unwrap().running);
    }

    #[tokio::test]
    async fn graceful_stop_is_idempotent() {
        let mut pool = start_pool(2, fast_sim()).await;
        pool.stop(true).await.unwrap();
        // Second stop observes the same stopped end state.
        pool.stop(true).await.unwrap();

        let state = pool.handle().state().await.unwrap();
        assert!(!state.running);
        assert!(state.workers.is_empty());
    }

    #[tokio::test]
    async fn submit_after_stop_is_rejected() {
        let mut pool = start_pool(1, fast_sim()).await;
        let handle = pool.handle();
        pool.stop(true).await.unwrap();

        assert!(matches!(
            handle.submit(OpKind::Hack, "alpha", 1, None).await,
            Err(PoolError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn failed_operation_requeued_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counting = calls.clone();
        let executor = Arc::new(FnExecutor(move |_kind, _target: String, _threads| -> OpFuture {
            let calls = counting.clone();
            Box::pin(async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("transient".to_string())
                } else {
                    Ok(OpOutcome { value: 1.0 })
                }
            })
        }));

        let mut pool = start_pool(1, executor).await;
        let handle = pool.handle();
        let id = handle.submit(OpKind::Grow, "alpha", 1, None).await.unwrap();

        let result = handle.await_result(id, Duration::from_secs(5)).await.unwrap();
        assert!(result.success);
        assert_eq!(result.attempts, 2);

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_after_retry_bound() {
        let executor = Arc::new(FnExecutor(|_kind, _target: String, _threads| -> OpFuture {
            Box::pin(async { Err("broken".to_string()) })
        }));

        let mut pool = start_pool(1, executor).await;
        let handle = pool.handle();
        let id = handle.submit(OpKind::Hack, "alpha", 1, None).await.unwrap();

        let result = handle.await_result(id, Duration::from_secs(5)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.attempts, 2); // First try + one requeue.
        assert_eq!(result.failure, Some(FailureKind::Execution));
        assert_eq!(result.error.as_deref(), Some("broken"));

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn executor_error_text_never_reclassifies_the_failure() {
        // An operation whose error message happens to read like the
        // lost-worker marker must still surface as an execution
        // failure, not as PoolError::WorkerLost.
        let executor = Arc::new(FnExecutor(|_kind, _target: String, _threads| -> OpFuture {
            Box::pin(async { Err("worker lost".to_string()) })
        }));

        let mut pool = start_pool(1, executor).await;
        let handle = pool.handle();
        let id = handle.submit(OpKind::Hack, "alpha", 1, None).await.unwrap();

        let result = handle.await_result(id, Duration::from_secs(5)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Execution));
        assert_eq!(result.error.as_deref(), Some("worker lost"));

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn late_start_is_abandoned() {
        let mut pool = start_pool(1, fast_sim()).await;
        let handle = pool.handle();

        // Start time far in the past, beyond any slack.
        let stale_start = epoch_ms().saturating_sub(60_000);
        let id = handle
            .submit(OpKind::Weaken, "alpha", 1, Some(stale_start))
            .await
            .unwrap();

        let result = handle.await_result(id, Duration::from_secs(5)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::StartMissed));

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn future_start_time_is_honored() {
        let mut pool = start_pool(1, fast_sim()).await;
        let handle = pool.handle();

        let start = epoch_ms() + 80;
        let id = handle.submit(OpKind::Weaken, "alpha", 1, Some(start)).await.unwrap();
        let result = handle.await_result(id, Duration::from_secs(5)).await.unwrap();
        assert!(result.success);
        assert!(epoch_ms() >= start);

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn stale_claim_requeued_once_then_lost() {
        // No real workers: drive the sweep against a fabricated dead
        // worker holding a claim.
        let mut pool = start_pool(0, fast_sim()).await;
        let handle = pool.handle();

        let task = Task {
            id: 99,
            kind: OpKind::Weaken,
            target: "alpha".to_string(),
            threads: 1,
            start_time_ms: None,
        };

        // First loss: claim requeued with lost_requeues = 1.
        pool.mailbox
            .register_worker(WorkerRecord {
                worker_id: 7,
                pid: 1,
                running: true,
                current: Some(QueuedTask::new(task.clone())),
                last_heartbeat_ms: 0, // Ancient.
            })
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if handle.backlog().await.unwrap() == 1 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "sweep never requeued");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let requeued = pool.mailbox.claim().await.unwrap().unwrap();
        assert_eq!(requeued.task.id, 99);
        assert_eq!(requeued.lost_requeues, 1);

        // Second loss: surfaced as WorkerLost.
        pool.mailbox
            .register_worker(WorkerRecord {
                worker_id: 8,
                pid: 2,
                running: true,
                current: Some(requeued),
                last_heartbeat_ms: 0,
            })
            .await
            .unwrap();

        let err = handle.await_result(99, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, PoolError::WorkerLost(99)));

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn forced_stop_kills_hung_worker() {
        // Executor that never completes.
        let executor = Arc::new(FnExecutor(|_kind, _target: String, _threads| -> OpFuture {
            Box::pin(async {
                std::future::pending::<()>().await;
                unreachable!()
            })
        }));

        let mut pool = start_pool(1, executor).await;
        let handle = pool.handle();
        handle.submit(OpKind::Hack, "alpha", 1, None).await.unwrap();

        // Give the worker time to claim and hang.
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.stop(false).await.unwrap();
        let state = handle.state().await.unwrap();
        assert!(state.workers.is_empty());
        assert!(!state.running);
    }

    #[tokio::test]
    async fn graceful_stop_times_out_on_hung_worker() {
        let executor = Arc::new(FnExecutor(|_kind, _target: String, _threads| -> OpFuture {
            Box::pin(async {
                std::future::pending::<()>().await;
                unreachable!()
            })
        }));

        let mut pool = start_pool(1, executor).await;
        let handle = pool.handle();
        handle.submit(OpKind::Hack, "alpha", 1, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(pool.stop(true).await, Err(PoolError::ShutdownTimeout)));
        // Escalate to forced, which always completes.
        pool.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn sweep_prunes_results_nobody_consumes() {
        let mut config = test_config(1);
        config.result_ttl = Duration::from_millis(50);
        let mut pool = WorkerPool::start(
            PortBus::new(),
            &PortConfig::default(),
            config,
            fast_sim(),
        )
        .await
        .unwrap();
        let handle = pool.handle();

        let id = handle.submit(OpKind::Weaken, "alpha", 1, None).await.unwrap();

        // Never consume it; the sweep drops it once the ttl elapses.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(pool.mailbox.take_result(id).await.unwrap().is_none());

        pool.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn await_result_times_out_without_result() {
        let mut pool = start_pool(0, fast_sim()).await;
        let handle = pool.handle();
        assert!(matches!(
            handle.await_result(12345, Duration::from_millis(40)).await,
            Err(PoolError::ResultTimeout(12345))
        ));
        pool.stop(true).await.unwrap();
    }
}
