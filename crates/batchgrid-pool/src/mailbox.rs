//! The pool mailbox — shared records over the port bus.
//!
//! Three ports carry all pool traffic:
//! - **control**: the `PoolState` slot record (running flag + worker
//!   registry), mutated in place under the single-writer-per-field
//!   convention
//! - **tasks**: the FIFO work queue; a pop is an atomic claim
//! - **results**: a slot map of task id → `TaskResult`. Entries carry
//!   their posting time so results nobody consumes (late posts after a
//!   timeout, abandoned submissions) can be pruned.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use batch_core::epoch_ms;
use batch_core::types::{Task, TaskId, TaskResult};
use batchgrid_port::{PortBus, PortResult};

/// A worker's own record in the registry. The worker writes every
/// field after registration; the supervisor only flips `running` and
/// removes records of dead workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: u32,
    pub pid: u64,
    /// Soft-stop signal: the worker exits at its next poll boundary
    /// once this is false.
    pub running: bool,
    /// The claim: the task currently executing, if any. Kept whole so
    /// the supervisor can requeue it if the worker disappears.
    pub current: Option<QueuedTask>,
    pub last_heartbeat_ms: u64,
}

/// A task plus its bookkeeping counters while in the queue or claimed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub task: Task,
    /// Executions so far (failed attempts increment this).
    pub attempts: u32,
    /// Times the stale-claim sweep has requeued this task.
    pub lost_requeues: u32,
}

impl QueuedTask {
    pub fn new(task: Task) -> Self {
        Self { task, attempts: 0, lost_requeues: 0 }
    }
}

/// Wire form of one results-slot entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResult {
    posted_at_ms: u64,
    result: TaskResult,
}

/// The pool's canonical shared state, persisted in the control slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolState {
    pub running: bool,
    pub supervisor_pid: u64,
    pub workers: BTreeMap<u32, WorkerRecord>,
}

/// Typed access to the pool's three ports. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Mailbox {
    bus: PortBus,
    control: u16,
    tasks: u16,
    results: u16,
}

impl Mailbox {
    pub fn new(bus: PortBus, control: u16, tasks: u16, results: u16) -> Self {
        Self { bus, control, tasks, results }
    }

    /// Open all three ports and write the initial control record.
    pub async fn init(&self, state: &PoolState) -> PortResult<()> {
        self.bus.open(self.control).await;
        self.bus.open(self.tasks).await;
        self.bus.open(self.results).await;
        self.bus.replace(self.control, state).await
    }

    /// Latest pool state snapshot, if the pool was ever initialized.
    pub async fn read_state(&self) -> PortResult<Option<PoolState>> {
        self.bus.peek(self.control).await
    }

    /// Read-modify-write the control record under the bus lock.
    ///
    /// Callers must touch only the sub-records they own.
    pub async fn update_state(&self, f: impl FnOnce(&mut PoolState)) -> PortResult<()> {
        self.bus
            .update_slot(self.control, |prev| {
                let mut state: PoolState = prev
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                f(&mut state);
                serde_json::to_value(&state).unwrap_or(Value::Null)
            })
            .await
    }

    /// Worker registration: create this worker's record.
    pub async fn register_worker(&self, record: WorkerRecord) -> PortResult<()> {
        self.update_state(|s| {
            s.workers.insert(record.worker_id, record);
        })
        .await
    }

    /// Worker heartbeat: refresh timestamp and the current claim.
    pub async fn heartbeat(
        &self,
        worker_id: u32,
        current: Option<QueuedTask>,
    ) -> PortResult<()> {
        self.update_state(|s| {
            if let Some(w) = s.workers.get_mut(&worker_id) {
                w.current = current;
                w.last_heartbeat_ms = epoch_ms();
            }
        })
        .await
    }

    /// Remove a worker's record (clean exit or confirmed dead).
    pub async fn remove_worker(&self, worker_id: u32) -> PortResult<()> {
        self.update_state(|s| {
            s.workers.remove(&worker_id);
        })
        .await
    }

    /// Queue a task for the workers.
    pub async fn enqueue(&self, queued: &QueuedTask) -> PortResult<()> {
        self.bus.push(self.tasks, queued).await
    }

    /// Claim the next task, if any. The pop is atomic: exactly one
    /// worker receives any given task.
    pub async fn claim(&self) -> PortResult<Option<QueuedTask>> {
        self.bus.try_pop(self.tasks).await
    }

    /// Number of unclaimed tasks.
    pub async fn backlog(&self) -> PortResult<usize> {
        self.bus.queue_len(self.tasks).await
    }

    /// Post a result under its task id.
    pub async fn post_result(&self, result: &TaskResult) -> PortResult<()> {
        let key = result.id.to_string();
        let value = serde_json::to_value(StoredResult {
            posted_at_ms: epoch_ms(),
            result: result.clone(),
        })?;
        self.bus
            .update_slot(self.results, move |prev| {
                let mut map = match prev {
                    Some(Value::Object(map)) => map,
                    _ => serde_json::Map::new(),
                };
                map.insert(key, value);
                Value::Object(map)
            })
            .await
    }

    /// Consume the result for a task id, retiring the id.
    pub async fn take_result(&self, id: TaskId) -> PortResult<Option<TaskResult>> {
        let mut taken: Option<TaskResult> = None;
        let key = id.to_string();
        self.bus
            .update_slot(self.results, |prev| match prev {
                Some(Value::Object(mut map)) => {
                    if let Some(v) = map.remove(&key) {
                        taken = serde_json::from_value::<StoredResult>(v)
                            .ok()
                            .map(|s| s.result);
                    }
                    Value::Object(map)
                }
                other => other.unwrap_or(Value::Null),
            })
            .await?;
        Ok(taken)
    }

    /// Drop results that have sat unconsumed longer than `ttl_ms`.
    /// Returns how many entries were pruned.
    pub async fn prune_results(&self, ttl_ms: u64) -> PortResult<usize> {
        let cutoff = epoch_ms().saturating_sub(ttl_ms);
        let mut pruned = 0usize;
        self.bus
            .update_slot(self.results, |prev| match prev {
                Some(Value::Object(mut map)) => {
                    let before = map.len();
                    map.retain(|_, v| {
                        v.get("posted_at_ms")
                            .and_then(Value::as_u64)
                            .is_some_and(|at| at >= cutoff)
                    });
                    pruned = before - map.len();
                    Value::Object(map)
                }
                other => other.unwrap_or(Value::Null),
            })
            .await?;
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_core::types::OpKind;

    fn mailbox() -> Mailbox {
        Mailbox::new(PortBus::new(), 3, 1, 2)
    }

    fn task(id: TaskId) -> Task {
        Task {
            id,
            kind: OpKind::Weaken,
            target: "alpha".to_string(),
            threads: 1,
            start_time_ms: None,
        }
    }

    fn worker(id: u32) -> WorkerRecord {
        WorkerRecord {
            worker_id: id,
            pid: 100 + u64::from(id),
            running: true,
            current: None,
            last_heartbeat_ms: epoch_ms(),
        }
    }

    #[tokio::test]
    async fn init_writes_control_record() {
        let mb = mailbox();
        let state = PoolState { running: true, supervisor_pid: 42, workers: BTreeMap::new() };
        mb.init(&state).await.unwrap();
        assert_eq!(mb.read_state().await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn register_and_remove_worker() {
        let mb = mailbox();
        mb.init(&PoolState::default()).await.unwrap();

        mb.register_worker(worker(1)).await.unwrap();
        mb.register_worker(worker(2)).await.unwrap();
        let state = mb.read_state().await.unwrap().unwrap();
        assert_eq!(state.workers.len(), 2);

        mb.remove_worker(1).await.unwrap();
        let state = mb.read_state().await.unwrap().unwrap();
        assert!(!state.workers.contains_key(&1));
        assert!(state.workers.contains_key(&2));
    }

    #[tokio::test]
    async fn heartbeat_updates_own_record_only() {
        let mb = mailbox();
        mb.init(&PoolState::default()).await.unwrap();
        mb.register_worker(worker(1)).await.unwrap();
        mb.register_worker(worker(2)).await.unwrap();

        let claim = QueuedTask::new(task(9));
        mb.heartbeat(1, Some(claim.clone())).await.unwrap();

        let state = mb.read_state().await.unwrap().unwrap();
        assert_eq!(state.workers[&1].current, Some(claim));
        assert_eq!(state.workers[&2].current, None);
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let mb = mailbox();
        mb.init(&PoolState::default()).await.unwrap();

        mb.enqueue(&QueuedTask::new(task(1))).await.unwrap();
        mb.enqueue(&QueuedTask::new(task(2))).await.unwrap();
        assert_eq!(mb.backlog().await.unwrap(), 2);

        let first = mb.claim().await.unwrap().unwrap();
        assert_eq!(first.task.id, 1);
        let second = mb.claim().await.unwrap().unwrap();
        assert_eq!(second.task.id, 2);
        assert!(mb.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn result_posted_then_taken_once() {
        let mb = mailbox();
        mb.init(&PoolState::default()).await.unwrap();

        mb.post_result(&TaskResult::ok(5, 123.0, 1)).await.unwrap();
        let taken = mb.take_result(5).await.unwrap().unwrap();
        assert!(taken.success);
        assert_eq!(taken.value, Some(123.0));

        // Id retired: a second take finds nothing.
        assert!(mb.take_result(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn results_for_other_ids_survive_take() {
        let mb = mailbox();
        mb.init(&PoolState::default()).await.unwrap();

        mb.post_result(&TaskResult::ok(1, 1.0, 1)).await.unwrap();
        mb.post_result(&TaskResult::ok(2, 2.0, 1)).await.unwrap();

        mb.take_result(1).await.unwrap().unwrap();
        assert!(mb.take_result(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_results_are_pruned_fresh_ones_kept() {
        let mb = mailbox();
        mb.init(&PoolState::default()).await.unwrap();

        for id in 0..10 {
            mb.post_result(&TaskResult::ok(id, 1.0, 1)).await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        mb.post_result(&TaskResult::ok(99, 1.0, 1)).await.unwrap();

        // Everything older than 10ms goes; the fresh post survives.
        let pruned = mb.prune_results(10).await.unwrap();
        assert_eq!(pruned, 10);
        assert!(mb.take_result(0).await.unwrap().is_none());
        assert!(mb.take_result(99).await.unwrap().is_some());
    }
}
