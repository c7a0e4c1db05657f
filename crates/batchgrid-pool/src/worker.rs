//! The worker main loop.
//!
//! A worker registers itself in the pool registry, then repeatedly
//! polls the mailbox: claim a task, honor its start time, execute the
//! operation for its full duration, post the result, clear the claim.
//! It exits at the next poll boundary once its own `running` flag or
//! the pool's goes false. Execution is never preempted from inside the
//! loop — only a forced kill interrupts an in-flight operation.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use batch_core::epoch_ms;
use batch_core::types::{OpKind, TaskResult};

use crate::error::PoolResult;
use crate::executor::Executor;
use crate::mailbox::{Mailbox, QueuedTask, WorkerRecord};

/// Static configuration for one worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: u32,
    pub pid: u64,
    /// Operation kinds this worker can execute. Declared once at
    /// start; used for footprint accounting, not dispatch.
    pub capabilities: Vec<OpKind>,
    pub poll_interval: Duration,
    /// Tasks whose start time passed by more than this are abandoned.
    pub start_slack_ms: u64,
    /// Failed executions are requeued up to this many times.
    pub max_requeues: u32,
}

/// A long-lived worker process.
pub struct Worker {
    config: WorkerConfig,
    mailbox: Mailbox,
    executor: Arc<dyn Executor>,
}

impl Worker {
    pub fn new(config: WorkerConfig, mailbox: Mailbox, executor: Arc<dyn Executor>) -> Self {
        Self { config, mailbox, executor }
    }

    /// Run until told to stop. Consumes the worker.
    pub async fn run(self) -> PoolResult<()> {
        let id = self.config.id;
        self.mailbox
            .register_worker(WorkerRecord {
                worker_id: id,
                pid: self.config.pid,
                running: true,
                current: None,
                last_heartbeat_ms: epoch_ms(),
            })
            .await?;
        debug!(worker = id, capabilities = ?self.config.capabilities, "worker registered");

        loop {
            if !self.should_run().await? {
                break;
            }

            let Some(queued) = self.mailbox.claim().await? else {
                self.mailbox.heartbeat(id, None).await?;
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };

            if !self.config.capabilities.contains(&queued.task.kind) {
                // Not ours to run; put it back for a capable worker.
                self.mailbox.enqueue(&queued).await?;
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }

            self.execute_claim(queued).await?;
        }

        self.mailbox.remove_worker(id).await?;
        debug!(worker = id, "worker exited");
        Ok(())
    }

    /// Pool and own running flags, read at the poll boundary.
    async fn should_run(&self) -> PoolResult<bool> {
        let Some(state) = self.mailbox.read_state().await? else {
            return Ok(false);
        };
        if !state.running {
            return Ok(false);
        }
        Ok(state
            .workers
            .get(&self.config.id)
            .is_none_or(|w| w.running))
    }

    async fn execute_claim(&self, mut queued: QueuedTask) -> PoolResult<()> {
        let id = self.config.id;
        let task_id = queued.task.id;

        // Mark the claim before any suspension so the supervisor can
        // requeue it if this worker dies.
        self.mailbox.heartbeat(id, Some(queued.clone())).await?;

        if let Some(start) = queued.task.start_time_ms {
            let now = epoch_ms();
            if now > start + self.config.start_slack_ms {
                warn!(
                    task = task_id,
                    late_ms = now - start,
                    "start time missed, abandoning task"
                );
                self.mailbox
                    .post_result(&TaskResult::abandoned(task_id, queued.attempts))
                    .await?;
                self.mailbox.heartbeat(id, None).await?;
                return Ok(());
            }
            if start > now {
                tokio::time::sleep(Duration::from_millis(start - now)).await;
            }
        }

        queued.attempts += 1;
        let outcome = self
            .executor
            .execute(queued.task.kind, queued.task.target.clone(), queued.task.threads)
            .await;

        match outcome {
            Ok(result) => {
                self.mailbox
                    .post_result(&TaskResult::ok(task_id, result.value, queued.attempts))
                    .await?;
            }
            Err(message) if queued.attempts <= self.config.max_requeues => {
                warn!(task = task_id, attempts = queued.attempts, %message, "operation failed, requeuing");
                self.mailbox.enqueue(&queued).await?;
            }
            Err(message) => {
                warn!(task = task_id, attempts = queued.attempts, %message, "operation permanently failed");
                self.mailbox
                    .post_result(&TaskResult::failed(task_id, queued.attempts, message))
                    .await?;
            }
        }

        self.mailbox.heartbeat(id, None).await?;
        Ok(())
    }
}
