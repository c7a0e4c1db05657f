//! The executor seam — where a claimed task becomes a timed remote
//! operation.
//!
//! Workers look up the executor by operation kind; the executor
//! suspends for the operation's full real-time duration (operations
//! are not preemptible once started) and reports the effect.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use batch_core::model::{
    GROW_MULTIPLIER_PER_THREAD, HACK_FRACTION_PER_THREAD, HACK_SECURITY_PER_THREAD,
    GROW_SECURITY_PER_THREAD, WEAKEN_SECURITY_PER_THREAD, duration_ms,
};
use batch_core::types::{OpKind, TargetSnapshot};

/// Effect of one completed operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpOutcome {
    /// Money moved (hack/grow) or security removed (weaken).
    pub value: f64,
}

/// Boxed operation future, as returned by [`Executor::execute`].
pub type OpFuture = Pin<Box<dyn Future<Output = Result<OpOutcome, String>> + Send>>;

/// Executes one operation against a target. Implementations suspend
/// for the operation's wall-clock duration. The effect (and the
/// reported value) covers all `threads` of the operation; duration is
/// thread-independent.
pub trait Executor: Send + Sync {
    fn execute(&self, kind: OpKind, target: String, threads: u32) -> OpFuture;
}

/// Adapter so tests can use plain closures as executors.
pub struct FnExecutor<F>(pub F);

impl<F> Executor for FnExecutor<F>
where
    F: Fn(OpKind, String, u32) -> OpFuture + Send + Sync,
{
    fn execute(&self, kind: OpKind, target: String, threads: u32) -> OpFuture {
        (self.0)(kind, target, threads)
    }
}

/// In-process simulation of the remote grid: holds target state,
/// sleeps each operation's model duration (scaled), then applies the
/// operation's effect.
pub struct SimExecutor {
    targets: Arc<RwLock<HashMap<String, TargetSnapshot>>>,
    /// Multiplier on model durations; tests use small values.
    time_scale: f64,
}

impl SimExecutor {
    pub fn new(targets: Vec<TargetSnapshot>) -> Self {
        let map = targets.into_iter().map(|t| (t.hostname.clone(), t)).collect();
        Self {
            targets: Arc::new(RwLock::new(map)),
            time_scale: 1.0,
        }
    }

    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale;
        self
    }

    /// Current snapshot of a simulated target.
    pub async fn target(&self, hostname: &str) -> Option<TargetSnapshot> {
        self.targets.read().await.get(hostname).cloned()
    }
}

impl Executor for SimExecutor {
    fn execute(&self, kind: OpKind, target: String, threads: u32) -> OpFuture {
        let targets = self.targets.clone();
        let scale = self.time_scale;
        Box::pin(async move {
            let security = {
                let map = targets.read().await;
                let t = map
                    .get(&target)
                    .ok_or_else(|| format!("unknown target: {target}"))?;
                t.security
            };

            let sleep_ms = (duration_ms(kind, security) as f64 * scale).max(1.0);
            tokio::time::sleep(Duration::from_millis(sleep_ms as u64)).await;

            let mut map = targets.write().await;
            let t = map
                .get_mut(&target)
                .ok_or_else(|| format!("target vanished: {target}"))?;
            let n = f64::from(threads);
            let value = match kind {
                OpKind::Weaken => {
                    let removed = (t.security - t.min_security)
                        .clamp(0.0, WEAKEN_SECURITY_PER_THREAD * n);
                    t.security -= removed;
                    removed
                }
                OpKind::Grow => {
                    let before = t.money;
                    let multiplier = GROW_MULTIPLIER_PER_THREAD.powi(threads as i32);
                    t.money = (t.money.max(1.0) * multiplier).min(t.max_money);
                    t.security += GROW_SECURITY_PER_THREAD * n;
                    t.money - before
                }
                OpKind::Hack => {
                    let stolen = (t.max_money * HACK_FRACTION_PER_THREAD * n).min(t.money);
                    t.money -= stolen;
                    t.security += HACK_SECURITY_PER_THREAD * n;
                    stolen
                }
            };
            debug!(%kind, %target, threads, value, "operation complete");
            Ok(OpOutcome { value })
        })
    }
}
