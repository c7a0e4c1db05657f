//! Standalone assembly: bus, grid, pool, dispatcher and RPC service in
//! one process, driven off one configuration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use batch_core::config::BatchgridConfig;
use batchgrid_alloc::Allocator;
use batchgrid_capacity::{Grid, Host};
use batchgrid_dispatch::{Dispatcher, DispatcherConfig};
use batchgrid_pool::{PoolError, PoolHandle, SimExecutor, WorkerPool, WorkerPoolConfig};
use batchgrid_port::{PortBus, PortService, ServiceClient};

use crate::status::{HostStatus, StatusCache};

/// Fallback host provisioned when the configuration names none.
const DEFAULT_HOST_GB: f64 = 64.0;

/// Status cache refresh period.
const STATUS_REFRESH: Duration = Duration::from_millis(250);

/// Reservations older than this are treated as leaked and reclaimed.
/// Comfortably above the longest operation the model can produce.
const RESERVATION_TTL_MS: u64 = 900_000;

/// A fully wired standalone daemon.
pub struct Standalone {
    config: BatchgridConfig,
    bus: PortBus,
    allocator: Allocator,
    executor: Arc<SimExecutor>,
    pool: WorkerPool,
    handle: PoolHandle,
    dispatcher: Dispatcher,
    status: StatusCache,
    stop_tx: watch::Sender<bool>,
    service_handle: JoinHandle<()>,
    status_handle: JoinHandle<()>,
}

impl Standalone {
    /// Bring up every subsystem. The pool is running and the RPC
    /// service answering when this returns.
    pub async fn start(config: BatchgridConfig) -> anyhow::Result<Self> {
        let bus = PortBus::new();

        let mut grid = Grid::new();
        for host in &config.grid.hosts {
            grid.provision(Host::new(&host.name, host.ram_gb));
        }
        if config.grid.hosts.is_empty() {
            warn!(ram_gb = DEFAULT_HOST_GB, "no hosts configured, provisioning one");
            grid.provision(Host::new("local", DEFAULT_HOST_GB));
        }
        let allocator = Allocator::new(grid);
        info!(hosts = config.grid.hosts.len().max(1), "grid provisioned");

        let targets = config.grid.targets.iter().map(|t| t.snapshot()).collect();
        let executor = Arc::new(
            SimExecutor::new(targets).with_time_scale(config.grid.time_scale),
        );

        let pool = WorkerPool::start(
            bus.clone(),
            &config.ports,
            WorkerPoolConfig::from_config(&config.pool, &config.batch),
            executor.clone(),
        )
        .await?;
        let handle = pool.handle();
        info!(workers = config.pool.workers, "worker pool started");

        let dispatcher = Dispatcher::new(
            allocator.clone(),
            handle.clone(),
            DispatcherConfig::from_config(&config.batch),
        );

        let status = StatusCache::new();
        let (stop_tx, stop_rx) = watch::channel(false);

        let cache = status.clone();
        let service = PortService::new(
            bus.clone(),
            config.ports.rpc,
            config.ports.rpc_reply,
            Arc::new(move |payload: Value| -> Result<Value, String> {
                match payload.as_str() {
                    Some("status") => cache.to_value(),
                    _ => Err(format!("unknown request: {payload}")),
                }
            }),
        );
        let service_stop = stop_rx.clone();
        let service_handle = tokio::spawn(async move {
            if let Err(e) = service.serve(service_stop).await {
                warn!(%e, "rpc service exited with error");
            }
        });
        info!(
            request_port = config.ports.rpc,
            reply_port = config.ports.rpc_reply,
            "rpc service started"
        );

        let status_handle = tokio::spawn(status_loop(
            handle.clone(),
            allocator.clone(),
            status.clone(),
            stop_rx,
        ));

        Ok(Self {
            config,
            bus,
            allocator,
            executor,
            pool,
            handle,
            dispatcher,
            status,
            stop_tx,
            service_handle,
            status_handle,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn allocator(&self) -> Allocator {
        self.allocator.clone()
    }

    pub fn pool_handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Client half of the status RPC, for operator tooling.
    pub fn status_client(&self) -> ServiceClient {
        ServiceClient::new(
            self.bus.clone(),
            self.config.ports.rpc,
            self.config.ports.rpc_reply,
        )
    }

    /// Current snapshot of a simulated target.
    pub async fn target(&self, name: &str) -> Option<batch_core::types::TargetSnapshot> {
        self.executor.target(name).await
    }

    /// Run one batch per configured target, in configuration order.
    /// Returns how many batches completed; failures are logged and do
    /// not stop the cycle.
    pub async fn run_cycle(&self) -> usize {
        let mut completed = 0;
        for target in &self.config.grid.targets {
            let Some(snapshot) = self.executor.target(&target.name).await else {
                warn!(target = %target.name, "target missing from simulation");
                continue;
            };
            match self.dispatcher.run_target(&snapshot).await {
                Ok(report) => {
                    info!(
                        target = %report.target,
                        succeeded = report.all_succeeded(),
                        "cycle batch finished"
                    );
                    self.status.push_batch(report);
                    completed += 1;
                }
                Err(e) => warn!(target = %target.name, %e, "cycle batch failed"),
            }
        }
        completed
    }

    /// Stop everything: graceful pool stop with forced fallback, then
    /// the RPC service and the status loop.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        let _ = self.stop_tx.send(true);

        match self.pool.stop(true).await {
            Ok(()) => {}
            Err(PoolError::ShutdownTimeout) => {
                warn!("graceful stop timed out, forcing");
                self.pool.stop(false).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let _ = self.service_handle.await;
        let _ = self.status_handle.await;
        info!("daemon stopped");
        Ok(())
    }
}

/// Refreshes the status cache and sweeps leaked reservations until the
/// stop signal flips.
async fn status_loop(
    handle: PoolHandle,
    allocator: Allocator,
    cache: StatusCache,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }

        let state = handle.state().await.ok();
        let backlog = handle.backlog().await.unwrap_or(0);
        let grid = allocator.snapshot().await;
        cache.update(|report| {
            match &state {
                Some(s) => {
                    report.running = s.running;
                    report.workers = s.workers.len();
                }
                None => {
                    report.running = false;
                    report.workers = 0;
                }
            }
            report.backlog = backlog;
            report.hosts = grid
                .hosts()
                .map(|h| HostStatus {
                    name: h.name.clone(),
                    total_gb: h.total_gb,
                    available_gb: h.available_gb(),
                })
                .collect();
        });

        let swept = allocator.sweep_expired(RESERVATION_TTL_MS).await;
        if !swept.is_empty() {
            debug!(count = swept.len(), "leaked reservations reclaimed");
        }

        tokio::select! {
            _ = stop.changed() => {}
            _ = tokio::time::sleep(STATUS_REFRESH) => {}
        }
    }
}
