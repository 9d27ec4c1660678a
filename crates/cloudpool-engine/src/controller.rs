//! Pool controller: the per-pool reconciliation loop.
//!
//! Each pass reads a fresh snapshot from the driver, executes terminations
//! that have come due, then moves the pool one step toward its desired
//! size: launch the shortfall, or pick, schedule and queue victims for the
//! surplus. Never both in the same pass.
//!
//! Passes are mutually exclusive per controller. A trigger that arrives
//! while a pass is running does not start a second, concurrent pass; it
//! marks the controller dirty and the running pass loops once more before
//! releasing the lock. Any number of such triggers collapse into one
//! follow-up pass.

mod management;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use cloudpool_alert::{Alert, AlertSink, AlertTopic};
use cloudpool_core::{
    CloudPoolConfig, Machine, MachineId, MachinePool, MachineState, ScaleOutConfig,
    ScheduledTermination, VictimSelectionPolicy,
};
use cloudpool_driver::{CloudDriver, DriverError, DriverResult};
use cloudpool_scalein::{TerminationQueue, TerminationScheduler, VictimSelectionStrategy};

use crate::error::{EngineError, EngineResult};
use crate::report::PassReport;

#[derive(Debug, Default)]
struct PoolState {
    /// Latest snapshot, amended with this controller's own launches and
    /// terminations since it was taken.
    snapshot: Option<MachinePool>,
    /// Unset until the first snapshot or an explicit resize.
    desired_size: Option<u32>,
}

/// Keeps one machine pool at its desired size.
pub struct PoolController {
    name: String,
    driver: Arc<dyn CloudDriver>,
    alerts: Arc<dyn AlertSink>,
    scale_out: ScaleOutConfig,
    policy: VictimSelectionPolicy,
    scheduler: TerminationScheduler,
    queue: TerminationQueue,
    state: RwLock<PoolState>,
    /// Held for the duration of a pass or a mutating management call.
    pass_lock: Mutex<()>,
    rerun: AtomicBool,
    closed: AtomicBool,
    driver_timeout: Duration,
}

impl PoolController {
    /// Build a controller from a pool configuration. The configuration is
    /// validated first.
    pub fn new(
        config: &CloudPoolConfig,
        driver: Arc<dyn CloudDriver>,
        alerts: Arc<dyn AlertSink>,
    ) -> EngineResult<Self> {
        config.validate()?;
        let scheduler = TerminationScheduler::new(config.scale_in.instance_hour_margin)?;

        Ok(Self {
            name: config.name.clone(),
            driver,
            alerts,
            scale_out: config.scale_out.clone(),
            policy: config.scale_in.victim_selection_policy,
            scheduler,
            queue: TerminationQueue::new(),
            state: RwLock::new(PoolState::default()),
            pass_lock: Mutex::new(()),
            rerun: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            driver_timeout: config.pool_update.driver_timeout()?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> VictimSelectionPolicy {
        self.policy
    }

    pub async fn desired_size(&self) -> Option<u32> {
        self.state.read().await.desired_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(atomic::Ordering::SeqCst)
    }

    /// Request a reconciliation pass.
    ///
    /// Returns the report of the last pass run by this call, or `None` if
    /// the request was folded into a pass already in flight.
    pub async fn reconcile(&self) -> EngineResult<Option<PassReport>> {
        self.ensure_open()?;
        self.rerun.store(true, atomic::Ordering::SeqCst);

        let mut last = None;
        loop {
            let Ok(guard) = self.pass_lock.try_lock() else {
                break;
            };
            while self.rerun.swap(false, atomic::Ordering::SeqCst) {
                last = Some(self.run_pass().await);
            }
            drop(guard);
            // A trigger may have landed between the last check and the unlock.
            if !self.rerun.load(atomic::Ordering::SeqCst) {
                break;
            }
        }
        last.transpose()
    }

    /// Run passes every `interval` until `shutdown` fires, then stop
    /// accepting triggers and return the terminations still pending.
    pub async fn run(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Vec<ScheduledTermination> {
        info!(
            pool = %self.name,
            interval_secs = interval.as_secs(),
            policy = ?self.policy,
            "pool controller started"
        );

        self.trigger().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => self.trigger().await,
                _ = shutdown.changed() => {
                    info!(pool = %self.name, "pool controller shutting down");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Refuse further triggers, wait for any in-flight pass, and hand back
    /// the terminations that were never executed.
    pub async fn shutdown(&self) -> Vec<ScheduledTermination> {
        self.closed.store(true, atomic::Ordering::SeqCst);
        let _guard = self.pass_lock.lock().await;

        let pending = self.queue.snapshot().await;
        for entry in &pending {
            info!(
                pool = %self.name,
                machine_id = %entry.machine_id(),
                termination_time = %entry.termination_time,
                "scheduled termination not executed before shutdown"
            );
        }
        pending
    }

    /// Reconcile, ignoring the outcome. Pass failures are logged and
    /// alerted by the pass itself.
    async fn trigger(&self) {
        if let Err(e) = self.reconcile().await {
            debug!(pool = %self.name, error = %e, "reconciliation pass failed");
        }
    }

    /// Finish a management call made under the pass lock. Runs a pass if
    /// the call changed the pool, and in any case if a trigger was folded
    /// in while the lock was held, whatever the call's outcome.
    async fn settle<T>(&self, result: EngineResult<T>, changed_pool: bool) -> EngineResult<T> {
        if (changed_pool && result.is_ok()) || self.rerun.load(atomic::Ordering::SeqCst) {
            self.trigger().await;
        }
        result
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    async fn run_pass(&self) -> EngineResult<PassReport> {
        let pool = match self.fetch_pool().await {
            Ok(pool) => pool,
            Err(e) => {
                error!(pool = %self.name, error = %e, "failed to fetch machine pool, skipping pass");
                self.alert(Alert::error(
                    AlertTopic::PoolError,
                    format!("failed to fetch machine pool: {e}"),
                ))
                .await;
                return Err(e.into());
            }
        };
        let now = Utc::now();

        let allocated: HashSet<&str> = pool
            .allocated_machines()
            .into_iter()
            .map(|m| m.id.as_str())
            .collect();
        for entry in self.queue.retain(|id| allocated.contains(id)).await {
            debug!(
                pool = %self.name,
                machine_id = %entry.machine_id(),
                "machine left the pool, dropping its scheduled termination"
            );
        }

        let desired = {
            let mut state = self.state.write().await;
            *state.desired_size.get_or_insert_with(|| {
                info!(
                    pool = %self.name,
                    desired = allocated.len(),
                    "desired size initialized from pool"
                );
                allocated.len() as u32
            })
        };
        let mut report = PassReport::new(desired);

        let mut retries = self.execute_due(now, &mut report).await;

        let queued = self.queue.machine_ids().await;
        let committed: HashSet<&str> = report
            .terminated
            .iter()
            .map(String::as_str)
            .chain(queued.iter().map(String::as_str))
            .chain(retries.iter().map(ScheduledTermination::machine_id))
            .collect();
        let candidates: Vec<Machine> = pool
            .allocated_machines()
            .into_iter()
            .filter(|m| !committed.contains(m.id.as_str()))
            .cloned()
            .collect();
        let effective = candidates.len() as u32;
        report.effective_size = effective;

        match effective.cmp(&desired) {
            Ordering::Less => self.launch(desired - effective, &mut report).await,
            Ordering::Greater => {
                let surplus = (effective - desired) as usize;
                if let Err(e) = self.schedule_victims(&candidates, surplus, now, &mut report).await {
                    error!(pool = %self.name, error = %e, "victim selection failed");
                    self.alert(Alert::error(
                        AlertTopic::PoolError,
                        format!("failed to select {surplus} victim(s): {e}"),
                    ))
                    .await;
                    report.failures.push(e.to_string());
                }
                // Victims inside the margin are due right away.
                retries.extend(self.execute_due(Utc::now(), &mut report).await);
            }
            Ordering::Equal => debug!(pool = %self.name, size = effective, "pool at desired size"),
        }

        if !retries.is_empty() {
            self.queue.enqueue(retries).await;
        }
        self.remember(&pool, &report).await;

        info!(
            pool = %self.name,
            desired,
            effective,
            launched = report.launched.len(),
            scheduled = report.scheduled.len(),
            terminated = report.terminated.len(),
            failures = report.failures.len(),
            "reconciliation pass complete"
        );
        Ok(report)
    }

    /// Terminate every queued entry due at `now`, concurrently. Returns
    /// the entries that failed, rescheduled for immediate execution.
    async fn execute_due(
        &self,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Vec<ScheduledTermination> {
        let due = self.queue.pop_due(now).await;
        if due.is_empty() {
            return Vec::new();
        }

        let mut outstanding: HashMap<MachineId, ScheduledTermination> = due
            .into_iter()
            .map(|entry| (entry.machine_id().to_string(), entry))
            .collect();

        let mut tasks = JoinSet::new();
        for machine_id in outstanding.keys().cloned() {
            let driver = Arc::clone(&self.driver);
            let timeout = self.driver_timeout;
            tasks.spawn(async move {
                let result = bounded("terminate", timeout, driver.terminate(&machine_id)).await;
                (machine_id, result)
            });
        }

        let mut retries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (machine_id, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(pool = %self.name, error = %e, "termination task failed");
                    continue;
                }
            };
            let Some(entry) = outstanding.remove(&machine_id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    info!(pool = %self.name, %machine_id, "machine terminated");
                    self.alert(
                        Alert::info(AlertTopic::PoolResize, format!("terminated machine {machine_id}"))
                            .with_metadata("machineId", &machine_id),
                    )
                    .await;
                    report.terminated.push(machine_id);
                }
                Err(e) if e.is_not_found() => {
                    debug!(pool = %self.name, %machine_id, "machine already gone");
                    report.terminated.push(machine_id);
                }
                Err(e) => {
                    retries.push(self.termination_failed(entry, &e.to_string(), now, report).await);
                }
            }
        }

        // Entries whose task never reported back.
        for entry in outstanding.into_values() {
            retries.push(
                self.termination_failed(entry, "termination task aborted", now, report)
                    .await,
            );
        }

        report.terminated.sort();
        retries
    }

    /// Alert and record a failed termination, returning the entry
    /// rescheduled for immediate execution.
    async fn termination_failed(
        &self,
        entry: ScheduledTermination,
        reason: &str,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> ScheduledTermination {
        let machine_id = entry.machine_id();
        warn!(pool = %self.name, %machine_id, error = %reason, "termination failed, will retry");
        self.alert(
            Alert::warn(
                AlertTopic::PoolError,
                format!("failed to terminate machine {machine_id}: {reason}"),
            )
            .with_metadata("machineId", machine_id),
        )
        .await;
        report.failures.push(format!("terminate {machine_id}: {reason}"));
        ScheduledTermination::new(entry.machine, now)
    }

    async fn launch(&self, count: u32, report: &mut PassReport) {
        info!(pool = %self.name, count, "scaling out");
        let outcome = match bounded(
            "launch",
            self.driver_timeout,
            self.driver.launch(count, &self.scale_out),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(pool = %self.name, count, error = %e, "launch failed");
                self.alert(Alert::error(
                    AlertTopic::PoolError,
                    format!("failed to launch {count} machine(s): {e}"),
                ))
                .await;
                report.failures.push(format!("launch {count}: {e}"));
                return;
            }
        };

        if !outcome.launched.is_empty() {
            let ids: Vec<&str> = outcome.launched.iter().map(|m| m.id.as_str()).collect();
            self.alert(
                Alert::info(
                    AlertTopic::PoolResize,
                    format!(
                        "launched {} of {count} requested machine(s): {}",
                        ids.len(),
                        ids.join(", ")
                    ),
                )
                .with_metadata("requested", count),
            )
            .await;
        }
        for failure in &outcome.failures {
            warn!(pool = %self.name, reason = %failure.reason, "machine launch failed");
            self.alert(Alert::warn(
                AlertTopic::PoolError,
                format!("failed to launch machine: {}", failure.reason),
            ))
            .await;
            report.failures.push(format!("launch: {}", failure.reason));
        }
        report.launched.extend(outcome.launched);
    }

    async fn schedule_victims(
        &self,
        candidates: &[Machine],
        count: usize,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> EngineResult<()> {
        info!(pool = %self.name, count, policy = ?self.policy, "scaling in");
        let victims = self.policy.select_victims(candidates, count, now)?;
        let scheduled = self.scheduler.schedule_all(victims, now);

        for entry in &scheduled {
            info!(
                pool = %self.name,
                machine_id = %entry.machine_id(),
                termination_time = %entry.termination_time,
                "termination scheduled"
            );
            self.alert(
                Alert::info(
                    AlertTopic::PoolResize,
                    format!(
                        "scheduled termination of machine {} at {}",
                        entry.machine_id(),
                        entry.termination_time.to_rfc3339()
                    ),
                )
                .with_metadata("machineId", entry.machine_id()),
            )
            .await;
        }

        self.queue.enqueue(scheduled.clone()).await;
        report.scheduled = scheduled;
        Ok(())
    }

    /// Store `pool` as the latest snapshot, amended with the pass's own
    /// launches and terminations.
    async fn remember(&self, pool: &MachinePool, report: &PassReport) {
        let terminated: HashSet<&str> = report.terminated.iter().map(String::as_str).collect();
        let amended = amend(pool, &terminated, &report.launched);
        self.state.write().await.snapshot = Some(amended);
    }

    async fn fetch_pool(&self) -> DriverResult<MachinePool> {
        bounded("list_machines", self.driver_timeout, self.driver.list_machines()).await
    }

    async fn alert(&self, alert: Alert) {
        self.alerts.notify(alert.with_metadata("pool", &self.name)).await;
    }
}

/// A copy of `pool` with `terminated` machines moved to `TERMINATING` and
/// `launched` machines appended.
fn amend(pool: &MachinePool, terminated: &HashSet<&str>, launched: &[Machine]) -> MachinePool {
    let mut machines: Vec<Machine> = pool
        .machines()
        .iter()
        .map(|m| {
            let mut machine = m.clone();
            if machine.is_allocated() && terminated.contains(machine.id.as_str()) {
                machine.state = MachineState::Terminating;
            }
            machine
        })
        .collect();
    machines.extend(launched.iter().cloned());
    MachinePool::new(machines, pool.timestamp())
}

/// Bound a driver call by `timeout`; expiry becomes a retryable
/// `DriverError::Timeout`.
async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    call: impl Future<Output = DriverResult<T>>,
) -> DriverResult<T> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| DriverError::Timeout { operation, timeout })?
}
