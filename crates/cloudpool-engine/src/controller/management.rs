//! Management surface of a pool controller.
//!
//! Mutating calls take the pass lock, so they never interleave with a
//! reconciliation pass. Calls that change membership or size trigger a
//! pass once they are done. A pass requested while a call held the lock
//! runs as soon as the call releases it, even if the call failed.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use cloudpool_alert::{Alert, AlertTopic};
use cloudpool_core::{CloudPoolMetadata, MachinePool, PoolSize, ScheduledTermination, ServiceState};

use super::{PoolController, amend, bounded};
use crate::error::{EngineError, EngineResult};

impl PoolController {
    /// Fresh snapshot straight from the driver.
    pub async fn get_pool(&self) -> EngineResult<MachinePool> {
        Ok(self.fetch_pool().await?)
    }

    pub async fn get_pool_size(&self) -> EngineResult<PoolSize> {
        let (pool, desired) = self.ensure_initialized().await?;
        let queued = self.queue.machine_ids().await;
        let effective = pool
            .allocated_machines()
            .into_iter()
            .filter(|m| !queued.contains(&m.id))
            .count();

        Ok(PoolSize {
            timestamp: pool.timestamp(),
            desired_size: desired,
            allocated: pool.allocated_count() as u32,
            active: pool.active_count() as u32,
            effective_size: effective as u32,
        })
    }

    pub fn get_pool_metadata(&self) -> CloudPoolMetadata {
        self.driver.metadata()
    }

    /// Scheduled terminations not yet executed, earliest first.
    pub async fn pending_terminations(&self) -> Vec<ScheduledTermination> {
        self.queue.snapshot().await
    }

    pub async fn set_desired_size(&self, desired_size: i64) -> EngineResult<()> {
        self.ensure_open()?;
        if desired_size < 0 {
            return Err(EngineError::invalid_argument(format!(
                "desired size must be non-negative, got {desired_size}"
            )));
        }
        let desired = u32::try_from(desired_size).map_err(|_| {
            EngineError::invalid_argument(format!("desired size too large: {desired_size}"))
        })?;

        {
            let _guard = self.pass_lock.lock().await;
            let previous = self.state.write().await.desired_size.replace(desired);
            info!(pool = %self.name, ?previous, desired, "desired size set");

            if previous != Some(desired) {
                let from = previous.map_or_else(|| "unset".to_string(), |n| n.to_string());
                self.alert(
                    Alert::info(
                        AlertTopic::PoolResize,
                        format!("desired size changed from {from} to {desired}"),
                    )
                    .with_metadata("desiredSize", desired),
                )
                .await;
            }

            if let Err(e) = bounded(
                "set_desired_size",
                self.driver_timeout,
                self.driver.set_desired_size(desired),
            )
            .await
            {
                warn!(pool = %self.name, desired, error = %e, "driver did not accept desired size");
            }
        }

        self.trigger().await;
        Ok(())
    }

    /// Terminate a pool member now, bypassing victim selection and the
    /// instance-hour margin.
    pub async fn terminate_machine(
        &self,
        machine_id: &str,
        decrement_desired_size: bool,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        let result = {
            let _guard = self.pass_lock.lock().await;
            self.terminate_member(machine_id, decrement_desired_size).await
        };
        self.settle(result, true).await
    }

    /// Adopt an externally launched machine. The desired size grows by one
    /// so the new member is not immediately scaled away.
    pub async fn attach_machine(&self, machine_id: &str) -> EngineResult<()> {
        self.ensure_open()?;
        let result = {
            let _guard = self.pass_lock.lock().await;
            self.attach_member(machine_id).await
        };
        self.settle(result, true).await
    }

    /// Release a machine from the pool without terminating it. A machine
    /// that is already gone counts as detached.
    pub async fn detach_machine(
        &self,
        machine_id: &str,
        decrement_desired_size: bool,
    ) -> EngineResult<()> {
        self.ensure_open()?;
        let result = {
            let _guard = self.pass_lock.lock().await;
            self.detach_member(machine_id, decrement_desired_size).await
        };
        self.settle(result, true).await
    }

    pub async fn set_service_state(
        &self,
        machine_id: &str,
        service_state: ServiceState,
    ) -> EngineResult<()> {
        let result = {
            let _guard = self.pass_lock.lock().await;
            bounded(
                "set_service_state",
                self.driver_timeout,
                self.driver.set_service_state(machine_id, service_state),
            )
            .await
            .map_err(EngineError::from)
        };
        self.settle(result, false).await?;

        info!(pool = %self.name, %machine_id, %service_state, "service state set");
        self.alert(
            Alert::info(
                AlertTopic::ServiceState,
                format!("Service state set to {service_state} for machine {machine_id}"),
            )
            .with_metadata("machineId", machine_id),
        )
        .await;
        Ok(())
    }

    pub async fn tag_machine(
        &self,
        machine_id: &str,
        tags: &HashMap<String, String>,
    ) -> EngineResult<()> {
        let result = {
            let _guard = self.pass_lock.lock().await;
            bounded("tag", self.driver_timeout, self.driver.tag(machine_id, tags))
                .await
                .map_err(EngineError::from)
        };
        self.settle(result, false).await?;
        debug!(pool = %self.name, %machine_id, count = tags.len(), "machine tagged");
        Ok(())
    }

    pub async fn untag_machine(&self, machine_id: &str, tag_keys: &[String]) -> EngineResult<()> {
        let result = {
            let _guard = self.pass_lock.lock().await;
            bounded("untag", self.driver_timeout, self.driver.untag(machine_id, tag_keys))
                .await
                .map_err(EngineError::from)
        };
        self.settle(result, false).await?;
        debug!(pool = %self.name, %machine_id, count = tag_keys.len(), "machine untagged");
        Ok(())
    }

    // Callers below hold the pass lock.

    async fn terminate_member(&self, machine_id: &str, decrement_desired_size: bool) -> EngineResult<()> {
        let pool = self.fetch_pool().await?;
        if !pool.get(machine_id).is_some_and(|m| m.is_allocated()) {
            return Err(EngineError::NotFound(machine_id.to_string()));
        }
        self.initialize_desired(&pool).await;

        match bounded("terminate", self.driver_timeout, self.driver.terminate(machine_id)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(pool = %self.name, %machine_id, "machine already gone");
            }
            Err(e) => return Err(e.into()),
        }
        self.queue.remove(machine_id).await;

        let mut state = self.state.write().await;
        if decrement_desired_size {
            state.desired_size = state.desired_size.map(|n| n.saturating_sub(1));
        }
        state.snapshot = Some(amend(&pool, &HashSet::from([machine_id]), &[]));
        drop(state);

        info!(pool = %self.name, %machine_id, decrement_desired_size, "machine terminated on request");
        self.alert(
            Alert::info(AlertTopic::PoolResize, format!("terminated machine {machine_id}"))
                .with_metadata("machineId", machine_id),
        )
        .await;
        Ok(())
    }

    async fn attach_member(&self, machine_id: &str) -> EngineResult<()> {
        self.ensure_initialized().await?;
        bounded("attach", self.driver_timeout, self.driver.attach(machine_id)).await?;

        let desired = {
            let mut state = self.state.write().await;
            let desired = state.desired_size.map_or(1, |n| n.saturating_add(1));
            state.desired_size = Some(desired);
            desired
        };

        info!(pool = %self.name, %machine_id, desired, "machine attached");
        self.alert(
            Alert::info(AlertTopic::PoolResize, format!("attached machine {machine_id}"))
                .with_metadata("machineId", machine_id),
        )
        .await;
        Ok(())
    }

    async fn detach_member(&self, machine_id: &str, decrement_desired_size: bool) -> EngineResult<()> {
        self.ensure_initialized().await?;

        match bounded(
            "detach",
            self.driver_timeout,
            self.driver.detach(machine_id, decrement_desired_size),
        )
        .await
        {
            Ok(()) => {
                if decrement_desired_size {
                    let mut state = self.state.write().await;
                    state.desired_size = state.desired_size.map(|n| n.saturating_sub(1));
                }
                info!(pool = %self.name, %machine_id, decrement_desired_size, "machine detached");
                self.alert(
                    Alert::info(AlertTopic::PoolResize, format!("detached machine {machine_id}"))
                        .with_metadata("machineId", machine_id),
                )
                .await;
            }
            Err(e) if e.is_not_found() => {
                debug!(pool = %self.name, %machine_id, "machine not in pool, nothing to detach");
            }
            Err(e) => return Err(e.into()),
        }

        if self.queue.remove(machine_id).await.is_some() {
            debug!(pool = %self.name, %machine_id, "cancelled scheduled termination");
        }
        Ok(())
    }

    /// Cached snapshot and desired size, fetching a snapshot first if
    /// none has been taken yet.
    async fn ensure_initialized(&self) -> EngineResult<(MachinePool, u32)> {
        {
            let state = self.state.read().await;
            if let (Some(pool), Some(desired)) = (&state.snapshot, state.desired_size) {
                return Ok((pool.clone(), desired));
            }
        }

        let pool = self.fetch_pool().await?;
        let mut state = self.state.write().await;
        let desired = *state
            .desired_size
            .get_or_insert(pool.allocated_count() as u32);
        let pool = state.snapshot.get_or_insert(pool).clone();
        Ok((pool, desired))
    }

    async fn initialize_desired(&self, pool: &MachinePool) {
        self.state
            .write()
            .await
            .desired_size
            .get_or_insert(pool.allocated_count() as u32);
    }
}
