//! Shared fixtures for the engine's unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use cloudpool_alert::MemoryAlertSink;
use cloudpool_core::{
    CloudPoolConfig, CloudPoolMetadata, DriverConfig, Machine, MachinePool, MachineState,
    PoolUpdateConfig, ScaleInConfig, ScaleOutConfig, VictimSelectionPolicy,
};
use cloudpool_driver::{CloudDriver, DriverError, DriverResult, InMemoryDriver, LaunchOutcome};

use crate::controller::PoolController;

pub fn config(policy: VictimSelectionPolicy, margin: i64, driver_timeout: &str) -> CloudPoolConfig {
    CloudPoolConfig {
        name: "web".to_string(),
        driver: DriverConfig::Memory {
            pool_identifier: "sim".to_string(),
            initial_machines: 0,
        },
        scale_out: ScaleOutConfig {
            size: "m1.small".to_string(),
            image: "ubuntu-24.04".to_string(),
            key_pair: None,
            security_groups: vec!["web".to_string()],
            boot_script: Vec::new(),
        },
        scale_in: ScaleInConfig {
            victim_selection_policy: policy,
            instance_hour_margin: margin,
        },
        pool_update: PoolUpdateConfig {
            update_interval: "60s".to_string(),
            driver_timeout: driver_timeout.to_string(),
        },
        alerts: None,
    }
}

pub fn controller_with(
    driver: Arc<dyn CloudDriver>,
    policy: VictimSelectionPolicy,
    margin: i64,
) -> (PoolController, MemoryAlertSink) {
    controller_with_timeout(driver, policy, margin, "5s")
}

pub fn controller_with_timeout(
    driver: Arc<dyn CloudDriver>,
    policy: VictimSelectionPolicy,
    margin: i64,
    driver_timeout: &str,
) -> (PoolController, MemoryAlertSink) {
    let alerts = MemoryAlertSink::new();
    let controller = PoolController::new(
        &config(policy, margin, driver_timeout),
        driver,
        Arc::new(alerts.clone()),
    )
    .unwrap();
    (controller, alerts)
}

/// A running machine launched `minutes` ago.
pub fn running_since(id: &str, minutes: i64) -> Machine {
    Machine::new(id, MachineState::Running).with_launch_time(Utc::now() - Duration::minutes(minutes))
}

/// How `BrokenTerminateDriver` answers a terminate call.
#[derive(Debug, Clone, Copy)]
pub enum TerminateFault {
    /// The machine has already disappeared.
    Vanished,
    /// The driver panics mid-call.
    Panic,
}

/// Delegates to an in-memory cloud, except for terminations.
pub struct BrokenTerminateDriver {
    inner: Arc<InMemoryDriver>,
    fault: TerminateFault,
}

impl BrokenTerminateDriver {
    pub fn new(inner: Arc<InMemoryDriver>, fault: TerminateFault) -> Self {
        Self { inner, fault }
    }
}

#[async_trait]
impl CloudDriver for BrokenTerminateDriver {
    async fn list_machines(&self) -> DriverResult<MachinePool> {
        self.inner.list_machines().await
    }

    async fn launch(&self, count: u32, template: &ScaleOutConfig) -> DriverResult<LaunchOutcome> {
        self.inner.launch(count, template).await
    }

    async fn terminate(&self, machine_id: &str) -> DriverResult<()> {
        match self.fault {
            TerminateFault::Vanished => Err(DriverError::NotFound(machine_id.to_string())),
            TerminateFault::Panic => panic!("driver crashed terminating {machine_id}"),
        }
    }

    async fn attach(&self, machine_id: &str) -> DriverResult<()> {
        self.inner.attach(machine_id).await
    }

    async fn detach(&self, machine_id: &str, decrement_desired_size: bool) -> DriverResult<()> {
        self.inner.detach(machine_id, decrement_desired_size).await
    }

    async fn tag(&self, machine_id: &str, tags: &HashMap<String, String>) -> DriverResult<()> {
        self.inner.tag(machine_id, tags).await
    }

    async fn untag(&self, machine_id: &str, tag_keys: &[String]) -> DriverResult<()> {
        self.inner.untag(machine_id, tag_keys).await
    }

    fn metadata(&self) -> CloudPoolMetadata {
        self.inner.metadata()
    }
}
