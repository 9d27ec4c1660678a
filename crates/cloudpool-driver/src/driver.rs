//! The capability contract every cloud backend implements.

use std::collections::HashMap;

use async_trait::async_trait;

use cloudpool_core::{CloudPoolMetadata, Machine, MachinePool, ScaleOutConfig, ServiceState};

use crate::error::DriverResult;

/// Tag key under which the default `set_service_state` records a
/// machine's service state.
pub const SERVICE_STATE_TAG: &str = "cloudpool:service-state";

/// One machine the provider failed to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchFailure {
    pub reason: String,
}

/// Result of a best-effort launch request.
///
/// A partially successful launch is not an error: the machines that did
/// start are in `launched`, and every machine that did not is reported
/// separately in `failures`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchOutcome {
    pub launched: Vec<Machine>,
    pub failures: Vec<LaunchFailure>,
}

impl LaunchOutcome {
    /// Total machines the outcome accounts for.
    pub fn requested(&self) -> usize {
        self.launched.len() + self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A cloud backend (EC2, an autoscaling group, OpenStack, Kubernetes, ...).
///
/// Credentials, region and similar settings are passed at construction.
/// Implementations must tolerate concurrent calls; the engine serializes
/// mutating calls per pool so they need not lock internally for that.
#[async_trait]
pub trait CloudDriver: Send + Sync {
    /// Full snapshot of the machines belonging to the pool.
    async fn list_machines(&self) -> DriverResult<MachinePool>;

    /// Launch `count` machines from `template`.
    async fn launch(&self, count: u32, template: &ScaleOutConfig) -> DriverResult<LaunchOutcome>;

    /// Terminate a machine. `NotFound` if it is already gone.
    async fn terminate(&self, machine_id: &str) -> DriverResult<()>;

    /// Adopt an existing, externally launched machine into the pool.
    async fn attach(&self, machine_id: &str) -> DriverResult<()>;

    /// Release a machine from the pool without terminating it.
    async fn detach(&self, machine_id: &str, decrement_desired_size: bool) -> DriverResult<()>;

    /// Tell providers that size groups natively about the new target.
    ///
    /// Providers without group sizing leave this as a no-op; the engine
    /// enforces the size through launch/terminate calls regardless.
    async fn set_desired_size(&self, _desired_size: u32) -> DriverResult<()> {
        Ok(())
    }

    async fn tag(&self, machine_id: &str, tags: &HashMap<String, String>) -> DriverResult<()>;

    async fn untag(&self, machine_id: &str, tag_keys: &[String]) -> DriverResult<()>;

    /// Record the service state of a machine, by default as a tag.
    async fn set_service_state(&self, machine_id: &str, state: ServiceState) -> DriverResult<()> {
        let tags = HashMap::from([(SERVICE_STATE_TAG.to_string(), state.to_string())]);
        self.tag(machine_id, &tags).await
    }

    fn metadata(&self) -> CloudPoolMetadata;
}
