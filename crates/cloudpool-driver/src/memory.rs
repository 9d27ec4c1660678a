//! In-memory driver: a simulated cloud held in process memory.
//!
//! Backs the daemon's `memory` driver mode and the engine/API tests.
//! Machines launched by it start `PENDING` with the current time as launch
//! time. Terminated machines stay visible in exactly one more snapshot and
//! are then forgotten, like a real provider's short-lived listing of dead
//! instances.
//!
//! Faults can be injected to exercise the engine's failure handling:
//! failing snapshot reads, individually failing launches, failing
//! terminations, and slow snapshot reads (for timeouts).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use cloudpool_core::{
    CloudPoolMetadata, Machine, MachinePool, MachineState, ScaleOutConfig, ServiceState,
};

use crate::driver::{CloudDriver, LaunchFailure, LaunchOutcome, SERVICE_STATE_TAG};
use crate::error::{DriverError, DriverResult};

/// API versions the simulated cloud claims to support.
const SUPPORTED_API_VERSIONS: &[&str] = &["1", "4.0"];

/// Record of the calls a driver has received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallLog {
    pub list_calls: u32,
    /// Machine count requested by each launch call.
    pub launches: Vec<u32>,
    /// Machine ids passed to terminate, successful or not.
    pub terminations: Vec<String>,
    pub desired_sizes: Vec<u32>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_lists: u32,
    failing_launches: u32,
    failing_terminations: HashSet<String>,
    list_delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct SimState {
    /// Pool members, in launch/attach order.
    members: Vec<Machine>,
    /// Machines that exist in the cloud but outside the pool.
    unmanaged: HashMap<String, Machine>,
    next_id: u64,
    desired_size: Option<u32>,
    faults: Faults,
    calls: CallLog,
}

impl SimState {
    fn next_machine_id(&mut self) -> String {
        self.next_id += 1;
        format!("sim-{:04}", self.next_id)
    }

    fn member_mut(&mut self, machine_id: &str) -> DriverResult<&mut Machine> {
        self.members
            .iter_mut()
            .find(|m| m.id == machine_id && !m.state.is_terminal())
            .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))
    }
}

/// A simulated cloud backend.
pub struct InMemoryDriver {
    metadata: CloudPoolMetadata,
    state: Mutex<SimState>,
}

impl InMemoryDriver {
    /// Create an empty simulated pool.
    pub fn new(pool_identifier: &str) -> DriverResult<Self> {
        let metadata = CloudPoolMetadata::new(
            pool_identifier,
            SUPPORTED_API_VERSIONS.iter().map(|v| v.to_string()).collect(),
        )
        .map_err(|e| DriverError::Config(e.to_string()))?;

        Ok(Self {
            metadata,
            state: Mutex::new(SimState::default()),
        })
    }

    /// Start with `count` running machines launched just now.
    pub async fn with_running_machines(self, count: u32) -> Self {
        {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            for _ in 0..count {
                let id = state.next_machine_id();
                state
                    .members
                    .push(Machine::new(id, MachineState::Running).with_launch_time(now));
            }
        }
        self
    }

    /// Add a machine to the pool as-is.
    pub async fn insert(&self, machine: Machine) {
        self.state.lock().await.members.push(machine);
    }

    /// Add a machine that exists in the cloud but is not a pool member.
    pub async fn insert_unmanaged(&self, machine: Machine) {
        self.state
            .lock()
            .await
            .unmanaged
            .insert(machine.id.clone(), machine);
    }

    /// Move a member to a new state, as the provider would.
    pub async fn set_state(&self, machine_id: &str, new_state: MachineState) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        let machine = state
            .members
            .iter_mut()
            .find(|m| m.id == machine_id)
            .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))?;
        machine.state = new_state;
        Ok(())
    }

    /// Remove a member without going through `terminate`, e.g. a machine
    /// killed out-of-band.
    pub async fn remove(&self, machine_id: &str) -> Option<Machine> {
        let mut state = self.state.lock().await;
        let index = state.members.iter().position(|m| m.id == machine_id)?;
        Some(state.members.remove(index))
    }

    /// Fail the next `n` snapshot reads.
    pub async fn fail_next_lists(&self, n: u32) {
        self.state.lock().await.faults.failing_lists = n;
    }

    /// Fail the next `n` individual machine launches.
    pub async fn fail_next_launches(&self, n: u32) {
        self.state.lock().await.faults.failing_launches = n;
    }

    /// Make every terminate call for `machine_id` fail with a provider error.
    pub async fn fail_terminations_of(&self, machine_id: &str) {
        self.state
            .lock()
            .await
            .faults
            .failing_terminations
            .insert(machine_id.to_string());
    }

    /// Let terminate calls for `machine_id` succeed again.
    pub async fn clear_termination_failure(&self, machine_id: &str) {
        self.state
            .lock()
            .await
            .faults
            .failing_terminations
            .remove(machine_id);
    }

    /// Delay every snapshot read by `delay`.
    pub async fn set_list_delay(&self, delay: Option<Duration>) {
        self.state.lock().await.faults.list_delay = delay;
    }

    pub async fn calls(&self) -> CallLog {
        self.state.lock().await.calls.clone()
    }

    /// Desired size last reported through `set_desired_size`.
    pub async fn desired_size(&self) -> Option<u32> {
        self.state.lock().await.desired_size
    }

    /// Current member machine, including terminal ones not yet forgotten.
    pub async fn machine(&self, machine_id: &str) -> Option<Machine> {
        let state = self.state.lock().await;
        state.members.iter().find(|m| m.id == machine_id).cloned()
    }
}

#[async_trait]
impl CloudDriver for InMemoryDriver {
    async fn list_machines(&self) -> DriverResult<MachinePool> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.list_calls += 1;
            if state.faults.failing_lists > 0 {
                state.faults.failing_lists -= 1;
                return Err(DriverError::provider("simulated snapshot failure"));
            }
            state.faults.list_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        let pool = MachinePool::new(state.members.clone(), Utc::now());
        // Dead machines are reported once, then dropped.
        state
            .members
            .retain(|m| m.state != MachineState::Terminated);
        Ok(pool)
    }

    async fn launch(&self, count: u32, template: &ScaleOutConfig) -> DriverResult<LaunchOutcome> {
        let mut state = self.state.lock().await;
        state.calls.launches.push(count);

        let mut outcome = LaunchOutcome::default();
        let now = Utc::now();
        for _ in 0..count {
            if state.faults.failing_launches > 0 {
                state.faults.failing_launches -= 1;
                outcome.failures.push(LaunchFailure {
                    reason: format!("simulated launch failure for size {}", template.size),
                });
                continue;
            }
            let id = state.next_machine_id();
            let machine = Machine::new(id, MachineState::Pending)
                .with_launch_time(now)
                .with_tag("size", template.size.clone())
                .with_tag("image", template.image.clone());
            state.members.push(machine.clone());
            outcome.launched.push(machine);
        }

        info!(
            pool = %self.metadata.pool_identifier(),
            requested = count,
            launched = outcome.launched.len(),
            "simulated launch"
        );
        Ok(outcome)
    }

    async fn terminate(&self, machine_id: &str) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        state.calls.terminations.push(machine_id.to_string());
        if state.faults.failing_terminations.contains(machine_id) {
            return Err(DriverError::provider(format!(
                "simulated termination failure for {machine_id}"
            )));
        }
        let machine = state.member_mut(machine_id)?;
        machine.state = MachineState::Terminated;
        debug!(%machine_id, "simulated termination");
        Ok(())
    }

    async fn attach(&self, machine_id: &str) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        let machine = state
            .unmanaged
            .remove(machine_id)
            .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))?;
        state.members.push(machine);
        debug!(%machine_id, "machine attached");
        Ok(())
    }

    async fn detach(&self, machine_id: &str, decrement_desired_size: bool) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        let index = state
            .members
            .iter()
            .position(|m| m.id == machine_id && !m.state.is_terminal())
            .ok_or_else(|| DriverError::NotFound(machine_id.to_string()))?;
        let machine = state.members.remove(index);
        state.unmanaged.insert(machine.id.clone(), machine);
        if decrement_desired_size {
            state.desired_size = state.desired_size.map(|n| n.saturating_sub(1));
        }
        debug!(%machine_id, decrement_desired_size, "machine detached");
        Ok(())
    }

    async fn set_desired_size(&self, desired_size: u32) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        state.desired_size = Some(desired_size);
        state.calls.desired_sizes.push(desired_size);
        Ok(())
    }

    async fn tag(&self, machine_id: &str, tags: &HashMap<String, String>) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        let machine = state.member_mut(machine_id)?;
        for (key, value) in tags {
            machine.metadata.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn untag(&self, machine_id: &str, tag_keys: &[String]) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        let machine = state.member_mut(machine_id)?;
        for key in tag_keys {
            machine.metadata.remove(key);
        }
        Ok(())
    }

    async fn set_service_state(&self, machine_id: &str, service_state: ServiceState) -> DriverResult<()> {
        let mut state = self.state.lock().await;
        let machine = state.member_mut(machine_id)?;
        machine.service_state = service_state;
        machine
            .metadata
            .insert(SERVICE_STATE_TAG.to_string(), service_state.to_string());
        Ok(())
    }

    fn metadata(&self) -> CloudPoolMetadata {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ScaleOutConfig {
        ScaleOutConfig {
            size: "m1.small".to_string(),
            image: "ubuntu".to_string(),
            key_pair: None,
            security_groups: vec![],
            boot_script: vec![],
        }
    }

    #[tokio::test]
    async fn launch_adds_pending_machines() {
        let driver = InMemoryDriver::new("sim").unwrap();
        let outcome = driver.launch(3, &template()).await.unwrap();
        assert_eq!(outcome.launched.len(), 3);
        assert!(outcome.is_complete());

        let pool = driver.list_machines().await.unwrap();
        assert_eq!(pool.allocated_count(), 3);
        assert!(pool.machines().iter().all(|m| m.state == MachineState::Pending));
        assert!(pool.machines().iter().all(|m| m.launch_time.is_some()));
        assert_eq!(driver.calls().await.launches, vec![3]);
    }

    #[tokio::test]
    async fn partial_launch_reports_failures_individually() {
        let driver = InMemoryDriver::new("sim").unwrap();
        driver.fail_next_launches(2).await;
        let outcome = driver.launch(3, &template()).await.unwrap();
        assert_eq!(outcome.launched.len(), 1);
        assert_eq!(outcome.failures.len(), 2);
    }

    #[tokio::test]
    async fn terminated_machine_is_listed_once() {
        let driver = InMemoryDriver::new("sim").unwrap().with_running_machines(1).await;
        let id = driver.list_machines().await.unwrap().machines()[0].id.clone();

        driver.terminate(&id).await.unwrap();
        let pool = driver.list_machines().await.unwrap();
        assert_eq!(pool.get(&id).unwrap().state, MachineState::Terminated);
        assert_eq!(pool.allocated_count(), 0);

        let pool = driver.list_machines().await.unwrap();
        assert!(!pool.contains(&id));

        assert_eq!(
            driver.terminate(&id).await,
            Err(DriverError::NotFound(id.clone()))
        );
    }

    #[tokio::test]
    async fn attach_and_detach_move_machines() {
        let driver = InMemoryDriver::new("sim").unwrap();
        driver
            .insert_unmanaged(Machine::new("ext-1", MachineState::Running))
            .await;
        driver.set_desired_size(1).await.unwrap();

        driver.attach("ext-1").await.unwrap();
        assert!(driver.list_machines().await.unwrap().contains("ext-1"));
        assert!(driver.attach("ext-1").await.unwrap_err().is_not_found());

        driver.detach("ext-1", true).await.unwrap();
        assert!(!driver.list_machines().await.unwrap().contains("ext-1"));
        assert_eq!(driver.desired_size().await, Some(0));
        assert!(driver.detach("ext-1", false).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn tags_and_service_state() {
        let driver = InMemoryDriver::new("sim").unwrap();
        driver.insert(Machine::new("i-1", MachineState::Running)).await;

        let tags = HashMap::from([("role".to_string(), "web".to_string())]);
        driver.tag("i-1", &tags).await.unwrap();
        driver
            .set_service_state("i-1", ServiceState::InService)
            .await
            .unwrap();

        let machine = driver.machine("i-1").await.unwrap();
        assert_eq!(machine.metadata.get("role").map(String::as_str), Some("web"));
        assert_eq!(machine.service_state, ServiceState::InService);
        assert_eq!(
            machine.metadata.get(SERVICE_STATE_TAG).map(String::as_str),
            Some("IN_SERVICE")
        );

        driver.untag("i-1", &["role".to_string()]).await.unwrap();
        assert!(!driver.machine("i-1").await.unwrap().metadata.contains_key("role"));
        assert!(driver.tag("nope", &tags).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn injected_list_failure_is_transient() {
        let driver = InMemoryDriver::new("sim").unwrap();
        driver.fail_next_lists(1).await;
        assert!(matches!(
            driver.list_machines().await,
            Err(DriverError::Provider(_))
        ));
        assert!(driver.list_machines().await.is_ok());
        assert_eq!(driver.calls().await.list_calls, 2);
    }

    #[test]
    fn invalid_identifier_is_a_config_error() {
        assert!(matches!(
            InMemoryDriver::new(""),
            Err(DriverError::Config(_))
        ));
    }
}
