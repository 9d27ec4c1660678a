//! Domain types for machine pools.
//!
//! A `MachinePool` is an immutable snapshot of every machine a driver
//! reported at one point in time. Snapshots are never mutated; the engine
//! replaces the whole value on every reconciliation pass.
//!
//! The JSON form (camelCase field names) is the persisted/wire format. A
//! machine record must carry `id`, `state` and `metadata`; `launchTime`
//! and `serviceState` are optional.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Provider-assigned machine identifier, unique within a pool.
pub type MachineId = String;

/// Length of one billing period, in seconds.
pub const INSTANCE_HOUR_SECS: i64 = 3600;

// ── Machine ───────────────────────────────────────────────────────

/// Lifecycle state of a machine as reported by the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Requested,
    Pending,
    Running,
    Rejected,
    Terminating,
    Terminated,
}

impl MachineState {
    /// Requested, pending or running: the machine consumes (or is about to
    /// consume) resources and counts toward the pool size.
    pub fn is_allocated(self) -> bool {
        matches!(self, Self::Requested | Self::Pending | Self::Running)
    }

    /// Pending or running.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Terminated)
    }

    /// Whether the provider may move a machine from `self` to `next`.
    pub fn can_transition_to(self, next: MachineState) -> bool {
        use MachineState::*;
        matches!(
            (self, next),
            (Requested, Pending)
                | (Requested, Rejected)
                | (Pending, Running)
                | (Pending, Terminating)
                | (Running, Terminating)
                | (Terminating, Terminated)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "REQUESTED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Rejected => "REJECTED",
            Self::Terminating => "TERMINATING",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational state of the service running on a machine.
///
/// Independent of `MachineState`: a running machine may still be booting
/// its service, or be taken out of service by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Booting,
    InService,
    Unhealthy,
    OutOfService,
    #[default]
    Unknown,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::InService => "IN_SERVICE",
            Self::Unhealthy => "UNHEALTHY",
            Self::OutOfService => "OUT_OF_SERVICE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceState {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "BOOTING" => Ok(Self::Booting),
            "IN_SERVICE" => Ok(Self::InService),
            "UNHEALTHY" => Ok(Self::Unhealthy),
            "OUT_OF_SERVICE" => Ok(Self::OutOfService),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(CoreError::invalid_argument(format!(
                "unrecognized service state: {other}"
            ))),
        }
    }
}

/// A single machine in a pool snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: MachineId,
    pub state: MachineState,
    /// Absent when the provider has not (yet) reported it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub service_state: ServiceState,
    /// Provider/service tags.
    pub metadata: HashMap<String, String>,
}

impl Machine {
    /// Create a machine with no launch time and no metadata.
    pub fn new(id: impl Into<MachineId>, state: MachineState) -> Self {
        Self {
            id: id.into(),
            state,
            launch_time: None,
            service_state: ServiceState::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_launch_time(mut self, launch_time: DateTime<Utc>) -> Self {
        self.launch_time = Some(launch_time);
        self
    }

    pub fn with_service_state(mut self, service_state: ServiceState) -> Self {
        self.service_state = service_state;
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_allocated(&self) -> bool {
        self.state.is_allocated()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Seconds remaining until the machine's current billing hour ends.
    ///
    /// Returns `None` if the launch time is unknown. A launch time in the
    /// future (clock skew) is treated as a just-started hour.
    pub fn seconds_left_of_instance_hour(&self, now: DateTime<Utc>) -> Option<i64> {
        let launched = self.launch_time?;
        let elapsed = (now - launched).num_seconds().max(0);
        Some(INSTANCE_HOUR_SECS - elapsed % INSTANCE_HOUR_SECS)
    }
}

// ── MachinePool ───────────────────────────────────────────────────

/// Immutable snapshot of a machine pool.
///
/// May contain machines in any state, including terminal ones that the
/// provider still briefly reports. Only allocated machines count toward
/// the pool's size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachinePool {
    timestamp: DateTime<Utc>,
    machines: Vec<Machine>,
}

impl MachinePool {
    pub fn new(machines: Vec<Machine>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            machines,
        }
    }

    /// A snapshot with no machines.
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), timestamp)
    }

    /// Time the snapshot was taken.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// All machines, in any state.
    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    /// Machines in an allocated state (requested, pending, running).
    pub fn allocated_machines(&self) -> Vec<&Machine> {
        self.machines.iter().filter(|m| m.is_allocated()).collect()
    }

    /// Machines in an active state (pending, running).
    pub fn active_machines(&self) -> Vec<&Machine> {
        self.machines.iter().filter(|m| m.is_active()).collect()
    }

    /// Number of allocated machines: the pool's effective size.
    pub fn allocated_count(&self) -> usize {
        self.machines.iter().filter(|m| m.is_allocated()).count()
    }

    pub fn active_count(&self) -> usize {
        self.machines.iter().filter(|m| m.is_active()).count()
    }

    pub fn get(&self, id: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Parse the persisted JSON form.
    ///
    /// Fails if the timestamp or machine list is missing, or if any
    /// machine record lacks `id`, `state` or `metadata`.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        serde_json::from_str(json).map_err(|e| CoreError::Deserialize(e.to_string()))
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::Serialize(e.to_string()))
    }
}

// ── Scale-in ──────────────────────────────────────────────────────

/// A victim paired with the instant its termination should execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTermination {
    pub machine: Machine,
    pub termination_time: DateTime<Utc>,
}

impl ScheduledTermination {
    pub fn new(machine: Machine, termination_time: DateTime<Utc>) -> Self {
        Self {
            machine,
            termination_time,
        }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine.id
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.termination_time <= now
    }
}

// ── Pool metadata and size ────────────────────────────────────────

static API_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+(\.\d)?$").expect("api version pattern is valid")
});

/// Static properties of a pool and the cloud it manages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawCloudPoolMetadata")]
pub struct CloudPoolMetadata {
    pool_identifier: String,
    supported_api_versions: Vec<String>,
}

/// Wire form of `CloudPoolMetadata`, checked by `CloudPoolMetadata::new`
/// on the way in.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCloudPoolMetadata {
    pool_identifier: String,
    supported_api_versions: Vec<String>,
}

impl TryFrom<RawCloudPoolMetadata> for CloudPoolMetadata {
    type Error = CoreError;

    fn try_from(raw: RawCloudPoolMetadata) -> CoreResult<Self> {
        Self::new(raw.pool_identifier, raw.supported_api_versions)
    }
}

impl CloudPoolMetadata {
    /// Build pool metadata.
    ///
    /// The identifier must be non-empty and at least one API version must
    /// be given, each of the form `<digits>` or `<digits>.<digit>`.
    pub fn new(
        pool_identifier: impl Into<String>,
        supported_api_versions: Vec<String>,
    ) -> CoreResult<Self> {
        let pool_identifier = pool_identifier.into();
        if pool_identifier.trim().is_empty() {
            return Err(CoreError::invalid_argument("poolIdentifier cannot be empty"));
        }
        if supported_api_versions.is_empty() {
            return Err(CoreError::invalid_argument(
                "supportedApiVersions cannot be empty",
            ));
        }
        if let Some(bad) = supported_api_versions
            .iter()
            .find(|v| !API_VERSION.is_match(v))
        {
            return Err(CoreError::invalid_argument(format!(
                "{bad} is not a valid API version"
            )));
        }
        Ok(Self {
            pool_identifier,
            supported_api_versions,
        })
    }

    pub fn pool_identifier(&self) -> &str {
        &self.pool_identifier
    }

    pub fn supported_api_versions(&self) -> &[String] {
        &self.supported_api_versions
    }
}

/// Desired versus observed size of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSize {
    pub timestamp: DateTime<Utc>,
    pub desired_size: u32,
    /// Machines in an allocated state.
    pub allocated: u32,
    /// Machines in an active state.
    pub active: u32,
    /// Allocated machines not already committed to termination.
    pub effective_size: u32,
}
