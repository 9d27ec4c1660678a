//! cloudpool-core: shared domain types and pool configuration.
//!
//! Everything the other cloudpool crates agree on lives here:
//!
//! - `Machine`, `MachineState`, `ServiceState`: one instance as seen by a
//!   cloud driver
//! - `MachinePool`: an immutable, serializable snapshot of a pool
//! - `ScheduledTermination`: a victim plus its termination instant
//! - `CloudPoolMetadata`, `PoolSize`: management surface payloads
//! - `CloudPoolConfig`: the TOML pool configuration and its validation

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    AlertSettings, CloudPoolConfig, DriverConfig, PoolUpdateConfig, ScaleInConfig,
    ScaleOutConfig, VictimSelectionPolicy, parse_duration,
};
pub use error::{CoreError, CoreResult};
pub use types::*;
