//! cloudpool-driver: the cloud backend contract.
//!
//! The engine never branches on provider identity; it only talks to a
//! `dyn CloudDriver`. One implementation exists per backend. This crate
//! ships the contract and an in-memory simulated backend.
//!
//! # Architecture
//!
//! ```text
//! PoolController ──► Arc<dyn CloudDriver>
//!                        ├── list_machines / launch / terminate
//!                        ├── attach / detach / set_desired_size
//!                        └── tag / untag / set_service_state / metadata
//! ```

pub mod driver;
pub mod error;
pub mod memory;

pub use driver::{CloudDriver, LaunchFailure, LaunchOutcome, SERVICE_STATE_TAG};
pub use error::{DriverError, DriverResult};
pub use memory::{CallLog, InMemoryDriver};
