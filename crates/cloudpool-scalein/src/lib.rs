//! cloudpool-scalein: deciding which machines to remove, and when.
//!
//! # Architecture
//!
//! ```text
//! allocated, not-yet-queued machines
//!   └── VictimSelectionStrategy (per configured policy) ──► victims
//!         └── TerminationScheduler (instance-hour margin) ──► ScheduledTermination
//!               └── TerminationQueue (shared, keyed by machine id)
//!                     └── pop_due(now) ──► engine terminates
//! ```

pub mod error;
pub mod queue;
pub mod scheduler;
pub mod victim;

pub use error::{ScaleInError, ScaleInResult};
pub use queue::TerminationQueue;
pub use scheduler::TerminationScheduler;
pub use victim::VictimSelectionStrategy;
