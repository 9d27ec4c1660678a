//! cloudpool-engine: keeps a machine pool at its desired size.
//!
//! # Architecture
//!
//! ```text
//!   tick (update_interval) ─┐
//!   management call ────────┼──► PoolController::reconcile (one pass at a time)
//!                           │       1. CloudDriver::list_machines
//!                           │       2. TerminationQueue::pop_due ──► terminate (JoinSet)
//!                           │       3. effective = allocated − queued − terminated
//!                           │       4. launch shortfall | select + schedule + enqueue surplus
//!                           │       5. AlertSink::notify for every resize event
//!   shutdown (watch) ───────┘──► pending terminations returned and logged
//! ```

pub mod controller;
pub mod error;
pub mod report;

#[cfg(test)]
mod test_support;

pub use controller::PoolController;
pub use error::{EngineError, EngineResult};
pub use report::PassReport;
