//! cloudpool-alert: alert records and the sinks that receive them.
//!
//! ```text
//! engine ──notify(Alert)──► FilteringAlertSink (severity regex, subject)
//!                              └──► LogAlertSink (tracing) | MemoryAlertSink
//! ```

pub mod alert;
pub mod sink;

pub use alert::{Alert, AlertSeverity, AlertTopic};
pub use sink::{AlertSink, FilteringAlertSink, LogAlertSink, MemoryAlertSink};
