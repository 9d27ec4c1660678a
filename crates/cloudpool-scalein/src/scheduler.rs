//! Termination scheduling: when to remove a chosen victim.
//!
//! Providers bill whole instance-hours, so a victim is kept until just
//! before its current billing hour ends. `instance_hour_margin` is how many
//! seconds before that boundary the termination executes, leaving time for
//! the terminate call to complete.

use chrono::{DateTime, Duration, Utc};

use cloudpool_core::{INSTANCE_HOUR_SECS, Machine, ScheduledTermination};

use crate::error::{ScaleInError, ScaleInResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationScheduler {
    instance_hour_margin: i64,
}

impl TerminationScheduler {
    /// A non-positive margin means "terminate as soon as ordered".
    pub fn new(instance_hour_margin: i64) -> ScaleInResult<Self> {
        if instance_hour_margin >= INSTANCE_HOUR_SECS {
            return Err(ScaleInError::InvalidMargin(instance_hour_margin));
        }
        Ok(Self {
            instance_hour_margin,
        })
    }

    pub fn instance_hour_margin(&self) -> i64 {
        self.instance_hour_margin
    }

    /// Schedule a single victim relative to `now`.
    ///
    /// Never schedules in the past: a victim already inside the margin is
    /// due immediately.
    pub fn schedule(&self, victim: Machine, now: DateTime<Utc>) -> ScheduledTermination {
        let termination_time = self.termination_time(&victim, now);
        ScheduledTermination::new(victim, termination_time)
    }

    pub fn schedule_all(
        &self,
        victims: Vec<Machine>,
        now: DateTime<Utc>,
    ) -> Vec<ScheduledTermination> {
        victims
            .into_iter()
            .map(|victim| self.schedule(victim, now))
            .collect()
    }

    fn termination_time(&self, victim: &Machine, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.instance_hour_margin <= 0 {
            return now;
        }
        let Some(seconds_left) = victim.seconds_left_of_instance_hour(now) else {
            return now;
        };
        let delay = (seconds_left - self.instance_hour_margin).max(0);
        now + Duration::seconds(delay)
    }
}
