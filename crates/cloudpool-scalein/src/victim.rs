//! Victim selection: which machine to remove on scale-in.
//!
//! Every policy is a pure, deterministic choice over a non-empty candidate
//! set. Ties are broken by ascending machine id, so the same input always
//! yields the same victim.
//!
//! A machine whose launch time is unknown is treated as launched `now`
//! by the age-based policies, and as having no billed time left by
//! `CLOSEST_TO_INSTANCE_HOUR`.

use std::cmp::{Ordering, Reverse};

use chrono::{DateTime, Utc};

use cloudpool_core::{Machine, VictimSelectionPolicy};

use crate::error::{ScaleInError, ScaleInResult};

/// Victim selection behavior attached to each configured policy.
pub trait VictimSelectionStrategy {
    /// Pick one machine to terminate.
    fn select_victim<'a>(
        &self,
        candidates: &'a [Machine],
        now: DateTime<Utc>,
    ) -> ScaleInResult<&'a Machine>;

    /// Pick `count` distinct victims, applying the policy repeatedly to the
    /// shrinking candidate set.
    fn select_victims(
        &self,
        candidates: &[Machine],
        count: usize,
        now: DateTime<Utc>,
    ) -> ScaleInResult<Vec<Machine>> {
        if count > candidates.len() {
            return Err(ScaleInError::NotEnoughCandidates {
                requested: count,
                available: candidates.len(),
            });
        }

        let mut remaining = candidates.to_vec();
        let mut victims = Vec::with_capacity(count);
        for _ in 0..count {
            let victim_id = self.select_victim(&remaining, now)?.id.clone();
            if let Some(index) = remaining.iter().position(|m| m.id == victim_id) {
                victims.push(remaining.swap_remove(index));
            }
        }
        Ok(victims)
    }
}

impl VictimSelectionStrategy for VictimSelectionPolicy {
    fn select_victim<'a>(
        &self,
        candidates: &'a [Machine],
        now: DateTime<Utc>,
    ) -> ScaleInResult<&'a Machine> {
        let launched = |m: &Machine| m.launch_time.unwrap_or(now);

        let chosen = match self {
            Self::OldestInstance => candidates
                .iter()
                .min_by(|a, b| by_key_then_id(a, b, launched)),
            Self::NewestInstance => candidates
                .iter()
                .min_by(|a, b| by_key_then_id(a, b, |m| Reverse(launched(m)))),
            Self::ClosestToInstanceHour => candidates.iter().min_by(|a, b| {
                by_key_then_id(a, b, |m| m.seconds_left_of_instance_hour(now).unwrap_or(0))
            }),
        };

        chosen.ok_or(ScaleInError::EmptyCandidateSet)
    }
}

fn by_key_then_id<K: Ord>(a: &Machine, b: &Machine, key: impl Fn(&Machine) -> K) -> Ordering {
    key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
}
