//! Termination queue: scheduled terminations awaiting execution.
//!
//! Shared between the periodic tick (which drains due entries) and the
//! request path (which enqueues new victims). Keyed by machine id, so a
//! machine is never scheduled twice; re-scheduling replaces the entry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use cloudpool_core::{MachineId, ScheduledTermination};

#[derive(Debug, Clone, Default)]
pub struct TerminationQueue {
    entries: Arc<Mutex<HashMap<MachineId, ScheduledTermination>>>,
}

impl TerminationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add scheduled terminations, replacing any prior entry per machine.
    pub async fn enqueue(&self, terminations: impl IntoIterator<Item = ScheduledTermination>) {
        let mut entries = self.entries.lock().await;
        for termination in terminations {
            let id = termination.machine_id().to_string();
            if entries.insert(id.clone(), termination).is_some() {
                debug!(machine_id = %id, "replaced scheduled termination");
            }
        }
    }

    /// Remove and return every entry due at `now`, earliest first.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Vec<ScheduledTermination> {
        let mut entries = self.entries.lock().await;
        let due_ids: Vec<MachineId> = entries
            .values()
            .filter(|e| e.is_due(now))
            .map(|e| e.machine_id().to_string())
            .collect();
        let mut due: Vec<ScheduledTermination> = due_ids
            .iter()
            .filter_map(|id| entries.remove(id))
            .collect();
        sort_by_time(&mut due);
        due
    }

    /// Cancel the pending termination of a machine.
    pub async fn remove(&self, machine_id: &str) -> Option<ScheduledTermination> {
        self.entries.lock().await.remove(machine_id)
    }

    /// Keep only entries whose machine satisfies `keep`; return the rest.
    pub async fn retain(&self, keep: impl Fn(&str) -> bool) -> Vec<ScheduledTermination> {
        let mut entries = self.entries.lock().await;
        let dropped_ids: Vec<MachineId> = entries.keys().filter(|id| !keep(id)).cloned().collect();
        dropped_ids
            .iter()
            .filter_map(|id| entries.remove(id))
            .collect()
    }

    pub async fn contains(&self, machine_id: &str) -> bool {
        self.entries.lock().await.contains_key(machine_id)
    }

    pub async fn machine_ids(&self) -> HashSet<MachineId> {
        self.entries.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Copy of every pending entry, earliest first.
    pub async fn snapshot(&self) -> Vec<ScheduledTermination> {
        let mut all: Vec<ScheduledTermination> =
            self.entries.lock().await.values().cloned().collect();
        sort_by_time(&mut all);
        all
    }
}

fn sort_by_time(entries: &mut [ScheduledTermination]) {
    entries.sort_by(|a, b| {
        a.termination_time
            .cmp(&b.termination_time)
            .then_with(|| a.machine_id().cmp(b.machine_id()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use cloudpool_core::{Machine, MachineState};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn entry(id: &str, offset_secs: i64) -> ScheduledTermination {
        ScheduledTermination::new(
            Machine::new(id, MachineState::Running),
            now() + Duration::seconds(offset_secs),
        )
    }

    #[tokio::test]
    async fn pop_due_returns_only_due_entries_in_order() {
        let queue = TerminationQueue::new();
        queue
            .enqueue(vec![entry("i-3", 0), entry("i-1", -60), entry("i-2", 600)])
            .await;

        let due = queue.pop_due(now()).await;
        let ids: Vec<&str> = due.iter().map(|e| e.machine_id()).collect();
        assert_eq!(ids, vec!["i-1", "i-3"]);
        assert_eq!(queue.len().await, 1);
        assert!(queue.contains("i-2").await);

        assert!(queue.pop_due(now()).await.is_empty());
        assert_eq!(queue.pop_due(now() + Duration::seconds(600)).await.len(), 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_machine() {
        let queue = TerminationQueue::new();
        queue.enqueue(vec![entry("i-1", 600)]).await;
        queue.enqueue(vec![entry("i-1", 0)]).await;

        assert_eq!(queue.len().await, 1);
        let due = queue.pop_due(now()).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].termination_time, now());
    }

    #[tokio::test]
    async fn remove_cancels_entry() {
        let queue = TerminationQueue::new();
        queue.enqueue(vec![entry("i-1", 0), entry("i-2", 0)]).await;

        assert_eq!(queue.remove("i-1").await.map(|e| e.machine.id), Some("i-1".to_string()));
        assert!(queue.remove("i-1").await.is_none());
        assert_eq!(queue.machine_ids().await, HashSet::from(["i-2".to_string()]));
    }

    #[tokio::test]
    async fn retain_drops_unwanted_machines() {
        let queue = TerminationQueue::new();
        queue
            .enqueue(vec![entry("i-1", 0), entry("i-2", 60), entry("i-3", 120)])
            .await;

        let dropped = queue.retain(|id| id != "i-2").await;
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].machine_id(), "i-2");

        let remaining: Vec<String> = queue
            .snapshot()
            .await
            .into_iter()
            .map(|e| e.machine.id)
            .collect();
        assert_eq!(remaining, vec!["i-1", "i-3"]);
    }

    #[tokio::test]
    async fn concurrent_enqueue_and_drain_lose_nothing() {
        let queue = TerminationQueue::new();
        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    queue.enqueue(vec![entry(&format!("p{p}-{i}"), 0)]).await;
                    tokio::task::yield_now().await;
                }
            }));
        }

        let drainer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut drained = Vec::new();
                for _ in 0..100 {
                    drained.extend(queue.pop_due(now()).await);
                    tokio::task::yield_now().await;
                }
                drained
            })
        };

        for producer in producers {
            producer.await.unwrap();
        }
        let mut drained = drainer.await.unwrap();
        drained.extend(queue.pop_due(now()).await);

        let unique: HashSet<String> = drained.iter().map(|e| e.machine.id.clone()).collect();
        assert_eq!(drained.len(), 200);
        assert_eq!(unique.len(), 200);
    }
}
