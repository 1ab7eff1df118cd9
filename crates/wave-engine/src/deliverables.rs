//! Concurrent-safe deliverable tracking.
//!
//! Steps record user-facing outputs (files, URLs, PRs, branches, issues,
//! logs, contracts) as they produce them; the run summary renders the
//! collection at the end. Duplicates by `(step_id, path)` are dropped.

use std::sync::Mutex;
use wave_core::{Deliverable, DeliverableKind};

/// Mutex-guarded deliverable collection shared across workers.
#[derive(Debug, Default)]
pub struct DeliverableTracker {
    items: Mutex<Vec<Deliverable>>,
}

impl DeliverableTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deliverable. Returns false when an entry with the same
    /// `(step_id, path)` already exists.
    pub fn record(&self, deliverable: Deliverable) -> bool {
        let Ok(mut items) = self.items.lock() else {
            return false;
        };
        if items
            .iter()
            .any(|d| d.step_id == deliverable.step_id && d.path == deliverable.path)
        {
            return false;
        }
        items.push(deliverable);
        true
    }

    /// Convenience for file deliverables.
    pub fn record_file(&self, step_id: &str, path: &str) -> bool {
        self.record(Deliverable {
            step_id: step_id.to_string(),
            kind: DeliverableKind::File,
            path: path.to_string(),
            description: None,
        })
    }

    /// Snapshot of everything recorded so far.
    pub fn snapshot(&self) -> Vec<Deliverable> {
        self.items.lock().map(|items| items.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn record_dedups_by_step_and_path() {
        let tracker = DeliverableTracker::new();
        assert!(tracker.record_file("build", "/ws/out.json"));
        assert!(!tracker.record_file("build", "/ws/out.json"));
        // Same path from another step is a distinct deliverable.
        assert!(tracker.record_file("review", "/ws/out.json"));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn kinds_are_preserved() {
        let tracker = DeliverableTracker::new();
        tracker.record(Deliverable {
            step_id: "release".to_string(),
            kind: DeliverableKind::PullRequest,
            path: "https://github.com/acme/app/pull/42".to_string(),
            description: Some("release PR".to_string()),
        });

        let items = tracker.snapshot();
        assert_eq!(items[0].kind, DeliverableKind::PullRequest);
        assert_eq!(items[0].description.as_deref(), Some("release PR"));
    }

    #[test]
    fn concurrent_records_do_not_lose_entries() {
        let tracker = Arc::new(DeliverableTracker::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    tracker.record_file(&format!("step-{worker}"), &format!("/out/{i}"));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.len(), 8 * 50);
    }
}
