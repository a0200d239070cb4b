//! Lightweight counters the control surface exposes over `/v1/status`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct SyncStats {
    passes_completed: AtomicU64,
    passes_failed: AtomicU64,
    last_error: Mutex<HashMap<String, String>>,
}

impl SyncStats {
    pub fn record_success(&self, folder: &str) {
        self.passes_completed.fetch_add(1, Ordering::Relaxed);
        self.last_error.lock().unwrap().remove(folder);
    }

    pub fn record_failure(&self, folder: &str, err: &str) {
        self.passes_failed.fetch_add(1, Ordering::Relaxed);
        self.last_error
            .lock()
            .unwrap()
            .insert(folder.to_string(), err.to_string());
    }

    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            passes_completed: self.passes_completed.load(Ordering::Relaxed),
            passes_failed: self.passes_failed.load(Ordering::Relaxed),
            last_errors: self.last_error.lock().unwrap().clone(),
        }
    }
}

#[derive(Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncStatsSnapshot {
    pub passes_completed: u64,
    pub passes_failed: u64,
    pub last_errors: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_success_and_failure_independently() {
        let stats = SyncStats::default();
        stats.record_success("work");
        stats.record_failure("personal", "connect timed out");

        let snap = stats.snapshot();
        assert_eq!(snap.passes_completed, 1);
        assert_eq!(snap.passes_failed, 1);
        assert_eq!(snap.last_errors.get("personal").unwrap(), "connect timed out");
        assert!(!snap.last_errors.contains_key("work"));
    }

    #[test]
    fn success_after_failure_clears_last_error() {
        let stats = SyncStats::default();
        stats.record_failure("work", "boom");
        stats.record_success("work");

        let snap = stats.snapshot();
        assert!(!snap.last_errors.contains_key("work"));
    }
}
