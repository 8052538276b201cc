//! Background sweep of orphaned transient files
//!
//! A worker killed mid-request never reaches its cleanup path, so its staged
//! upload (and any partial artifact) stays on disk. The reaper removes
//! transient files older than the longest a live request can run
//! (`timeout + grace`), which cannot belong to anything still in flight.

use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::storage::{ReapReport, Storage};

#[derive(Clone)]
pub struct Reaper {
    storage: Storage,
    max_age: Duration,
    every: Duration,
}

impl Reaper {
    pub fn new(storage: Storage, max_age: Duration, every: Duration) -> Self {
        Self { storage, max_age, every }
    }

    /// One synchronous pass
    pub fn sweep(&self) -> ReapReport {
        let report = self.storage.reap(self.max_age);
        if report.removed > 0 || report.failed > 0 {
            info!(
                "🧹 Reaped {} orphaned file(s) ({} scanned, {} failed)",
                report.removed, report.scanned, report.failed
            );
        }
        report
    }

    /// Sweep immediately, then every interval, until the task is dropped.
    pub async fn run(self) {
        info!(
            "Starting orphan reaper (interval: {:?}, max age: {:?})",
            self.every, self.max_age
        );

        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let pass = self.clone();
            let swept = tokio::task::spawn_blocking(move || pass.sweep()).await;
            if let Err(e) = swept {
                error!("Reaper pass failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    #[test]
    fn test_sweep_removes_only_old_files() {
        let tmp = TempDir::new().unwrap();
        let storage = Storage::open(tmp.path().join("uploads"), tmp.path().join("data")).unwrap();
        storage.stage(&Uuid::new_v4(), b"left behind", Some("a.png")).unwrap();

        let patient = Reaper::new(storage.clone(), Duration::from_secs(3600), Duration::from_secs(60));
        assert_eq!(patient.sweep().removed, 0);

        let eager = Reaper::new(storage.clone(), Duration::ZERO, Duration::from_secs(60));
        assert_eq!(eager.sweep().removed, 1);
        assert_eq!(storage.staged_count(), 0);
    }
}
