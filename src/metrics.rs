//! Metrics and observability for thermo_media
//!
//! Counters live per worker process; `/metrics` reports the worker that
//! answered, not a pool-wide aggregate.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::codec::MediaKind;
use crate::error::ErrorCode;

/// Per-process metrics collector
pub struct Metrics {
    pub total_requests: AtomicU64,
    pub successful_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,

    // Per-kind counters
    pub image_count: AtomicU64,
    pub video_count: AtomicU64,
    pub video_frames: AtomicU64,

    // Indexed by position in `ErrorCode::ALL`
    errors: [AtomicU64; ErrorCode::ALL.len()],
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_success(&self, kind: MediaKind, bytes_in: u64, bytes_out: u64, frames: u64, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);

        match kind {
            MediaKind::Image => self.image_count.fetch_add(1, Ordering::Relaxed),
            MediaKind::Video => {
                self.video_frames.fetch_add(frames, Ordering::Relaxed);
                self.video_count.fetch_add(1, Ordering::Relaxed)
            }
        };
    }

    pub fn record_failure(&self, code: ErrorCode, bytes_in: u64, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);

        if let Some(i) = ErrorCode::ALL.iter().position(|c| *c == code) {
            self.errors[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let successful = self.successful_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);

        let errors = ErrorCode::ALL
            .iter()
            .zip(self.errors.iter())
            .map(|(code, count)| ErrorCount {
                code: *code,
                count: count.load(Ordering::Relaxed),
            })
            .collect();

        MetricsSnapshot {
            pid: std::process::id(),
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            error_rate: if total > 0 { failed as f64 / total as f64 } else { 0.0 },
            avg_latency_ms: if total > 0 { total_latency / total } else { 0 },
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            media: MediaMetrics {
                images: self.image_count.load(Ordering::Relaxed),
                videos: self.video_count.load(Ordering::Relaxed),
                video_frames: self.video_frames.load(Ordering::Relaxed),
            },
            errors,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            image_count: AtomicU64::new(0),
            video_count: AtomicU64::new(0),
            video_frames: AtomicU64::new(0),
            errors: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub pid: u32,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub error_rate: f64,
    pub avg_latency_ms: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub media: MediaMetrics,
    pub errors: Vec<ErrorCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMetrics {
    pub images: u64,
    pub videos: u64,
    pub video_frames: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCount {
    pub code: ErrorCode,
    pub count: u64,
}

/// Timer for tracking request latency
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = Metrics::new();
        metrics.record_success(MediaKind::Image, 100, 40, 1, 10);
        metrics.record_success(MediaKind::Video, 1000, 500, 12, 30);
        metrics.record_failure(ErrorCode::CorruptInput, 7, 2);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.successful_requests, 2);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.avg_latency_ms, 14);
        assert_eq!(snap.bytes_in, 1107);
        assert_eq!(snap.bytes_out, 540);
        assert_eq!(snap.media.images, 1);
        assert_eq!(snap.media.videos, 1);
        assert_eq!(snap.media.video_frames, 12);

        let corrupt = snap.errors.iter().find(|e| e.code == ErrorCode::CorruptInput).unwrap();
        assert_eq!(corrupt.count, 1);
        assert_eq!(snap.errors.len(), ErrorCode::ALL.len());
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = Metrics::default().snapshot();
        assert_eq!(snap.error_rate, 0.0);
        assert_eq!(snap.avg_latency_ms, 0);
    }
}
