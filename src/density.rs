//! Crowd density readings and their per-request summary
//!
//! The heatmap stage measures every frame it draws: the mean active fraction
//! over its cell lattice plus the total active pixel count. A request folds
//! those readings into a [`DensitySummary`] that rides along in the receipt.
//!
//! Readings are smoothed over the last [`SMOOTHING_WINDOW`] frames before they
//! are compared with the threshold, so one noisy frame does not flip a clip to
//! `over`.

use serde::Serialize;
use std::collections::VecDeque;

/// Frames averaged into the smoothed density
pub const SMOOTHING_WINDOW: usize = 15;

/// Active pixels attributed to one person before the overcount correction
const PIXELS_PER_PERSON: u64 = 800;
const OVERCOUNT_FACTOR: f64 = 3.5;

/// What a measuring stage saw in one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DensityReading {
    /// Mean active fraction over the cell lattice, 0.0-1.0
    pub density: f32,
    /// Active pixels in the whole frame
    pub active_pixels: u64,
}

impl DensityReading {
    /// Rough head count; never below one
    pub fn estimated_people(&self) -> u32 {
        let raw = (self.active_pixels / PIXELS_PER_PERSON).max(1);
        ((raw as f64 / OVERCOUNT_FACTOR) as u32).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DensityStatus {
    Clear,
    Over,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DensitySummary {
    /// Frames that produced a reading
    pub frames: u64,
    pub mean_density: f32,
    pub peak_density: f32,
    pub peak_people: u32,
    pub threshold: f32,
    /// Frames whose smoothed density exceeded the threshold
    pub frames_over: u64,
    /// State at the last frame
    pub status: DensityStatus,
}

/// Accumulates readings for one request
#[derive(Debug)]
pub struct DensityMeter {
    threshold: f32,
    window: VecDeque<f32>,
    frames: u64,
    sum: f64,
    peak_density: f32,
    peak_people: u32,
    frames_over: u64,
    last: Option<f32>,
}

impl DensityMeter {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            window: VecDeque::with_capacity(SMOOTHING_WINDOW),
            frames: 0,
            sum: 0.0,
            peak_density: 0.0,
            peak_people: 0,
            frames_over: 0,
            last: None,
        }
    }

    pub fn record(&mut self, reading: DensityReading) {
        if self.window.len() == SMOOTHING_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(reading.density);
        let smoothed = self.window.iter().sum::<f32>() / self.window.len() as f32;

        self.frames += 1;
        self.sum += smoothed as f64;
        self.peak_density = self.peak_density.max(smoothed);
        self.peak_people = self.peak_people.max(reading.estimated_people());
        if smoothed > self.threshold {
            self.frames_over += 1;
        }
        self.last = Some(smoothed);
    }

    /// `None` when no stage measured anything
    pub fn summary(&self) -> Option<DensitySummary> {
        let last = self.last?;
        Some(DensitySummary {
            frames: self.frames,
            mean_density: (self.sum / self.frames as f64) as f32,
            peak_density: self.peak_density,
            peak_people: self.peak_people,
            threshold: self.threshold,
            frames_over: self.frames_over,
            status: if last > self.threshold {
                DensityStatus::Over
            } else {
                DensityStatus::Clear
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(density: f32, active_pixels: u64) -> DensityReading {
        DensityReading {
            density,
            active_pixels,
        }
    }

    #[test]
    fn test_people_estimate() {
        assert_eq!(reading(0.0, 0).estimated_people(), 1);
        assert_eq!(reading(0.1, 2_800).estimated_people(), 1);
        // 28_000 / 800 = 35, / 3.5 = 10
        assert_eq!(reading(0.5, 28_000).estimated_people(), 10);
    }

    #[test]
    fn test_no_readings_no_summary() {
        assert!(DensityMeter::new(0.45).summary().is_none());
    }

    #[test]
    fn test_single_frame_summary() {
        let mut meter = DensityMeter::new(0.45);
        meter.record(reading(0.6, 28_000));
        let summary = meter.summary().unwrap();
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.mean_density, 0.6);
        assert_eq!(summary.peak_density, 0.6);
        assert_eq!(summary.peak_people, 10);
        assert_eq!(summary.frames_over, 1);
        assert_eq!(summary.status, DensityStatus::Over);
    }

    #[test]
    fn test_one_spike_is_smoothed_away() {
        let mut meter = DensityMeter::new(0.45);
        for _ in 0..9 {
            meter.record(reading(0.1, 100));
        }
        meter.record(reading(1.0, 100));
        let summary = meter.summary().unwrap();
        // (9 * 0.1 + 1.0) / 10 = 0.19
        assert!((summary.peak_density - 0.19).abs() < 1e-4);
        assert_eq!(summary.frames_over, 0);
        assert_eq!(summary.status, DensityStatus::Clear);
    }

    #[test]
    fn test_window_forgets_old_frames() {
        let mut meter = DensityMeter::new(0.5);
        for _ in 0..SMOOTHING_WINDOW {
            meter.record(reading(1.0, 0));
        }
        for _ in 0..SMOOTHING_WINDOW {
            meter.record(reading(0.0, 0));
        }
        let summary = meter.summary().unwrap();
        assert_eq!(summary.frames, 2 * SMOOTHING_WINDOW as u64);
        assert_eq!(summary.peak_density, 1.0);
        assert_eq!(summary.status, DensityStatus::Clear);
        assert!(summary.frames_over > 0 && summary.frames_over < summary.frames);
    }
}
