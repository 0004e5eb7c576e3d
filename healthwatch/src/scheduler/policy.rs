//! Throughput adaptation: the quality setting and the frame-rate policy.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;

/// An external quality/throughput setting the scheduler may lower.
pub trait QualityControl: Send + Sync + 'static {
    /// Current level.
    fn level(&self) -> u32;

    /// Lowest level the setting can reach.
    fn min_level(&self) -> u32 {
        0
    }

    /// Lower the setting by one step. Returns `false` if already at the minimum.
    fn decrease(&self) -> bool;
}

/// Atomic [`QualityControl`] with a fixed floor.
#[derive(Debug)]
pub struct QualityLevel {
    level: AtomicU32,
    min: u32,
}

impl QualityLevel {
    pub fn new(level: u32, min: u32) -> Self {
        Self {
            level: AtomicU32::new(level.max(min)),
            min,
        }
    }

    pub fn set(&self, level: u32) {
        self.level.store(level.max(self.min), Ordering::Release);
    }
}

impl Default for QualityLevel {
    fn default() -> Self {
        Self::new(5, 0)
    }
}

impl QualityControl for QualityLevel {
    fn level(&self) -> u32 {
        self.level.load(Ordering::Acquire)
    }

    fn min_level(&self) -> u32 {
        self.min
    }

    fn decrease(&self) -> bool {
        self.level
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |level| {
                (level > self.min).then(|| level - 1)
            })
            .is_ok()
    }
}

/// Classification of a reported frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameRateStatus {
    Healthy,
    BelowTarget,
    Critical,
}

/// Frame-rate thresholds, in frames per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrameRatePolicy {
    pub target: f32,
    pub critical: f32,
}

impl FrameRatePolicy {
    pub fn new(target: f32, critical: f32) -> Self {
        Self { target, critical }
    }

    pub fn classify(&self, frame_rate: f32) -> FrameRateStatus {
        if frame_rate < self.critical {
            FrameRateStatus::Critical
        } else if frame_rate < self.target {
            FrameRateStatus::BelowTarget
        } else {
            FrameRateStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decrease_stops_at_minimum() {
        let quality = QualityLevel::new(2, 1);
        assert!(quality.decrease());
        assert_eq!(quality.level(), 1);
        assert!(!quality.decrease());
        assert_eq!(quality.level(), 1);
    }

    #[test]
    fn test_level_never_below_floor() {
        let quality = QualityLevel::new(0, 2);
        assert_eq!(quality.level(), 2);
        quality.set(1);
        assert_eq!(quality.level(), 2);
    }

    #[test]
    fn test_frame_rate_classification() {
        let policy = FrameRatePolicy::new(60.0, 20.0);
        assert_eq!(policy.classify(60.0), FrameRateStatus::Healthy);
        assert_eq!(policy.classify(45.0), FrameRateStatus::BelowTarget);
        assert_eq!(policy.classify(20.0), FrameRateStatus::BelowTarget);
        assert_eq!(policy.classify(19.9), FrameRateStatus::Critical);
    }
}
