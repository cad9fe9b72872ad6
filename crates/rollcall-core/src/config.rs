//! Tunable recognition and attendance parameters.
//!
//! Every threshold here is configuration, not contract. Defaults match the
//! CLAHE + Gaussian blur + strict detector revision of the pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionConfig {
    /// Distance threshold for live attendance streams bound to a session.
    pub attendance_threshold: f64,
    /// Distance threshold for the unbound preview stream.
    pub preview_threshold: f64,
    /// Distance threshold for single-frame attendance submissions.
    pub frame_threshold: f64,
    /// Distance threshold for the duplicate-registration check.
    pub duplicate_threshold: f64,
    /// Confidence above which a different identity blocks a registration.
    pub duplicate_min_confidence: f64,
    /// Width the detector downscales frames to.
    pub detect_width: u32,
    /// Minimum face side length, in detection-frame pixels.
    pub min_face_size: u32,
    /// Retrain requests within this window of the last training are coalesced.
    pub train_debounce_secs: f64,
    /// Repeat marks for the same (identity, session) within this window skip the store.
    pub cooldown_secs: f64,
    /// Minimum gap between two notifications for the same (identity, session).
    pub notify_secs: f64,
    /// Cooldown entries idle for longer than this are evicted.
    pub cooldown_eviction_secs: f64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            attendance_threshold: 48.0,
            preview_threshold: 45.0,
            frame_threshold: 42.0,
            duplicate_threshold: 35.0,
            duplicate_min_confidence: 70.0,
            detect_width: 400,
            min_face_size: 40,
            train_debounce_secs: 5.0,
            cooldown_secs: 10.0,
            notify_secs: 2.0,
            cooldown_eviction_secs: 300.0,
        }
    }
}

impl RecognitionConfig {
    pub fn train_debounce(&self) -> Duration {
        Duration::from_secs_f64(self.train_debounce_secs.max(0.0))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_secs.max(0.0))
    }

    pub fn notify_window(&self) -> Duration {
        Duration::from_secs_f64(self.notify_secs.max(0.0))
    }

    pub fn cooldown_eviction(&self) -> Duration {
        Duration::from_secs_f64(self.cooldown_eviction_secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_check_stricter_than_attendance() {
        let cfg = RecognitionConfig::default();
        assert!(cfg.duplicate_threshold < cfg.frame_threshold);
        assert!(cfg.frame_threshold < cfg.attendance_threshold);
    }

    #[test]
    fn test_notify_window_shorter_than_cooldown() {
        let cfg = RecognitionConfig::default();
        assert!(cfg.notify_window() < cfg.cooldown());
        assert!(cfg.cooldown() < cfg.cooldown_eviction());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: RecognitionConfig =
            serde_json::from_str(r#"{"attendance_threshold": 50.0}"#).unwrap();
        assert_eq!(cfg.attendance_threshold, 50.0);
        assert_eq!(cfg.cooldown_secs, 10.0);
    }
}
