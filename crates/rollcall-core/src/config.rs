//! Pipeline configuration.
//!
//! Every numeric gate in the pipeline is a named field with a documented
//! default. The defaults are empirically tuned, not physically derived, and
//! are expected to be retuned per deployment and camera hardware.

use serde::{Deserialize, Serialize};

/// Match threshold policy selected by the caller per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Tightest distance ceiling — for high-stakes operations.
    Strict,
    /// Standard ceiling.
    #[default]
    Default,
    /// Loosest ceiling.
    Relaxed,
}

impl std::str::FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(MatchPolicy::Strict),
            "default" | "" => Ok(MatchPolicy::Default),
            "relaxed" => Ok(MatchPolicy::Relaxed),
            other => Err(format!("unknown match policy '{other}'")),
        }
    }
}

/// Decode and image-quality gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Smallest accepted frame edge, in pixels. Default 30.
    pub min_dimension: u32,
    /// Largest accepted frame edge, in pixels — bounds per-stage work.
    /// Default 4096.
    pub max_dimension: u32,
    /// Laplacian-variance floor below which a frame is rejected as blurred.
    /// Default 100.0 on an 8-bit intensity scale.
    pub min_sharpness: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_dimension: 30,
            max_dimension: 4096,
            min_sharpness: 100.0,
        }
    }
}

/// Face and eye location settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Minimum accepted face edge in pixels; candidates below this are
    /// discarded before the face-count policy is applied. Default 30.
    pub min_face_size: u32,
    /// Pyramid shrink factor per scale step. Default 0.9 (10% per step).
    pub pyramid_scale_factor: f32,
    /// Sliding-window step for the cascade, in pixels. Default 4.
    pub slide_window_step: u32,
    /// Cascade classifier score threshold. Default 2.0.
    pub score_threshold: f64,
    /// Minimum eye window edge in pixels. Default 12.
    pub min_eye_size: u32,
    /// Intensity margin by which an eye window must sit below the eye-band
    /// mean to classify as positive. Default 15.0.
    pub eye_contrast_margin: f64,
    /// Overlapping positive windows required for an eye cluster to count as
    /// a detection. Default 5.
    pub min_eye_neighbors: usize,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            min_face_size: 30,
            pyramid_scale_factor: 0.9,
            slide_window_step: 4,
            score_threshold: 2.0,
            min_eye_size: 12,
            eye_contrast_margin: 15.0,
            min_eye_neighbors: 5,
        }
    }
}

/// Anti-spoofing battery thresholds, one group per technique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoofConfig {
    /// Technique 1: Laplacian-variance floor for the face crop. Default 100.0.
    pub face_sharpness_floor: f64,
    /// Technique 2: variance ceiling for the high-pass filter response.
    /// Default 2000.0.
    pub highfreq_variance_ceiling: f64,
    /// Technique 3: a hue bin is a peak when it exceeds this factor times the
    /// mean bin height. Default 3.0.
    pub hue_peak_factor: f64,
    /// Technique 3: minimum peak count for a natural gamut. Default 5.
    pub min_hue_peaks: usize,
    /// Technique 4: gradient magnitude at or above this value marks an edge
    /// pixel. Default 128.0.
    pub edge_magnitude_floor: f64,
    /// Technique 4: fraction of a row/column that must be edge pixels to form
    /// a border line. Default 0.5.
    pub edge_line_fraction: f64,
    /// Technique 4: rectangle area fraction of the frame at which a border is
    /// treated as a device bezel. Default 0.3.
    pub border_area_fraction: f64,
    /// Technique 5: brightness standard-deviation floor. Default 20.0.
    pub brightness_std_floor: f64,
    /// Technique 6: ceiling on the 8-aligned spectral magnitude ratio.
    /// Default 0.1.
    pub block_energy_ceiling: f64,
}

impl Default for SpoofConfig {
    fn default() -> Self {
        Self {
            face_sharpness_floor: 100.0,
            highfreq_variance_ceiling: 2000.0,
            hue_peak_factor: 3.0,
            min_hue_peaks: 5,
            edge_magnitude_floor: 128.0,
            edge_line_fraction: 0.5,
            border_area_fraction: 0.3,
            brightness_std_floor: 20.0,
            block_energy_ceiling: 0.1,
        }
    }
}

/// Match decision thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Embedding distance ceiling under [`MatchPolicy::Strict`]. Default 0.3.
    pub strict_distance: f32,
    /// Embedding distance ceiling under [`MatchPolicy::Default`]. Default 0.4.
    pub default_distance: f32,
    /// Embedding distance ceiling under [`MatchPolicy::Relaxed`]. Default 0.5.
    pub relaxed_distance: f32,
    /// Histogram correlation floor for the fallback strategy. Default 0.7.
    pub histogram_correlation_floor: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            strict_distance: 0.3,
            default_distance: 0.4,
            relaxed_distance: 0.5,
            histogram_correlation_floor: 0.7,
        }
    }
}

impl MatchConfig {
    /// Distance ceiling for the given policy.
    pub fn distance_threshold(&self, policy: MatchPolicy) -> f32 {
        match policy {
            MatchPolicy::Strict => self.strict_distance,
            MatchPolicy::Default => self.default_distance,
            MatchPolicy::Relaxed => self.relaxed_distance,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub quality: QualityConfig,
    pub locator: LocatorConfig,
    pub spoof: SpoofConfig,
    pub matching: MatchConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!("strict".parse::<MatchPolicy>(), Ok(MatchPolicy::Strict));
        assert_eq!("default".parse::<MatchPolicy>(), Ok(MatchPolicy::Default));
        assert_eq!("".parse::<MatchPolicy>(), Ok(MatchPolicy::Default));
        assert_eq!("relaxed".parse::<MatchPolicy>(), Ok(MatchPolicy::Relaxed));
        assert!("paranoid".parse::<MatchPolicy>().is_err());
    }

    #[test]
    fn test_threshold_layering() {
        let cfg = MatchConfig::default();
        assert!(cfg.strict_distance < cfg.default_distance);
        assert!(cfg.default_distance < cfg.relaxed_distance);
        assert_eq!(cfg.distance_threshold(MatchPolicy::Strict), 0.3);
        assert_eq!(cfg.distance_threshold(MatchPolicy::Default), 0.4);
        assert_eq!(cfg.distance_threshold(MatchPolicy::Relaxed), 0.5);
    }
}
