//! Analysis report types sent to clients as `audio_analysis` messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyDirection {
    Increasing,
    Decreasing,
    Stable,
}

/// How the most recent records moved relative to each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionAnalysis {
    pub amplitude_delta: f64,
    pub brightness_delta: f64,
    pub beat_strength_delta: f64,
    pub frequency_deltas: Vec<f64>,
    pub transition_smoothness: f64,
    pub change_velocity: f64,
    pub energy_direction: EnergyDirection,
}

impl TransitionAnalysis {
    pub fn neutral(band_count: usize) -> Self {
        Self {
            amplitude_delta: 0.0,
            brightness_delta: 0.0,
            beat_strength_delta: 0.0,
            frequency_deltas: vec![0.0; band_count],
            transition_smoothness: 1.0,
            change_velocity: 0.0,
            energy_direction: EnergyDirection::Stable,
        }
    }
}

/// Normalized slopes over the sliding window, each in [-1, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub amplitude_trend: f64,
    pub brightness_trend: f64,
    pub beat_strength_trend: f64,
    pub frequency_trends: Vec<f64>,
    pub overall_energy_trend: f64,
    pub trend_strength: f64,
    pub volatility: f64,
}

impl TrendAnalysis {
    pub fn flat(band_count: usize) -> Self {
        Self {
            amplitude_trend: 0.0,
            brightness_trend: 0.0,
            beat_strength_trend: 0.0,
            frequency_trends: vec![0.0; band_count],
            overall_energy_trend: 0.0,
            trend_strength: 0.0,
            volatility: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Rhythmic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedPattern {
    #[serde(rename = "type")]
    pub kind: PatternKind,
    /// Seconds between recurring amplitude peaks.
    pub period: f64,
    pub strength: f64,
    /// Offset in seconds of the latest peak within the inspected slice.
    pub last_occurrence: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternAnalysis {
    pub detected_patterns: Vec<DetectedPattern>,
    pub pattern_strength: f64,
    /// Period of the strongest pattern, counted in records.
    pub cycle_length: Option<usize>,
    pub pattern_confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnergyChange {
    Drop,
    Buildup,
    Breakdown,
    Stable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionAnalysis {
    pub predicted_amplitude: f64,
    pub predicted_brightness: f64,
    pub predicted_beat_strength: f64,
    pub predicted_energy_change: EnergyChange,
    pub drop_probability: f64,
    pub buildup_probability: f64,
    pub break_probability: f64,
}

impl PredictionAnalysis {
    pub fn neutral() -> Self {
        Self {
            predicted_amplitude: 0.5,
            predicted_brightness: 0.5,
            predicted_beat_strength: 0.5,
            predicted_energy_change: EnergyChange::Stable,
            drop_probability: 0.0,
            buildup_probability: 0.0,
            break_probability: 0.0,
        }
    }
}

/// One relational analysis pass over the window and the full history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Timestamp of the record that triggered this pass.
    pub analysis_timestamp: f64,
    pub transitions: TransitionAnalysis,
    pub trends: TrendAnalysis,
    pub patterns: PatternAnalysis,
    pub predictions: PredictionAnalysis,
    pub window_size: usize,
    pub history_size: usize,
}
