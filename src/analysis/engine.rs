//! # Relational Analysis Engine
//!
//! Looks at how feature records relate to each other over time rather than at
//! any single record. Each pass produces four views:
//!
//! - **Transitions**: the last few records; deltas, smoothness, acceleration
//! - **Trends**: normalized regression slopes across the sliding window
//! - **Patterns**: recurring amplitude peaks across the full session history
//! - **Predictions**: one-step extrapolation and drop/buildup/break likelihoods
//!
//! ## Ownership:
//! The analyzer owns its sliding window outright. The full history is a shared
//! handle: the analyzer is its only writer, while HTTP handlers and WebSocket
//! actors read snapshots of it for time-window queries.

use super::history::{FullHistory, SlidingWindow};
use super::report::{
    AnalysisReport, DetectedPattern, EnergyChange, EnergyDirection, PatternAnalysis, PatternKind,
    PredictionAnalysis, TransitionAnalysis, TrendAnalysis,
};
use super::stats::{find_peaks, linear_regression, mean, normalized_trend, std_dev, variance};
use crate::audio::FeatureRecord;

/// Records inspected for transitions.
const TRANSITION_SPAN: usize = 5;
/// Records needed before any trend or prediction is computed.
const MIN_TREND_RECORDS: usize = 3;
/// Records needed before energy-change and drop estimates kick in.
const MIN_EVENT_RECORDS: usize = 5;
/// Below this history length the pattern section is left empty.
const MIN_PATTERN_HISTORY: usize = 8;
/// Below this history length no peak detection is attempted.
const MIN_DETECTION_HISTORY: usize = 16;
/// Most recent records searched for amplitude peaks.
const PATTERN_SPAN: usize = 40;
const MIN_PEAK_DISTANCE: usize = 2;

const DIRECTION_THRESHOLD: f64 = 0.05;

/// Sliding-window analyzer fed one record at a time by a session's production task.
pub struct RelationalAnalyzer {
    window: SlidingWindow,
    history: FullHistory,
    chunk_duration_seconds: f64,
}

impl RelationalAnalyzer {
    pub fn new(window_size: usize, chunk_duration_seconds: f64, history: FullHistory) -> Self {
        Self {
            window: SlidingWindow::new(window_size),
            history,
            chunk_duration_seconds,
        }
    }

    /// Append a record to both the sliding window and the full history.
    pub fn add_record(&mut self, record: FeatureRecord) {
        self.history.append(record.clone());
        self.window.push(record);
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn history(&self) -> &FullHistory {
        &self.history
    }

    /// Run one analysis pass, or `None` while the window holds fewer than two records.
    pub fn analyze(&self) -> Option<AnalysisReport> {
        if self.window.len() < 2 {
            return None;
        }

        let records: Vec<&FeatureRecord> = self.window.iter().collect();
        let latest = records[records.len() - 1];
        let band_count = latest.frequency_bands.len();

        Some(AnalysisReport {
            analysis_timestamp: latest.timestamp,
            transitions: analyze_transitions(&records, band_count),
            trends: analyze_trends(&records, band_count),
            patterns: self.analyze_patterns(),
            predictions: predict(&records),
            window_size: records.len(),
            history_size: self.history.len(),
        })
    }

    fn analyze_patterns(&self) -> PatternAnalysis {
        let history_len = self.history.len();
        if history_len < MIN_PATTERN_HISTORY {
            return PatternAnalysis::default();
        }

        let patterns = if history_len < MIN_DETECTION_HISTORY {
            Vec::new()
        } else {
            let amplitudes: Vec<f64> = self
                .history
                .tail(PATTERN_SPAN)
                .iter()
                .map(|r| r.amplitude)
                .collect();
            detect_rhythmic_patterns(&amplitudes, self.chunk_duration_seconds)
        };

        summarize_patterns(patterns, self.chunk_duration_seconds)
    }
}

fn series(records: &[&FeatureRecord], field: impl Fn(&FeatureRecord) -> f64) -> Vec<f64> {
    records.iter().map(|&r| field(r)).collect()
}

fn band_series(records: &[&FeatureRecord], band: usize) -> Vec<f64> {
    series(records, |r| r.frequency_bands.get(band).copied().unwrap_or(0.0))
}

/// Mean of amplitude, brightness and beat strength per record.
fn energy_scores(records: &[&FeatureRecord]) -> Vec<f64> {
    series(records, |r| (r.amplitude + r.brightness + r.beat_strength) / 3.0)
}

fn analyze_transitions(records: &[&FeatureRecord], band_count: usize) -> TransitionAnalysis {
    if records.len() < 2 {
        return TransitionAnalysis::neutral(band_count);
    }

    let recent = &records[records.len().saturating_sub(TRANSITION_SPAN)..];
    let current = recent[recent.len() - 1];
    let previous = recent[recent.len() - 2];

    let amplitudes = series(recent, |r| r.amplitude);
    let steps: Vec<f64> = amplitudes.windows(2).map(|w| w[1] - w[0]).collect();

    let abs_steps: Vec<f64> = steps.iter().map(|s| s.abs()).collect();
    let transition_smoothness = (1.0 / (1.0 + 10.0 * variance(&abs_steps))).clamp(0.0, 1.0);

    let accelerations: Vec<f64> = steps.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    let change_velocity = mean(&accelerations);

    let net_change = amplitudes[amplitudes.len() - 1] - amplitudes[0];
    let energy_direction = if net_change > DIRECTION_THRESHOLD {
        EnergyDirection::Increasing
    } else if net_change < -DIRECTION_THRESHOLD {
        EnergyDirection::Decreasing
    } else {
        EnergyDirection::Stable
    };

    TransitionAnalysis {
        amplitude_delta: current.amplitude - previous.amplitude,
        brightness_delta: current.brightness - previous.brightness,
        beat_strength_delta: current.beat_strength - previous.beat_strength,
        frequency_deltas: current
            .frequency_bands
            .iter()
            .zip(&previous.frequency_bands)
            .map(|(now, before)| now - before)
            .collect(),
        transition_smoothness,
        change_velocity,
        energy_direction,
    }
}

fn analyze_trends(records: &[&FeatureRecord], band_count: usize) -> TrendAnalysis {
    if records.len() < MIN_TREND_RECORDS {
        return TrendAnalysis::flat(band_count);
    }

    let amplitudes = series(records, |r| r.amplitude);
    let trend_strength = linear_regression(&amplitudes)
        .and_then(|fit| fit.r)
        .map(f64::abs)
        .unwrap_or(0.0);

    TrendAnalysis {
        amplitude_trend: normalized_trend(&amplitudes),
        brightness_trend: normalized_trend(&series(records, |r| r.brightness)),
        beat_strength_trend: normalized_trend(&series(records, |r| r.beat_strength)),
        frequency_trends: (0..band_count)
            .map(|band| normalized_trend(&band_series(records, band)))
            .collect(),
        overall_energy_trend: normalized_trend(&energy_scores(records)),
        trend_strength,
        volatility: std_dev(&amplitudes),
    }
}

/// Regular amplitude peaks in `amplitudes`, reported in seconds.
///
/// Needs at least three peaks at or above the slice mean, at least two records
/// apart. A pattern is "strong" (1.0) when the peak spacing varies by less
/// than one record.
fn detect_rhythmic_patterns(amplitudes: &[f64], chunk_duration_seconds: f64) -> Vec<DetectedPattern> {
    let peaks = find_peaks(amplitudes, mean(amplitudes), MIN_PEAK_DISTANCE);
    if peaks.len() < 3 {
        return Vec::new();
    }

    let distances: Vec<f64> = peaks.windows(2).map(|w| (w[1] - w[0]) as f64).collect();
    let regular = std_dev(&distances) < 1.0;
    let last_peak = peaks[peaks.len() - 1];

    vec![DetectedPattern {
        kind: PatternKind::Rhythmic,
        period: mean(&distances) * chunk_duration_seconds,
        strength: if regular { 1.0 } else { 0.0 },
        last_occurrence: last_peak as f64 * chunk_duration_seconds,
    }]
}

fn summarize_patterns(patterns: Vec<DetectedPattern>, chunk_duration_seconds: f64) -> PatternAnalysis {
    if patterns.is_empty() {
        return PatternAnalysis::default();
    }

    let strengths: Vec<f64> = patterns.iter().map(|p| p.strength).collect();
    let count = patterns.len() as f64;

    // First of equally strong patterns wins.
    let strongest = patterns
        .iter()
        .fold(None::<&DetectedPattern>, |best, p| match best {
            Some(b) if b.strength >= p.strength => Some(b),
            _ => Some(p),
        });
    let cycle_length = strongest
        .filter(|p| p.period > 0.0)
        .map(|p| (p.period / chunk_duration_seconds).round() as usize);

    let pattern_confidence =
        (strengths.iter().sum::<f64>() / count * (count / 3.0).min(1.0)).clamp(0.0, 1.0);

    PatternAnalysis {
        pattern_strength: mean(&strengths),
        cycle_length,
        pattern_confidence,
        detected_patterns: patterns,
    }
}

/// One step past the end of the fitted line, clamped to [0, 1].
fn extrapolate(values: &[f64]) -> f64 {
    match linear_regression(values) {
        Some(fit) => fit.at(values.len() as f64).clamp(0.0, 1.0),
        None => values.first().copied().unwrap_or(0.0),
    }
}

fn predict(records: &[&FeatureRecord]) -> PredictionAnalysis {
    if records.len() < MIN_TREND_RECORDS {
        return PredictionAnalysis::neutral();
    }

    let overall_trend = normalized_trend(&energy_scores(records));
    let latest_amplitude = records[records.len() - 1].amplitude;

    let break_probability = if latest_amplitude < 0.3 && overall_trend < -0.1 {
        overall_trend.abs().clamp(0.0, 1.0)
    } else {
        0.0
    };

    PredictionAnalysis {
        predicted_amplitude: extrapolate(&series(records, |r| r.amplitude)),
        predicted_brightness: extrapolate(&series(records, |r| r.brightness)),
        predicted_beat_strength: extrapolate(&series(records, |r| r.beat_strength)),
        predicted_energy_change: predict_energy_change(records),
        drop_probability: drop_probability(records, overall_trend),
        buildup_probability: overall_trend.clamp(0.0, 1.0),
        break_probability,
    }
}

fn predict_energy_change(records: &[&FeatureRecord]) -> EnergyChange {
    if records.len() < MIN_EVENT_RECORDS {
        return EnergyChange::Stable;
    }

    let recent_trend = normalized_trend(&energy_scores(&records[records.len() - MIN_EVENT_RECORDS..]));
    let current_amplitude = records[records.len() - 1].amplitude;

    if recent_trend > 0.3 && current_amplitude > 0.7 {
        EnergyChange::Drop
    } else if recent_trend > 0.1 {
        EnergyChange::Buildup
    } else if recent_trend < -0.2 {
        EnergyChange::Breakdown
    } else {
        EnergyChange::Stable
    }
}

/// Loud, punchy and still rising: each cue adds its weight.
fn drop_probability(records: &[&FeatureRecord], overall_trend: f64) -> f64 {
    if records.len() < MIN_EVENT_RECORDS {
        return 0.0;
    }

    let last_three = &records[records.len() - 3..];
    let mut probability = 0.0;
    if mean(&series(last_three, |r| r.amplitude)) > 0.7 {
        probability += 0.3;
    }
    if mean(&series(last_three, |r| r.beat_strength)) > 0.6 {
        probability += 0.3;
    }
    if overall_trend > 0.2 {
        probability += 0.4;
    }
    f64::clamp(probability, 0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sequencer::tests::record_at;

    fn analyzer_with(amplitudes: &[f64], window_size: usize) -> RelationalAnalyzer {
        let mut analyzer = RelationalAnalyzer::new(window_size, 0.2, FullHistory::new());
        for (i, &amplitude) in amplitudes.iter().enumerate() {
            analyzer.add_record(record_at(i as f64 * 0.2, amplitude));
        }
        analyzer
    }

    #[test]
    fn test_needs_two_records() {
        assert!(analyzer_with(&[], 25).analyze().is_none());
        assert!(analyzer_with(&[0.4], 25).analyze().is_none());

        let report = analyzer_with(&[0.4, 0.5], 25).analyze().unwrap();
        assert_eq!(report.window_size, 2);
        // two records: transitions computed, trends and predictions default
        assert!((report.transitions.amplitude_delta - 0.1).abs() < 1e-9);
        assert_eq!(report.trends, TrendAnalysis::flat(4));
        assert_eq!(report.predictions, PredictionAnalysis::neutral());
    }

    #[test]
    fn test_constant_amplitude_is_flat_and_stable() {
        let report = analyzer_with(&[0.2; 10], 25).analyze().unwrap();

        assert_eq!(report.trends.amplitude_trend, 0.0);
        assert!(report.trends.volatility.abs() < 1e-12);
        assert_eq!(report.trends.trend_strength, 0.0);
        assert_eq!(report.transitions.energy_direction, EnergyDirection::Stable);
        assert_eq!(report.transitions.transition_smoothness, 1.0);
        assert_eq!(report.predictions.predicted_energy_change, EnergyChange::Stable);
        assert_eq!(report.predictions.drop_probability, 0.0);
        assert!((report.predictions.predicted_amplitude - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_rising_energy_with_strong_beats_predicts_drop() {
        let mut analyzer = RelationalAnalyzer::new(25, 0.2, FullHistory::new());
        for i in 0..10 {
            let mut record = record_at(i as f64 * 0.2, 0.1 + 0.8 * i as f64 / 9.0);
            record.beat_strength = if i >= 7 { 0.9 } else { 0.2 };
            analyzer.add_record(record);
        }

        let report = analyzer.analyze().unwrap();
        let predictions = &report.predictions;
        assert!(predictions.drop_probability > 0.5);
        assert!((predictions.drop_probability - 1.0).abs() < 1e-9);
        assert!(report.trends.amplitude_trend > 0.9);
        assert_eq!(report.transitions.energy_direction, EnergyDirection::Increasing);
        assert_eq!(predictions.predicted_energy_change, EnergyChange::Drop);
        assert!(predictions.buildup_probability > 0.0);
        assert_eq!(predictions.break_probability, 0.0);
    }

    #[test]
    fn test_falling_quiet_section_predicts_break() {
        let amplitudes: Vec<f64> = (0..10).map(|i| 0.8 - 0.07 * i as f64).collect();
        let mut analyzer = RelationalAnalyzer::new(25, 0.2, FullHistory::new());
        for (i, &amplitude) in amplitudes.iter().enumerate() {
            let mut record = record_at(i as f64 * 0.2, amplitude);
            record.brightness = amplitude;
            analyzer.add_record(record);
        }

        let predictions = analyzer.analyze().unwrap().predictions;
        assert_eq!(predictions.predicted_energy_change, EnergyChange::Breakdown);
        assert!(predictions.break_probability > 0.0);
        assert_eq!(predictions.buildup_probability, 0.0);
    }

    #[test]
    fn test_window_is_bounded_but_history_is_not() {
        let analyzer = analyzer_with(&[0.5; 60], 25);
        let report = analyzer.analyze().unwrap();
        assert_eq!(analyzer.window_len(), 25);
        assert_eq!(report.window_size, 25);
        assert_eq!(report.history_size, 60);
        assert_eq!(analyzer.history().len(), 60);
    }

    #[test]
    fn test_values_stay_in_range() {
        let amplitudes: Vec<f64> = (0..30).map(|i| ((i * 7) % 10) as f64 / 10.0).collect();
        let report = analyzer_with(&amplitudes, 25).analyze().unwrap();

        let trends = &report.trends;
        for trend in [
            trends.amplitude_trend,
            trends.brightness_trend,
            trends.beat_strength_trend,
            trends.overall_energy_trend,
        ]
        .iter()
        .chain(&trends.frequency_trends)
        {
            assert!((-1.0..=1.0).contains(trend));
        }
        let predictions = &report.predictions;
        for probability in [
            predictions.drop_probability,
            predictions.buildup_probability,
            predictions.break_probability,
            report.transitions.transition_smoothness,
        ] {
            assert!((0.0..=1.0).contains(&probability));
        }
    }

    #[test]
    fn test_patterns_need_sixteen_records() {
        let pulse: Vec<f64> = [0.9, 0.2, 0.3, 0.2].repeat(10);

        let below_minimum = analyzer_with(&pulse[..7], 25).analyze().unwrap();
        assert_eq!(below_minimum.patterns, PatternAnalysis::default());

        let no_detection = analyzer_with(&pulse[..15], 25).analyze().unwrap();
        assert!(no_detection.patterns.detected_patterns.is_empty());
        assert!(no_detection.patterns.cycle_length.is_none());

        let detected = analyzer_with(&pulse[..16], 25).analyze().unwrap();
        assert_eq!(detected.patterns.detected_patterns.len(), 1);
    }

    #[test]
    fn test_regular_pulse_is_detected() {
        let pulse: Vec<f64> = [0.9, 0.2, 0.3, 0.2].repeat(10);
        let patterns = analyzer_with(&pulse, 25).analyze().unwrap().patterns;

        assert_eq!(patterns.detected_patterns.len(), 1);
        let pattern = &patterns.detected_patterns[0];
        assert_eq!(pattern.kind, PatternKind::Rhythmic);
        assert!((pattern.period - 0.8).abs() < 1e-9);
        assert_eq!(pattern.strength, 1.0);
        assert!((pattern.last_occurrence - 7.2).abs() < 1e-9);
        assert_eq!(patterns.cycle_length, Some(4));
        assert_eq!(patterns.pattern_strength, 1.0);
        assert!((patterns.pattern_confidence - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_irregular_peaks_are_weak() {
        let amplitudes = [0.1, 0.9, 0.1, 0.9, 0.1, 0.1, 0.1, 0.1, 0.1, 0.9, 0.1, 0.1];
        let patterns = detect_rhythmic_patterns(&amplitudes, 0.2);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].strength, 0.0);

        let summary = summarize_patterns(patterns, 0.2);
        assert_eq!(summary.pattern_confidence, 0.0);
        assert_eq!(summary.cycle_length, Some(4));
    }

    #[test]
    fn test_report_serializes_pattern_type_field() {
        let pulse: Vec<f64> = [0.9, 0.2, 0.3, 0.2].repeat(5);
        let report = analyzer_with(&pulse, 25).analyze().unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["patterns"]["detected_patterns"][0]["type"], "rhythmic");
        assert_eq!(json["transitions"]["energy_direction"], "stable");
        // the last five records dip after a peak
        assert_eq!(json["predictions"]["predicted_energy_change"], "breakdown");
    }
}
