//! # Spectral Feature Extraction
//!
//! Turns one window of mono samples into a [`FeatureRecord`]: band energies,
//! loudness, brightness, rolloff, noisiness, pitch-class energy, and simple
//! rhythm cues. The extractor is stateless apart from a cached FFT plan, so a
//! single instance is shared by every session behind an `Arc`.
//!
//! ## Frame layout:
//! The window is cut into frames of `n_fft` samples with `hop_length` spacing,
//! each shaped by a Hann window. A window shorter than `n_fft` becomes a single
//! zero-padded frame. Spectral features use the magnitude spectrum averaged
//! over frames; flux-based features compare consecutive frames.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Number of pitch classes in the chroma vector (C, C#, ..., B).
pub const CHROMA_BINS: usize = 12;

const DEFAULT_N_FFT: usize = 2048;
const DEFAULT_HOP_LENGTH: usize = 512;
const LOWEST_BAND_HZ: f64 = 20.0;
const CHROMA_MAX_HZ: f64 = 8000.0;
const ROLLOFF_PERCENT: f64 = 0.85;
const FLATNESS_FLOOR: f64 = 1e-10;
const PERCUSSIVE_FLUX_FLOOR: f64 = 0.1;
const TEMPO_HOP: usize = 256;
const TEMPO_FRAME: usize = 512;
const MIN_BPM: f64 = 40.0;
const MAX_BPM: f64 = 240.0;

/// Audio descriptors for one window of the stream.
///
/// Field names on the wire are snake_case; the band energies go out as
/// `frequencies` because that is what the browser visualizer reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Start of the window in seconds from the beginning of the track.
    pub timestamp: f64,
    /// Per-band energies, normalized so the loudest band is 1.0.
    #[serde(rename = "frequencies")]
    pub frequency_bands: Vec<f64>,
    /// RMS level of the window, clamped to [0, 1].
    pub amplitude: f64,
    /// Spectral centroid as a fraction of the Nyquist frequency.
    pub brightness: f64,
    /// Spectral centroid in Hz.
    pub energy_center: f64,
    pub is_percussive: bool,
    /// Frequency in Hz below which 85% of the spectral magnitude lies.
    pub rolloff: f64,
    pub zero_crossing_rate: f64,
    pub spectral_flatness: f64,
    pub chroma: Vec<f64>,
    pub beat_strength: f64,
    /// Estimated tempo in BPM, 0.0 when the window is too short to tell.
    pub tempo: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtractionError {
    #[error("window contains no samples")]
    EmptyWindow,

    #[error("sample rate must be greater than 0")]
    InvalidSampleRate,

    #[error("non-finite sample value at offset {offset}")]
    NonFiniteSample { offset: usize },
}

/// Computes a [`FeatureRecord`] for one window of mono samples.
///
/// Implementations must be pure with respect to their inputs and safe to call
/// from several production tasks at once.
pub trait FeatureExtractor: Send + Sync {
    fn extract(
        &self,
        window: &[f32],
        sample_rate: u32,
        timestamp: f64,
    ) -> Result<FeatureRecord, ExtractionError>;
}

/// FFT-based extractor used by the server.
pub struct SpectralFeatureExtractor {
    n_fft: usize,
    hop_length: usize,
    band_count: usize,
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
}

impl SpectralFeatureExtractor {
    pub fn new(band_count: usize) -> Self {
        Self::with_frame_size(band_count, DEFAULT_N_FFT, DEFAULT_HOP_LENGTH)
    }

    pub fn with_frame_size(band_count: usize, n_fft: usize, hop_length: usize) -> Self {
        let n_fft = n_fft.max(2);
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);
        // Periodic Hann window, matching the usual STFT convention.
        let hann = (0..n_fft)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / n_fft as f32;
                0.5 - 0.5 * phase.cos()
            })
            .collect();

        Self {
            n_fft,
            hop_length: hop_length.max(1),
            band_count: band_count.max(1),
            fft,
            hann,
        }
    }

    pub fn band_count(&self) -> usize {
        self.band_count
    }

    fn bin_count(&self) -> usize {
        self.n_fft / 2 + 1
    }

    fn bin_frequency(&self, bin: usize, sample_rate: u32) -> f64 {
        bin as f64 * sample_rate as f64 / self.n_fft as f64
    }

    /// Magnitude spectrum of each frame, `bin_count()` values per frame.
    fn magnitude_frames(&self, samples: &[f32]) -> Vec<Vec<f64>> {
        let frame_count = if samples.len() <= self.n_fft {
            1
        } else {
            (samples.len() - self.n_fft) / self.hop_length + 1
        };

        let mut buffer = vec![Complex::new(0.0f32, 0.0f32); self.n_fft];
        (0..frame_count)
            .map(|frame| {
                let start = frame * self.hop_length;
                for (i, slot) in buffer.iter_mut().enumerate() {
                    let sample = samples.get(start + i).copied().unwrap_or(0.0);
                    *slot = Complex::new(sample * self.hann[i], 0.0);
                }
                self.fft.process(&mut buffer);
                buffer[..self.bin_count()]
                    .iter()
                    .map(|c| c.norm() as f64)
                    .collect()
            })
            .collect()
    }

    /// First FFT bin whose center frequency is at or above `frequency`.
    fn first_bin_at_or_above(&self, frequency: f64, sample_rate: u32) -> Option<usize> {
        let bin = (frequency * self.n_fft as f64 / sample_rate as f64).ceil().max(0.0) as usize;
        (bin < self.bin_count()).then_some(bin)
    }

    fn band_energies(&self, frames: &[Vec<f64>], sample_rate: u32) -> Vec<f64> {
        let nyquist = sample_rate as f64 / 2.0;
        let low = LOWEST_BAND_HZ.min(nyquist).ln();
        let high = nyquist.ln();
        let edges: Vec<f64> = (0..=self.band_count)
            .map(|i| (low + (high - low) * i as f64 / self.band_count as f64).exp())
            .collect();

        let energies: Vec<f64> = edges
            .windows(2)
            .map(|edge| {
                let start = self.first_bin_at_or_above(edge[0], sample_rate).unwrap_or(0);
                let end = self
                    .first_bin_at_or_above(edge[1], sample_rate)
                    .unwrap_or(self.bin_count() - 1);
                if end <= start {
                    return 0.0;
                }
                let total: f64 = frames
                    .iter()
                    .map(|frame| frame[start..end].iter().sum::<f64>())
                    .sum();
                total / ((end - start) * frames.len()) as f64
            })
            .collect();

        let max = energies.iter().cloned().fold(0.0, f64::max);
        let divisor = if max > 0.0 { max } else { 1.0 };
        energies.into_iter().map(|e| e / divisor).collect()
    }

    fn chroma(&self, spectrum: &[f64], sample_rate: u32) -> Vec<f64> {
        let mut chroma = vec![0.0; CHROMA_BINS];
        for (bin, magnitude) in spectrum.iter().enumerate() {
            let frequency = self.bin_frequency(bin, sample_rate);
            if !(LOWEST_BAND_HZ..=CHROMA_MAX_HZ).contains(&frequency) {
                continue;
            }
            let midi = 69.0 + 12.0 * (frequency / 440.0).log2();
            let pitch_class = (midi.round() as i64).rem_euclid(CHROMA_BINS as i64) as usize;
            chroma[pitch_class] += magnitude * magnitude;
        }

        let max = chroma.iter().cloned().fold(0.0, f64::max);
        if max > 0.0 {
            chroma.iter_mut().for_each(|c| *c /= max);
        }
        chroma
    }
}

impl FeatureExtractor for SpectralFeatureExtractor {
    fn extract(
        &self,
        window: &[f32],
        sample_rate: u32,
        timestamp: f64,
    ) -> Result<FeatureRecord, ExtractionError> {
        if window.is_empty() {
            return Err(ExtractionError::EmptyWindow);
        }
        if sample_rate == 0 {
            return Err(ExtractionError::InvalidSampleRate);
        }
        if let Some(offset) = window.iter().position(|s| !s.is_finite()) {
            return Err(ExtractionError::NonFiniteSample { offset });
        }

        let nyquist = sample_rate as f64 / 2.0;
        let frames = self.magnitude_frames(window);
        let spectrum = mean_spectrum(&frames);

        let centroid = spectral_centroid(&spectrum, |bin| self.bin_frequency(bin, sample_rate));
        let flux = spectral_flux(&frames);
        let beat_strength = flux
            .iter()
            .map(|f| f.ratio)
            .fold(0.0, f64::max)
            .clamp(0.0, 1.0);

        Ok(FeatureRecord {
            timestamp,
            frequency_bands: self.band_energies(&frames, sample_rate),
            amplitude: rms(window).clamp(0.0, 1.0),
            brightness: (centroid / nyquist).clamp(0.0, 1.0),
            energy_center: centroid,
            is_percussive: is_percussive(&flux),
            rolloff: spectral_rolloff(&spectrum, |bin| self.bin_frequency(bin, sample_rate)),
            zero_crossing_rate: zero_crossing_rate(window),
            spectral_flatness: spectral_flatness(&spectrum),
            chroma: self.chroma(&spectrum, sample_rate),
            beat_strength,
            tempo: estimate_tempo(window, sample_rate),
        })
    }
}

fn mean_spectrum(frames: &[Vec<f64>]) -> Vec<f64> {
    let bins = frames.first().map(Vec::len).unwrap_or(0);
    let mut spectrum = vec![0.0; bins];
    for frame in frames {
        for (acc, magnitude) in spectrum.iter_mut().zip(frame) {
            *acc += magnitude;
        }
    }
    let count = frames.len().max(1) as f64;
    spectrum.iter_mut().for_each(|m| *m /= count);
    spectrum
}

fn rms(samples: &[f32]) -> f64 {
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt()
}

fn spectral_centroid(spectrum: &[f64], frequency: impl Fn(usize) -> f64) -> f64 {
    let total: f64 = spectrum.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = spectrum
        .iter()
        .enumerate()
        .map(|(bin, magnitude)| frequency(bin) * magnitude)
        .sum();
    weighted / total
}

fn spectral_rolloff(spectrum: &[f64], frequency: impl Fn(usize) -> f64) -> f64 {
    let total: f64 = spectrum.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }
    let threshold = total * ROLLOFF_PERCENT;
    let mut cumulative = 0.0;
    for (bin, magnitude) in spectrum.iter().enumerate() {
        cumulative += magnitude;
        if cumulative >= threshold {
            return frequency(bin);
        }
    }
    frequency(spectrum.len().saturating_sub(1))
}

/// Geometric over arithmetic mean of the power spectrum; 1.0 is white noise.
fn spectral_flatness(spectrum: &[f64]) -> f64 {
    if spectrum.is_empty() {
        return 0.0;
    }
    let n = spectrum.len() as f64;
    let powers = spectrum.iter().map(|m| m * m + FLATNESS_FLOOR);
    let log_mean = powers.clone().map(f64::ln).sum::<f64>() / n;
    let arithmetic = powers.sum::<f64>() / n;
    (log_mean.exp() / arithmetic).clamp(0.0, 1.0)
}

fn zero_crossing_rate(samples: &[f32]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0.0) != (pair[1] >= 0.0))
        .count();
    crossings as f64 / samples.len() as f64
}

struct FluxPoint {
    flux: f64,
    /// Flux relative to the magnitude sum of the newer frame.
    ratio: f64,
}

fn spectral_flux(frames: &[Vec<f64>]) -> Vec<FluxPoint> {
    frames
        .windows(2)
        .map(|pair| {
            let flux: f64 = pair[1]
                .iter()
                .zip(&pair[0])
                .map(|(current, previous)| (current - previous).max(0.0))
                .sum();
            let magnitude: f64 = pair[1].iter().sum();
            let ratio = if magnitude > 0.0 { flux / magnitude } else { 0.0 };
            FluxPoint { flux, ratio }
        })
        .collect()
}

/// A transient stands out from the rest of the window's flux envelope.
fn is_percussive(flux: &[FluxPoint]) -> bool {
    if flux.len() < 2 {
        return false;
    }
    let values: Vec<f64> = flux.iter().map(|f| f.flux).collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let threshold = mean + 1.5 * variance.sqrt();

    flux.iter()
        .any(|point| point.flux > threshold && point.ratio > PERCUSSIVE_FLUX_FLOOR)
}

/// Autocorrelation of the onset envelope over the 40–240 BPM lag range.
fn estimate_tempo(samples: &[f32], sample_rate: u32) -> f64 {
    if samples.len() < TEMPO_FRAME {
        return 0.0;
    }
    let frames_per_second = sample_rate as f64 / TEMPO_HOP as f64;
    let min_lag = (60.0 / MAX_BPM * frames_per_second).ceil() as usize;
    let max_lag = (60.0 / MIN_BPM * frames_per_second).floor() as usize;

    let energy: Vec<f64> = (0..=(samples.len() - TEMPO_FRAME) / TEMPO_HOP)
        .map(|frame| {
            let start = frame * TEMPO_HOP;
            samples[start..start + TEMPO_FRAME]
                .iter()
                .map(|&s| (s as f64) * (s as f64))
                .sum()
        })
        .collect();
    let onsets: Vec<f64> = energy
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).max(0.0))
        .collect();

    if min_lag == 0 || onsets.len() <= min_lag {
        return 0.0;
    }

    let max_lag = max_lag.min(onsets.len() - 1);
    let mut best: Option<(usize, f64)> = None;
    for lag in min_lag..=max_lag {
        let score: f64 = onsets.iter().zip(&onsets[lag..]).map(|(a, b)| a * b).sum();
        if score > best.map(|(_, s)| s).unwrap_or(0.0) {
            best = Some((lag, score));
        }
    }

    best.map(|(lag, _)| 60.0 * frames_per_second / lag as f64)
        .unwrap_or(0.0)
}
