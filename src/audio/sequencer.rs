//! Lazy, forward-only iteration over fixed-length windows of a decoded track.

use std::iter::FusedIterator;
use std::sync::Arc;
use thiserror::Error;

use super::features::{ExtractionError, FeatureExtractor, FeatureRecord};

/// Extraction failed for one window; the sequence ends after this.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("feature extraction failed for window {position} ({timestamp:.3}s): {source}")]
pub struct SequenceError {
    pub position: usize,
    pub timestamp: f64,
    #[source]
    pub source: ExtractionError,
}

/// Number of samples in one window. Truncates, so 0.2s at 44.1kHz is 8820.
pub fn window_samples(chunk_duration_seconds: f64, sample_rate: u32) -> usize {
    (chunk_duration_seconds * sample_rate as f64) as usize
}

/// Windows needed to cover `total_samples`, counting a short final window.
pub fn window_count(total_samples: usize, window_samples: usize) -> usize {
    if window_samples == 0 {
        return 0;
    }
    total_samples.div_ceil(window_samples)
}

/// Yields one [`FeatureRecord`] per window, in order.
///
/// The final window is zero-padded to full length before extraction. On the
/// first extraction failure the sequencer yields the error and then stops for
/// good; it never skips a window.
pub struct ChunkSequencer {
    samples: Arc<Vec<f32>>,
    sample_rate: u32,
    window_samples: usize,
    total_windows: usize,
    next_window: usize,
    extractor: Arc<dyn FeatureExtractor>,
    failed: bool,
}

impl ChunkSequencer {
    pub fn new(
        samples: Arc<Vec<f32>>,
        sample_rate: u32,
        chunk_duration_seconds: f64,
        extractor: Arc<dyn FeatureExtractor>,
    ) -> Self {
        let window_samples = window_samples(chunk_duration_seconds, sample_rate);
        let total_windows = window_count(samples.len(), window_samples);
        Self {
            samples,
            sample_rate,
            window_samples,
            total_windows,
            next_window: 0,
            extractor,
            failed: false,
        }
    }

    pub fn total_windows(&self) -> usize {
        self.total_windows
    }

    fn remaining(&self) -> usize {
        if self.failed {
            0
        } else {
            self.total_windows - self.next_window
        }
    }
}

impl Iterator for ChunkSequencer {
    type Item = Result<FeatureRecord, SequenceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining() == 0 {
            return None;
        }

        let position = self.next_window;
        self.next_window += 1;

        let start = position * self.window_samples;
        let end = (start + self.window_samples).min(self.samples.len());
        let timestamp = start as f64 / self.sample_rate as f64;

        let result = if end - start == self.window_samples {
            self.extractor
                .extract(&self.samples[start..end], self.sample_rate, timestamp)
        } else {
            let mut padded = vec![0.0f32; self.window_samples];
            padded[..end - start].copy_from_slice(&self.samples[start..end]);
            self.extractor.extract(&padded, self.sample_rate, timestamp)
        };

        Some(result.map_err(|source| {
            self.failed = true;
            SequenceError {
                position,
                timestamp,
                source,
            }
        }))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}

impl FusedIterator for ChunkSequencer {}
