//! # Audio Processing Module
//!
//! Everything between an uploaded MP3 and a stream of feature records:
//!
//! ## Key Components:
//! - **Decoder**: MP3 bytes to mono `f32` samples (symphonia)
//! - **Features**: the `FeatureExtractor` contract and the FFT-based implementation
//! - **Sequencer**: cuts the decoded track into fixed windows and extracts each one lazily
//!
//! ## Window Layout:
//! - **Window length**: `chunk_duration_seconds * sample_rate` samples (0.2s by default)
//! - **Timestamps**: window `i` starts at `i * window_samples / sample_rate` seconds
//! - **Final window**: zero-padded to full length when the track does not divide evenly

pub mod decoder;      // MP3 decoding and mono mixdown
pub mod features;     // Spectral descriptors per window
pub mod sequencer;    // Lazy window iteration

pub use decoder::{decode_mp3, has_mp3_extension, AudioFileInfo};
pub use features::{FeatureExtractor, FeatureRecord, SpectralFeatureExtractor};
pub use sequencer::{window_count, window_samples, ChunkSequencer};
