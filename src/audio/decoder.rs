//! MP3 decoding for uploaded tracks.
//!
//! Uploads arrive as raw bytes; symphonia probes them, the first MP3 track is
//! decoded to interleaved `f32`, and channels are averaged into a single mono
//! buffer for feature extraction.

use serde::Serialize;
use std::io::Cursor;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_MP3};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::StreamError;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unrecognized audio container: {0}")]
    UnsupportedFormat(String),

    #[error("no MP3 audio track found")]
    NoMp3Track,

    #[error("stream is missing its {0}")]
    MissingParameter(&'static str),

    #[error("failed to decode audio: {0}")]
    Decode(String),

    #[error("audio stream contains no samples")]
    Empty,
}

impl From<DecodeError> for StreamError {
    fn from(err: DecodeError) -> Self {
        StreamError::InvalidInput(err.to_string())
    }
}

/// Metadata about an uploaded file, reported back to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioFileInfo {
    pub filename: String,
    pub duration_seconds: f64,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Mono samples plus the stream parameters they were decoded with.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Channel count of the source, before mixdown.
    pub channels: u16,
}

impl DecodedAudio {
    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn file_info(&self, filename: &str) -> AudioFileInfo {
        AudioFileInfo {
            filename: filename.to_string(),
            duration_seconds: self.duration_seconds(),
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Case-insensitive `.mp3` extension check used before any decoding happens.
pub fn has_mp3_extension(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
}

/// Decode a complete MP3 file held in memory.
///
/// Corrupt frames are logged and skipped, the way players do; a stream that
/// yields no samples at all is an error.
pub fn decode_mp3(bytes: Vec<u8>) -> Result<DecodedAudio, DecodeError> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("mp3");

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| DecodeError::UnsupportedFormat(e.to_string()))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec == CODEC_TYPE_MP3)
        .ok_or(DecodeError::NoMp3Track)?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or(DecodeError::MissingParameter("sample rate"))?;
    let mut channels = codec_params.channels.map(|c| c.count() as u16);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| DecodeError::Decode(e.to_string()))?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError::Decode(e.to_string())),
        };

        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let channel_count = spec.channels.count().max(1);
                channels.get_or_insert(channel_count as u16);

                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                mix_to_mono(buffer.samples(), channel_count, &mut mono);
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                warn!("Skipping corrupt MP3 frame: {}", msg);
            }
            Err(e) => return Err(DecodeError::Decode(e.to_string())),
        }
    }

    if mono.is_empty() {
        return Err(DecodeError::Empty);
    }

    let decoded = DecodedAudio {
        samples: mono,
        sample_rate,
        channels: channels.unwrap_or(1),
    };
    debug!(
        sample_rate,
        channels = decoded.channels,
        duration_seconds = decoded.duration_seconds(),
        "Decoded MP3"
    );
    Ok(decoded)
}

/// Average interleaved frames into one sample each.
fn mix_to_mono(interleaved: &[f32], channels: usize, output: &mut Vec<f32>) {
    if channels == 1 {
        output.extend_from_slice(interleaved);
        return;
    }
    output.extend(
        interleaved
            .chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}
