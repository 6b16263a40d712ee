//! PCM wire format
//!
//! Outbound frames are 16-bit little-endian PCM at 16 kHz; inbound audio arrives as
//! base64 16-bit PCM (24 kHz mono unless the payload says otherwise).

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::{Error, Result};

/// Sample rate of transmitted capture frames
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Sample rate of received synthesized audio
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Mime descriptor for outbound frames at the default capture rate
pub const INPUT_MIME: &str = "audio/pcm;rate=16000";

/// Mime descriptor for raw PCM at `sample_rate`
#[must_use]
pub fn pcm_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Convert f32 samples in [-1.0, 1.0] to 16-bit little-endian PCM bytes
#[must_use]
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        #[allow(clippy::cast_possible_truncation)]
        let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        bytes.extend_from_slice(&sample_i16.to_le_bytes());
    }
    bytes
}

/// Convert 16-bit little-endian PCM bytes to f32 samples
///
/// # Errors
///
/// Returns error if the byte count is odd
pub fn decode_pcm16(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Decode(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }

    Ok(bytes
        .chunks_exact(2)
        .map(|pair| f32::from(i16::from_le_bytes([pair[0], pair[1]])) / 32768.0)
        .collect())
}

/// Base64 encoding of an outbound PCM frame
#[must_use]
pub fn encode_base64(pcm: &[u8]) -> String {
    BASE64.encode(pcm)
}

/// Extract the sample rate from a descriptor such as `audio/pcm;rate=24000`
#[must_use]
pub fn parse_mime_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|part| part.trim().strip_prefix("rate="))
        .find_map(|rate| rate.parse().ok())
}

/// Decoded PCM ready for scheduling
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl PlaybackBuffer {
    /// Wrap mono samples at `sample_rate`
    #[must_use]
    pub const fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Decode a base64 16-bit PCM payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not valid base64 or not whole samples
    pub fn from_base64_pcm16(data: &str, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(Error::Decode("sample rate must be positive".to_string()));
        }
        let bytes = BASE64
            .decode(data.trim())
            .map_err(|e| Error::Decode(format!("invalid base64 audio: {e}")))?;
        let samples = decode_pcm16(&bytes)?;
        Ok(Self::new(samples, sample_rate))
    }

    /// Playback length
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }

    #[must_use]
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    #[must_use]
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
