//! Voice processing module
//!
//! Handles microphone capture with voice activity detection, the PCM wire codec,
//! and gapless scheduling of received audio onto the output device.

mod capture;
mod codec;
mod output;
mod scheduler;
mod vad;

use std::time::Duration;

pub use capture::{
    CaptureDevice, CaptureFrame, CapturePath, CpalCapture, FRAME_SIZE, FrameChunker,
    FrameProcessor, FrameSink, peak_amplitude,
};
pub use codec::{
    INPUT_MIME, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, PlaybackBuffer, decode_pcm16,
    encode_base64, encode_pcm16, parse_mime_rate, pcm_mime,
};
pub use output::{CpalOutput, Timeline, resample_linear};
pub use scheduler::{
    AudioOutput, CompletionHandler, PlaybackId, PlaybackScheduler, ScheduledPlayback,
};
pub use vad::{SPEECH_HOLD, SPEECH_THRESHOLD, VoiceActivity, run_debounce};

/// Capture and playback tuning
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    /// Samples per capture frame
    pub frame_size: usize,

    /// Peak amplitude above which a frame counts as speech
    pub vad_threshold: f32,

    /// Quiet period before the speaking signal drops
    pub vad_hold: Duration,

    /// Rate of transmitted frames
    pub input_rate: u32,

    /// Rate of received audio when the payload does not say
    pub output_rate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            frame_size: FRAME_SIZE,
            vad_threshold: SPEECH_THRESHOLD,
            vad_hold: SPEECH_HOLD,
            input_rate: INPUT_SAMPLE_RATE,
            output_rate: OUTPUT_SAMPLE_RATE,
        }
    }
}
