//! Configuration management for the live bridge
//!
//! Resolution order: built-in defaults, then the TOML file overlay, then
//! environment variables.

pub mod file;

use std::time::Duration;

use crate::queue::QueueConfig;
use crate::session::{ReconnectPolicy, SessionSetup, tool_declaration};
use crate::voice::AudioConfig;
use crate::{Error, Result};

use file::BridgeConfigFile;

/// Default streaming endpoint
const DEFAULT_URL: &str = "ws://localhost:6000/v1/live";

/// Default base URL for discrete calls
const DEFAULT_API_BASE: &str = "http://localhost:6000/v1";

/// Default model identifier
const DEFAULT_MODEL: &str = "live-audio";

/// Default voice identifier
const DEFAULT_VOICE: &str = "alloy";

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Inference service endpoints
    pub service: ServiceConfig,

    /// Setup payload sent when a session connects
    pub setup: SessionSetup,

    /// Call queue pacing and retry policy
    pub queue: QueueConfig,

    /// Session reconnect policy
    pub reconnect: ReconnectPolicy,

    /// Capture and playback tuning
    pub audio: AudioConfig,
}

/// Inference service endpoints and credentials
#[derive(Clone)]
pub struct ServiceConfig {
    /// Streaming WebSocket endpoint (`ws://` or `wss://`)
    pub url: String,

    /// Base URL for discrete HTTP calls
    pub api_base: String,

    /// API key (from `BEACON_LIVE_API_KEY` env)
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("url", &self.url)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .finish()
    }
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn load() -> Result<Self> {
        let file = file::load_config_file();
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if the resolved configuration is invalid
    pub fn from_sources(
        file: BridgeConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let service = ServiceConfig {
            url: env("BEACON_LIVE_URL")
                .or(file.service.url)
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            api_base: env("BEACON_LIVE_API_BASE")
                .or(file.service.api_base)
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: env("BEACON_LIVE_API_KEY").or(file.service.api_key),
            model: env("BEACON_LIVE_MODEL")
                .or(file.service.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        };

        let setup = SessionSetup {
            model: service.model.clone(),
            voice: env("BEACON_LIVE_VOICE")
                .or(file.session.voice)
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            system_instruction: file.session.system_instruction.unwrap_or_default(),
            tools: file
                .session
                .tools
                .unwrap_or_default()
                .iter()
                .map(|name| tool_declaration(name))
                .collect(),
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            min_interval: file
                .queue
                .min_interval_ms
                .map_or(queue_defaults.min_interval, Duration::from_millis),
            base_backoff: file
                .queue
                .base_backoff_ms
                .map_or(queue_defaults.base_backoff, Duration::from_millis),
            max_retries: file.queue.max_retries.unwrap_or(queue_defaults.max_retries),
        };

        let reconnect_defaults = ReconnectPolicy::default();
        let reconnect = ReconnectPolicy {
            delay: file
                .reconnect
                .delay_ms
                .map_or(reconnect_defaults.delay, Duration::from_millis),
            max_consecutive_failures: file
                .reconnect
                .max_consecutive_failures
                .unwrap_or(reconnect_defaults.max_consecutive_failures),
            max_reconnects: file.reconnect.max_reconnects,
        };

        let audio_defaults = AudioConfig::default();
        let audio = AudioConfig {
            frame_size: file.audio.frame_size.unwrap_or(audio_defaults.frame_size),
            vad_threshold: file
                .audio
                .vad_threshold
                .unwrap_or(audio_defaults.vad_threshold),
            vad_hold: file
                .audio
                .vad_hold_ms
                .map_or(audio_defaults.vad_hold, Duration::from_millis),
            input_rate: file.audio.input_rate.unwrap_or(audio_defaults.input_rate),
            output_rate: file.audio.output_rate.unwrap_or(audio_defaults.output_rate),
        };

        let config = Self {
            service,
            setup,
            queue,
            reconnect,
            audio,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the crate relies on
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if !(self.service.url.starts_with("ws://") || self.service.url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "service.url must be a ws:// or wss:// URL, got {}",
                self.service.url
            )));
        }
        if !(self.service.api_base.starts_with("http://")
            || self.service.api_base.starts_with("https://"))
        {
            return Err(Error::Config(format!(
                "service.api_base must be an http(s) URL, got {}",
                self.service.api_base
            )));
        }
        if self.audio.frame_size == 0 {
            return Err(Error::Config("audio.frame_size must be positive".to_string()));
        }
        if self.audio.input_rate == 0 || self.audio.output_rate == 0 {
            return Err(Error::Config("audio sample rates must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.audio.vad_threshold) {
            return Err(Error::Config(
                "audio.vad_threshold must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.queue.min_interval.is_zero() {
            tracing::warn!("queue.min_interval_ms is 0, dispatches will not be paced");
        }
        Ok(())
    }
}
