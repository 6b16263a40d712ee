//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-live/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfigFile {
    /// Inference service endpoints and credentials
    #[serde(default)]
    pub service: ServiceFileConfig,

    /// Streaming session setup
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Call queue pacing
    #[serde(default)]
    pub queue: QueueFileConfig,

    /// Reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,

    /// Capture/playback tuning
    #[serde(default)]
    pub audio: AudioFileConfig,
}

/// Service endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ServiceFileConfig {
    /// Streaming WebSocket endpoint
    pub url: Option<String>,
    /// Base URL for discrete HTTP calls
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Session setup payload
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Voice identifier (e.g. "alloy")
    pub voice: Option<String>,
    pub system_instruction: Option<String>,
    /// Tool names to declare (e.g. `["web_search"]`)
    pub tools: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueueFileConfig {
    pub min_interval_ms: Option<u64>,
    pub base_backoff_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconnectFileConfig {
    pub delay_ms: Option<u64>,
    /// Failed attempts in a row before the session closes
    pub max_consecutive_failures: Option<u32>,
    /// Total reconnects per session; unset means unbounded
    pub max_reconnects: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Samples per capture frame
    pub frame_size: Option<usize>,
    /// Peak amplitude that counts as speech
    pub vad_threshold: Option<f32>,
    /// Quiet period before speaking is lowered
    pub vad_hold_ms: Option<u64>,
    pub input_rate: Option<u32>,
    pub output_rate: Option<u32>,
}

/// Load the TOML config file from the standard path
///
/// Returns `BridgeConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> BridgeConfigFile {
    config_file_path().map_or_else(BridgeConfigFile::default, |path| load_from(&path))
}

/// Load a config file from an explicit path, falling back to defaults
pub fn load_from(path: &Path) -> BridgeConfigFile {
    if !path.exists() {
        return BridgeConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                BridgeConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            BridgeConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-live/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-live")
            .join("config.toml")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_file() {
        let file: BridgeConfigFile = toml::from_str(
            r#"
            [service]
            url = "wss://example.test/live"

            [queue]
            max_retries = 3

            [session]
            tools = ["web_search"]
            "#,
        )
        .unwrap();

        assert_eq!(file.service.url.as_deref(), Some("wss://example.test/live"));
        assert_eq!(file.service.api_key, None);
        assert_eq!(file.queue.max_retries, Some(3));
        assert_eq!(file.queue.min_interval_ms, None);
        assert_eq!(file.session.tools, Some(vec!["web_search".to_string()]));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let file: BridgeConfigFile = toml::from_str("").unwrap();
        assert!(file.service.url.is_none());
        assert!(file.reconnect.max_reconnects.is_none());
    }

    #[test]
    fn unknown_section_is_rejected() {
        assert!(toml::from_str::<BridgeConfigFile>("[personas]\nname = \"x\"").is_err());
    }

    #[test]
    fn missing_path_yields_defaults() {
        let file = load_from(Path::new("/nonexistent/beacon-live/config.toml"));
        assert!(file.audio.frame_size.is_none());
    }

    #[test]
    fn config_path_is_under_beacon_live() {
        if let Some(path) = config_file_path() {
            assert!(path.ends_with("omni/beacon-live/config.toml"));
        }
    }
}
