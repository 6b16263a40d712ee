//! Streaming transport abstraction
//!
//! A [`Transport`] performs the connect handshake and splits the session into an
//! outbound [`AudioSender`] and a stream of [`InboundEvent`]s. The bridge never sees
//! the wire protocol.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::Result;

/// Payload sent once when a session connects, forwarded verbatim
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Tool declarations as the service expects them
    pub tools: Vec<serde_json::Value>,
}

/// Declaration for a named tool
///
/// `web_search` maps to the service's built-in search tool; any other name is
/// declared as an empty object under that name.
#[must_use]
pub fn tool_declaration(name: &str) -> serde_json::Value {
    match name {
        "web_search" | "google_search" => json!({ "googleSearch": {} }),
        other => {
            let mut declaration = serde_json::Map::new();
            declaration.insert(other.to_string(), json!({}));
            serde_json::Value::Object(declaration)
        }
    }
}

/// Something the service sent during a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Base64 16-bit PCM
    Audio { data: String, sample_rate: u32 },

    /// The user barged in; pending playback is stale
    Interrupted,

    /// Model finished its turn
    TurnComplete,

    /// Remote side closed the connection
    Closed { reason: Option<String> },

    /// Transport failure
    Error(String),
}

/// Outbound half of a connected session
#[async_trait]
pub trait AudioSender: Send + Sync {
    /// Send one 16-bit PCM frame
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Transport`] if the connection is gone
    async fn send_audio(&self, pcm: &[u8]) -> Result<()>;

    /// Close the connection
    ///
    /// # Errors
    ///
    /// Returns error if the close handshake fails
    async fn close(&self) -> Result<()>;
}

/// A connected session
pub struct Connection {
    pub sender: Arc<dyn AudioSender>,
    pub events: mpsc::Receiver<InboundEvent>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Opens streaming sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and complete the setup handshake
    ///
    /// # Errors
    ///
    /// Returns error if the connection or handshake fails
    async fn connect(&self, setup: &SessionSetup) -> Result<Connection>;
}
