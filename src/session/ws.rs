//! WebSocket transport for the live audio service
//!
//! Connect, send the setup message, and wait for `setupComplete` before handing the
//! socket to the bridge. Outbound audio goes out as `realtimeInput` media chunks;
//! inbound `serverContent` is translated to [`InboundEvent`]s by a reader task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::transport::{AudioSender, Connection, InboundEvent, SessionSetup, Transport};
use crate::config::ServiceConfig;
use crate::voice::{
    INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, encode_base64, parse_mime_rate, pcm_mime,
};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for `setupComplete`
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound events buffered between the reader task and the bridge
const EVENT_BUFFER: usize = 64;

/// Live session over a WebSocket
#[derive(Clone)]
pub struct WsTransport {
    url: String,
    api_key: Option<String>,
    handshake_timeout: Duration,
    input_rate: u32,
    default_rate: u32,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("input_rate", &self.input_rate)
            .finish_non_exhaustive()
    }
}

impl WsTransport {
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            api_key,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            input_rate: INPUT_SAMPLE_RATE,
            default_rate: OUTPUT_SAMPLE_RATE,
        }
    }

    #[must_use]
    pub fn from_config(service: &ServiceConfig) -> Self {
        Self::new(service.url.clone(), service.api_key.clone())
    }

    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sample rate of the PCM handed to [`AudioSender::send_audio`]
    #[must_use]
    pub const fn with_input_rate(mut self, rate: u32) -> Self {
        self.input_rate = rate;
        self
    }

    /// Rate assumed for inbound audio whose mime type carries none
    #[must_use]
    pub const fn with_default_rate(mut self, rate: u32) -> Self {
        self.default_rate = rate;
        self
    }

    fn request(&self) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(key) = &self.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| Error::Config(format!("invalid API key header: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }
        Ok(request)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, setup: &SessionSetup) -> Result<Connection> {
        let request = self.request()?;
        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| Error::Transport(format!("connect to {} failed: {e}", self.url)))?;

        let (mut sink, mut stream) = socket.split();

        sink.send(Message::Text(setup_message(setup).to_string().into()))
            .await?;

        tokio::time::timeout(self.handshake_timeout, await_setup_complete(&mut stream))
            .await
            .map_err(|_| Error::Transport("setup handshake timed out".to_string()))??;

        tracing::info!(url = %self.url, model = %setup.model, "live session connected");

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_events(stream, event_tx, self.default_rate));

        Ok(Connection {
            sender: Arc::new(WsSender {
                sink: Mutex::new(sink),
                mime: pcm_mime(self.input_rate),
                reader,
            }),
            events: event_rx,
        })
    }
}

/// Setup message sent once per connection
#[must_use]
pub fn setup_message(setup: &SessionSetup) -> serde_json::Value {
    let mut body = json!({
        "model": setup.model,
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": setup.voice }
                }
            }
        },
    });

    if !setup.system_instruction.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": setup.system_instruction }] });
    }
    if !setup.tools.is_empty() {
        body["tools"] = json!(setup.tools);
    }

    json!({ "setup": body })
}

/// Outbound frame for one PCM chunk described by `mime`
#[must_use]
pub fn audio_message(pcm: &[u8], mime: &str) -> serde_json::Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{ "mimeType": mime, "data": encode_base64(pcm) }]
        }
    })
}

async fn await_setup_complete(stream: &mut SplitStream<WsStream>) -> Result<()> {
    while let Some(message) = stream.next().await {
        let value: serde_json::Value = match message? {
            Message::Text(text) => serde_json::from_str(&text)?,
            Message::Binary(bytes) => serde_json::from_slice(&bytes)?,
            Message::Close(frame) => {
                let reason = frame.map(|f| f.reason.as_str().to_string()).unwrap_or_default();
                return Err(Error::Transport(format!("closed during setup: {reason}")));
            }
            _ => continue,
        };

        if value.get("setupComplete").is_some() {
            return Ok(());
        }
        if let Some(error) = value.get("error") {
            return Err(Error::Transport(format!("setup rejected: {error}")));
        }
    }

    Err(Error::Transport("connection ended during setup".to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    server_content: Option<ServerContent>,
    error: Option<ServerError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
struct ServerError {
    #[serde(default)]
    message: String,
}

/// Translate one server message into bridge events
///
/// # Errors
///
/// Returns [`Error::Serialization`] if the message is not valid JSON
pub fn parse_server_message(text: &str, default_rate: u32) -> Result<Vec<InboundEvent>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if let Some(error) = message.error {
        events.push(InboundEvent::Error(error.message));
    }

    if let Some(content) = message.server_content {
        // Barge-in first so stale audio is flushed before anything new is scheduled
        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
        if let Some(turn) = content.model_turn {
            events.extend(turn.parts.into_iter().filter_map(|part| {
                part.inline_data.map(|inline| InboundEvent::Audio {
                    sample_rate: inline
                        .mime_type
                        .as_deref()
                        .and_then(parse_mime_rate)
                        .unwrap_or(default_rate),
                    data: inline.data,
                })
            }));
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
    }

    Ok(events)
}

async fn read_events(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<InboundEvent>,
    default_rate: u32,
) {
    let last = loop {
        let Some(message) = stream.next().await else {
            break InboundEvent::Closed { reason: None };
        };

        let parsed = match message {
            Ok(Message::Text(text)) => parse_server_message(&text, default_rate),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => parse_server_message(text, default_rate),
                Err(e) => Err(Error::Decode(e.to_string())),
            },
            Ok(Message::Close(frame)) => {
                break InboundEvent::Closed {
                    reason: frame.map(|f| f.reason.as_str().to_string()),
                };
            }
            Ok(_) => continue,
            Err(e) => break InboundEvent::Error(e.to_string()),
        };

        match parsed {
            Ok(parsed) => {
                for event in parsed {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "ignoring unparseable server message"),
        }
    };

    let _ = events.send(last).await;
}

struct WsSender {
    sink: Mutex<SplitSink<WsStream, Message>>,
    mime: String,
    reader: JoinHandle<()>,
}

#[async_trait]
impl AudioSender for WsSender {
    async fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        let frame = Message::Text(audio_message(pcm, &self.mime).to_string().into());
        self.sink
            .lock()
            .await
            .send(frame)
            .await
            .map_err(|e| Error::Transport(format!("send failed: {e}")))
    }

    async fn close(&self) -> Result<()> {
        self.sink.lock().await.close().await?;
        Ok(())
    }
}

impl Drop for WsSender {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
