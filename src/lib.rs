//! Beacon Live - Real-time voice bridge for conversational AI services
//!
//! This library provides two independent pieces:
//! - A live audio bridge: microphone capture with voice activity detection, streamed
//!   to the service over a duplex session, with received speech scheduled for gapless
//!   playback and flushed on barge-in
//! - A throttled call queue that paces discrete service calls and retries transient
//!   failures with exponential backoff
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  PCM 16k   ┌─────────────────┐  base64 PCM 24k  ┌──────────────────┐
//! │ CapturePath  ├───────────►│   VoiceBridge   ├─────────────────►│ PlaybackScheduler│
//! │ (VAD, mute)  │            │ (state machine, │                  │ (gapless, flush) │
//! └──────────────┘            │   reconnect)    │                  └──────────────────┘
//!                             └───────┬─────────┘
//!                                     │ Transport (WebSocket)
//!                                     ▼
//!                              Live audio service
//!                                     ▲
//!                                     │ HTTP
//!                             ┌───────┴─────────┐
//!                             │ InferenceClient ├──► ThrottleQueue (process-wide)
//!                             └─────────────────┘
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod queue;
pub mod service;
pub mod session;
pub mod voice;
pub mod wake_lock;

pub use clock::{Clock, TokioClock};
pub use config::Config;
pub use error::{Error, Result, ServiceError};
pub use queue::{JobHandle, QueueConfig, ThrottleQueue};
pub use service::{GenerateRequest, InferenceClient};
pub use session::{
    BridgeEvent, BridgeSlot, ReconnectPolicy, SessionSetup, SessionState, Transport,
    VoiceBridge, WsTransport,
};
pub use voice::{AudioConfig, AudioOutput, CaptureDevice, PlaybackBuffer, PlaybackScheduler};
pub use wake_lock::{WakeLock, default_wake_lock};
