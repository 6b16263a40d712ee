//! Live voice session lifecycle
//!
//! A [`VoiceBridge`] owns one duplex session: microphone frames flow out through the
//! transport and received audio flows into the playback scheduler. State moves
//! `Idle → Connecting → Active → {Reconnecting → Active | Closing} → Closed`, and
//! `Closed` is terminal.
//!
//! An unexpected transport loss while `Active` schedules a reconnect after a fixed
//! delay. Capture stays attached and the scheduler keeps its timeline across the
//! reconnect. A caller-initiated [`VoiceBridge::close`] never reconnects.
//!
//! Each connection carries a generation number. Tasks bound to an older generation
//! (a reader draining a dead socket, a reconnect racing a close) find the number has
//! moved on and do nothing.

mod transport;
pub mod ws;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use transport::{
    AudioSender, Connection, InboundEvent, SessionSetup, Transport, tool_declaration,
};
pub use ws::WsTransport;

use crate::voice::{
    AudioConfig, AudioOutput, CaptureDevice, CapturePath, PlaybackBuffer, PlaybackScheduler,
};
use crate::wake_lock::{NoopWakeLock, WakeLock};
use crate::{Error, Result};

/// Delay before the reconnect attempt
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Encoded frames buffered between the capture thread and the network
const TRANSMIT_QUEUE_DEPTH: usize = 8;

/// Bridge events buffered per subscriber
const EVENT_CAPACITY: usize = 64;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether the session has ended for good
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Observable bridge activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Lifecycle transition
    State(SessionState),

    /// Voice activity raised or lowered
    Speaking(bool),

    /// Playback flushed on barge-in
    Interrupted,

    /// Reconnect scheduled; `attempt` counts from 1 per session
    ReconnectAttempt { attempt: u32 },

    /// Failure surfaced to the caller
    Error(String),
}

/// When and how often a lost session reconnects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Wait before each attempt
    pub delay: Duration,

    /// Failed attempts in a row before the session closes
    pub max_consecutive_failures: u32,

    /// Reconnect attempts allowed per session; `None` is unbounded
    pub max_reconnects: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: RECONNECT_DELAY,
            max_consecutive_failures: 1,
            max_reconnects: None,
        }
    }
}

/// Admits at most one open session at a time
///
/// Bridges use the process-wide [`BridgeSlot::shared`] slot unless built with their
/// own.
#[derive(Debug, Clone, Default)]
pub struct BridgeSlot {
    held: Arc<AtomicBool>,
}

static SHARED_SLOT: OnceLock<BridgeSlot> = OnceLock::new();

impl BridgeSlot {
    /// A slot independent of every other
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide slot
    #[must_use]
    pub fn shared() -> Self {
        SHARED_SLOT.get_or_init(Self::new).clone()
    }

    /// Claim the slot, or `None` if another session holds it
    #[must_use]
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard {
                held: Arc::clone(&self.held),
            })
    }

    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Releases its [`BridgeSlot`] on drop
#[derive(Debug)]
pub struct SlotGuard {
    held: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}

enum Activation {
    Ready,
    Stale(Arc<dyn AudioSender>),
    Failed(Error, Arc<dyn AudioSender>),
}

struct Core {
    state: SessionState,
    generation: u64,
    capture: CapturePath,
    sender: Option<Arc<dyn AudioSender>>,
    inbound: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    speaking: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    wake_lock: Box<dyn WakeLock>,
    slot_guard: Option<SlotGuard>,
    reconnects: u32,
}

struct Shared {
    id: Uuid,
    transport: Arc<dyn Transport>,
    setup: SessionSetup,
    policy: ReconnectPolicy,
    scheduler: PlaybackScheduler,
    muted: Arc<AtomicBool>,
    slot: BridgeSlot,
    events: broadcast::Sender<BridgeEvent>,
    state_tx: watch::Sender<SessionState>,
    core: Mutex<Core>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: BridgeEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, core: &mut Core, state: SessionState) {
        if core.state == state {
            return;
        }
        tracing::info!(session = %self.id, from = %core.state, to = %state, "session state");
        core.state = state;
        self.state_tx.send_replace(state);
        self.emit(BridgeEvent::State(state));
    }

    /// Release session-scoped resources and enter `Closed`
    fn finish_closed(&self, core: &mut Core) {
        if core.wake_lock.is_held() {
            core.wake_lock.release();
        }
        core.slot_guard = None;
        self.set_state(core, SessionState::Closed);
    }

    async fn open(self: &Arc<Self>) -> Result<()> {
        let generation = {
            let mut core = self.lock();
            if core.state != SessionState::Idle {
                return Err(Error::InvalidState(format!(
                    "cannot open a session that is {}",
                    core.state
                )));
            }
            let guard = self.slot.try_acquire().ok_or_else(|| {
                Error::InvalidState("another session holds the bridge slot".to_string())
            })?;
            core.slot_guard = Some(guard);
            self.set_state(&mut core, SessionState::Connecting);
            core.generation
        };

        let connection = match self.transport.connect(&self.setup).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(session = %self.id, error = %e, "connect failed");
                self.emit(BridgeEvent::Error(e.to_string()));
                self.close().await;
                return Err(e);
            }
        };

        match self.activate(generation, connection) {
            Activation::Ready => Ok(()),
            Activation::Stale(sender) => {
                let _ = sender.close().await;
                Err(Error::InvalidState(
                    "session closed while connecting".to_string(),
                ))
            }
            Activation::Failed(e, sender) => {
                self.emit(BridgeEvent::Error(e.to_string()));
                if let Err(close_err) = sender.close().await {
                    tracing::debug!(error = %close_err, "transport close failed");
                }
                self.scheduler.shutdown();

                // Device failures skip Closing; Closed is published once released
                let mut core = self.lock();
                self.finish_closed(&mut core);
                Err(e)
            }
        }
    }

    /// Install a fresh connection and start capture
    fn activate(self: &Arc<Self>, generation: u64, connection: Connection) -> Activation {
        let mut core = self.lock();
        if core.state != SessionState::Connecting || core.generation != generation {
            return Activation::Stale(connection.sender);
        }

        let (frames_tx, frames_rx) = mpsc::channel(TRANSMIT_QUEUE_DEPTH);
        if let Err(e) = core.capture.attach(frames_tx) {
            tracing::error!(session = %self.id, error = %e, "capture failed to start");
            core.generation += 1;
            return Activation::Failed(e, connection.sender);
        }

        core.sender = Some(connection.sender);
        self.set_state(&mut core, SessionState::Active);

        if let Err(e) = core.wake_lock.acquire() {
            tracing::warn!(error = %e, "wake lock unavailable, continuing without it");
        }

        let speaking_rx = core.capture.vad().subscribe();
        core.speaking = Some(tokio::spawn(forward_speaking(Arc::clone(self), speaking_rx)));
        core.pump = Some(tokio::spawn(run_pump(Arc::clone(self), frames_rx)));
        core.inbound = Some(tokio::spawn(run_inbound(
            Arc::clone(self),
            generation,
            connection.events,
        )));

        Activation::Ready
    }

    /// The connection for `generation` went away without the caller asking
    ///
    /// `from_inbound` is set when called by the connection's own inbound task, which
    /// is left to finish instead of being aborted.
    fn transport_lost(self: &Arc<Self>, generation: u64, reason: &str, from_inbound: bool) {
        let mut core = self.lock();
        if core.state != SessionState::Active || core.generation != generation {
            return;
        }

        tracing::warn!(session = %self.id, reason, "transport lost");
        if let Some(inbound) = core.inbound.take()
            && !from_inbound
        {
            inbound.abort();
        }
        if let Some(sender) = core.sender.take() {
            tokio::spawn(async move {
                if let Err(e) = sender.close().await {
                    tracing::debug!(error = %e, "closing lost transport failed");
                }
            });
        }
        core.generation += 1;

        let reconnects = core.reconnects;
        if let Some(max) = self.policy.max_reconnects.filter(|&max| reconnects >= max) {
            drop(core);
            self.emit(BridgeEvent::Error(format!(
                "transport lost after {max} reconnects: {reason}"
            )));
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.close().await });
            return;
        }

        self.set_state(&mut core, SessionState::Reconnecting);
        core.reconnect = Some(tokio::spawn(run_reconnect(
            Arc::clone(self),
            core.generation,
        )));
    }

    async fn close(self: &Arc<Self>) {
        let (sender, inbound) = {
            let mut core = self.lock();
            match core.state {
                SessionState::Closing | SessionState::Closed => return,
                SessionState::Idle => {
                    self.finish_closed(&mut core);
                    return;
                }
                _ => {}
            }

            self.set_state(&mut core, SessionState::Closing);
            core.generation += 1;
            core.capture.detach();

            if let Some(reconnect) = core.reconnect.take() {
                reconnect.abort();
                tracing::debug!(session = %self.id, "pending reconnect cancelled");
            }
            for task in [core.pump.take(), core.speaking.take()].into_iter().flatten() {
                task.abort();
            }

            (core.sender.take(), core.inbound.take())
        };

        if let Some(sender) = sender
            && let Err(e) = sender.close().await
        {
            tracing::debug!(error = %e, "transport close failed");
        }
        if let Some(inbound) = inbound {
            inbound.abort();
        }

        self.scheduler.shutdown();

        let mut core = self.lock();
        self.finish_closed(&mut core);
    }

    fn handle_inbound(&self, event: InboundEvent) {
        match event {
            InboundEvent::Audio { data, sample_rate } => {
                match PlaybackBuffer::from_base64_pcm16(&data, sample_rate) {
                    Ok(buffer) if buffer.is_empty() => {}
                    Ok(buffer) => {
                        if let Err(e) = self.scheduler.schedule(buffer) {
                            tracing::warn!(error = %e, "failed to schedule playback");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "dropping undecodable audio buffer");
                    }
                }
            }
            InboundEvent::Interrupted => {
                let stopped = self.scheduler.flush();
                tracing::debug!(stopped, "interrupted, playback flushed");
                self.emit(BridgeEvent::Interrupted);
            }
            InboundEvent::TurnComplete => tracing::debug!("turn complete"),
            InboundEvent::Closed { .. } | InboundEvent::Error(_) => {}
        }
    }
}

/// Deliver inbound events for one connection
async fn run_inbound(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::Receiver<InboundEvent>,
) {
    let reason = loop {
        match events.recv().await {
            Some(InboundEvent::Closed { reason }) => {
                break reason.unwrap_or_else(|| "connection closed".to_string());
            }
            Some(InboundEvent::Error(message)) => break message,
            Some(event) => shared.handle_inbound(event),
            None => break "event stream ended".to_string(),
        }
    };

    shared.transport_lost(generation, &reason, true);
}

/// Move encoded frames from capture to whichever connection is current
async fn run_pump(shared: Arc<Shared>, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(pcm) = frames.recv().await {
        let current = {
            let core = shared.lock();
            core.sender.clone().map(|sender| (core.generation, sender))
        };

        // Frames captured while reconnecting have nowhere to go
        let Some((generation, sender)) = current else {
            continue;
        };

        if let Err(e) = sender.send_audio(&pcm).await {
            tracing::debug!(error = %e, "frame send failed");
            shared.transport_lost(generation, &e.to_string(), false);
        }
    }
}

/// Republish voice activity as bridge events
async fn forward_speaking(shared: Arc<Shared>, mut speaking: watch::Receiver<bool>) {
    while speaking.changed().await.is_ok() {
        let value = *speaking.borrow_and_update();
        shared.emit(BridgeEvent::Speaking(value));
    }
}

async fn run_reconnect(shared: Arc<Shared>, generation: u64) {
    let mut failures = 0u32;

    loop {
        let attempt = {
            let mut core = shared.lock();
            if core.state != SessionState::Reconnecting || core.generation != generation {
                return;
            }
            core.reconnects += 1;
            core.reconnects
        };

        tracing::info!(
            session = %shared.id,
            attempt,
            delay_ms = u64::try_from(shared.policy.delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
        shared.emit(BridgeEvent::ReconnectAttempt { attempt });
        tokio::time::sleep(shared.policy.delay).await;

        let error = match shared.transport.connect(&shared.setup).await {
            Ok(connection) => {
                let stale = {
                    let mut core = shared.lock();
                    if core.state == SessionState::Reconnecting && core.generation == generation {
                        core.reconnect = None;
                        core.sender = Some(connection.sender);
                        core.inbound = Some(tokio::spawn(run_inbound(
                            Arc::clone(&shared),
                            generation,
                            connection.events,
                        )));
                        shared.set_state(&mut core, SessionState::Active);
                        tracing::info!(session = %shared.id, attempt, "reconnected");
                        None
                    } else {
                        Some(connection.sender)
                    }
                };
                if let Some(sender) = stale {
                    let _ = sender.close().await;
                }
                return;
            }
            Err(e) => e,
        };

        failures += 1;
        tracing::warn!(session = %shared.id, attempt, failures, error = %error, "reconnect failed");

        let exhausted = failures >= shared.policy.max_consecutive_failures.max(1)
            || shared
                .policy
                .max_reconnects
                .is_some_and(|max| attempt >= max);
        if exhausted {
            {
                let mut core = shared.lock();
                if core.generation != generation {
                    return;
                }
                // Keep close() from aborting this task mid-teardown
                core.reconnect = None;
            }
            shared.emit(BridgeEvent::Error(format!("reconnect failed: {error}")));
            shared.close().await;
            return;
        }
    }
}

/// Builder for [`VoiceBridge`]
#[derive(Default)]
pub struct VoiceBridgeBuilder {
    transport: Option<Arc<dyn Transport>>,
    capture: Option<Box<dyn CaptureDevice>>,
    output: Option<Arc<dyn AudioOutput>>,
    wake_lock: Option<Box<dyn WakeLock>>,
    setup: SessionSetup,
    policy: ReconnectPolicy,
    audio: AudioConfig,
    slot: Option<BridgeSlot>,
    muted: bool,
}

impl VoiceBridgeBuilder {
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn capture(mut self, capture: Box<dyn CaptureDevice>) -> Self {
        self.capture = Some(capture);
        self
    }

    #[must_use]
    pub fn output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }

    #[must_use]
    pub fn wake_lock(mut self, wake_lock: Box<dyn WakeLock>) -> Self {
        self.wake_lock = Some(wake_lock);
        self
    }

    #[must_use]
    pub fn setup(mut self, setup: SessionSetup) -> Self {
        self.setup = setup;
        self
    }

    #[must_use]
    pub const fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn audio(mut self, audio: AudioConfig) -> Self {
        self.audio = audio;
        self
    }

    /// Use `slot` instead of the process-wide one
    #[must_use]
    pub fn slot(mut self, slot: BridgeSlot) -> Self {
        self.slot = Some(slot);
        self
    }

    #[must_use]
    pub const fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] if the transport, capture device, or output is missing
    pub fn build(self) -> Result<VoiceBridge> {
        let transport = self
            .transport
            .ok_or_else(|| Error::Config("voice bridge needs a transport".to_string()))?;
        let capture = self
            .capture
            .ok_or_else(|| Error::Config("voice bridge needs a capture device".to_string()))?;
        let output = self
            .output
            .ok_or_else(|| Error::Config("voice bridge needs an audio output".to_string()))?;

        let muted = Arc::new(AtomicBool::new(self.muted));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state_tx, _) = watch::channel(SessionState::Idle);

        let core = Core {
            state: SessionState::Idle,
            generation: 0,
            capture: CapturePath::new(capture, &self.audio, Arc::clone(&muted)),
            sender: None,
            inbound: None,
            pump: None,
            speaking: None,
            reconnect: None,
            wake_lock: self
                .wake_lock
                .unwrap_or_else(|| Box::new(NoopWakeLock::default())),
            slot_guard: None,
            reconnects: 0,
        };

        Ok(VoiceBridge {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                transport,
                setup: self.setup,
                policy: self.policy,
                scheduler: PlaybackScheduler::new(output),
                muted,
                slot: self.slot.unwrap_or_else(BridgeSlot::shared),
                events,
                state_tx,
                core: Mutex::new(core),
            }),
        })
    }
}

/// One live duplex voice session
///
/// Call [`close`](Self::close) when done; background tasks keep the session alive
/// until then.
pub struct VoiceBridge {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for VoiceBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceBridge")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl VoiceBridge {
    #[must_use]
    pub fn builder() -> VoiceBridgeBuilder {
        VoiceBridgeBuilder::default()
    }

    /// Connect, attach capture, and start routing audio
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless the session is `Idle` and the slot is free,
    /// the transport error if the connect fails, or [`Error::Device`] if capture cannot
    /// start. Every failure leaves the session `Closed`.
    pub async fn open(&self) -> Result<()> {
        self.shared.open().await
    }

    /// Tear the session down; safe to call repeatedly
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Stop or resume transmitting captured audio
    ///
    /// Voice activity keeps updating while muted.
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Relaxed);
        tracing::info!(session = %self.shared.id, muted, "mute toggled");
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Watch the lifecycle state
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to bridge events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.shared.events.subscribe()
    }

    /// Playback scheduler fed by this session
    #[must_use]
    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.shared.scheduler
    }

    /// Reconnect attempts made so far
    #[must_use]
    pub fn reconnect_count(&self) -> u32 {
        self.shared.lock().reconnects
    }

    /// Whether capture is currently attached
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.shared.lock().capture.is_attached()
    }

    /// Whether the wake lock is held
    #[must_use]
    pub fn holds_wake_lock(&self) -> bool {
        self.shared.lock().wake_lock.is_held()
    }

    /// Session identifier used in logs
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }
}
