//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use beacon_live::session::{
    AudioSender, BridgeEvent, BridgeSlot, Connection, InboundEvent, ReconnectPolicy, SessionSetup,
    SessionState, Transport, VoiceBridge,
};
use beacon_live::voice::{
    AudioOutput, CaptureDevice, CompletionHandler, FrameSink, PlaybackBuffer, PlaybackId,
    encode_base64, encode_pcm16,
};
use beacon_live::wake_lock::WakeLock;
use beacon_live::{Error, Result};

/// Outbound half of a fake connection
#[derive(Default)]
pub struct FakeSender {
    pub frames: Mutex<Vec<Vec<u8>>>,
    pub closed: AtomicBool,
    pub fail_sends: AtomicBool,
}

#[async_trait]
impl AudioSender for FakeSender {
    async fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::Transport("broken pipe".to_string()));
        }
        self.frames.lock().unwrap().push(pcm.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeConnection {
    pub sender: Arc<FakeSender>,
    pub events: Option<mpsc::Sender<InboundEvent>>,
}

#[derive(Default)]
struct TransportState {
    failures: VecDeque<String>,
    connections: Vec<FakeConnection>,
    connect_times: Vec<Instant>,
}

/// Transport whose connects succeed unless a failure is scripted
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next connect attempt fail
    pub fn fail_next(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push_back(message.to_string());
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connect_times.len()
    }

    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().connect_times.clone()
    }

    /// Sender of the most recent successful connection
    pub fn latest_sender(&self) -> Arc<FakeSender> {
        let state = self.state.lock().unwrap();
        Arc::clone(&state.connections.last().expect("no connection").sender)
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    /// Whether the bridge stopped reading the most recent connection's events
    pub fn latest_events_abandoned(&self) -> bool {
        let state = self.state.lock().unwrap();
        state
            .connections
            .last()
            .and_then(|c| c.events.as_ref())
            .is_none_or(mpsc::Sender::is_closed)
    }

    /// Deliver an inbound event on the most recent connection
    pub async fn inject(&self, event: InboundEvent) {
        let tx = {
            let state = self.state.lock().unwrap();
            state
                .connections
                .last()
                .and_then(|c| c.events.clone())
                .expect("no live connection")
        };
        tx.send(event).await.expect("bridge stopped reading");
    }

    /// Simulate the remote side dropping the most recent connection
    pub async fn drop_connection(&self) {
        self.inject(InboundEvent::Closed {
            reason: Some("network unreachable".to_string()),
        })
        .await;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, _setup: &SessionSetup) -> Result<Connection> {
        let mut state = self.state.lock().unwrap();
        state.connect_times.push(Instant::now());

        if let Some(message) = state.failures.pop_front() {
            return Err(Error::Transport(message));
        }

        let (tx, rx) = mpsc::channel(16);
        let sender = Arc::new(FakeSender::default());
        state.connections.push(FakeConnection {
            sender: Arc::clone(&sender),
            events: Some(tx),
        });

        Ok(Connection {
            sender,
            events: rx,
        })
    }
}

#[derive(Default)]
struct CaptureState {
    sink: Option<FrameSink>,
    starts: u32,
    stops: u32,
    deny: bool,
}

/// Capture device driven by the test
#[derive(Clone, Default)]
pub struct FakeCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capture device that fails to start as if permission was denied
    pub fn denied() -> Self {
        let capture = Self::default();
        capture.state.lock().unwrap().deny = true;
        capture
    }

    /// Push one frame through the installed sink, as the audio thread would
    pub fn push_frame(&self, samples: Vec<f32>) {
        let sink = self.state.lock().unwrap().sink.clone();
        if let Some(sink) = sink {
            sink(samples);
        }
    }

    pub fn starts(&self) -> u32 {
        self.state.lock().unwrap().starts
    }

    pub fn stops(&self) -> u32 {
        self.state.lock().unwrap().stops
    }
}

impl CaptureDevice for FakeCapture {
    fn start(&mut self, _frame_size: usize, sink: FrameSink) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.deny {
            return Err(Error::Device("microphone permission denied".to_string()));
        }
        if state.sink.is_none() {
            state.sink = Some(sink);
            state.starts += 1;
        }
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap();
        if state.sink.take().is_some() {
            state.stops += 1;
        }
    }

    fn is_capturing(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }
}

/// A buffer handed to the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    pub id: PlaybackId,
    pub at: Duration,
    pub duration: Duration,
}

#[derive(Default)]
struct OutputState {
    now: Duration,
    started: Vec<Started>,
    stopped: Vec<PlaybackId>,
    finished: Vec<PlaybackId>,
    shutdowns: u32,
    states_at_shutdown: Vec<SessionState>,
}

/// Output whose clock only moves when the test says so
#[derive(Default)]
pub struct ManualOutput {
    state: Mutex<OutputState>,
    handler: Mutex<Option<CompletionHandler>>,
    session: Mutex<Option<watch::Receiver<SessionState>>>,
}

impl ManualOutput {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_now(&self, now: Duration) {
        self.state.lock().unwrap().now = now;
    }

    pub fn started(&self) -> Vec<Started> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<PlaybackId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn shutdowns(&self) -> u32 {
        self.state.lock().unwrap().shutdowns
    }

    /// Record the session state each time the output is shut down
    pub fn track_session(&self, state: watch::Receiver<SessionState>) {
        *self.session.lock().unwrap() = Some(state);
    }

    pub fn states_at_shutdown(&self) -> Vec<SessionState> {
        self.state.lock().unwrap().states_at_shutdown.clone()
    }

    /// Report natural completion of `id`
    pub fn finish(&self, id: PlaybackId) {
        self.state.lock().unwrap().finished.push(id);
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(id);
        }
    }

    /// Ids that would be audible at clock position `t`
    pub fn playing_at(&self, t: Duration) -> Vec<PlaybackId> {
        let state = self.state.lock().unwrap();
        state
            .started
            .iter()
            .filter(|s| !state.stopped.contains(&s.id) && !state.finished.contains(&s.id))
            .filter(|s| s.at <= t && t < s.at + s.duration)
            .map(|s| s.id)
            .collect()
    }
}

impl AudioOutput for ManualOutput {
    fn now(&self) -> Duration {
        self.state.lock().unwrap().now
    }

    fn start(&self, id: PlaybackId, buffer: PlaybackBuffer, at: Duration) -> Result<()> {
        self.state.lock().unwrap().started.push(Started {
            id,
            at,
            duration: buffer.duration(),
        });
        Ok(())
    }

    fn stop(&self, id: PlaybackId) {
        self.state.lock().unwrap().stopped.push(id);
    }

    fn set_completion_handler(&self, handler: CompletionHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn shutdown(&self) {
        let session = self.session.lock().unwrap().as_ref().map(|rx| *rx.borrow());
        let mut state = self.state.lock().unwrap();
        state.shutdowns += 1;
        state.states_at_shutdown.extend(session);
    }
}

/// Wake lock that records whether it is held
#[derive(Clone, Default)]
pub struct RecordingWakeLock {
    pub held: Arc<AtomicBool>,
    pub acquisitions: Arc<AtomicU32>,
}

impl WakeLock for RecordingWakeLock {
    fn acquire(&mut self) -> Result<()> {
        if !self.held.swap(true, Ordering::SeqCst) {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }

    fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Everything a bridge test needs to poke at
pub struct Harness {
    pub bridge: VoiceBridge,
    pub transport: FakeTransport,
    pub capture: FakeCapture,
    pub output: Arc<ManualOutput>,
    pub wake_lock: RecordingWakeLock,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(FakeCapture::new(), ReconnectPolicy::default())
    }

    pub fn with(capture: FakeCapture, policy: ReconnectPolicy) -> Self {
        let transport = FakeTransport::new();
        let output = ManualOutput::new();
        let wake_lock = RecordingWakeLock::default();

        let bridge = VoiceBridge::builder()
            .transport(Arc::new(transport.clone()))
            .capture(Box::new(capture.clone()))
            .output(Arc::clone(&output) as Arc<dyn AudioOutput>)
            .wake_lock(Box::new(wake_lock.clone()))
            .setup(SessionSetup {
                model: "live-audio".to_string(),
                voice: "alloy".to_string(),
                ..SessionSetup::default()
            })
            .reconnect_policy(policy)
            .slot(BridgeSlot::new())
            .build()
            .expect("bridge builds");

        Self {
            bridge,
            transport,
            capture,
            output,
            wake_lock,
        }
    }
}

/// Wait until the bridge reaches `state`
pub async fn wait_for_state(bridge: &VoiceBridge, state: SessionState) {
    let mut rx = bridge.watch_state();
    tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
        .map(|_| ())
        .expect("state channel closed");
}

/// Poll `condition` while letting background tasks run
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Drain every event received so far
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Base64 PCM payload of `ms` milliseconds at 24 kHz
pub fn audio_payload(ms: u32) -> InboundEvent {
    let samples = vec![0.1f32; (24 * ms) as usize];
    InboundEvent::Audio {
        data: encode_base64(&encode_pcm16(&samples)),
        sample_rate: 24_000,
    }
}
