//! Audio capture from microphone
//!
//! The device delivers fixed-size frames to a [`FrameSink`] on its own thread. The
//! [`FrameProcessor`] behind that sink measures the frame, updates voice activity,
//! encodes to 16-bit PCM, and hands the frame to the transmit channel with
//! `try_send`. The capture thread never waits on the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use rubato::{FftFixedIn, Resampler};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::AudioConfig;
use super::codec::encode_pcm16;
use super::vad::{VoiceActivity, run_debounce};
use crate::{Error, Result};

/// Samples per capture frame
pub const FRAME_SIZE: usize = 4096;

/// Receives one mono frame at the transmit rate; called on the capture thread
pub type FrameSink = Arc<dyn Fn(Vec<f32>) + Send + Sync>;

/// Peak absolute amplitude of a frame
#[must_use]
pub fn peak_amplitude(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

/// One captured frame and its peak
#[derive(Debug, Clone)]
pub struct CaptureFrame {
    pub samples: Vec<f32>,
    pub peak: f32,
}

impl CaptureFrame {
    #[must_use]
    pub fn new(samples: Vec<f32>) -> Self {
        let peak = peak_amplitude(&samples);
        Self { samples, peak }
    }
}

/// Source of fixed-size microphone frames
pub trait CaptureDevice: Send {
    /// Start delivering `frame_size`-sample frames to `sink`
    ///
    /// Starting an already started device is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the device is missing or access is denied
    fn start(&mut self, frame_size: usize, sink: FrameSink) -> Result<()>;

    /// Stop delivering frames and release the device
    fn stop(&mut self);

    /// Whether frames are being delivered
    fn is_capturing(&self) -> bool;
}

/// Per-frame work done on the capture thread
pub struct FrameProcessor {
    vad: Arc<VoiceActivity>,
    muted: Arc<AtomicBool>,
    outbound: mpsc::Sender<Vec<u8>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl FrameProcessor {
    #[must_use]
    pub fn new(
        vad: Arc<VoiceActivity>,
        muted: Arc<AtomicBool>,
        outbound: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            vad,
            muted,
            outbound,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Handle one frame; never blocks
    pub fn process(&self, samples: Vec<f32>) {
        let frame = CaptureFrame::new(samples);
        self.vad.observe(frame.peak, Instant::now());

        if self.muted.load(Ordering::Relaxed) {
            return;
        }

        match self.outbound.try_send(encode_pcm16(&frame.samples)) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!(dropped, "transmit channel full, frame dropped");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Frames handed to the transmit channel
    #[must_use]
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Frames dropped because the transmit channel was full
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Attached {
    processor: Arc<FrameProcessor>,
    debounce: JoinHandle<()>,
}

/// Capture device plus its frame processor, attached at most once
pub struct CapturePath {
    device: Box<dyn CaptureDevice>,
    frame_size: usize,
    vad: Arc<VoiceActivity>,
    muted: Arc<AtomicBool>,
    attached: Option<Attached>,
}

impl CapturePath {
    #[must_use]
    pub fn new(device: Box<dyn CaptureDevice>, config: &AudioConfig, muted: Arc<AtomicBool>) -> Self {
        Self {
            device,
            frame_size: config.frame_size,
            vad: Arc::new(VoiceActivity::new(config.vad_threshold, config.vad_hold)),
            muted,
            attached: None,
        }
    }

    /// Start the device and route its frames into `outbound`
    ///
    /// Returns `false` without touching the device if already attached.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if the device cannot be started
    pub fn attach(&mut self, outbound: mpsc::Sender<Vec<u8>>) -> Result<bool> {
        if self.attached.is_some() {
            tracing::debug!("capture already attached");
            return Ok(false);
        }

        let processor = Arc::new(FrameProcessor::new(
            Arc::clone(&self.vad),
            Arc::clone(&self.muted),
            outbound,
        ));
        let sink_processor = Arc::clone(&processor);
        let sink: FrameSink = Arc::new(move |samples| sink_processor.process(samples));

        self.device.start(self.frame_size, sink)?;
        let debounce = tokio::spawn(run_debounce(Arc::clone(&self.vad)));

        self.attached = Some(Attached {
            processor,
            debounce,
        });
        tracing::debug!(frame_size = self.frame_size, "capture attached");
        Ok(true)
    }

    /// Stop the device and drop the frame processor
    pub fn detach(&mut self) {
        if let Some(attached) = self.attached.take() {
            self.device.stop();
            attached.debounce.abort();
            self.vad.reset();
            tracing::debug!(
                sent = attached.processor.frames_sent(),
                dropped = attached.processor.frames_dropped(),
                "capture detached"
            );
        }
    }

    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.attached.is_some()
    }

    /// Voice activity for this capture path
    #[must_use]
    pub fn vad(&self) -> &Arc<VoiceActivity> {
        &self.vad
    }

    /// Frames dropped on a full transmit channel since attach
    #[must_use]
    pub fn frames_dropped(&self) -> u64 {
        self.attached
            .as_ref()
            .map_or(0, |a| a.processor.frames_dropped())
    }
}

impl Drop for CapturePath {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Downmixes, resamples to the transmit rate, and cuts fixed-size frames
pub struct FrameChunker {
    channels: usize,
    frame_size: usize,
    resampler: Option<FftFixedIn<f32>>,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
}

/// Input frames per resampler chunk
const RESAMPLE_CHUNK: usize = 1024;

impl FrameChunker {
    /// # Errors
    ///
    /// Returns error if the resampler cannot be built for the rate pair
    pub fn new(device_rate: u32, target_rate: u32, channels: u16, frame_size: usize) -> Result<Self> {
        let resampler = if device_rate == target_rate {
            None
        } else {
            Some(
                FftFixedIn::<f32>::new(
                    device_rate as usize,
                    target_rate as usize,
                    RESAMPLE_CHUNK,
                    2,
                    1,
                )
                .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?,
            )
        };

        Ok(Self {
            channels: usize::from(channels.max(1)),
            frame_size,
            resampler,
            pending_in: Vec::new(),
            pending_out: Vec::with_capacity(frame_size * 2),
        })
    }

    /// Push interleaved device samples, emitting every completed frame
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(Vec<f32>)) {
        let mono = interleaved
            .chunks(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32);

        match self.resampler.as_mut() {
            None => self.pending_out.extend(mono),
            Some(resampler) => {
                self.pending_in.extend(mono);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.pending_in.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.pending_in.drain(..needed).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(mut out) => {
                            if let Some(channel) = out.pop() {
                                self.pending_out.extend(channel);
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "resample failed, chunk dropped"),
                    }
                }
            }
        }

        while self.pending_out.len() >= self.frame_size {
            let rest = self.pending_out.split_off(self.frame_size);
            emit(std::mem::replace(&mut self.pending_out, rest));
        }
    }
}

struct CaptureWorker {
    stop_tx: std::sync::mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

/// Captures from the default input device
///
/// cpal streams are not `Send`, so the stream lives on a dedicated thread for as
/// long as capture runs.
pub struct CpalCapture {
    target_rate: u32,
    worker: Option<CaptureWorker>,
}

impl CpalCapture {
    #[must_use]
    pub const fn new(target_rate: u32) -> Self {
        Self {
            target_rate,
            worker: None,
        }
    }
}

impl CaptureDevice for CpalCapture {
    fn start(&mut self, frame_size: usize, sink: FrameSink) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let target_rate = self.target_rate;
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("beacon-capture".to_string())
            .spawn(move || match open_input_stream(target_rate, frame_size, sink) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Blocks until stop() or the sender is dropped
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::Device(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop_tx, thread });
                tracing::debug!("audio capture started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::Device("capture thread exited during start".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.thread.join();
            tracing::debug!("audio capture stopped");
        }
    }

    fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Open and start the default input stream, feeding `sink`
fn open_input_stream(target_rate: u32, frame_size: usize, sink: FrameSink) -> Result<Stream> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::Device("no input device available".to_string()))?;

    // Prefer native mono at the transmit rate; otherwise take the device default and resample
    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::Device(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(target_rate)
                && c.max_sample_rate() >= SampleRate(target_rate)
        })
        .map(|c| c.with_sample_rate(SampleRate(target_rate)));

    let supported_config = match supported_config {
        Some(config) => config,
        None => device
            .default_input_config()
            .map_err(|e| Error::Device(e.to_string()))?,
    };

    let sample_format = supported_config.sample_format();
    let config = supported_config.config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        device_rate = config.sample_rate.0,
        target_rate,
        channels = config.channels,
        ?sample_format,
        "audio capture initialized"
    );

    let chunker = FrameChunker::new(config.sample_rate.0, target_rate, config.channels, frame_size)?;

    let stream = match sample_format {
        SampleFormat::F32 => build_input::<f32>(&device, &config, chunker, sink)?,
        SampleFormat::I16 => build_input::<i16>(&device, &config, chunker, sink)?,
        SampleFormat::U16 => build_input::<u16>(&device, &config, chunker, sink)?,
        other => {
            return Err(Error::Device(format!(
                "unsupported input sample format: {other:?}"
            )));
        }
    };

    stream.play().map_err(|e| Error::Device(e.to_string()))?;
    Ok(stream)
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut chunker: FrameChunker,
    sink: FrameSink,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data
                    .iter()
                    .map(|&s| <f32 as FromSample<T>>::from_sample_(s))
                    .collect();
                chunker.push(&samples, |frame| sink(frame));
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}
