//! Audio output to speakers
//!
//! [`CpalOutput`] keeps one output stream open and mixes a [`Timeline`] of scheduled
//! buffers into it. Its clock is the number of frames the device has rendered, so
//! scheduled start positions line up with what is actually heard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};

use super::codec::PlaybackBuffer;
use super::scheduler::{AudioOutput, CompletionHandler, PlaybackId};
use crate::{Error, Result};

#[derive(Debug)]
struct Entry {
    id: PlaybackId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Entry {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mono mix of buffers placed at absolute frame positions
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<Entry>,
}

impl Timeline {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Place `samples` starting at `start_frame`
    pub fn schedule(&mut self, id: PlaybackId, start_frame: u64, samples: Vec<f32>) {
        self.entries.push(Entry {
            id,
            start_frame,
            samples,
        });
    }

    /// Remove a buffer; returns whether it was still pending
    pub fn stop(&mut self, id: PlaybackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mix frames `[position, position + out.len())` into `out`
    ///
    /// Returns ids of buffers that finished within this block.
    #[allow(clippy::cast_possible_truncation)]
    pub fn render(&mut self, position: u64, out: &mut [f32]) -> Vec<PlaybackId> {
        out.fill(0.0);
        let block_end = position + out.len() as u64;

        for entry in &self.entries {
            let from = entry.start_frame.max(position);
            let to = entry.end_frame().min(block_end);
            for frame in from..to {
                out[(frame - position) as usize] += entry.samples[(frame - entry.start_frame) as usize];
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        let mut finished = Vec::new();
        self.entries.retain(|e| {
            if e.end_frame() <= block_end {
                finished.push(e.id);
                false
            } else {
                true
            }
        });
        finished
    }
}

/// Linear resample of mono samples
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - pos.floor()) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}

struct OutputShared {
    timeline: Mutex<Timeline>,
    rendered: AtomicU64,
    on_complete: Mutex<Option<CompletionHandler>>,
    device_rate: u32,
}

impl OutputShared {
    fn timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Render one mono block; completion handler runs after the timeline lock is released
    fn render(&self, out: &mut [f32]) {
        let position = self.rendered.load(Ordering::Acquire);
        let finished = self.timeline().render(position, out);
        self.rendered.fetch_add(out.len() as u64, Ordering::Release);

        if finished.is_empty() {
            return;
        }
        let handler = self
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = handler.as_ref() {
            for id in finished {
                handler(id);
            }
        }
    }
}

struct OutputWorker {
    stop_tx: std::sync::mpsc::Sender<()>,
    thread: std::thread::JoinHandle<()>,
}

/// Default output device mixing scheduled buffers
///
/// The stream lives on its own thread since cpal streams are not `Send`.
pub struct CpalOutput {
    shared: Arc<OutputShared>,
    worker: Mutex<Option<OutputWorker>>,
}

impl CpalOutput {
    /// Open the default output device, preferring `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Device`] if no output device can be opened
    pub fn open(sample_rate: u32) -> Result<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<Arc<OutputShared>>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("beacon-output".to_string())
            .spawn(move || match open_output_stream(sample_rate) {
                Ok((stream, shared)) => {
                    let _ = ready_tx.send(Ok(shared));
                    let _ = stop_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::Device(format!("failed to spawn output thread: {e}")))?;

        let shared = match ready_rx.recv() {
            Ok(Ok(shared)) => shared,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::Device("output thread exited during open".to_string()));
            }
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(OutputWorker { stop_tx, thread })),
        })
    }

    /// Rate the device clock runs at
    #[must_use]
    pub fn device_rate(&self) -> u32 {
        self.shared.device_rate
    }

    /// Buffers still pending in the mix
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.timeline().len()
    }
}

impl AudioOutput for CpalOutput {
    fn now(&self) -> Duration {
        let frames = self.shared.rendered.load(Ordering::Acquire);
        let rate = u64::from(self.shared.device_rate);
        Duration::from_secs(frames / rate) + Duration::from_nanos((frames % rate) * 1_000_000_000 / rate)
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn start(&self, id: PlaybackId, buffer: PlaybackBuffer, at: Duration) -> Result<()> {
        let device_rate = self.shared.device_rate;
        let samples = if buffer.sample_rate() == device_rate {
            buffer.into_samples()
        } else {
            resample_linear(buffer.samples(), buffer.sample_rate(), device_rate)
        };

        let requested = (at.as_secs_f64() * f64::from(device_rate)).round() as u64;
        // Never place audio behind the render head
        let start_frame = requested.max(self.shared.rendered.load(Ordering::Acquire));

        self.shared.timeline().schedule(id, start_frame, samples);
        Ok(())
    }

    fn stop(&self, id: PlaybackId) {
        self.shared.timeline().stop(id);
    }

    fn set_completion_handler(&self, handler: CompletionHandler) {
        *self
            .shared
            .on_complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn shutdown(&self) {
        self.shared.timeline().clear();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(());
            let _ = worker.thread.join();
            tracing::debug!("audio output closed");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn output_config_at(device: &Device, rate: u32, channels: u16) -> Option<cpal::SupportedStreamConfig> {
    device.supported_output_configs().ok()?.find_map(|c| {
        (c.channels() == channels
            && c.min_sample_rate() <= SampleRate(rate)
            && c.max_sample_rate() >= SampleRate(rate))
        .then(|| c.with_sample_rate(SampleRate(rate)))
    })
}

fn open_output_stream(sample_rate: u32) -> Result<(Stream, Arc<OutputShared>)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Device("no output device available".to_string()))?;

    // Mono at the stream rate, then stereo, then whatever the device defaults to
    let supported_config = match output_config_at(&device, sample_rate, 1)
        .or_else(|| output_config_at(&device, sample_rate, 2))
    {
        Some(config) => config,
        None => device
            .default_output_config()
            .map_err(|e| Error::Device(e.to_string()))?,
    };

    let sample_format = supported_config.sample_format();
    let config = supported_config.config();

    let shared = Arc::new(OutputShared {
        timeline: Mutex::new(Timeline::new()),
        rendered: AtomicU64::new(0),
        on_complete: Mutex::new(None),
        device_rate: config.sample_rate.0,
    });

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        ?sample_format,
        "audio output initialized"
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_output::<f32>(&device, &config, Arc::clone(&shared))?,
        SampleFormat::I16 => build_output::<i16>(&device, &config, Arc::clone(&shared))?,
        SampleFormat::U16 => build_output::<u16>(&device, &config, Arc::clone(&shared))?,
        other => {
            return Err(Error::Device(format!(
                "unsupported output sample format: {other:?}"
            )));
        }
    };

    stream.play().map_err(|e| Error::Device(e.to_string()))?;
    Ok((stream, shared))
}

fn build_output<T>(device: &Device, config: &StreamConfig, shared: Arc<OutputShared>) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let mut mono = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                shared.render(&mut mono);

                for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                    for out in frame.iter_mut() {
                        *out = T::from_sample_(sample);
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio output error");
            },
            None,
        )
        .map_err(|e| Error::Device(e.to_string()))
}
