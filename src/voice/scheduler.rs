//! Gapless playback scheduling
//!
//! Each buffer starts at `max(cursor, output clock)` and pushes the cursor to its end,
//! so windows never overlap and queued speech plays back to back. `flush` stops every
//! pending buffer and rewinds the cursor for barge-in.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::codec::PlaybackBuffer;
use crate::Result;

/// Handle for one buffer registered with an [`AudioOutput`]
pub type PlaybackId = u64;

/// Called by the output when a buffer finishes naturally
pub type CompletionHandler = Box<dyn Fn(PlaybackId) + Send + Sync>;

/// Platform sink with a monotonic clock
pub trait AudioOutput: Send + Sync {
    /// Current position of the output clock
    fn now(&self) -> Duration;

    /// Register `buffer` to begin at clock position `at`
    ///
    /// # Errors
    ///
    /// Returns error if the output cannot accept the buffer
    fn start(&self, id: PlaybackId, buffer: PlaybackBuffer, at: Duration) -> Result<()>;

    /// Stop a buffer; unknown or finished ids are ignored
    ///
    /// Must not invoke the completion handler.
    fn stop(&self, id: PlaybackId);

    /// Install the natural-completion callback
    fn set_completion_handler(&self, handler: CompletionHandler);

    /// Release the underlying device
    fn shutdown(&self) {}
}

/// Window assigned to a scheduled buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    pub start: Duration,
    pub end: Duration,
}

#[derive(Debug, Default)]
struct SchedulerState {
    next_start: Duration,
    active: BTreeMap<PlaybackId, ScheduledPlayback>,
    next_id: PlaybackId,
}

fn lock(state: &Mutex<SchedulerState>) -> MutexGuard<'_, SchedulerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Orders decoded buffers onto an [`AudioOutput`] timeline
pub struct PlaybackScheduler {
    output: Arc<dyn AudioOutput>,
    state: Arc<Mutex<SchedulerState>>,
}

impl PlaybackScheduler {
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let state = Arc::new(Mutex::new(SchedulerState::default()));

        let weak = Arc::downgrade(&state);
        output.set_completion_handler(Box::new(move |id| {
            if let Some(state) = weak.upgrade() {
                lock(&state).active.remove(&id);
            }
        }));

        Self { output, state }
    }

    /// Queue `buffer` directly after everything already scheduled
    ///
    /// # Errors
    ///
    /// Returns error if the output rejects the buffer; the cursor is left unchanged
    pub fn schedule(&self, buffer: PlaybackBuffer) -> Result<ScheduledPlayback> {
        let mut state = lock(&self.state);

        let start = state.next_start.max(self.output.now());
        let end = start + buffer.duration();
        let id = state.next_id;
        state.next_id += 1;

        let window = ScheduledPlayback { id, start, end };
        state.active.insert(id, window);

        if let Err(e) = self.output.start(id, buffer, start) {
            state.active.remove(&id);
            return Err(e);
        }
        state.next_start = end;

        tracing::trace!(
            id,
            start_ms = start.as_millis(),
            end_ms = end.as_millis(),
            "buffer scheduled"
        );
        Ok(window)
    }

    /// Stop every pending buffer and rewind the cursor
    ///
    /// Returns how many buffers were stopped.
    pub fn flush(&self) -> usize {
        let stopped = {
            let mut state = lock(&self.state);
            state.next_start = Duration::ZERO;
            std::mem::take(&mut state.active)
        };

        for id in stopped.keys() {
            self.output.stop(*id);
        }

        if !stopped.is_empty() {
            tracing::debug!(stopped = stopped.len(), "playback flushed");
        }
        stopped.len()
    }

    /// Buffers scheduled and not yet finished
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.state).active.len()
    }

    /// Windows of unfinished buffers in start order
    #[must_use]
    pub fn active(&self) -> Vec<ScheduledPlayback> {
        lock(&self.state).active.values().copied().collect()
    }

    /// Where the next buffer would start if the clock were behind it
    #[must_use]
    pub fn next_start(&self) -> Duration {
        lock(&self.state).next_start
    }

    /// Output clock position
    #[must_use]
    pub fn now(&self) -> Duration {
        self.output.now()
    }

    /// Flush and release the output device
    pub fn shutdown(&self) {
        self.flush();
        self.output.shutdown();
    }
}
