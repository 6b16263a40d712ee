//! Voice activity detection
//!
//! Peak-amplitude detector with a hold timer: a loud frame raises the speaking
//! signal and re-arms the timer, and the signal only drops once the timer runs out
//! without another loud frame. `observe` is cheap and lock-light so the capture
//! callback can call it directly; the timer itself runs in [`run_debounce`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;

/// Peak amplitude above which a frame counts as speech
pub const SPEECH_THRESHOLD: f32 = 0.05;

/// Quiet period before the speaking signal drops
pub const SPEECH_HOLD: Duration = Duration::from_millis(200);

#[derive(Debug, Default)]
struct VadState {
    speaking: bool,
    deadline: Option<Instant>,
}

/// Hysteretic speaking indicator
#[derive(Debug)]
pub struct VoiceActivity {
    threshold: f32,
    hold: Duration,
    state: Mutex<VadState>,
    rearmed: Notify,
    speaking_tx: watch::Sender<bool>,
}

impl VoiceActivity {
    #[must_use]
    pub fn new(threshold: f32, hold: Duration) -> Self {
        let (speaking_tx, _) = watch::channel(false);
        Self {
            threshold,
            hold,
            state: Mutex::new(VadState::default()),
            rearmed: Notify::new(),
            speaking_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed the peak of one frame
    ///
    /// Returns `Some(true)` when this frame raised the signal.
    pub fn observe(&self, peak: f32, now: Instant) -> Option<bool> {
        if peak <= self.threshold {
            return None;
        }

        let raised = {
            let mut state = self.lock();
            state.deadline = Some(now + self.hold);
            !std::mem::replace(&mut state.speaking, true)
        };

        self.rearmed.notify_one();
        if raised {
            self.speaking_tx.send_replace(true);
            tracing::trace!(peak, "speech started");
            Some(true)
        } else {
            None
        }
    }

    /// Lower the signal if the hold timer has run out by `now`
    ///
    /// Returns `Some(false)` when the signal was lowered.
    pub fn expire(&self, now: Instant) -> Option<bool> {
        {
            let mut state = self.lock();
            match state.deadline {
                Some(deadline) if deadline <= now => {
                    state.deadline = None;
                    state.speaking = false;
                }
                _ => return None,
            }
        }

        self.speaking_tx.send_replace(false);
        tracing::trace!("speech ended");
        Some(false)
    }

    /// Drop the signal and disarm the timer
    pub fn reset(&self) {
        let was_speaking = {
            let mut state = self.lock();
            state.deadline = None;
            std::mem::take(&mut state.speaking)
        };
        if was_speaking {
            self.speaking_tx.send_replace(false);
        }
        self.rearmed.notify_one();
    }

    /// When the hold timer fires, if armed
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.lock().speaking
    }

    /// Watch speaking transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.speaking_tx.subscribe()
    }
}

/// Run the hold timer until the task is aborted
pub async fn run_debounce(vad: Arc<VoiceActivity>) {
    loop {
        match vad.deadline() {
            None => vad.rearmed.notified().await,
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {
                        vad.expire(Instant::now());
                    }
                    () = vad.rearmed.notified() => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> VoiceActivity {
        VoiceActivity::new(SPEECH_THRESHOLD, SPEECH_HOLD)
    }

    #[test]
    fn quiet_frames_do_not_raise() {
        let vad = detector();
        let now = Instant::now();
        assert_eq!(vad.observe(0.01, now), None);
        assert_eq!(vad.observe(SPEECH_THRESHOLD, now), None);
        assert!(!vad.is_speaking());
        assert!(vad.deadline().is_none());
    }

    #[test]
    fn loud_frame_raises_once() {
        let vad = detector();
        let now = Instant::now();
        assert_eq!(vad.observe(0.3, now), Some(true));
        assert_eq!(vad.observe(0.3, now), None);
        assert!(vad.is_speaking());
        assert_eq!(vad.deadline(), Some(now + SPEECH_HOLD));
    }

    #[test]
    fn expire_respects_hold() {
        let vad = detector();
        let now = Instant::now();
        vad.observe(0.3, now);

        assert_eq!(vad.expire(now + Duration::from_millis(199)), None);
        assert!(vad.is_speaking());
        assert_eq!(vad.expire(now + SPEECH_HOLD), Some(false));
        assert!(!vad.is_speaking());
    }

    #[test]
    fn rearming_extends_hold() {
        let vad = detector();
        let start = Instant::now();
        vad.observe(0.3, start);
        vad.observe(0.3, start + Duration::from_millis(150));

        assert_eq!(vad.expire(start + Duration::from_millis(250)), None);
        assert_eq!(
            vad.expire(start + Duration::from_millis(350)),
            Some(false)
        );
    }

    #[test]
    fn reset_lowers_signal() {
        let vad = detector();
        let rx = vad.subscribe();
        vad.observe(0.9, Instant::now());
        assert!(*rx.borrow());

        vad.reset();
        assert!(!*rx.borrow());
        assert!(vad.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_task_lowers_after_quiet_period() {
        let vad = Arc::new(detector());
        let mut rx = vad.subscribe();
        let task = tokio::spawn(run_debounce(Arc::clone(&vad)));

        let start = Instant::now();
        vad.observe(0.5, start);
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(Instant::now() - start >= SPEECH_HOLD);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_task_holds_while_rearmed() {
        let vad = Arc::new(detector());
        let task = tokio::spawn(run_debounce(Arc::clone(&vad)));

        for _ in 0..5 {
            vad.observe(0.5, Instant::now());
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(vad.is_speaking());
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!vad.is_speaking());
        task.abort();
    }
}
