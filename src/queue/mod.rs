//! Throttled call queue for discrete inference requests
//!
//! Every request/response call to the inference service funnels through one
//! [`ThrottleQueue`]. The queue dispatches one job at a time, keeps at least
//! `min_interval` between dispatch starts, and retries transient failures with
//! exponential backoff before the caller ever sees them.
//!
//! A retried job is re-inserted at the head of the queue, so it runs before any job
//! submitted after it. Under sustained rate limiting this delays unrelated jobs by up
//! to the sum of one job's backoff windows; `max_retries` bounds that delay.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::clock::{Clock, TokioClock};
use crate::error::ServiceError;

/// Minimum spacing between two dispatch starts
pub const MIN_INTERVAL: Duration = Duration::from_millis(2000);

/// Backoff unit; retry `r` waits `BASE_BACKOFF * 2^r`
pub const BASE_BACKOFF: Duration = Duration::from_millis(2000);

/// Retries allowed after the first attempt
pub const MAX_RETRIES: u32 = 5;

/// Queue pacing and retry policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Minimum spacing between dispatch starts
    pub min_interval: Duration,
    /// Backoff unit
    pub base_backoff: Duration,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_interval: MIN_INTERVAL,
            base_backoff: BASE_BACKOFF,
            max_retries: MAX_RETRIES,
        }
    }
}

impl QueueConfig {
    /// Backoff applied before retry number `retry` (1-based)
    #[must_use]
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.base_backoff
            .saturating_mul(2u32.saturating_pow(retry))
    }
}

type Attempt = BoxFuture<'static, Result<(), ServiceError>>;

/// A queued unit of work with its type-erased completion paths
struct Job {
    seq: u64,
    retries: u32,
    /// Runs the callable once; resolves the caller on success
    attempt: Box<dyn FnMut() -> Attempt + Send>,
    /// Rejects the caller with a final error
    reject: Box<dyn FnOnce(ServiceError) + Send>,
}

struct ThrottleState {
    last_dispatch_at: Option<Instant>,
    dispatching: bool,
    jobs: VecDeque<Job>,
    next_seq: u64,
}

struct Inner {
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    state: Mutex<ThrottleState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Serialized, paced, retrying dispatcher
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Clone)]
pub struct ThrottleQueue {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ThrottleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ThrottleQueue")
            .field("config", &self.inner.config)
            .field("pending", &state.jobs.len())
            .field("dispatching", &state.dispatching)
            .finish_non_exhaustive()
    }
}

static SHARED: OnceLock<ThrottleQueue> = OnceLock::new();

impl ThrottleQueue {
    /// Create a queue driven by the tokio clock
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Create a queue with an injected clock
    #[must_use]
    pub fn with_clock(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                config,
                state: Mutex::new(ThrottleState {
                    last_dispatch_at: None,
                    dispatching: false,
                    jobs: VecDeque::new(),
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Install the process-wide queue
    ///
    /// The first call wins; later calls return the already installed queue and
    /// ignore `config`.
    pub fn init_shared(config: QueueConfig) -> &'static Self {
        SHARED.get_or_init(|| Self::new(config))
    }

    /// The process-wide queue, created with defaults if not yet installed
    pub fn shared() -> &'static Self {
        SHARED.get_or_init(|| Self::new(QueueConfig::default()))
    }

    /// Queue policy
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Jobs waiting for dispatch (excludes the one in flight)
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Whether no job is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Submit a job; the returned handle resolves with its final outcome
    ///
    /// `job` is invoked once per attempt, so it must be callable again after a
    /// transient failure.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime while the dispatcher is idle.
    pub fn submit<F, Fut, T>(&self, mut job: F) -> JobHandle<T>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let reject_slot = Arc::new(Mutex::new(Some(tx)));
        let resolve_slot = Arc::clone(&reject_slot);

        let attempt = Box::new(move || -> Attempt {
            let fut = job();
            let slot = Arc::clone(&resolve_slot);
            Box::pin(async move {
                let value = fut.await?;
                if let Some(tx) = take_sender(&slot) {
                    let _ = tx.send(Ok(value));
                }
                Ok(())
            })
        });
        let reject = Box::new(move |err: ServiceError| {
            if let Some(tx) = take_sender(&reject_slot) {
                let _ = tx.send(Err(err));
            }
        });

        let seq = {
            let mut state = self.inner.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.jobs.push_back(Job {
                seq,
                retries: 0,
                attempt,
                reject,
            });
            seq
        };
        tracing::debug!(seq, "job queued");

        self.kick();
        JobHandle { seq, rx }
    }

    /// Start the dispatcher unless it is already running
    fn kick(&self) {
        {
            let mut state = self.inner.lock();
            if state.dispatching || state.jobs.is_empty() {
                return;
            }
            state.dispatching = true;
        }
        tokio::spawn(run_dispatcher(Arc::clone(&self.inner)));
    }
}

fn take_sender<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// Clears the `dispatching` flag if the dispatcher stops without draining the queue
///
/// Covers unwinding and cancellation of the dispatcher task, so a later `submit`
/// can start a fresh one.
struct DispatchGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().dispatching = false;
        }
    }
}

/// Dispatcher loop; exactly one runs per queue while jobs are pending
async fn run_dispatcher(inner: Arc<Inner>) {
    let mut guard = DispatchGuard {
        inner: Arc::clone(&inner),
        armed: true,
    };

    loop {
        let deadline = {
            let mut state = inner.lock();
            if state.jobs.is_empty() {
                state.dispatching = false;
                guard.armed = false;
                return;
            }
            state
                .last_dispatch_at
                .map(|last| last + inner.config.min_interval)
        };

        if let Some(deadline) = deadline {
            inner.clock.sleep_until(deadline).await;
        }

        let mut job = {
            let mut state = inner.lock();
            let Some(job) = state.jobs.pop_front() else {
                state.dispatching = false;
                guard.armed = false;
                return;
            };
            state.last_dispatch_at = Some(inner.clock.now());
            job
        };

        tracing::debug!(seq = job.seq, retries = job.retries, "dispatching job");

        // The callable itself runs inside the guarded future, so a panic while
        // building the attempt is caught along with one while polling it
        let outcome = AssertUnwindSafe(async { (job.attempt)().await })
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(ServiceError::Permanent("job panicked".to_string())));

        match outcome {
            Ok(()) => {
                tracing::debug!(seq = job.seq, retries = job.retries, "job resolved");
            }
            Err(err) if err.is_transient() && job.retries < inner.config.max_retries => {
                job.retries += 1;
                let backoff = inner.config.backoff_for(job.retries);
                tracing::warn!(
                    seq = job.seq,
                    retry = job.retries,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "transient failure, retrying"
                );
                let mut state = inner.lock();
                state.last_dispatch_at = Some(inner.clock.now() + backoff);
                state.jobs.push_front(job);
            }
            Err(err) => {
                tracing::warn!(
                    seq = job.seq,
                    retries = job.retries,
                    error = %err,
                    "job rejected"
                );
                (job.reject)(err);
            }
        }
    }
}

/// Deferred result of a submitted job
#[derive(Debug)]
pub struct JobHandle<T> {
    seq: u64,
    rx: oneshot::Receiver<Result<T, ServiceError>>,
}

impl<T> JobHandle<T> {
    /// Enqueue order of the job
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, ServiceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.rx.poll_unpin(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(ServiceError::Permanent(
                    "job dropped before completion".to_string(),
                ))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_values() {
        let config = QueueConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(2000));
        assert_eq!(config.base_backoff, Duration::from_millis(2000));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let config = QueueConfig {
            base_backoff: Duration::from_millis(100),
            ..QueueConfig::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(200));
        assert_eq!(config.backoff_for(2), Duration::from_millis(400));
        assert_eq!(config.backoff_for(5), Duration::from_millis(3200));
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_single_job() {
        let queue = ThrottleQueue::new(QueueConfig::default());
        let handle = queue.submit(|| async { Ok::<_, ServiceError>(7) });
        assert_eq!(handle.seq(), 0);
        assert_eq!(handle.await, Ok(7));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_job_is_rejected_and_queue_survives() {
        let queue = ThrottleQueue::new(QueueConfig::default());
        let bad = queue.submit(|| async {
            if true {
                panic!("boom");
            }
            Ok::<u8, ServiceError>(0)
        });
        let good = queue.submit(|| async { Ok::<_, ServiceError>(1u8) });

        assert!(matches!(bad.await, Err(ServiceError::Permanent(_))));
        assert_eq!(good.await, Ok(1));
    }

    #[tokio::test(start_paused = true)]
    async fn callable_that_panics_before_returning_a_future_is_rejected() {
        let queue = ThrottleQueue::new(QueueConfig::default());
        let bad = queue.submit(|| -> std::future::Ready<Result<u8, ServiceError>> {
            panic!("boom while building request")
        });
        let good = queue.submit(|| async { Ok::<_, ServiceError>(2u8) });

        assert!(matches!(bad.await, Err(ServiceError::Permanent(_))));
        assert_eq!(good.await, Ok(2));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_dispatcher_does_not_wedge_queue() {
        let queue = ThrottleQueue::new(QueueConfig::default());
        {
            let mut state = queue.inner.lock();
            state.dispatching = true;
            state.last_dispatch_at = Some(Instant::now());
        }
        let waiting = queue.submit(|| async { Ok::<_, ServiceError>(3u8) });

        // Park a dispatcher in its interval sleep, then cancel it
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&queue.inner)));
        tokio::task::yield_now().await;
        dispatcher.abort();
        let _ = dispatcher.await;
        assert!(!queue.inner.lock().dispatching);
        assert_eq!(queue.len(), 1);

        let next = queue.submit(|| async { Ok::<_, ServiceError>(4u8) });
        assert_eq!(waiting.await, Ok(3));
        assert_eq!(next.await, Ok(4));
    }
}
