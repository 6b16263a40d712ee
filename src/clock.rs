//! Time source for the call queue
//!
//! The queue never reads ambient wall-clock time; it asks its [`Clock`]. The tokio
//! implementation honours `tokio::time::pause`, so tests drive dispatch timing
//! deterministically.

use async_trait::async_trait;
use tokio::time::Instant;

/// Monotonic time source with an async sleep
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Suspend until `deadline` (returns immediately if it has passed)
    async fn sleep_until(&self, deadline: Instant);
}

/// Clock backed by the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}
