//! Throttle queue integration tests
//!
//! All timing runs on tokio's paused clock, so spacing and backoff are checked
//! exactly without real waiting.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use beacon_live::queue::{BASE_BACKOFF, MAX_RETRIES, MIN_INTERVAL};
use beacon_live::{QueueConfig, ServiceError, ThrottleQueue};
use futures::future::join_all;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready_eq};

type Log = Arc<Mutex<Vec<(&'static str, Instant)>>>;

fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn times(log: &Log, name: &str) -> Vec<Instant> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(n, _)| *n == name)
        .map(|(_, t)| *t)
        .collect()
}

/// Job that records each attempt and fails transiently the first `failures` times
fn flaky(
    queue: &ThrottleQueue,
    log: &Log,
    name: &'static str,
    failures: u32,
) -> beacon_live::JobHandle<&'static str> {
    let log = Arc::clone(log);
    let attempts = Arc::new(AtomicU32::new(0));
    queue.submit(move || {
        let log = Arc::clone(&log);
        let attempts = Arc::clone(&attempts);
        async move {
            log.lock().unwrap().push((name, Instant::now()));
            if attempts.fetch_add(1, Ordering::SeqCst) < failures {
                Err(ServiceError::Transient("429 Too Many Requests".to_string()))
            } else {
                Ok(name)
            }
        }
    })
}

#[tokio::test(start_paused = true)]
async fn test_dispatches_are_spaced_by_min_interval() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let log = log();

    let handles: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| flaky(&queue, &log, name, 0))
        .collect();
    let results = join_all(handles).await;

    assert_eq!(results, vec![Ok("a"), Ok("b"), Ok("c"), Ok("d")]);

    let entries = log.lock().unwrap().clone();
    let order: Vec<_> = entries.iter().map(|(n, _)| *n).collect();
    assert_eq!(order, vec!["a", "b", "c", "d"]);
    for pair in entries.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= MIN_INTERVAL);
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_dispatch_is_immediate() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let log = log();
    let start = Instant::now();

    flaky(&queue, &log, "a", 0).await.unwrap();
    assert_eq!(times(&log, "a")[0], start);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_with_exponential_backoff() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let log = log();

    let result = flaky(&queue, &log, "a", 3).await;
    assert_eq!(result, Ok("a"));

    let attempts = times(&log, "a");
    assert_eq!(attempts.len(), 4);
    for (retry, pair) in (1u32..).zip(attempts.windows(2)) {
        let gap = pair[1] - pair[0];
        assert!(
            gap >= BASE_BACKOFF * 2u32.pow(retry),
            "retry {retry} after {gap:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_reject_and_queue_continues() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let log = log();

    let doomed = flaky(&queue, &log, "doomed", u32::MAX);
    let later = flaky(&queue, &log, "later", 0);

    let err = doomed.await.unwrap_err();
    assert!(err.is_transient());
    assert!(err.message().contains("429"));
    assert_eq!(times(&log, "doomed").len(), 1 + MAX_RETRIES as usize);

    assert_eq!(later.await, Ok("later"));
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = queue
        .submit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ServiceError::Permanent("400 invalid argument".to_string())) }
        })
        .await;

    assert_eq!(
        result,
        Err(ServiceError::Permanent("400 invalid argument".to_string()))
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_untyped_errors_are_classified_by_message() {
    let queue = ThrottleQueue::new(QueueConfig {
        max_retries: 1,
        ..QueueConfig::default()
    });
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let result = queue
        .submit(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(ServiceError::classify("RESOURCE_EXHAUSTED: try later"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

    assert_eq!(result, Ok(1));
}

#[tokio::test(start_paused = true)]
async fn test_panicking_callable_does_not_wedge_queue() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let log = log();

    let broken = queue.submit(|| -> std::future::Ready<Result<&'static str, ServiceError>> {
        panic!("request builder failed")
    });
    let later = flaky(&queue, &log, "later", 0);

    let outcome = tokio::time::timeout(Duration::from_secs(600), async {
        (broken.await, later.await)
    })
    .await
    .expect("queue stopped dispatching");

    assert!(matches!(outcome.0, Err(ServiceError::Permanent(_))));
    assert_eq!(outcome.1, Ok("later"));
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retried_job_keeps_its_place_at_head() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let log = log();

    let first = flaky(&queue, &log, "first", 1);
    let second = flaky(&queue, &log, "second", 0);
    assert_eq!(join_all([first, second]).await, vec![Ok("first"), Ok("second")]);

    let order: Vec<_> = log.lock().unwrap().iter().map(|(n, _)| *n).collect();
    assert_eq!(order, vec!["first", "first", "second"]);
}

#[tokio::test(start_paused = true)]
async fn test_idle_queue_respects_interval_for_late_submissions() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let log = log();

    flaky(&queue, &log, "a", 0).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    flaky(&queue, &log, "b", 0).await.unwrap();

    let a = times(&log, "a")[0];
    let b = times(&log, "b")[0];
    assert_eq!(b - a, MIN_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_handle_stays_pending_until_dispatch() {
    let queue = ThrottleQueue::new(QueueConfig::default());
    let log = log();

    flaky(&queue, &log, "a", 0).await.unwrap();
    let mut second = tokio_test::task::spawn(flaky(&queue, &log, "b", 0));

    tokio::time::sleep(MIN_INTERVAL - Duration::from_millis(1)).await;
    assert_pending!(second.poll());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_ready_eq!(second.poll(), Ok("b"));
}

#[tokio::test(start_paused = true)]
async fn test_custom_policy_is_honoured() {
    let queue = ThrottleQueue::new(QueueConfig {
        min_interval: Duration::from_millis(100),
        base_backoff: Duration::from_millis(10),
        max_retries: 2,
    });
    let log = log();

    let err = flaky(&queue, &log, "a", u32::MAX).await.unwrap_err();
    assert!(err.is_transient());

    let attempts = times(&log, "a");
    assert_eq!(attempts.len(), 3);
    // Backoff plus the dispatch interval
    assert_eq!(attempts[1] - attempts[0], Duration::from_millis(120));
    assert_eq!(attempts[2] - attempts[1], Duration::from_millis(140));
}

#[tokio::test]
async fn test_shared_queue_is_process_wide() {
    let installed = ThrottleQueue::init_shared(QueueConfig::default());
    assert!(std::ptr::eq(installed, ThrottleQueue::shared()));
    assert!(std::ptr::eq(
        installed,
        ThrottleQueue::init_shared(QueueConfig {
            max_retries: 0,
            ..QueueConfig::default()
        })
    ));
    assert_eq!(installed.config().max_retries, MAX_RETRIES);
}
