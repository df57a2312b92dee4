// tests/throttle_breaker.rs
//
// Breaker monotonicity and pacing guarantees of the throttle gate, driven
// on paused tokio time so the pacing sleeps are deterministic.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use insight_miner::source::SourceError;
use insight_miner::throttle::{ThrottleCfg, ThrottleError, ThrottleGate};

fn content_gate() -> ThrottleGate {
    ThrottleGate::new(
        "content",
        ThrottleCfg {
            base_interval_ms: 5_000,
            increment_ms: 10_000,
            decrement_ms: 2_500,
            max_backoff_ms: 60_000,
            break_threshold_ms: 30_000,
            breaker_reset_ms: 60_000,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn three_rate_limits_grow_backoff_and_open_the_breaker() {
    let gate = content_gate();
    let attempts = AtomicU32::new(0);

    for expected_backoff in [10_000u64, 20_000, 30_000] {
        let r = gate
            .call(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(SourceError::RateLimited)
            })
            .await;
        assert!(matches!(r, Err(ThrottleError::Upstream(_))));

        let snap = gate.snapshot().await;
        assert_eq!(snap.backoff_ms, expected_backoff);
    }

    let snap = gate.snapshot().await;
    assert!(snap.breaker_open, "breaker must open at the threshold");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    // Breaker open, inside the reset window: rejected without a call attempt.
    let r = gate
        .call(|| async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Ok::<_, SourceError>(())
        })
        .await;
    match r {
        Err(ThrottleError::Rejected { retry_after_ms }) => {
            assert!(retry_after_ms > 0 && retry_after_ms <= 60_000);
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
    assert_eq!(
        attempts.load(Ordering::SeqCst),
        3,
        "no network call may be attempted while the breaker is open"
    );
}

#[tokio::test(start_paused = true)]
async fn breaker_reset_probes_half_open_with_halved_backoff() {
    let gate = content_gate();
    for _ in 0..3 {
        let _ = gate
            .call(|| async { Err::<(), _>(SourceError::RateLimited) })
            .await;
    }
    assert!(gate.snapshot().await.breaker_open);

    // Let the cooldown elapse; the next call closes the breaker and probes.
    tokio::time::advance(std::time::Duration::from_millis(61_000)).await;
    gate.call(|| async { Ok::<_, SourceError>(()) })
        .await
        .expect("half-open probe should pass through");

    let snap = gate.snapshot().await;
    assert!(!snap.breaker_open);
    // 30000 halved by the probe, then one success decrement of 2500.
    assert_eq!(snap.backoff_ms, 12_500);
}

#[tokio::test(start_paused = true)]
async fn successes_drain_backoff_to_zero_in_bounded_steps() {
    let gate = content_gate();
    let _ = gate
        .call(|| async { Err::<(), _>(SourceError::RateLimited) })
        .await;
    assert_eq!(gate.snapshot().await.backoff_ms, 10_000);

    let mut last = 10_000;
    for _ in 0..4 {
        gate.call(|| async { Ok::<_, SourceError>(()) })
            .await
            .unwrap();
        let now = gate.snapshot().await.backoff_ms;
        assert!(now <= last, "backoff must be non-increasing on success");
        last = now;
    }
    assert_eq!(last, 0, "4 successes at -2500 clear a 10000ms backoff");
}

#[tokio::test(start_paused = true)]
async fn snapshot_resolves_while_a_call_is_paced() {
    let gate = Arc::new(content_gate());
    gate.call(|| async { Ok::<_, SourceError>(()) })
        .await
        .unwrap();

    // A second call now has to wait out the 5s base interval.
    let paced = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move { gate.call(|| async { Ok::<_, SourceError>(()) }).await })
    };
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }

    // The /status read path must not queue behind the pacing sleep.
    let before = tokio::time::Instant::now();
    let snap = gate.snapshot().await;
    let waited = tokio::time::Instant::now().duration_since(before);
    assert!(
        waited < Duration::from_millis(5_000),
        "snapshot waited {waited:?} behind a paced call"
    );
    assert!(!snap.breaker_open);

    paced.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn consecutive_calls_respect_the_base_interval() {
    let gate = content_gate();

    gate.call(|| async { Ok::<_, SourceError>(()) })
        .await
        .unwrap();
    let before_second = tokio::time::Instant::now();
    gate.call(|| async { Ok::<_, SourceError>(()) })
        .await
        .unwrap();
    let elapsed = tokio::time::Instant::now().duration_since(before_second);

    assert!(
        elapsed.as_millis() >= 5_000,
        "second call must wait out the base interval, waited {elapsed:?}"
    );
}
