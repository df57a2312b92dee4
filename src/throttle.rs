// src/throttle.rs
// Per-dependency pacing gate: additive-increase / subtractive-decrease
// backoff plus a circuit breaker. Each rate-limited dependency (content
// source, inference provider) owns one independent `ThrottleGate`; failures
// on one must never throttle the other.

use std::future::Future;
use std::time::Duration;

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Classifies whether an upstream failure should feed the backoff/breaker.
/// Rate-limit responses and 5xx-class failures count; other errors are
/// reported but leave pacing untouched.
pub trait ThrottleSignal {
    fn is_throttle_signal(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum ThrottleError<E> {
    /// Breaker open or pacing not satisfied without a call attempt. Expected
    /// and non-fatal; callers skip and retry on their next scheduled cycle.
    #[error("throttled, retry in {retry_after_ms} ms")]
    Rejected { retry_after_ms: u64 },
    #[error(transparent)]
    Upstream(E),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThrottleCfg {
    /// Minimum gap between two call attempts, before backoff.
    pub base_interval_ms: u64,
    /// Added to the backoff on each rate-limit / 5xx outcome.
    pub increment_ms: u64,
    /// Subtracted from the backoff on each success, floored at zero.
    pub decrement_ms: u64,
    pub max_backoff_ms: u64,
    /// Backoff level at which the breaker opens.
    pub break_threshold_ms: u64,
    /// How long an open breaker rejects calls before a half-open probe.
    pub breaker_reset_ms: u64,
}

impl ThrottleCfg {
    pub fn content_default() -> Self {
        Self {
            base_interval_ms: 5_000,
            increment_ms: 10_000,
            decrement_ms: 2_500,
            max_backoff_ms: 60_000,
            break_threshold_ms: 30_000,
            breaker_reset_ms: 60_000,
        }
    }

    pub fn inference_default() -> Self {
        Self {
            base_interval_ms: 1_500,
            increment_ms: 5_000,
            decrement_ms: 1_000,
            max_backoff_ms: 30_000,
            break_threshold_ms: 15_000,
            breaker_reset_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct ThrottleState {
    last_request_at: Option<Instant>,
    backoff_ms: u64,
    breaker_open: bool,
    breaker_opened_at: Option<Instant>,
}

/// Read-only view of a gate's state for `/status` and diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleSnapshot {
    pub backoff_ms: u64,
    pub breaker_open: bool,
    /// Remaining cooldown before a half-open probe, 0 when closed.
    pub breaker_remaining_ms: u64,
}

pub struct ThrottleGate {
    name: &'static str,
    cfg: ThrottleCfg,
    state: Mutex<ThrottleState>,
}

impl ThrottleGate {
    pub fn new(name: &'static str, cfg: ThrottleCfg) -> Self {
        Self {
            name,
            cfg,
            state: Mutex::new(ThrottleState {
                last_request_at: None,
                backoff_ms: 0,
                breaker_open: false,
                breaker_opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run one call through the gate.
    ///
    /// Consults the breaker first: an open breaker inside its reset window
    /// rejects without invoking `f` at all. Otherwise the caller waits out
    /// the pacing interval; the sleep runs with the gate lock released so
    /// readers (`snapshot`) are never starved by a waiting call, and the
    /// pacing slot is re-checked under the lock after waking. The outcome of
    /// `f` feeds the backoff: success decrements, a throttle-signal failure
    /// increments and may open the breaker.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, ThrottleError<E>>
    where
        E: ThrottleSignal,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        loop {
            let due = {
                let mut st = self.state.lock().await;
                let now = Instant::now();

                if st.breaker_open {
                    let opened = st.breaker_opened_at.unwrap_or(now);
                    let elapsed_ms = now.duration_since(opened).as_millis() as u64;
                    if elapsed_ms < self.cfg.breaker_reset_ms {
                        let retry_after_ms = self.cfg.breaker_reset_ms - elapsed_ms;
                        counter!("throttle_rejected_total", "dependency" => self.name).increment(1);
                        return Err(ThrottleError::Rejected { retry_after_ms });
                    }
                    // Cooldown elapsed: close and probe with half the backoff.
                    st.breaker_open = false;
                    st.breaker_opened_at = None;
                    st.backoff_ms /= 2;
                    tracing::info!(
                        target: "throttle",
                        dependency = self.name,
                        backoff_ms = st.backoff_ms,
                        "breaker closed, probing half-open"
                    );
                }

                let required = Duration::from_millis(self.cfg.base_interval_ms + st.backoff_ms);
                match st.last_request_at {
                    // Another caller may claim the slot while we sleep, so
                    // the due time is only a hint; it is re-derived each lap.
                    Some(last) if now < last + required => Some(last + required),
                    _ => {
                        st.last_request_at = Some(now);
                        self.export(&st);
                        None
                    }
                }
            };
            match due {
                Some(due) => tokio::time::sleep_until(due).await,
                None => break,
            }
        }

        let out = f().await;

        let mut st = self.state.lock().await;
        match out {
            Ok(v) => {
                st.backoff_ms = st.backoff_ms.saturating_sub(self.cfg.decrement_ms);
                self.export(&st);
                Ok(v)
            }
            Err(e) => {
                if e.is_throttle_signal() {
                    st.backoff_ms =
                        (st.backoff_ms + self.cfg.increment_ms).min(self.cfg.max_backoff_ms);
                    if st.backoff_ms >= self.cfg.break_threshold_ms && !st.breaker_open {
                        st.breaker_open = true;
                        st.breaker_opened_at = Some(Instant::now());
                        tracing::warn!(
                            target: "throttle",
                            dependency = self.name,
                            backoff_ms = st.backoff_ms,
                            "breaker opened"
                        );
                        counter!("throttle_breaker_opened_total", "dependency" => self.name)
                            .increment(1);
                    }
                }
                self.export(&st);
                Err(ThrottleError::Upstream(e))
            }
        }
    }

    pub async fn snapshot(&self) -> ThrottleSnapshot {
        let st = self.state.lock().await;
        let breaker_remaining_ms = match (st.breaker_open, st.breaker_opened_at) {
            (true, Some(opened)) => {
                let elapsed = Instant::now().duration_since(opened).as_millis() as u64;
                self.cfg.breaker_reset_ms.saturating_sub(elapsed)
            }
            _ => 0,
        };
        ThrottleSnapshot {
            backoff_ms: st.backoff_ms,
            breaker_open: st.breaker_open,
            breaker_remaining_ms,
        }
    }

    fn export(&self, st: &ThrottleState) {
        gauge!("throttle_backoff_ms", "dependency" => self.name).set(st.backoff_ms as f64);
        gauge!("throttle_breaker_open", "dependency" => self.name)
            .set(if st.breaker_open { 1.0 } else { 0.0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum FakeErr {
        #[error("rate limited")]
        RateLimited,
        #[error("bad request")]
        Client,
    }

    impl ThrottleSignal for FakeErr {
        fn is_throttle_signal(&self) -> bool {
            matches!(self, FakeErr::RateLimited)
        }
    }

    fn small_gate() -> ThrottleGate {
        ThrottleGate::new(
            "test",
            ThrottleCfg {
                base_interval_ms: 10,
                increment_ms: 100,
                decrement_ms: 40,
                max_backoff_ms: 500,
                break_threshold_ms: 300,
                breaker_reset_ms: 1_000,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn success_decrements_and_floors_at_zero() {
        let gate = small_gate();
        let _ = gate
            .call(|| async { Err::<(), _>(FakeErr::RateLimited) })
            .await;
        assert_eq!(gate.snapshot().await.backoff_ms, 100);

        for _ in 0..3 {
            gate.call(|| async { Ok::<_, FakeErr>(()) }).await.unwrap();
        }
        assert_eq!(gate.snapshot().await.backoff_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_throttle_errors_leave_backoff_untouched() {
        let gate = small_gate();
        let r = gate.call(|| async { Err::<(), _>(FakeErr::Client) }).await;
        assert!(matches!(r, Err(ThrottleError::Upstream(FakeErr::Client))));
        assert_eq!(gate.snapshot().await.backoff_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_caps_at_configured_maximum() {
        let gate = small_gate();
        for _ in 0..10 {
            let _ = gate
                .call(|| async { Err::<(), _>(FakeErr::RateLimited) })
                .await;
        }
        let snap = gate.snapshot().await;
        // Breaker opens at the threshold; the cap still bounds the counter.
        assert!(snap.breaker_open);
        assert!(snap.backoff_ms <= 500);
    }
}
