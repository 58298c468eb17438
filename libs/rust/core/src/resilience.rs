//! Resilience primitives: retry with backoff and a circuit breaker.

use parking_lot::Mutex;
use rand::{thread_rng, Rng};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::SERVING_METRICS;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("circuit open")]
    CircuitOpen,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(1500),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Run `op` until it succeeds or `max_retries` retries are exhausted; the closure receives
/// the attempt index.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let delay = cfg.delay_for(attempt);
                let delay_ms = delay.as_millis() as u64;
                debug!(attempt, error=%e, delay_ms, "retrying after failure");
                SERVING_METRICS.resilience.retries_total.add(1, &[]);
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState { Closed, Open { opened_at: Instant }, HalfOpen }

#[derive(Debug)]
struct BreakerInner { state: BreakerState, failures: usize, half_open_successes: usize }

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: usize,
    open_timeout: Duration,
    required_half_open_successes: usize,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: usize,
        open_timeout: Duration,
        required_half_open_successes: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                half_open_successes: 0,
            }),
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            required_half_open_successes: required_half_open_successes.max(1),
        }
    }

    pub fn state(&self) -> BreakerState { self.inner.lock().state }

    /// Whether a call may proceed. An expired open breaker moves to half-open.
    pub fn allow(&self) -> bool {
        let mut st = self.inner.lock();
        if let BreakerState::Open { opened_at } = st.state {
            if opened_at.elapsed() >= self.open_timeout {
                debug!("breaker half-open trial");
                st.state = BreakerState::HalfOpen;
                st.half_open_successes = 0;
            } else {
                SERVING_METRICS.resilience.breaker_rejections_total.add(1, &[]);
                return false;
            }
        }
        true
    }

    pub fn record_success(&self) {
        let mut st = self.inner.lock();
        match st.state {
            BreakerState::Closed => st.failures = 0,
            BreakerState::HalfOpen => {
                st.half_open_successes += 1;
                if st.half_open_successes >= self.required_half_open_successes {
                    st.state = BreakerState::Closed;
                    st.failures = 0;
                    st.half_open_successes = 0;
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    pub fn record_failure(&self) {
        let mut st = self.inner.lock();
        match st.state {
            BreakerState::Closed => {
                st.failures += 1;
                if st.failures >= self.failure_threshold { self.open(&mut st); }
            }
            BreakerState::HalfOpen => self.open(&mut st),
            BreakerState::Open { .. } => {}
        }
    }

    fn open(&self, st: &mut BreakerInner) {
        st.state = BreakerState::Open { opened_at: Instant::now() };
        st.half_open_successes = 0;
        SERVING_METRICS.resilience.breaker_open_total.add(1, &[]);
        warn!(failures = st.failures, "circuit opened");
    }

    /// Guard an async call. `E` must be able to represent an open circuit.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<ResilienceError>,
    {
        if !self.allow() { return Err(ResilienceError::CircuitOpen.into()); }
        match op().await {
            Ok(v) => { self.record_success(); Ok(v) }
            Err(e) => { self.record_failure(); Err(e) }
        }
    }
}
