//! Retry with exponential backoff and a per-source circuit breaker.
//!
//! Retries only fire for errors flagged retryable (network failures,
//! HTTP 5xx, `SQLITE_BUSY`). The breaker counts failures in a sliding
//! 60 s window, opens at 5, fails fast for 30 s, then half-opens and lets
//! a single probe through.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{SourceError, SourceResult};
use crate::prelude::*;
use crate::row::Row;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const MAX_ATTEMPTS: u32 = 3;
const JITTER: f64 = 0.2;

const WINDOW: Duration = Duration::from_secs(60);
const FAILURE_THRESHOLD: usize = 5;
const OPEN_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    failures: VecDeque<Instant>,
}

/// One breaker per source, shared by fetch and apply paths.
#[derive(Debug)]
pub struct Circuit {
    inner: Mutex<Inner>,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: VecDeque::new(),
            }),
        }
    }
}

impl Circuit {
    /// Gate a call. `Err` means the breaker is open and the call must fail
    /// fast without touching the driver.
    pub fn check(&self) -> SourceResult<()> {
        let mut inner = self.inner.lock().expect("circuit lock poisoned");

        match inner.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open { since } => {
                if since.elapsed() >= OPEN_PERIOD {
                    inner.state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(SourceError::circuit_open("circuit breaker is open"))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit lock poisoned");
        inner.state = State::Closed;
        inner.failures.clear();
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("circuit lock poisoned");

        if inner.state == State::HalfOpen {
            // The probe failed; straight back to open.
            inner.state = State::Open { since: now };
            return;
        }

        inner.failures.push_back(now);
        while let Some(front) = inner.failures.front() {
            if now.duration_since(*front) > WINDOW {
                inner.failures.pop_front();
            } else {
                break;
            }
        }

        if inner.failures.len() >= FAILURE_THRESHOLD {
            inner.state = State::Open { since: now };
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        matches!(
            self.inner.lock().unwrap().state,
            State::Open { .. }
        )
    }
}

fn backoff_for(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt);
    let jitter = 1.0 + JITTER * (fastrand::f64() * 2.0 - 1.0);
    base.mul_f64(jitter)
}

/// Run `call` through the breaker with up to [`MAX_ATTEMPTS`] tries.
/// Non-retryable errors abort immediately; every attempt is individually
/// gated so an opening breaker cuts a retry loop short.
pub async fn with_resilience<F, Fut>(
    name: &str,
    op: &str,
    circuit: &Circuit,
    mut call: F,
) -> SourceResult<Vec<Row>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = SourceResult<Vec<Row>>>,
{
    let mut attempt = 0;

    loop {
        circuit
            .check()
            .map_err(|e| e.with_source(name).with_op(op))?;

        match call().await {
            Ok(rows) => {
                circuit.record_success();
                return Ok(rows);
            }
            Err(err) => {
                circuit.record_failure();
                let err = err.with_source(name).with_op(op);

                attempt += 1;
                if !err.retryable() || attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }

                let delay = backoff_for(attempt - 1);
                debug!(
                    source = name,
                    op,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after {err}"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_retryable_until_success() {
        let circuit = Circuit::default();
        let calls = AtomicU32::new(0);

        let result = with_resilience("s", "fetch", &circuit, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SourceError::connection("flaky"))
                } else {
                    Ok(vec![])
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_aborts_first_attempt() {
        let circuit = Circuit::default();
        let calls = AtomicU32::new(0);

        let result = with_resilience("s", "fetch", &circuit, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SourceError::validation("bad input")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn breaker_opens_at_threshold() {
        let circuit = Circuit::default();

        for _ in 0..FAILURE_THRESHOLD {
            assert!(circuit.check().is_ok());
            circuit.record_failure();
        }

        assert!(circuit.is_open());
        let err = circuit.check().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::CircuitOpen);
    }

    #[test]
    fn success_closes_breaker() {
        let circuit = Circuit::default();

        for _ in 0..FAILURE_THRESHOLD {
            circuit.record_failure();
        }
        assert!(circuit.is_open());

        circuit.record_success();
        assert!(circuit.check().is_ok());
    }

    #[test]
    fn backoff_progression_is_bounded() {
        for attempt in 0..3 {
            let d = backoff_for(attempt);
            let base = BACKOFF_BASE * 2u32.pow(attempt);
            assert!(d >= base.mul_f64(1.0 - JITTER - 0.01));
            assert!(d <= base.mul_f64(1.0 + JITTER + 0.01));
        }
    }
}
