use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::errors::{ErrorKind, ToolError, codes};

/// Availability state of a [`CircuitBreaker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct BreakerState {
    status: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Three-state gate capping calls to an unhealthy dependency.
///
/// Consecutive failures reaching the threshold open the circuit; after the
/// reset timeout a single probe is let through (half-open) and its outcome
/// decides between closing and re-opening. A threshold of zero trips the
/// breaker on the first error.
pub struct CircuitBreaker {
    threshold: u32,
    reset_timeout: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            threshold,
            reset_timeout,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().status
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Force the breaker closed and clear the failure count.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.status = CircuitState::Closed;
        state.failures = 0;
        state.last_failure = None;
    }

    /// Run `f` through the breaker: rejected immediately with a
    /// `CIRCUIT_OPEN` error while open, otherwise invoked and its outcome
    /// recorded.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T, ToolError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ToolError>>,
    {
        self.can_proceed()?;
        let result = f().await;
        self.record_result(result.is_ok());
        result
    }

    fn can_proceed(&self) -> Result<(), ToolError> {
        let mut state = self.lock();
        match state.status {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = state
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(self.reset_timeout);
                if elapsed > self.reset_timeout {
                    state.status = CircuitState::HalfOpen;
                    state.failures = 0;
                    return Ok(());
                }
                let remaining = self.reset_timeout - elapsed;
                Err(ToolError::new(
                    ErrorKind::Execution,
                    codes::CIRCUIT_OPEN,
                    "circuit breaker is open",
                )
                .with_retry(remaining))
            }
        }
    }

    fn record_result(&self, success: bool) {
        let mut state = self.lock();
        match (state.status, success) {
            (CircuitState::Closed, true) => {
                state.failures = 0;
            }
            (CircuitState::Closed, false) => {
                state.failures += 1;
                state.last_failure = Some(Instant::now());
                if state.failures >= self.threshold {
                    state.status = CircuitState::Open;
                    warn!(failures = state.failures, "circuit breaker opened");
                }
            }
            (CircuitState::HalfOpen, true) => {
                state.status = CircuitState::Closed;
                state.failures = 0;
                state.last_failure = None;
            }
            (CircuitState::HalfOpen, false) => {
                state.failures += 1;
                state.last_failure = Some(Instant::now());
                if state.failures >= self.threshold {
                    state.status = CircuitState::Open;
                    warn!("circuit breaker re-opened after failed probe");
                }
            }
            (CircuitState::Open, false) => {
                state.last_failure = Some(Instant::now());
            }
            (CircuitState::Open, true) => {}
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().expect("circuit breaker lock poisoned")
    }
}

#[cfg(test)]
mod tests;
