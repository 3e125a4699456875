//! Retry-on-transient wrapper with per-operation circuit breaking.
//!
//! Outbound hub and store calls go through [`Resilience::call`], which
//! enforces a hard timeout, retries transient failures, and trips a
//! circuit breaker per operation key so a struggling dependency is probed
//! instead of hammered.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use mesh_primitives::Classify;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally.
    Closed,
    /// Requests are blocked until the reset timeout elapses.
    Open,
    /// A limited number of probe requests are allowed through.
    HalfOpen,
}

/// Thresholds and timing for a circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` before the circuit closes.
    pub success_threshold: u32,
    /// Time in `Open` before probing begins.
    pub reset_timeout: Duration,
    /// Probe requests allowed while `HalfOpen`.
    pub half_open_max_requests: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_requests: 2,
        }
    }
}

/// Circuit breaker for one operation key.
#[derive(Debug)]
pub struct CircuitBreaker {
    operation: String,
    config: BreakerConfig,
    state: RwLock<BreakerState>,
    failures: AtomicU32,
    successes: AtomicU32,
    half_open_requests: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for an operation key.
    #[must_use]
    pub fn new(operation: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            operation: operation.into(),
            config,
            state: RwLock::new(BreakerState::Closed),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            half_open_requests: AtomicU32::new(0),
            opened_at: RwLock::new(None),
        }
    }

    /// Returns the current state, applying the open-to-half-open timeout.
    pub async fn state(&self) -> BreakerState {
        self.check_reset_timeout().await;
        *self.state.read().await
    }

    /// Returns `true` when a request may proceed.
    pub async fn allow_request(&self) -> bool {
        self.check_reset_timeout().await;
        match *self.state.read().await {
            BreakerState::Closed => true,
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                let used = self.half_open_requests.fetch_add(1, Ordering::SeqCst);
                used < self.config.half_open_max_requests
            }
        }
    }

    /// Records a successful call.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        match *state {
            BreakerState::Closed => {
                self.failures.store(0, Ordering::SeqCst);
            }
            BreakerState::HalfOpen => {
                let successes = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    info!(operation = %self.operation, "circuit closing after recovery");
                    self.transition(&mut state, BreakerState::Closed).await;
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Records a failed call.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        match *state {
            BreakerState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    warn!(operation = %self.operation, failures, "circuit opening");
                    self.transition(&mut state, BreakerState::Open).await;
                }
            }
            BreakerState::HalfOpen => {
                warn!(operation = %self.operation, "circuit re-opening after probe failure");
                self.transition(&mut state, BreakerState::Open).await;
            }
            BreakerState::Open => {}
        }
    }

    async fn check_reset_timeout(&self) {
        if *self.state.read().await != BreakerState::Open {
            return;
        }
        let elapsed = self
            .opened_at
            .read()
            .await
            .map(|at| at.elapsed() >= self.config.reset_timeout)
            .unwrap_or(false);
        if elapsed {
            let mut state = self.state.write().await;
            if *state == BreakerState::Open {
                debug!(operation = %self.operation, "circuit half-open; probing");
                self.transition(&mut state, BreakerState::HalfOpen).await;
            }
        }
    }

    async fn transition(&self, state: &mut BreakerState, next: BreakerState) {
        *state = next;
        match next {
            BreakerState::Closed => {
                self.failures.store(0, Ordering::SeqCst);
                self.successes.store(0, Ordering::SeqCst);
                *self.opened_at.write().await = None;
            }
            BreakerState::Open => {
                self.successes.store(0, Ordering::SeqCst);
                self.half_open_requests.store(0, Ordering::SeqCst);
                *self.opened_at.write().await = Some(Instant::now());
            }
            BreakerState::HalfOpen => {
                self.successes.store(0, Ordering::SeqCst);
                self.half_open_requests.store(0, Ordering::SeqCst);
            }
        }
    }
}

/// Configuration for the resilience wrapper.
#[derive(Debug, Clone, Copy)]
pub struct ResilienceConfig {
    /// Maximum attempts per call, counting the first.
    pub max_attempts: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Hard timeout applied to each attempt.
    pub call_timeout: Duration,
    /// Breaker thresholds shared by all operation keys.
    pub breaker: BreakerConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(200),
            call_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Errors produced by the resilience wrapper.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The breaker for this operation is open.
    #[error("circuit open for operation `{operation}`")]
    CircuitOpen {
        /// Operation key whose breaker is open.
        operation: String,
    },
    /// Every attempt timed out or failed transiently.
    #[error("operation `{operation}` failed after {attempts} attempts")]
    Exhausted {
        /// Operation key that kept failing.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt, absent when it timed out.
        last_error: Option<E>,
    },
    /// The call failed with a non-transient error; no retry was attempted.
    #[error("non-transient failure")]
    NonTransient(E),
}

/// Wraps fallible async operations with timeout, retry, and breaking.
#[derive(Debug, Default)]
pub struct Resilience {
    config: ResilienceConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Resilience {
    /// Creates a wrapper with the given configuration.
    #[must_use]
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for an operation key, creating it if needed.
    #[must_use]
    pub fn breaker(&self, operation: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(operation.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(operation, self.config.breaker))
            })
            .clone()
    }

    /// Runs an operation with hard timeout, transient retry, and breaking.
    ///
    /// The factory is invoked once per attempt. Errors whose kind is not
    /// transient short-circuit immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::CircuitOpen`] without calling the factory,
    /// [`ResilienceError::NonTransient`] on a non-retryable failure, or
    /// [`ResilienceError::Exhausted`] when every attempt failed.
    pub async fn call<T, E, F, Fut>(
        &self,
        operation: &str,
        mut attempt: F,
    ) -> Result<T, ResilienceError<E>>
    where
        E: Classify,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(operation);
        if !breaker.allow_request().await {
            return Err(ResilienceError::CircuitOpen {
                operation: operation.to_string(),
            });
        }

        let mut last_error = None;
        for round in 1..=self.config.max_attempts {
            match tokio::time::timeout(self.config.call_timeout, attempt()).await {
                Ok(Ok(value)) => {
                    breaker.record_success().await;
                    return Ok(value);
                }
                Ok(Err(err)) if err.kind().is_retryable() => {
                    warn!(operation, round, "transient failure; retrying");
                    breaker.record_failure().await;
                    last_error = Some(err);
                }
                Ok(Err(err)) => {
                    // Validation and state errors are the caller's problem,
                    // not the dependency's; they do not trip the breaker.
                    return Err(ResilienceError::NonTransient(err));
                }
                Err(_elapsed) => {
                    warn!(operation, round, "call timed out");
                    breaker.record_failure().await;
                }
            }

            if round < self.config.max_attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        Err(ResilienceError::Exhausted {
            operation: operation.to_string(),
            attempts: self.config.max_attempts,
            last_error,
        })
    }
}
