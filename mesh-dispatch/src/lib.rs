//! Push-based job dispatch for the mesh orchestrator.
//!
//! Routes pending jobs to eligible connected agents over bounded per-agent
//! channels, runs the acknowledgement and execution timers, applies the
//! retry policy, and reassigns work when agents disconnect. Outbound hub
//! calls are wrapped by a resilience helper with retry-on-transient and a
//! per-operation circuit breaker.

#![warn(missing_docs, clippy::pedantic)]

mod dispatcher;
mod resilience;
mod retry;
mod timers;

/// The dispatcher and its configuration.
pub use dispatcher::{Dispatcher, DispatcherConfig};
/// Retry-on-transient wrapper and circuit breaker.
pub use resilience::{
    BreakerConfig, BreakerState, CircuitBreaker, Resilience, ResilienceConfig, ResilienceError,
};
/// Jittered exponential backoff policy.
pub use retry::RetryPolicy;
/// The multiplexed deadline queue.
pub use timers::{TimerKey, TimerWheel};
