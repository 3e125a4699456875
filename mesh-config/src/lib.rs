//! Typed configuration for the mesh server.
//!
//! Invalid configuration is a startup-fatal error: the server refuses to
//! come up rather than run with a broken policy.

#![warn(missing_docs, clippy::pedantic)]

use std::time::Duration;

use mesh_primitives::{Classify, ErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Fatal
    }
}

/// Recognized server options.
///
/// Durations use serde's native `Duration` representation; loaders that
/// prefer human-friendly units can layer their own parsing on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Time without a heartbeat before an agent is declared disconnected.
    pub heartbeat_timeout: Duration,
    /// Time allowed between assignment and the agent's acknowledgement.
    pub ack_timeout: Duration,
    /// Bounded per-agent send channel capacity.
    pub per_agent_queue: usize,
    /// Base delay of the retry backoff.
    pub retry_base_delay: Duration,
    /// Upper bound of the retry backoff.
    pub retry_max_delay: Duration,
    /// Default retry budget for jobs that do not specify one.
    pub max_retry_attempts: u32,
    /// Default execution timeout for jobs that do not specify one.
    pub default_job_timeout: Duration,
    /// Interval between fallback dispatch passes.
    pub dispatch_tick_interval: Duration,
    /// Approve enrollments inline using the current bootstrap token.
    pub bootstrap_auto_approve: bool,
    /// Reject sessions lacking a valid certificate.
    pub require_certificate_auth: bool,
    /// Development-only: disable authentication entirely.
    pub allow_anonymous: bool,
    /// Legacy shared secret accepted in place of a certificate.
    pub legacy_api_token: Option<String>,
    /// Validity window of certificates issued at enrollment approval.
    pub certificate_validity: Duration,
    /// Time a pending enrollment may wait before expiring.
    pub enrollment_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            per_agent_queue: 16,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            max_retry_attempts: 3,
            default_job_timeout: Duration::from_secs(300),
            dispatch_tick_interval: Duration::from_millis(250),
            bootstrap_auto_approve: false,
            require_certificate_auth: false,
            allow_anonymous: false,
            legacy_api_token: None,
            certificate_validity: Duration::from_secs(30 * 24 * 3600),
            enrollment_ttl: Duration::from_secs(24 * 3600),
        }
    }
}

impl ServerConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first broken field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat timeout must be greater than zero",
            ));
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::Invalid("ack timeout must be greater than zero"));
        }
        if self.per_agent_queue == 0 {
            return Err(ConfigError::Invalid(
                "per-agent queue capacity must be greater than zero",
            ));
        }
        if self.retry_base_delay.is_zero() {
            return Err(ConfigError::Invalid(
                "retry base delay must be greater than zero",
            ));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(ConfigError::Invalid(
                "retry base delay cannot exceed retry max delay",
            ));
        }
        if self.default_job_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "default job timeout must be greater than zero",
            ));
        }
        if self.dispatch_tick_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "dispatch tick interval must be greater than zero",
            ));
        }
        if self.certificate_validity.is_zero() {
            return Err(ConfigError::Invalid(
                "certificate validity must be greater than zero",
            ));
        }
        if self.enrollment_ttl.is_zero() {
            return Err(ConfigError::Invalid(
                "enrollment TTL must be greater than zero",
            ));
        }
        if self.require_certificate_auth && self.allow_anonymous {
            return Err(ConfigError::Invalid(
                "certificate auth and anonymous access are mutually exclusive",
            ));
        }
        Ok(())
    }
}
