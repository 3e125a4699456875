//! Mesh orchestration server facade.
//!
//! Depend on this crate to embed the server: it bundles the component
//! crates behind one roof and exposes the [`Orchestrator`] composition
//! root plus the typed [`EventBus`].

#![warn(missing_docs, clippy::pedantic)]

mod bus;
mod orchestrator;

/// Typed publish/subscribe topics.
pub use bus::{EnrollmentDecided, EventBus};
/// The assembled server and its error type.
pub use orchestrator::{Orchestrator, ServerError, ServerResult};

/// Shared primitives: ids, capabilities, job records.
pub use mesh_primitives as primitives;

/// Typed server configuration.
pub use mesh_config as config;

/// Credential store: server keys, certificates, bootstrap token.
pub use mesh_credentials as credentials;

/// Trust-on-first-use enrollment.
pub use mesh_enroll as enroll;

/// Agent presence registry and heartbeat monitoring.
pub use mesh_registry as registry;

/// Job lifecycle engine.
pub use mesh_jobs as jobs;

/// Dispatcher, timers, and resilience.
pub use mesh_dispatch as dispatch;

/// The bidirectional RPC hub.
pub use mesh_hub as hub;

use tracing_subscriber::EnvFilter;

/// Installs a process-wide tracing subscriber honoring `RUST_LOG`.
///
/// Intended for binaries and examples embedding the server; libraries and
/// tests should install their own subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
