//! Bidirectional RPC hub for the mesh orchestrator.
//!
//! The hub is the session layer over any reliable, ordered, message-framed
//! transport: it authenticates connections, fixes each session to one
//! agent identity, routes inbound agent messages to the registry and the
//! dispatcher, and fans progress and stream items out to subscribers.
//! Wire framing belongs to the transport implementation.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod handlers;
mod hub;
mod protocol;
mod session;
mod streams;

/// Error type and result alias for hub operations.
pub use error::{HubError, HubResult};
/// Per-message handler trait and dispatch entry point.
pub use handlers::{HandlerContext, SessionHandler, dispatch_message};
/// The hub itself.
pub use hub::{Hub, HubConfig};
/// Protocol message sets for both directions.
pub use protocol::{AgentMessage, ServerMessage, SessionAuth};
/// Session state and the transport abstraction.
pub use session::{SessionState, SessionTransport};
/// Stream and progress fan-out.
pub use streams::{StreamRelay, StreamSubscription};
