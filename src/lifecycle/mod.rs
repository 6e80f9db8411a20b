//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (orchestrator.rs):
//!     ServerConfig → tuned listeners → TLS/QUIC wrap → one unit per stack
//!
//! Shutdown (orchestrator.rs + unit.rs):
//!     Signal received → units stop accepting → drain in-flight → Stopped
//!
//! Signals (signals.rs):
//!     SIGINT/SIGTERM → graceful drain
//!     second signal → abandon the drain
//! ```
//!
//! # Design Decisions
//! - One task per serving unit; each owns its listener and connections
//! - Unit states walk one way: Created → Serving → ShuttingDown → Stopped
//! - Shutdown has a deadline: whatever outlives the grace is aborted

pub mod orchestrator;
pub mod signals;
pub mod unit;

pub use orchestrator::{BoundEndpoint, Orchestrator, ServeError};
pub use unit::{ServingUnit, TcpStack, UnitState};
