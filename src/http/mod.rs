//! HTTP measurement surface.
//!
//! # Data Flow
//! ```text
//! accepted connection (any protocol stack)
//!     → handlers.rs (per-listener axum router)
//!         → body.rs (chunked / periodic streaming bodies)
//!         → instance.rs (shared counters, cached discovery document)
//!             → discovery.rs (document rendered once per instance)
//!
//! h3.rs bridges QUIC request streams onto the same router
//! ```

pub mod body;
pub mod discovery;
pub mod h3;
pub mod handlers;
pub mod instance;

pub use handlers::router;
pub use instance::ServerInstance;
