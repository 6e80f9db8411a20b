//! Network quality measurement server library.

pub mod config;
pub mod counters;
pub mod http;
pub mod lifecycle;
pub mod net;

pub use config::ServerConfig;
pub use counters::ByteCounters;
pub use lifecycle::Orchestrator;
