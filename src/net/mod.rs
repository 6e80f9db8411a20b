//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! ServerConfig
//!     → listener.rs (tuned socket creation, bind, listen)
//!     → tls.rs (optional rustls identity + per-stack ALPN)
//!     → handed to a lifecycle serving unit
//!
//! Tuning order per listener:
//!     socket() → SO_REUSEADDR → tunables → bind() → listen()
//! ```
//!
//! # Design Decisions
//! - Listening sockets are built by hand so kernel tunables land before
//!   `listen()` and are inherited by every accepted socket
//! - One TLS identity serves both the TCP and QUIC stacks
//! - Peer-disconnect write errors are expected test terminations, not faults

pub mod listener;
pub mod tls;
pub mod tuning;

/// True when `err` just means the peer went away.
///
/// Saturation tests end with the client abandoning the transfer, so
/// broken pipes and connection resets are the expected end-state of a
/// measurement, not a server fault. Walks the source chain because
/// hyper wraps the underlying io error.
pub fn is_disconnect(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_pipe_is_a_disconnect() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer closed");
        assert!(is_disconnect(&err));
    }

    #[test]
    fn wrapped_reset_is_a_disconnect() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "write failed")
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let err = Wrapper(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_disconnect(&err));
    }

    #[test]
    fn other_errors_are_not_disconnects() {
        let err = std::io::Error::new(std::io::ErrorKind::OutOfMemory, "enomem");
        assert!(!is_disconnect(&err));
    }
}
