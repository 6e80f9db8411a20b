//! Kernel socket tuning for measurement listeners.
//!
//! # Responsibilities
//! - Apply `TCP_NOTSENT_LOWAT` so unsent data queues in the measurement
//!   loop instead of in kernel buffers
//! - Apply `TCP_CONGESTION` for L4S-style congestion control testing
//! - Apply `IP_TOS` / `IPV6_TCLASS` for differentiated-service testing
//!
//! # Design Decisions
//! - Tunables are applied to the listening socket before `listen()`;
//!   accepted sockets inherit them
//! - A requested tunable that the platform cannot set is an error;
//!   an omitted tunable never touches the socket
//! - Platform differences live in the `sys` module, one body per target

use std::net::SocketAddr;

use socket2::Socket;
use thiserror::Error;

use crate::config::SocketTuning;

#[derive(Debug, Error)]
pub enum TuningError {
    #[error("{tunable} is not supported on this platform")]
    Unsupported { tunable: &'static str },

    #[error("setting {tunable} failed: {source}")]
    Set {
        tunable: &'static str,
        source: std::io::Error,
    },
}

/// Applies every requested tunable to `socket`, in a fixed order.
///
/// `addr` selects between the IPv4 and IPv6 traffic-class option. Fails on
/// the first tunable that cannot be applied.
pub fn apply(socket: &Socket, addr: &SocketAddr, tuning: &SocketTuning) -> Result<(), TuningError> {
    if let Some(bytes) = tuning.send_lowat {
        tracing::info!(bytes, "setting TCP_NOTSENT_LOWAT");
        sys::set_send_lowat(socket, bytes)?;
    }

    if let Some(algorithm) = tuning.congestion.as_deref() {
        tracing::info!(algorithm, "setting TCP_CONGESTION");
        sys::set_congestion(socket, algorithm)?;
    }

    if let Some(tos) = tuning.tos {
        tracing::info!(tos, "setting IP_TOS");
        sys::set_tos(socket, addr.is_ipv6(), tos)?;
    }

    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
mod sys {
    use std::os::fd::AsRawFd;

    use socket2::Socket;

    use super::TuningError;

    fn setsockopt(
        socket: &Socket,
        level: libc::c_int,
        name: libc::c_int,
        value: *const libc::c_void,
        len: libc::socklen_t,
        tunable: &'static str,
    ) -> Result<(), TuningError> {
        let rc = unsafe { libc::setsockopt(socket.as_raw_fd(), level, name, value, len) };
        if rc == 0 {
            Ok(())
        } else {
            Err(TuningError::Set {
                tunable,
                source: std::io::Error::last_os_error(),
            })
        }
    }

    pub fn set_send_lowat(socket: &Socket, bytes: u32) -> Result<(), TuningError> {
        let value = bytes as libc::c_int;
        setsockopt(
            socket,
            libc::IPPROTO_TCP,
            libc::TCP_NOTSENT_LOWAT,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            "TCP_NOTSENT_LOWAT",
        )
    }

    #[cfg(target_os = "linux")]
    pub fn set_congestion(socket: &Socket, algorithm: &str) -> Result<(), TuningError> {
        // The kernel takes the algorithm name as a plain byte string.
        let bytes = algorithm.as_bytes();
        setsockopt(
            socket,
            libc::IPPROTO_TCP,
            libc::TCP_CONGESTION,
            bytes.as_ptr() as *const libc::c_void,
            bytes.len() as libc::socklen_t,
            "TCP_CONGESTION",
        )
    }

    #[cfg(target_os = "macos")]
    pub fn set_congestion(_socket: &Socket, _algorithm: &str) -> Result<(), TuningError> {
        Err(TuningError::Unsupported {
            tunable: "TCP_CONGESTION",
        })
    }

    pub fn set_tos(socket: &Socket, ipv6: bool, tos: u8) -> Result<(), TuningError> {
        let value = tos as libc::c_int;
        let (level, name, tunable) = if ipv6 {
            (libc::IPPROTO_IPV6, libc::IPV6_TCLASS, "IPV6_TCLASS")
        } else {
            (libc::IPPROTO_IP, libc::IP_TOS, "IP_TOS")
        };
        setsockopt(
            socket,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            tunable,
        )
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod sys {
    use socket2::Socket;

    use super::TuningError;

    pub fn set_send_lowat(_socket: &Socket, _bytes: u32) -> Result<(), TuningError> {
        Err(TuningError::Unsupported {
            tunable: "TCP_NOTSENT_LOWAT",
        })
    }

    pub fn set_congestion(_socket: &Socket, _algorithm: &str) -> Result<(), TuningError> {
        Err(TuningError::Unsupported {
            tunable: "TCP_CONGESTION",
        })
    }

    pub fn set_tos(_socket: &Socket, _ipv6: bool, _tos: u8) -> Result<(), TuningError> {
        Err(TuningError::Unsupported {
            tunable: "IP_TOS",
        })
    }
}
