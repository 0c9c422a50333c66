//! Listening sockets shared across workers by port, and the per-listener
//! tuning options.

use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use tracing::debug;

use crate::config::SocketConfig;

const LISTEN_BACKLOG: libc::c_int = libc::SOMAXCONN;

// Classic BPF opcodes (linux/filter.h).
const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_RET: u16 = 0x06;
const BPF_A: u16 = 0x10;
// Ancillary load of the current CPU id.
const SKF_AD_OFF: i32 = -0x1000;
const SKF_AD_CPU: i32 = 36;

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to set {option}: {source}")]
    SetOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Bind a non-blocking IPv4 listener on `port` with `SO_REUSEPORT`, so every
/// worker can own a listener on the same port and the kernel spreads
/// connections between them.
pub fn bind_reuseport(port: u16) -> io::Result<TcpListener> {
    // SAFETY: socket(2) has no memory-safety preconditions.
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created descriptor owned by nobody else.
    let socket = unsafe { OwnedFd::from_raw_fd(fd) };

    let one: libc::c_int = 1;
    set_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &one, "SO_REUSEADDR")
        .map_err(into_io)?;
    set_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, &one, "SO_REUSEPORT")
        .map_err(into_io)?;

    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: libc::INADDR_ANY.to_be(),
        },
        sin_zero: [0; 8],
    };
    // SAFETY: addr is a valid sockaddr_in and the length matches it.
    let rc = unsafe {
        libc::bind(
            fd,
            ptr::from_ref(&addr).cast(),
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a bound stream socket.
    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(TcpListener::from(socket))
}

/// Apply the configured options to a listening socket.
///
/// Every requested option is attempted even if an earlier one fails; the last
/// failure is returned.
pub fn apply_tuning(fd: BorrowedFd<'_>, config: &SocketConfig) -> Result<(), SocketError> {
    if !config.enabled {
        return Ok(());
    }
    let fd = fd.as_raw_fd();
    let mut result = Ok(());

    if let Some(usec) = config.busy_poll_us {
        let value = libc::c_int::try_from(usec).unwrap_or(libc::c_int::MAX);
        record(
            &mut result,
            set_option(fd, libc::SOL_SOCKET, libc::SO_BUSY_POLL, &value, "SO_BUSY_POLL"),
        );
    }
    if config.nodelay {
        let one: libc::c_int = 1;
        record(
            &mut result,
            set_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &one, "TCP_NODELAY"),
        );
    }
    if let Some(enabled) = config.keepalive {
        let value = libc::c_int::from(enabled);
        record(
            &mut result,
            set_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &value, "SO_KEEPALIVE"),
        );
    }
    if config.reuseport_cbpf {
        record(&mut result, attach_cpu_steering(fd));
    }

    debug!(?config, ok = result.is_ok(), "applied socket tuning");
    result
}

/// Steer each new connection to the listener whose index in the reuseport
/// group equals the CPU that received it. With workers pinned one per CPU and
/// listeners opened in CPU order, a connection stays on one core end to end.
fn attach_cpu_steering(fd: RawFd) -> Result<(), SocketError> {
    let mut program = [
        libc::sock_filter {
            code: BPF_LD | BPF_W | BPF_ABS,
            jt: 0,
            jf: 0,
            k: (SKF_AD_OFF + SKF_AD_CPU) as u32,
        },
        libc::sock_filter {
            code: BPF_RET | BPF_A,
            jt: 0,
            jf: 0,
            k: 0,
        },
    ];
    let fprog = libc::sock_fprog {
        len: program.len() as u16,
        filter: program.as_mut_ptr(),
    };
    set_option(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ATTACH_REUSEPORT_CBPF,
        &fprog,
        "SO_ATTACH_REUSEPORT_CBPF",
    )
}

fn record(result: &mut Result<(), SocketError>, outcome: Result<(), SocketError>) {
    if outcome.is_err() {
        *result = outcome;
    }
}

fn set_option<T>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
    option: &'static str,
) -> Result<(), SocketError> {
    // SAFETY: value points to a live T and the length passed is its size.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            ptr::from_ref(value).cast(),
            size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(SocketError::SetOption {
            option,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

fn into_io(err: SocketError) -> io::Error {
    match err {
        SocketError::SetOption { source, .. } => source,
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    fn get_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> libc::c_int {
        let mut value: libc::c_int = -1;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: value and len are valid out-parameters of matching size.
        let rc = unsafe {
            libc::getsockopt(fd, level, name, ptr::from_mut(&mut value).cast(), &mut len)
        };
        assert_eq!(rc, 0, "{}", io::Error::last_os_error());
        value
    }

    fn unprivileged() -> SocketConfig {
        // Raising SO_BUSY_POLL needs CAP_NET_ADMIN.
        SocketConfig {
            busy_poll_us: None,
            ..SocketConfig::default()
        }
    }

    #[test]
    fn two_listeners_share_a_port() {
        let first = bind_reuseport(0).unwrap();
        let port = first.local_addr().unwrap().port();
        let second = bind_reuseport(port).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), port);
    }

    #[test]
    fn plain_listener_blocks_reuse() {
        let plain = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = plain.local_addr().unwrap().port();
        assert!(bind_reuseport(port).is_err());
    }

    #[test]
    fn tuning_sets_nodelay_and_keepalive() {
        let listener = bind_reuseport(0).unwrap();
        let config = SocketConfig {
            keepalive: Some(true),
            ..unprivileged()
        };
        apply_tuning(listener.as_fd(), &config).unwrap();
        let fd = listener.as_raw_fd();
        assert_eq!(get_int(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY), 1);
        assert_eq!(get_int(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE), 1);
    }

    #[test]
    fn keepalive_can_be_forced_off() {
        let listener = bind_reuseport(0).unwrap();
        apply_tuning(listener.as_fd(), &unprivileged()).unwrap();
        assert_eq!(
            get_int(listener.as_raw_fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE),
            0
        );
    }

    #[test]
    fn disabled_tuning_touches_nothing() {
        let listener = bind_reuseport(0).unwrap();
        let config = SocketConfig {
            enabled: false,
            ..SocketConfig::default()
        };
        apply_tuning(listener.as_fd(), &config).unwrap();
        assert_eq!(
            get_int(listener.as_raw_fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY),
            0
        );
    }

    #[test]
    fn failures_are_reported_after_trying_everything() {
        // Not a socket: every option fails.
        let file = tempfile::tempfile().unwrap();
        let err = apply_tuning(file.as_fd(), &unprivileged()).unwrap_err();
        let SocketError::SetOption { option, .. } = err;
        assert_eq!(option, "SO_ATTACH_REUSEPORT_CBPF");
    }
}
