//! One-shot readiness handshake between a parent and one forked worker.
//!
//! Backed by an `eventfd(2)` counter. The descriptor is created before fork,
//! so parent and child reach the same kernel object through their own copies
//! of it. Both operations consume the handle, which closes that side's copy:
//! a handle can be signalled or awaited at most once.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

#[derive(Debug)]
pub struct ReadinessChannel {
    fd: OwnedFd,
}

impl ReadinessChannel {
    pub fn new() -> io::Result<Self> {
        // SAFETY: eventfd has no memory-safety preconditions.
        let fd = unsafe { libc::eventfd(0, libc::EFD_SEMAPHORE | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// Increment the counter and close this side's handle.
    pub fn signal(self) -> io::Result<()> {
        let mut file = File::from(self.fd);
        file.write_all(&1u64.to_ne_bytes())
    }

    /// Check whether the counter is non-zero, waiting at most `timeout`.
    ///
    /// Does not consume the signal; follow with [`wait`](Self::wait).
    pub fn poll_ready(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
        // SAFETY: pfd is a valid pollfd and the count is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(rc > 0)
    }

    /// Block until the counter is non-zero, then close this side's handle.
    pub fn wait(self) -> io::Result<()> {
        let mut file = File::from(self.fd);
        let mut value = [0u8; 8];
        file.read_exact(&mut value)
    }
}

impl AsRawFd for ReadinessChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
