//! Blocking readiness wait on a raw socket.
use std::{os::fd::RawFd, time::Duration};

use crate::{Error, Result};

/// Block until `fd` is readable, errored, or `timeout` elapsed.
///
/// Poll failures are not reported, the caller will notice on its next read.
pub fn wait_read(fd: Option<RawFd>, timeout: Option<Duration>) -> Result<()> {
    wait_fd(fd, false, timeout)
}

/// Block until `fd` is writable, errored, or `timeout` elapsed.
pub fn wait_write(fd: Option<RawFd>, timeout: Option<Duration>) -> Result<()> {
    wait_fd(fd, true, timeout)
}

fn wait_fd(fd: Option<RawFd>, for_write: bool, timeout: Option<Duration>) -> Result<()> {
    let fd = match fd {
        Some(fd) if fd >= 0 => fd,
        _ => return Err(Error::broken("Connection to database failed.")),
    };

    let events = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL
        | if for_write { libc::POLLOUT } else { libc::POLLIN };
    let mut pfd = libc::pollfd { fd, events, revents: 0 };
    let timeout = timeout.map_or(-1, |e| e.as_millis().min(i32::MAX as u128) as libc::c_int);

    crate::common::verbose!(fd, for_write, timeout, "poll");

    // SAFETY: `pfd` is a single valid pollfd that outlives the call
    unsafe { libc::poll(&mut pfd, 1, timeout) };
    Ok(())
}
