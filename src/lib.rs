//! Seat and session broker.
//!
//! The daemon arbitrates exclusive access to DRM and evdev devices between
//! graphical session clients and coordinates handover on VT switches. It
//! speaks the seatd wire protocol over a Unix stream socket, passing device
//! fds to clients with SCM_RIGHTS.

use std::io;
use std::os::fd::{FromRawFd, OwnedFd};

pub mod client;
pub mod config;
pub mod connection;
pub mod devices;
pub mod event_loop;
pub mod protocol;
pub mod seat;
pub mod server;
pub mod terminal;

pub use server::Server;

pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0, 0];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    assert_ne!(fds[0], -1);
    assert_ne!(fds[1], -1);
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
