//! Server-side view of one connected session client.
//!
//! A `Client` owns its connection and its device ledger. Seat membership is
//! a weak link (an index into the server's seat table) so that the seat can
//! be consulted without circular ownership.

use std::io;
use std::num::NonZeroU64;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::errno::Errno;
use thiserror::Error;

use crate::connection::{Connection, IoMode};
use crate::protocol::{self, Header};
use crate::seat::SeatDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(NonZeroU64);

impl ClientId {
    pub fn first() -> Self {
        Self(NonZeroU64::MIN)
    }

    pub fn next(self) -> Self {
        Self(self.0.checked_add(1).unwrap())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    New,
    Active,
    PendingDisable,
    Disabled,
    Closed,
}

/// Errors that terminate a client connection. State and resource errors are
/// answered on the wire instead and never surface here.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("client disconnected")]
    Disconnected,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub struct Client {
    id: ClientId,
    pid: libc::pid_t,
    uid: libc::uid_t,
    gid: libc::gid_t,
    pub(crate) conn: Connection,
    /// Index into the server's seat table, set while attached.
    pub(crate) seat: Option<usize>,
    /// VT number on VT-bound seats, seat-local sequence otherwise. −1 until
    /// the client attaches; it never resets, which is what makes a client
    /// single-use.
    pub(crate) session: i32,
    pub(crate) state: ClientState,
    pub(crate) devices: Vec<SeatDevice>,
    /// Set when a flush could not complete and the event loop should watch
    /// for writability.
    pub(crate) wants_write: bool,
    /// The write interest currently submitted to the event loop.
    pub(crate) subscribed_write: bool,
}

impl Client {
    /// Wrap an accepted connection, capturing the peer's credentials.
    pub fn new(stream: UnixStream, id: ClientId) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let (pid, uid, gid) = peer_creds(&stream)?;
        Ok(Self {
            id,
            pid,
            uid,
            gid,
            conn: Connection::from(stream),
            seat: None,
            session: -1,
            state: ClientState::New,
            devices: Vec::new(),
            wants_write: false,
            subscribed_write: false,
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn uid(&self) -> libc::uid_t {
        self.uid
    }

    pub fn gid(&self) -> libc::gid_t {
        self.gid
    }

    pub fn fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn session(&self) -> i32 {
        self.session
    }

    pub(crate) fn find_device(&self, device_id: i32) -> Option<&SeatDevice> {
        self.devices.iter().find(|d| d.device_id() == device_id)
    }

    pub(crate) fn send_error(&mut self, error_code: Errno) -> io::Result<()> {
        self.conn.put_header(Header {
            opcode: protocol::SERVER_ERROR,
            size: 4,
        })?;
        self.conn.put_i32(error_code as i32)
    }

    pub(crate) fn send_enable(&mut self) -> io::Result<()> {
        self.conn.put_header(Header {
            opcode: protocol::SERVER_ENABLE_SEAT,
            size: 0,
        })?;
        self.flush()
    }

    pub(crate) fn send_disable(&mut self) -> io::Result<()> {
        self.conn.put_header(Header {
            opcode: protocol::SERVER_DISABLE_SEAT,
            size: 0,
        })?;
        self.flush()
    }

    /// Flush pending output. A partial flush is not an error: the remainder
    /// stays buffered and `wants_write` asks the event loop for a
    /// writability wakeup.
    pub(crate) fn flush(&mut self) -> io::Result<()> {
        match self.conn.flush(IoMode::NonBlocking) {
            Ok(()) => {
                self.wants_write = false;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.wants_write = true;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(target_os = "linux")]
fn peer_creds(stream: &UnixStream) -> io::Result<(libc::pid_t, libc::uid_t, libc::gid_t)> {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    } == -1
    {
        return Err(io::Error::last_os_error());
    }
    Ok((cred.pid, cred.uid, cred.gid))
}

#[cfg(target_os = "freebsd")]
fn peer_creds(stream: &UnixStream) -> io::Result<(libc::pid_t, libc::uid_t, libc::gid_t)> {
    let mut cred: libc::xucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::xucred>() as libc::socklen_t;
    if unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::LOCAL_PEERCRED,
            (&mut cred as *mut libc::xucred).cast(),
            &mut len,
        )
    } == -1
    {
        return Err(io::Error::last_os_error());
    }
    // LOCAL_PEERCRED carries no pid.
    let gid = if cred.cr_ngroups > 0 { cred.cr_groups[0] } else { libc::gid_t::MAX };
    Ok((-1, cred.cr_uid, gid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_own_credentials() {
        let (a, _b) = UnixStream::pair().unwrap();
        let client = Client::new(a, ClientId::first()).unwrap();
        assert_eq!(client.uid(), unsafe { libc::getuid() });
        assert_eq!(client.gid(), unsafe { libc::getgid() });
        #[cfg(target_os = "linux")]
        assert_eq!(client.pid(), std::process::id() as libc::pid_t);
        assert_eq!(client.session(), -1);
        assert_eq!(client.state(), ClientState::New);
    }
}
