//! The wire backend: framed request/reply over the broker's socket.
//!
//! Server-initiated `ENABLE_SEAT`/`DISABLE_SEAT` notifications may arrive
//! interleaved with the reply to a synchronous request. They are parked in
//! a FIFO here and fired only from `dispatch`, never from inside a
//! synchronous call, so callers are not re-entered mid-request.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use log::debug;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use seatmux::connection::{Connection, IoMode};
use seatmux::protocol::{self, Header, MAX_PATH_LEN, MAX_SEAT_LEN};

use crate::{DeviceId, Error, SeatEvent};

pub(crate) struct SeatdBackend {
    conn: Connection,
    seat_name: String,
    pending_events: VecDeque<SeatEvent>,
}

impl SeatdBackend {
    /// Connect to the broker's socket (`$SEATD_SOCK`, default
    /// `/run/seatd.sock`).
    pub(crate) fn connect() -> io::Result<UnixStream> {
        let path = std::env::var_os("SEATD_SOCK")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/run/seatd.sock"));
        UnixStream::connect(path)
    }

    /// Perform the `OPEN_SEAT` handshake over an established stream.
    pub(crate) fn open_seat(stream: UnixStream) -> Result<Self, Error> {
        stream.set_nonblocking(true)?;
        let mut backend = Self {
            conn: Connection::from(stream),
            seat_name: String::new(),
            pending_events: VecDeque::new(),
        };

        backend.conn.put_header(Header {
            opcode: protocol::CLIENT_OPEN_SEAT,
            size: 0,
        })?;
        backend.dispatch_until_reply()?;

        let size = backend.read_header_expect(protocol::SERVER_SEAT_OPENED)? as usize;
        if size < 2 {
            return Err(Error::Protocol("malformed seat_opened message"));
        }
        let name_len = backend.conn.get_u16()? as usize;
        if 2 + name_len > size || name_len >= MAX_SEAT_LEN {
            return Err(Error::Protocol("malformed seat_opened message"));
        }
        let mut name = vec![0u8; name_len];
        backend.conn.get(&mut name)?;
        backend.seat_name =
            String::from_utf8(name).map_err(|_| Error::Protocol("seat name is not utf-8"))?;

        debug!("opened seat '{}'", backend.seat_name);
        Ok(backend)
    }

    pub(crate) fn name(&self) -> &str {
        &self.seat_name
    }

    pub(crate) fn get_fd(&self) -> BorrowedFd {
        unsafe { BorrowedFd::borrow_raw(self.conn.as_raw_fd()) }
    }

    pub(crate) fn pop_event(&mut self) -> Option<SeatEvent> {
        self.pending_events.pop_front()
    }

    pub(crate) fn open_device(&mut self, path: &Path) -> Result<(OwnedFd, DeviceId), Error> {
        let bytes = path.as_os_str().as_encoded_bytes();
        let path_len = bytes.len() + 1;
        if path_len > MAX_PATH_LEN {
            return Err(Errno::EINVAL.into());
        }

        self.conn.put_header(Header {
            opcode: protocol::CLIENT_OPEN_DEVICE,
            size: (2 + path_len) as u16,
        })?;
        self.conn.put_u16(path_len as u16)?;
        self.conn.put(bytes)?;
        self.conn.put(&[0])?;
        self.dispatch_until_reply()?;

        let size = self.read_header_expect(protocol::SERVER_DEVICE_OPENED)?;
        if size < 4 {
            return Err(Error::Protocol("malformed device_opened message"));
        }
        let device_id = self.conn.get_i32()?;
        let fd = self
            .conn
            .get_fd()
            .map_err(|_| Error::Protocol("device_opened reply carried no fd"))?;
        Ok((fd, DeviceId(device_id)))
    }

    pub(crate) fn close_device(&mut self, device_id: DeviceId) -> Result<(), Error> {
        if device_id.0 < 0 {
            return Err(Errno::EINVAL.into());
        }

        self.conn.put_header(Header {
            opcode: protocol::CLIENT_CLOSE_DEVICE,
            size: 4,
        })?;
        self.conn.put_i32(device_id.0)?;
        self.dispatch_until_reply()?;

        let size = self.read_header_expect(protocol::SERVER_DEVICE_CLOSED)?;
        if size < 4 {
            return Err(Error::Protocol("malformed device_closed message"));
        }
        if self.conn.get_i32()? != device_id.0 {
            return Err(Error::Protocol("device_closed for a different device"));
        }
        Ok(())
    }

    pub(crate) fn switch_session(&mut self, session: i32) -> Result<(), Error> {
        if session < 0 {
            return Err(Errno::EINVAL.into());
        }
        self.conn.put_header(Header {
            opcode: protocol::CLIENT_SWITCH_SESSION,
            size: 4,
        })?;
        self.conn.put_i32(session)?;
        self.flush()
    }

    pub(crate) fn disable_seat(&mut self) -> Result<(), Error> {
        self.conn.put_header(Header {
            opcode: protocol::CLIENT_DISABLE_SEAT,
            size: 0,
        })?;
        self.flush()
    }

    pub(crate) fn close_seat(&mut self) -> Result<(), Error> {
        self.conn.put_header(Header {
            opcode: protocol::CLIENT_CLOSE_SEAT,
            size: 0,
        })?;
        self.dispatch_until_reply()?;
        self.read_header_expect(protocol::SERVER_SEAT_CLOSED)?;
        Ok(())
    }

    /// One bounded dispatch round: a non-blocking parse, one read (waiting
    /// up to `timeout` ms only if nothing is deliverable yet), a final
    /// parse. Returns the number of notifications ready for delivery.
    pub(crate) fn dispatch_background(&mut self, timeout: i32) -> Result<usize, Error> {
        self.dispatch_pending(false);
        // Don't block if we already have something to deliver; the caller
        // may be waiting for it. Still pick up anything readable. Note that
        // a notification parsed while a synchronous request was in flight
        // may be waiting here from before this call.
        let timeout = if self.pending_events.is_empty() {
            timeout
        } else {
            0
        };

        let read = if timeout == 0 {
            match self.conn.read(IoMode::NonBlocking) {
                Ok(0) => return Err(Error::Disconnected),
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
                Err(err) => return Err(err.into()),
            }
        } else {
            self.poll_connection(timeout)?
        };

        if read > 0 {
            self.dispatch_pending(false);
        }
        Ok(self.pending_events.len())
    }

    /// Flush all buffered output, polling through short writes.
    fn flush(&mut self) -> Result<(), Error> {
        loop {
            match self.conn.flush(IoMode::NonBlocking) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    let fd = self.get_fd();
                    let mut fds = [PollFd::new(&fd, PollFlags::POLLOUT)];
                    match poll(&mut fds, -1) {
                        Ok(_) | Err(Errno::EINTR) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Wait up to `timeout` ms for the connection to become readable and
    /// pull in whatever arrived. Returns the number of bytes read.
    fn poll_connection(&mut self, timeout: i32) -> Result<usize, Error> {
        let fd = self.get_fd();
        let mut fds = [PollFd::new(&fd, PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => return Ok(0),
            Err(err) => return Err(err.into()),
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
            return Err(Error::Disconnected);
        }
        if !revents.contains(PollFlags::POLLIN) {
            return Ok(0);
        }

        match self.conn.read(IoMode::NonBlocking) {
            Ok(0) => Err(Error::Disconnected),
            Ok(read) => Ok(read),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Queue any buffered notifications. Stops at the first other message;
    /// the second value is true once that message is complete and its
    /// header is back at the head of the buffer.
    fn dispatch_pending(&mut self, want_reply: bool) -> (usize, bool) {
        let mut queued = 0;
        loop {
            let Ok(header) = self.conn.get_header() else {
                return (queued, false);
            };
            match header.opcode {
                protocol::SERVER_DISABLE_SEAT => {
                    queued += 1;
                    self.pending_events.push_back(SeatEvent::Disable);
                }
                protocol::SERVER_ENABLE_SEAT => {
                    queued += 1;
                    self.pending_events.push_back(SeatEvent::Enable);
                }
                _ => {
                    let complete = want_reply && self.conn.pending() >= header.size as usize;
                    self.conn.restore(Header::SIZE);
                    return (queued, complete);
                }
            }
        }
    }

    /// Drive the connection until the reply to the current request is fully
    /// buffered, queueing notifications on the way.
    fn dispatch_until_reply(&mut self) -> Result<(), Error> {
        self.flush()?;
        loop {
            let (_, reply_ready) = self.dispatch_pending(true);
            if reply_ready {
                return Ok(());
            }
            self.poll_connection(-1)?;
        }
    }

    /// Consume the reply header, which must carry `expected`. Anything else
    /// is either an `ERROR` reply, mapped to [`Error::Server`], or a
    /// protocol violation.
    fn read_header_expect(&mut self, expected: u16) -> Result<u16, Error> {
        let header = self
            .conn
            .get_header()
            .map_err(|_| Error::Protocol("truncated reply"))?;
        if header.opcode != expected {
            self.conn.restore(Header::SIZE);
            return Err(self.take_error());
        }
        Ok(header.size)
    }

    fn take_error(&mut self) -> Error {
        let Ok(header) = self.conn.get_header() else {
            return Error::Protocol("truncated reply");
        };
        if header.opcode != protocol::SERVER_ERROR || header.size != 4 {
            return Error::Protocol("unexpected reply opcode");
        }
        match self.conn.get_i32() {
            Ok(errno) => Error::Server(Errno::from_i32(errno)),
            Err(_) => Error::Protocol("truncated error reply"),
        }
    }
}
