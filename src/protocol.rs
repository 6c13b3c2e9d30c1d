//! Wire protocol: fixed opcodes, message layouts and limits.
//!
//! Every message is a 4-byte header `{opcode: u16, size: u16}` followed by
//! `size` bytes of payload. All integers are little-endian. This is the
//! seatd protocol, so any conforming client or server can sit on the other
//! end of the socket.

use std::io;

use crate::connection::Connection;

pub const CLIENT_OPEN_SEAT: u16 = 1;
pub const CLIENT_CLOSE_SEAT: u16 = 2;
pub const CLIENT_OPEN_DEVICE: u16 = 3;
pub const CLIENT_CLOSE_DEVICE: u16 = 4;
pub const CLIENT_SWITCH_SESSION: u16 = 5;
pub const CLIENT_DISABLE_SEAT: u16 = 6;

pub const SERVER_ERROR: u16 = 101;
pub const SERVER_SEAT_OPENED: u16 = 102;
pub const SERVER_SEAT_CLOSED: u16 = 103;
pub const SERVER_DEVICE_OPENED: u16 = 104;
pub const SERVER_DEVICE_CLOSED: u16 = 105;
pub const SERVER_DISABLE_SEAT: u16 = 106;
pub const SERVER_ENABLE_SEAT: u16 = 107;

/// Maximum length of a device path, including the terminating NUL.
pub const MAX_PATH_LEN: usize = 256;
/// Maximum length of a seat name.
pub const MAX_SEAT_LEN: usize = 64;
/// Maximum number of devices one client may hold open.
pub const MAX_SEAT_DEVICES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u16,
    pub size: u16,
}

impl Header {
    pub const SIZE: usize = 4;
}

impl Connection {
    /// Try to consume a message header. Fails with
    /// [WouldBlock](io::ErrorKind::WouldBlock) if fewer than four bytes are
    /// buffered; use [`Connection::restore`] to put a header back when its
    /// payload turns out to be incomplete.
    pub fn get_header(&mut self) -> io::Result<Header> {
        let opcode = self.get_u16()?;
        let size = match self.get_u16() {
            Ok(size) => size,
            Err(err) => {
                self.restore(2);
                return Err(err);
            }
        };
        Ok(Header { opcode, size })
    }

    pub fn put_header(&mut self, header: Header) -> io::Result<()> {
        self.put_u16(header.opcode)?;
        self.put_u16(header.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::IoMode;
    use std::os::unix::net::UnixStream;

    #[test]
    fn header_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::from(a);
        let mut rx = Connection::from(b);

        tx.put_header(Header { opcode: CLIENT_OPEN_DEVICE, size: 18 })
            .unwrap();
        tx.flush(IoMode::Blocking).unwrap();
        rx.read(IoMode::Blocking).unwrap();

        let header = rx.get_header().unwrap();
        assert_eq!(header.opcode, CLIENT_OPEN_DEVICE);
        assert_eq!(header.size, 18);
    }

    #[test]
    fn header_is_little_endian() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::from(a);
        let mut rx = Connection::from(b);

        tx.put_header(Header { opcode: SERVER_ENABLE_SEAT, size: 0 })
            .unwrap();
        tx.flush(IoMode::Blocking).unwrap();
        rx.read(IoMode::Blocking).unwrap();

        let mut raw = [0; 4];
        rx.get(&mut raw).unwrap();
        assert_eq!(raw, [107, 0, 0, 0]);
    }

    #[test]
    fn partial_header_rewinds() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::from(a);
        let mut rx = Connection::from(b);

        tx.put_u16(CLIENT_OPEN_SEAT).unwrap();
        tx.flush(IoMode::Blocking).unwrap();
        rx.read(IoMode::Blocking).unwrap();

        assert!(rx.get_header().is_err());
        assert_eq!(rx.pending(), 2);
    }
}
