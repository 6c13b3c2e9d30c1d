//! Framed full-duplex connection over a Unix stream socket.
//!
//! Both the daemon and the client library funnel all traffic through
//! [`Connection`]: byte streams are staged in fixed-size ring buffers and
//! file descriptors ride alongside in SCM_RIGHTS control messages. Every fd
//! that enters a queue is owned by the connection until it is either
//! transmitted, handed out with [`Connection::get_fd`], or swept up by
//! [`Connection::close_fds`].

use std::collections::VecDeque;
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{self, ControlMessage, ControlMessageOwned};

pub const BYTES_OUT_LEN: usize = 4096;
pub const BYTES_IN_LEN: usize = BYTES_OUT_LEN * 2;
pub const FDS_OUT_LEN: usize = 28;
pub const FDS_IN_LEN: usize = FDS_OUT_LEN * 2;

/// The "mode" of an IO operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// The function call may block, but it will never return
    /// [WouldBlock](io::ErrorKind::WouldBlock).
    Blocking,
    /// The function call will not block on IO operations.
    /// [WouldBlock](io::ErrorKind::WouldBlock) is returned if the operation
    /// cannot be completed immediately.
    NonBlocking,
}

pub struct Connection {
    socket: UnixStream,
    bytes_in: RingBuffer<BYTES_IN_LEN>,
    bytes_out: RingBuffer<BYTES_OUT_LEN>,
    fds_in: VecDeque<OwnedFd>,
    fds_out: VecDeque<OwnedFd>,
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl From<UnixStream> for Connection {
    fn from(socket: UnixStream) -> Self {
        Self {
            socket,
            bytes_in: RingBuffer::new(),
            bytes_out: RingBuffer::new(),
            fds_in: VecDeque::new(),
            fds_out: VecDeque::new(),
        }
    }
}

impl Connection {
    /// Append bytes to the outbound buffer without flushing.
    pub fn put(&mut self, data: &[u8]) -> io::Result<()> {
        if self.bytes_out.writable_len() < data.len() {
            return Err(io::Error::other("outbound buffer overflow"));
        }
        self.bytes_out.write_bytes(data);
        Ok(())
    }

    pub fn put_u16(&mut self, val: u16) -> io::Result<()> {
        self.put(&val.to_le_bytes())
    }

    pub fn put_i32(&mut self, val: i32) -> io::Result<()> {
        self.put(&val.to_le_bytes())
    }

    /// Queue an fd for transmission. It is attached to the next flush that
    /// carries at least one byte of payload and closed once sent.
    pub fn put_fd(&mut self, fd: OwnedFd) -> io::Result<()> {
        if self.fds_out.len() >= FDS_OUT_LEN {
            return Err(io::Error::other("outbound fd queue overflow"));
        }
        self.fds_out.push_back(fd);
        Ok(())
    }

    /// Consume exactly `buf.len()` buffered inbound bytes.
    ///
    /// Fails with [WouldBlock](io::ErrorKind::WouldBlock) if fewer bytes are
    /// buffered, consuming nothing. A successful consumption may be undone
    /// with [`Connection::restore`] as long as no read happened in between.
    pub fn get(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.bytes_in.readable_len() < buf.len() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.bytes_in.read_bytes(buf);
        Ok(())
    }

    pub fn get_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0; 2];
        self.get(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn get_i32(&mut self) -> io::Result<i32> {
        let mut buf = [0; 4];
        self.get(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    /// Un-consume the last `n` bytes taken with [`Connection::get`].
    pub fn restore(&mut self, n: usize) {
        self.bytes_in.unconsume(n);
    }

    /// Dequeue one received fd. Ownership transfers to the caller.
    pub fn get_fd(&mut self) -> io::Result<OwnedFd> {
        self.fds_in
            .pop_front()
            .ok_or_else(|| io::ErrorKind::WouldBlock.into())
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn pending(&self) -> usize {
        self.bytes_in.readable_len()
    }

    /// Drop every fd still queued in either direction.
    pub fn close_fds(&mut self) {
        self.fds_in.clear();
        self.fds_out.clear();
    }

    /// Write as much buffered output as possible. Queued fds are attached as
    /// SCM_RIGHTS to the first non-empty write and closed once the kernel has
    /// taken them. On [WouldBlock](io::ErrorKind::WouldBlock) the remainder
    /// stays buffered.
    pub fn flush(&mut self, mode: IoMode) -> io::Result<()> {
        while !self.bytes_out.is_empty() {
            let mut flags = socket::MsgFlags::MSG_NOSIGNAL;
            if mode == IoMode::NonBlocking {
                flags |= socket::MsgFlags::MSG_DONTWAIT;
            }

            let raw_fds: Vec<RawFd> = self.fds_out.iter().map(|fd| fd.as_raw_fd()).collect();
            let b;
            let cmsgs: &[ControlMessage] = if raw_fds.is_empty() {
                &[]
            } else {
                b = [ControlMessage::ScmRights(&raw_fds)];
                &b
            };

            let mut iov_buf = [IoSlice::new(&[]), IoSlice::new(&[])];
            let iov = self.bytes_out.readable_iov(&mut iov_buf);
            let sent = match socket::sendmsg::<()>(self.socket.as_raw_fd(), iov, cmsgs, flags, None)
            {
                Ok(sent) => sent,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            };

            // The control message went out with this sendmsg, so our copies
            // of the fds are no longer needed.
            self.fds_out.clear();
            self.bytes_out.consume(sent);
        }
        Ok(())
    }

    /// Receive bytes and ancillary fds into the inbound queues.
    ///
    /// Returns the number of bytes read; 0 means the peer closed the
    /// connection. Received fds are close-on-exec.
    pub fn read(&mut self, mode: IoMode) -> io::Result<usize> {
        if self.bytes_in.is_full() {
            return Err(io::Error::other("inbound buffer overflow"));
        }

        let mut cmsg = nix::cmsg_space!([RawFd; FDS_OUT_LEN]);

        let mut flags = socket::MsgFlags::MSG_CMSG_CLOEXEC | socket::MsgFlags::MSG_NOSIGNAL;
        if mode == IoMode::NonBlocking {
            flags |= socket::MsgFlags::MSG_DONTWAIT;
        }

        let read = loop {
            let mut iov_buf = [IoSliceMut::new(&mut []), IoSliceMut::new(&mut [])];
            let iov = self.bytes_in.writable_iov(&mut iov_buf);
            match socket::recvmsg::<()>(self.socket.as_raw_fd(), iov, Some(&mut cmsg), flags) {
                Ok(msg) => {
                    for cmsg in msg.cmsgs() {
                        if let ControlMessageOwned::ScmRights(fds) = cmsg {
                            for fd in fds {
                                self.fds_in.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
                            }
                        }
                    }
                    break msg.bytes;
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        };

        self.bytes_in.advance(read);
        Ok(read)
    }
}

pub struct RingBuffer<const N: usize> {
    bytes: Box<[u8; N]>,
    offset: usize,
    len: usize,
}

impl<const N: usize> RingBuffer<N> {
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0; N]),
            offset: 0,
            len: 0,
        }
    }

    pub fn readable_len(&self) -> usize {
        self.len
    }

    pub fn writable_len(&self) -> usize {
        N - self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == N
    }

    fn head(&self) -> usize {
        (self.offset + self.len) % N
    }

    /// Mark `n` bytes starting at the head as written.
    pub fn advance(&mut self, n: usize) {
        self.len += n;
        assert!(self.len <= N);
    }

    /// Discard `n` bytes from the tail.
    pub fn consume(&mut self, n: usize) {
        self.offset = (self.offset + n) % N;
        self.len = self.len.checked_sub(n).unwrap();
    }

    /// Undo the consumption of the last `n` bytes. Only valid while nothing
    /// has been written over them, which holds as long as no fill happened
    /// since the matching `consume`.
    pub fn unconsume(&mut self, n: usize) {
        assert!(self.len + n <= N);
        self.offset = (self.offset + N - (n % N)) % N;
        self.len += n;
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        assert!(self.writable_len() >= data.len());

        let head = self.head();
        if head + data.len() <= N {
            self.bytes[head..][..data.len()].copy_from_slice(data);
        } else {
            let size = N - head;
            let rest = data.len() - size;
            self.bytes[head..][..size].copy_from_slice(&data[..size]);
            self.bytes[..rest].copy_from_slice(&data[size..]);
        }

        self.advance(data.len());
    }

    pub fn peek_bytes(&self, buf: &mut [u8]) {
        assert!(self.readable_len() >= buf.len());

        if self.offset + buf.len() <= N {
            buf.copy_from_slice(&self.bytes[self.offset..][..buf.len()]);
        } else {
            let size = N - self.offset;
            let rest = buf.len() - size;
            buf[..size].copy_from_slice(&self.bytes[self.offset..][..size]);
            buf[size..].copy_from_slice(&self.bytes[..rest]);
        }
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) {
        self.peek_bytes(buf);
        self.consume(buf.len());
    }

    pub fn writable_iov<'b, 'a: 'b>(
        &'a mut self,
        iov_buf: &'b mut [IoSliceMut<'a>; 2],
    ) -> &'b mut [IoSliceMut<'a>] {
        let head = self.head();
        if self.len == 0 {
            self.offset = 0;
            iov_buf[0] = IoSliceMut::new(&mut *self.bytes);
            &mut iov_buf[0..1]
        } else if head < self.offset {
            iov_buf[0] = IoSliceMut::new(&mut self.bytes[head..self.offset]);
            &mut iov_buf[0..1]
        } else if self.offset == 0 {
            iov_buf[0] = IoSliceMut::new(&mut self.bytes[head..N]);
            &mut iov_buf[0..1]
        } else {
            let (left, right) = self.bytes.split_at_mut(head);
            iov_buf[0] = IoSliceMut::new(right);
            iov_buf[1] = IoSliceMut::new(&mut left[..self.offset]);
            &mut iov_buf[0..2]
        }
    }

    pub fn readable_iov<'b, 'a: 'b>(
        &'a self,
        iov_buf: &'b mut [IoSlice<'a>; 2],
    ) -> &'b [IoSlice<'a>] {
        let head = self.head();
        if self.offset < head {
            iov_buf[0] = IoSlice::new(&self.bytes[self.offset..head]);
            &iov_buf[0..1]
        } else if head == 0 {
            iov_buf[0] = IoSlice::new(&self.bytes[self.offset..]);
            &iov_buf[0..1]
        } else {
            let (left, right) = self.bytes.split_at(self.offset);
            iov_buf[0] = IoSlice::new(right);
            iov_buf[1] = IoSlice::new(&left[..head]);
            &iov_buf[0..2]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn ring_buffer_wraps() {
        let mut rb: RingBuffer<8> = RingBuffer::new();
        rb.write_bytes(&[1, 2, 3, 4, 5, 6]);
        let mut buf = [0; 4];
        rb.read_bytes(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
        // Head wraps around the end of the backing array.
        rb.write_bytes(&[7, 8, 9, 10]);
        assert_eq!(rb.readable_len(), 6);
        let mut buf = [0; 6];
        rb.read_bytes(&mut buf);
        assert_eq!(buf, [5, 6, 7, 8, 9, 10]);
        assert!(rb.is_empty());
    }

    #[test]
    fn ring_buffer_unconsume() {
        let mut rb: RingBuffer<8> = RingBuffer::new();
        rb.write_bytes(&[1, 2, 3, 4]);
        let mut buf = [0; 2];
        rb.read_bytes(&mut buf);
        assert_eq!(buf, [1, 2]);
        rb.unconsume(2);
        let mut buf = [0; 4];
        rb.read_bytes(&mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn bytes_round_trip() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::from(a);
        let mut rx = Connection::from(b);

        tx.put_u16(0xbeef).unwrap();
        tx.put_i32(-7).unwrap();
        tx.flush(IoMode::Blocking).unwrap();

        assert_eq!(rx.read(IoMode::Blocking).unwrap(), 6);
        assert_eq!(rx.get_u16().unwrap(), 0xbeef);
        assert_eq!(rx.get_i32().unwrap(), -7);
        assert_eq!(rx.pending(), 0);
    }

    #[test]
    fn get_rewind() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::from(a);
        let mut rx = Connection::from(b);

        tx.put(&[1, 2, 3, 4]).unwrap();
        tx.flush(IoMode::Blocking).unwrap();
        rx.read(IoMode::Blocking).unwrap();

        let mut buf = [0; 4];
        rx.get(&mut buf).unwrap();
        assert!(rx.get(&mut [0; 1]).is_err());
        rx.restore(4);
        assert_eq!(rx.pending(), 4);
        rx.get(&mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn fd_passing() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::from(a);
        let mut rx = Connection::from(b);

        let (pipe_rx, pipe_tx) = crate::pipe().unwrap();
        use std::io::Write;
        let mut pipe_tx = std::fs::File::from(pipe_tx);
        pipe_tx.write_all(b"hi").unwrap();

        tx.put(&[42]).unwrap();
        tx.put_fd(pipe_rx).unwrap();
        tx.flush(IoMode::Blocking).unwrap();

        assert_eq!(rx.read(IoMode::Blocking).unwrap(), 1);
        let mut buf = [0; 1];
        rx.get(&mut buf).unwrap();
        assert_eq!(buf, [42]);

        let fd = rx.get_fd().unwrap();
        assert!(rx.get_fd().is_err());
        let mut contents = String::new();
        std::fs::File::from(fd).read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hi");
    }

    #[test]
    fn close_fds_sweeps_queues() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = Connection::from(a);
        let mut rx = Connection::from(b);

        let (pipe_rx, _pipe_tx) = crate::pipe().unwrap();
        tx.put(&[0]).unwrap();
        tx.put_fd(pipe_rx).unwrap();
        tx.flush(IoMode::Blocking).unwrap();
        rx.read(IoMode::Blocking).unwrap();

        // Received but never consumed; the sweep must not leak it.
        rx.close_fds();
        assert!(rx.get_fd().is_err());
    }
}
