//! Wire-level scenarios against the server core: a hand-rolled protocol
//! client on one end of a socketpair, the real server on the other.

use std::io;
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use seatmux::connection::{Connection, IoMode};
use seatmux::protocol::{self, Header};
use seatmux::Server;

struct WireClient {
    conn: Connection,
}

impl WireClient {
    fn send(&mut self, opcode: u16, payload: &[u8]) {
        self.conn
            .put_header(Header {
                opcode,
                size: payload.len() as u16,
            })
            .unwrap();
        self.conn.put(payload).unwrap();
        self.conn.flush(IoMode::Blocking).unwrap();
    }

    fn send_open_device(&mut self, path: &str) {
        let mut payload = ((path.len() + 1) as u16).to_le_bytes().to_vec();
        payload.extend_from_slice(path.as_bytes());
        payload.push(0);
        self.send(protocol::CLIENT_OPEN_DEVICE, &payload);
    }

    fn recv(&mut self) -> (Header, Vec<u8>) {
        loop {
            if let Ok(header) = self.conn.get_header() {
                if self.conn.pending() >= header.size as usize {
                    let mut payload = vec![0u8; header.size as usize];
                    self.conn.get(&mut payload).unwrap();
                    return (header, payload);
                }
                self.conn.restore(Header::SIZE);
            }
            let read = self.conn.read(IoMode::Blocking).unwrap();
            assert_ne!(read, 0, "server closed the connection");
        }
    }

    fn recv_opcode(&mut self) -> u16 {
        self.recv().0.opcode
    }

    fn recv_error(&mut self) -> i32 {
        let (header, payload) = self.recv();
        assert_eq!(header.opcode, protocol::SERVER_ERROR);
        i32::from_le_bytes(payload.try_into().unwrap())
    }

    fn open_seat(&mut self) -> String {
        self.send(protocol::CLIENT_OPEN_SEAT, &[]);
        let (header, payload) = self.recv();
        assert_eq!(header.opcode, protocol::SERVER_SEAT_OPENED);
        let name_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        assert_eq!(payload.len(), 2 + name_len);
        String::from_utf8(payload[2..].to_vec()).unwrap()
    }

    /// The server must drop the connection without a reply.
    fn expect_closed(&mut self) {
        loop {
            match self.conn.read(IoMode::Blocking) {
                Ok(0) | Err(_) => return,
                Ok(_) => continue,
            }
        }
    }
}

fn start_server(clients: usize) -> (Vec<WireClient>, JoinHandle<io::Result<()>>) {
    let mut server = Server::new(false).unwrap();
    let mut wire_clients = Vec::new();
    for _ in 0..clients {
        let (ours, theirs) = UnixStream::pair().unwrap();
        server.add_client(theirs).unwrap();
        wire_clients.push(WireClient {
            conn: Connection::from(ours),
        });
    }
    let handle = thread::spawn(move || server.run());
    (wire_clients, handle)
}

#[test]
fn basic_lifecycle() {
    let (mut clients, server) = start_server(1);
    let mut client = clients.remove(0);

    assert_eq!(client.open_seat(), "seat0");
    assert_eq!(client.recv_opcode(), protocol::SERVER_ENABLE_SEAT);

    client.send(protocol::CLIENT_CLOSE_SEAT, &[]);
    assert_eq!(client.recv_opcode(), protocol::SERVER_SEAT_CLOSED);

    drop(client);
    server.join().unwrap().unwrap();
}

#[test]
fn invalid_device_paths_are_recoverable() {
    let (mut clients, server) = start_server(1);
    let mut client = clients.remove(0);

    client.open_seat();
    assert_eq!(client.recv_opcode(), protocol::SERVER_ENABLE_SEAT);

    // Not a device node.
    client.send_open_device("/etc/passwd");
    assert_eq!(client.recv_error(), libc::ENOENT);

    // Does not exist at all. The connection survived the first error.
    client.send_open_device("/no/such/node");
    assert_eq!(client.recv_error(), libc::ENOENT);

    client.send(protocol::CLIENT_CLOSE_SEAT, &[]);
    assert_eq!(client.recv_opcode(), protocol::SERVER_SEAT_CLOSED);

    drop(client);
    server.join().unwrap().unwrap();
}

#[test]
fn close_unknown_device_is_ebadf() {
    let (mut clients, server) = start_server(1);
    let mut client = clients.remove(0);

    client.open_seat();
    assert_eq!(client.recv_opcode(), protocol::SERVER_ENABLE_SEAT);

    client.send(protocol::CLIENT_CLOSE_DEVICE, &5i32.to_le_bytes());
    assert_eq!(client.recv_error(), libc::EBADF);

    drop(client);
    server.join().unwrap().unwrap();
}

#[test]
fn switch_session_handshake() {
    let (mut clients, server) = start_server(2);
    let mut second = clients.remove(1);
    let mut first = clients.remove(0);

    first.open_seat();
    assert_eq!(first.recv_opcode(), protocol::SERVER_ENABLE_SEAT);
    second.open_seat();

    // Invalid target first.
    first.send(protocol::CLIENT_SWITCH_SESSION, &(-1i32).to_le_bytes());
    assert_eq!(first.recv_error(), libc::EINVAL);

    // Now the real handover to session 1.
    first.send(protocol::CLIENT_SWITCH_SESSION, &1i32.to_le_bytes());
    assert_eq!(first.recv_opcode(), protocol::SERVER_DISABLE_SEAT);

    first.send(protocol::CLIENT_DISABLE_SEAT, &[]);
    assert_eq!(second.recv_opcode(), protocol::SERVER_ENABLE_SEAT);

    drop(first);
    drop(second);
    server.join().unwrap().unwrap();
}

#[test]
fn disable_ack_from_inactive_client_is_eperm() {
    let (mut clients, server) = start_server(2);
    let mut second = clients.remove(1);
    let mut first = clients.remove(0);

    first.open_seat();
    assert_eq!(first.recv_opcode(), protocol::SERVER_ENABLE_SEAT);
    second.open_seat();

    second.send(protocol::CLIENT_DISABLE_SEAT, &[]);
    assert_eq!(second.recv_error(), libc::EPERM);

    drop(first);
    drop(second);
    server.join().unwrap().unwrap();
}

#[test]
fn oversize_path_terminates_connection() {
    let (mut clients, server) = start_server(1);
    let mut client = clients.remove(0);

    client.open_seat();
    assert_eq!(client.recv_opcode(), protocol::SERVER_ENABLE_SEAT);

    let mut payload = 1024u16.to_le_bytes().to_vec();
    payload.resize(2 + 1024, 0);
    client.send(protocol::CLIENT_OPEN_DEVICE, &payload);
    client.expect_closed();

    server.join().unwrap().unwrap();
}

#[test]
fn unknown_opcode_terminates_connection() {
    let (mut clients, server) = start_server(1);
    let mut client = clients.remove(0);

    client.send(999, &[]);
    client.expect_closed();

    server.join().unwrap().unwrap();
}

#[test]
fn device_request_without_seat_terminates_connection() {
    let (mut clients, server) = start_server(1);
    let mut client = clients.remove(0);

    client.send_open_device("/dev/dri/card0");
    client.expect_closed();

    server.join().unwrap().unwrap();
}

#[test]
fn partial_messages_are_reassembled() {
    let (mut clients, server) = start_server(1);
    let mut client = clients.remove(0);

    // Dribble an OPEN_SEAT header across two writes.
    let header = [
        protocol::CLIENT_OPEN_SEAT.to_le_bytes(),
        0u16.to_le_bytes(),
    ]
    .concat();
    client.conn.put(&header[..2]).unwrap();
    client.conn.flush(IoMode::Blocking).unwrap();
    thread::sleep(Duration::from_millis(10));
    client.conn.put(&header[2..]).unwrap();
    client.conn.flush(IoMode::Blocking).unwrap();

    let (reply, payload) = client.recv();
    assert_eq!(reply.opcode, protocol::SERVER_SEAT_OPENED);
    assert_eq!(&payload[2..], b"seat0");
    assert_eq!(client.recv_opcode(), protocol::SERVER_ENABLE_SEAT);

    drop(client);
    server.join().unwrap().unwrap();
}
