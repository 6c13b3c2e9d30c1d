//! Server front-end: the accept loop, the seat registry and the routing of
//! client messages and kernel VT signals into the seat state machine.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use nix::errno::Errno;

use crate::client::{Client, ClientError, ClientId};
use crate::connection::IoMode;
use crate::event_loop::{Event, EventLoop, Readiness};
use crate::protocol::{self, Header, MAX_PATH_LEN};
use crate::seat::{ClientMap, Seat};

pub struct Server {
    seats: Vec<Seat>,
    clients: ClientMap,
    next_client_id: ClientId,
    event_loop: EventLoop,
    listener: Option<UnixListener>,
    socket_path: Option<PathBuf>,
    signal_fds: Vec<(OwnedFd, Event)>,
    running: bool,
}

impl Server {
    pub fn new(vt_bound: bool) -> io::Result<Self> {
        Ok(Self {
            seats: vec![Seat::new("seat0", vt_bound)],
            clients: ClientMap::new(),
            next_client_id: ClientId::first(),
            event_loop: EventLoop::new()?,
            listener: None,
            socket_path: None,
            signal_fds: Vec::new(),
            running: false,
        })
    }

    /// Bind the well-known socket and start accepting clients on it.
    pub fn listen(&mut self, path: &Path) -> io::Result<()> {
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        self.event_loop.add_fd(listener.as_raw_fd(), Event::Listener)?;
        self.listener = Some(listener);
        self.socket_path = Some(path.to_owned());
        info!("listening on {}", path.display());
        Ok(())
    }

    /// Register the read end of a signal pipe. Whenever it becomes readable
    /// it is drained and `event` is handled.
    pub fn register_signal_fd(&mut self, fd: OwnedFd, event: Event) -> io::Result<()> {
        nix::fcntl::fcntl(
            fd.as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;
        self.event_loop.add_fd(fd.as_raw_fd(), event)?;
        self.signal_fds.push((fd, event));
        Ok(())
    }

    /// Adopt an already-connected stream as a new client.
    pub fn add_client(&mut self, stream: UnixStream) -> io::Result<ClientId> {
        let id = self.next_client_id;
        self.next_client_id = id.next();
        let client = Client::new(stream, id)?;
        self.event_loop.add_fd(client.fd(), Event::Client(id))?;
        info!(
            "new client connected (pid: {}, uid: {}, gid: {})",
            client.pid(),
            client.uid(),
            client.gid()
        );
        self.clients.insert(id, client);
        Ok(id)
    }

    pub fn run(&mut self) -> io::Result<()> {
        self.running = true;
        while self.running {
            let (event, readiness) = self.event_loop.poll()?;
            match event {
                Event::Listener => self.accept()?,
                Event::Client(id) => {
                    if let Err(err) = self.handle_client(id, readiness) {
                        match err {
                            ClientError::Disconnected => info!("client disconnected"),
                            err => error!("client error: {err}"),
                        }
                        self.destroy_client(id);
                    }
                }
                Event::VtRelease => {
                    self.drain_signal(event);
                    let Server { seats, clients, .. } = self;
                    let _ = seats[0].vt_release(clients);
                }
                Event::VtAcquire => {
                    self.drain_signal(event);
                    let Server { seats, clients, .. } = self;
                    let _ = seats[0].vt_activate(clients);
                }
                Event::Quit => {
                    self.drain_signal(event);
                    info!("shutting down");
                    self.running = false;
                }
            }
            self.sync_interests();
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&mut self) {
        let Server { seats, clients, .. } = self;
        for seat in seats.iter_mut() {
            seat.destroy(clients);
        }
        let ids: Vec<ClientId> = self.clients.keys().copied().collect();
        for id in ids {
            self.destroy_client(id);
        }
    }

    fn accept(&mut self) -> io::Result<()> {
        loop {
            match self.listener.as_ref().unwrap().accept() {
                Ok((stream, _)) => {
                    if let Err(err) = self.add_client(stream) {
                        error!("could not accept client: {err}");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    fn destroy_client(&mut self, id: ClientId) {
        {
            let Server { seats, clients, .. } = self;
            if let Some(seat_index) = clients.get(&id).and_then(|c| c.seat) {
                seats[seat_index].remove_client(clients, id);
            }
        }
        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        let _ = self.event_loop.remove(client.fd());
        client.conn.close_fds();
        debug!("destroyed client");

        // In single-client mode (no listener socket) the server's life is
        // tied to its client.
        if self.listener.is_none() && self.clients.is_empty() {
            self.running = false;
        }
    }

    fn drain_signal(&mut self, event: Event) {
        let Some((fd, _)) = self.signal_fds.iter().find(|(_, e)| *e == event) else {
            return;
        };
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }

    /// Propagate each client's desired write interest to the event loop.
    /// Swept once per loop iteration because seat handovers can leave
    /// partially-flushed output on clients other than the one that woke us.
    fn sync_interests(&mut self) {
        let updates: Vec<(ClientId, RawFd, bool)> = self
            .clients
            .iter()
            .filter(|(_, c)| c.wants_write != c.subscribed_write)
            .map(|(id, c)| (*id, c.fd(), c.wants_write))
            .collect();
        for (id, fd, writable) in updates {
            if self.event_loop.update(fd, writable).is_ok() {
                if let Some(client) = self.clients.get_mut(&id) {
                    client.subscribed_write = writable;
                }
            }
        }
    }

    fn handle_client(&mut self, id: ClientId, readiness: Readiness) -> Result<(), ClientError> {
        if readiness.error {
            return Err(ClientError::Protocol("connection error"));
        }
        if readiness.hangup {
            return Err(ClientError::Disconnected);
        }

        if readiness.writable {
            let client = self
                .clients
                .get_mut(&id)
                .ok_or(ClientError::Disconnected)?;
            client.flush()?;
        }

        if readiness.readable {
            {
                let client = self
                    .clients
                    .get_mut(&id)
                    .ok_or(ClientError::Disconnected)?;
                match client.conn.read(IoMode::NonBlocking) {
                    Ok(0) => return Err(ClientError::Disconnected),
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => return Err(err.into()),
                }
            }

            loop {
                let client = self.clients.get_mut(&id).unwrap();
                let Ok(header) = client.conn.get_header() else {
                    break;
                };
                if client.conn.pending() < header.size as usize {
                    client.conn.restore(Header::SIZE);
                    break;
                }
                self.dispatch(id, header)?;
            }
        }

        Ok(())
    }

    fn dispatch(&mut self, id: ClientId, header: Header) -> Result<(), ClientError> {
        match header.opcode {
            protocol::CLIENT_OPEN_SEAT => {
                if header.size != 0 {
                    return Err(ClientError::Protocol("invalid open_seat message"));
                }
                self.handle_open_seat(id)?;
            }
            protocol::CLIENT_CLOSE_SEAT => {
                if header.size != 0 {
                    return Err(ClientError::Protocol("invalid close_seat message"));
                }
                self.handle_close_seat(id)?;
            }
            protocol::CLIENT_OPEN_DEVICE => {
                let path = self.get_open_device_payload(id, header)?;
                self.handle_open_device(id, &path)?;
            }
            protocol::CLIENT_CLOSE_DEVICE => {
                if header.size as usize != 4 {
                    return Err(ClientError::Protocol("invalid close_device message"));
                }
                let client = self.clients.get_mut(&id).unwrap();
                let device_id = client.conn.get_i32()?;
                self.handle_close_device(id, device_id)?;
            }
            protocol::CLIENT_SWITCH_SESSION => {
                if header.size as usize != 4 {
                    return Err(ClientError::Protocol("invalid switch_session message"));
                }
                let client = self.clients.get_mut(&id).unwrap();
                let session = client.conn.get_i32()?;
                self.handle_switch_session(id, session)?;
            }
            protocol::CLIENT_DISABLE_SEAT => {
                if header.size != 0 {
                    return Err(ClientError::Protocol("invalid disable_seat message"));
                }
                self.handle_disable_seat(id)?;
            }
            opcode => {
                error!("protocol error: unknown opcode: {opcode}");
                return Err(ClientError::Protocol("unknown opcode"));
            }
        }

        let client = self.clients.get_mut(&id).unwrap();
        client.flush()?;
        Ok(())
    }

    fn get_open_device_payload(
        &mut self,
        id: ClientId,
        header: Header,
    ) -> Result<PathBuf, ClientError> {
        let client = self.clients.get_mut(&id).unwrap();
        if (header.size as usize) < 2 {
            return Err(ClientError::Protocol("invalid open_device message"));
        }
        let path_len = client.conn.get_u16()? as usize;
        if header.size as usize != 2 + path_len || path_len > MAX_PATH_LEN {
            return Err(ClientError::Protocol("invalid open_device message"));
        }
        let mut buf = vec![0u8; path_len];
        client.conn.get(&mut buf)?;
        if buf.pop() != Some(0) {
            return Err(ClientError::Protocol("open_device path is not terminated"));
        }
        // The wire format is a C string; anything past an embedded NUL is
        // not part of the path.
        if let Some(nul) = buf.iter().position(|&b| b == 0) {
            buf.truncate(nul);
        }
        use std::os::unix::ffi::OsStringExt;
        Ok(PathBuf::from(std::ffi::OsString::from_vec(buf)))
    }

    fn handle_open_seat(&mut self, id: ClientId) -> Result<(), ClientError> {
        let Server { seats, clients, .. } = self;

        // Every client lands on seat0 for now; mapping peers to seats is an
        // open problem upstream as well.
        let seat_name = "seat0";
        let Some(seat_index) = seats.iter().position(|s| s.name() == seat_name) else {
            error!("unable to find seat by name");
            return Err(ClientError::Protocol("no such seat"));
        };
        let seat = &mut seats[seat_index];

        let client = clients.get_mut(&id).unwrap();
        if let Err(err) = seat.add_client(seat_index, client) {
            error!("unable to add client to target seat: {err}");
            return Err(ClientError::Protocol("could not attach client to seat"));
        }

        let name = seat.name();
        client.conn.put_header(Header {
            opcode: protocol::SERVER_SEAT_OPENED,
            size: (2 + name.len()) as u16,
        })?;
        client.conn.put_u16(name.len() as u16)?;
        client.conn.put(name.as_bytes())?;

        // Enable right away when possible; on a VT-bound seat whose VT is
        // foreign this fails and the client waits for the VT to come back.
        let _ = seat.open_client(clients, id);
        Ok(())
    }

    fn handle_close_seat(&mut self, id: ClientId) -> Result<(), ClientError> {
        let Server { seats, clients, .. } = self;
        let Some(seat_index) = clients.get(&id).and_then(|c| c.seat) else {
            error!("protocol error: no seat associated with client");
            return Err(ClientError::Protocol("client has no seat"));
        };

        seats[seat_index].remove_client(clients, id);

        let client = clients.get_mut(&id).unwrap();
        client.conn.put_header(Header {
            opcode: protocol::SERVER_SEAT_CLOSED,
            size: 0,
        })?;
        Ok(())
    }

    fn handle_open_device(&mut self, id: ClientId, path: &Path) -> Result<(), ClientError> {
        let Server { seats, clients, .. } = self;
        let client = clients.get_mut(&id).unwrap();
        let Some(seat_index) = client.seat else {
            error!("protocol error: no seat associated with client");
            return Err(ClientError::Protocol("client has no seat"));
        };
        let seat = &mut seats[seat_index];

        let device_id = match seat.open_device(client, path) {
            Ok(device_id) => device_id,
            Err(errno) => {
                error!("could not open device: {errno}");
                client.send_error(errno)?;
                return Ok(());
            }
        };

        // The client gets its own copy of the fd so that it can close it
        // independently of the server's.
        let device_fd = client.find_device(device_id).unwrap().fd().as_raw_fd();
        match nix::unistd::dup(device_fd) {
            Ok(raw) => {
                client.conn.put_fd(unsafe { OwnedFd::from_raw_fd(raw) })?;
                client.conn.put_header(Header {
                    opcode: protocol::SERVER_DEVICE_OPENED,
                    size: 4,
                })?;
                client.conn.put_i32(device_id)?;
            }
            Err(errno) => {
                error!("could not dup fd: {errno}");
                let _ = seat.close_device(client, device_id);
                client.send_error(errno)?;
            }
        }
        Ok(())
    }

    fn handle_close_device(&mut self, id: ClientId, device_id: i32) -> Result<(), ClientError> {
        let Server { seats, clients, .. } = self;
        let client = clients.get_mut(&id).unwrap();
        let Some(seat_index) = client.seat else {
            error!("protocol error: no seat associated with client");
            return Err(ClientError::Protocol("client has no seat"));
        };

        if client.find_device(device_id).is_none() {
            error!("no such device");
            client.send_error(Errno::EBADF)?;
            return Ok(());
        }

        match seats[seat_index].close_device(client, device_id) {
            Ok(()) => {
                client.conn.put_header(Header {
                    opcode: protocol::SERVER_DEVICE_CLOSED,
                    size: 4,
                })?;
                client.conn.put_i32(device_id)?;
            }
            Err(errno) => {
                error!("could not close device: {errno}");
                client.send_error(errno)?;
            }
        }
        Ok(())
    }

    fn handle_switch_session(&mut self, id: ClientId, session: i32) -> Result<(), ClientError> {
        let Server { seats, clients, .. } = self;
        let Some(seat_index) = clients.get(&id).and_then(|c| c.seat) else {
            error!("protocol error: no seat associated with client");
            return Err(ClientError::Protocol("client has no seat"));
        };

        if let Err(errno) = seats[seat_index].set_next_session(clients, id, session) {
            clients.get_mut(&id).unwrap().send_error(errno)?;
        }
        Ok(())
    }

    fn handle_disable_seat(&mut self, id: ClientId) -> Result<(), ClientError> {
        let Server { seats, clients, .. } = self;
        let Some(seat_index) = clients.get(&id).and_then(|c| c.seat) else {
            error!("protocol error: no seat associated with client");
            return Err(ClientError::Protocol("client has no seat"));
        };

        if seats[seat_index].active_client() != Some(id) {
            info!("client is not currently active");
            clients.get_mut(&id).unwrap().send_error(Errno::EPERM)?;
            return Ok(());
        }

        if let Err(errno) = seats[seat_index].ack_disable_client(clients, id) {
            clients.get_mut(&id).unwrap().send_error(errno)?;
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}
