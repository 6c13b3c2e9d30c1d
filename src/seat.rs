//! The per-seat policy engine.
//!
//! A seat tracks its attached clients, gates activation against VT state,
//! flips DRM master / evdev revocation on handovers and mediates the
//! disable/ack handshake. Client records live in the server's [`ClientMap`];
//! the seat only holds ids, and `active_client`/`next_client` are cleared
//! whenever the referenced client leaves the list, so they cannot dangle.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use crate::client::{Client, ClientId, ClientState};
use crate::devices::{self, DeviceType};
use crate::protocol::MAX_SEAT_DEVICES;
use crate::terminal;

pub type ClientMap = HashMap<ClientId, Client>;

pub(crate) fn io_errno(err: &io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO)
}

/// One opened device file, owned by a client.
pub struct SeatDevice {
    device_id: i32,
    path: PathBuf,
    fd: OwnedFd,
    ref_cnt: usize,
    ty: DeviceType,
    /// Mirrors kernel state: DRM master held / evdev not revoked.
    active: bool,
}

impl SeatDevice {
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn fd(&self) -> BorrowedFd {
        self.fd.as_fd()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

fn activate_device(device: &mut SeatDevice) -> Result<(), Errno> {
    if device.active {
        return Ok(());
    }
    match device.ty {
        DeviceType::Drm => {
            if let Err(err) = devices::drm_set_master(device.fd.as_fd()) {
                error!("could not make device fd drm master: {err}");
            }
            device.active = true;
        }
        // Revocation is permanent for the fd; regaining evdev input takes a
        // fresh open from the client.
        DeviceType::Evdev => return Err(Errno::EINVAL),
    }
    Ok(())
}

fn deactivate_device(device: &mut SeatDevice) -> Result<(), Errno> {
    if !device.active {
        return Ok(());
    }
    match device.ty {
        DeviceType::Drm => devices::drm_drop_master(device.fd.as_fd())?,
        DeviceType::Evdev => devices::evdev_revoke(device.fd.as_fd())?,
    }
    device.active = false;
    Ok(())
}

pub struct Seat {
    name: String,
    vt_bound: bool,
    cur_vt: i32,
    cur_tty: Option<OwnedFd>,
    clients: Vec<ClientId>,
    active_client: Option<ClientId>,
    next_client: Option<ClientId>,
    session_cnt: i32,
}

impl Seat {
    pub fn new(name: &str, vt_bound: bool) -> Self {
        if vt_bound {
            info!("created VT-bound seat '{name}'");
        } else {
            info!("created seat '{name}'");
        }
        Self {
            name: name.to_owned(),
            vt_bound,
            cur_vt: 0,
            cur_tty: None,
            clients: Vec::new(),
            active_client: None,
            next_client: None,
            session_cnt: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vt_bound(&self) -> bool {
        self.vt_bound
    }

    pub fn clients(&self) -> &[ClientId] {
        &self.clients
    }

    pub fn active_client(&self) -> Option<ClientId> {
        self.active_client
    }

    fn update_vt(&mut self) {
        let tty0 = match terminal::open(0) {
            Ok(fd) => fd,
            Err(err) => {
                error!("unable to open tty0: {err}");
                return;
            }
        };
        self.cur_vt = terminal::current_vt(tty0.as_fd()).unwrap_or(-1);
    }

    fn vt_open(&mut self, vt: i32) -> Result<(), Errno> {
        assert_ne!(vt, -1);
        if let Some(old) = self.cur_tty.take() {
            let _ = terminal::set_process_switching(old.as_fd(), true);
        }
        let tty = terminal::open(vt).map_err(|err| {
            error!("could not open terminal for vt {vt}: {err}");
            err
        })?;
        if let Err(err) = terminal::set_process_switching(tty.as_fd(), true) {
            error!("could not enable process switching: {err}");
        }
        if let Err(err) = terminal::set_keyboard(tty.as_fd(), false) {
            error!("could not disable terminal keyboard: {err}");
        }
        if let Err(err) = terminal::set_graphics(tty.as_fd(), true) {
            error!("could not set terminal to graphics mode: {err}");
        }
        self.cur_tty = Some(tty);
        Ok(())
    }

    fn vt_close(&mut self) {
        if let Some(tty) = self.cur_tty.take() {
            vt_restore(tty.as_fd());
        }
    }

    fn vt_close_num(&self, vt: i32) -> Result<(), Errno> {
        let tty = terminal::open(vt).map_err(|err| {
            error!("could not open terminal: {err}");
            err
        })?;
        vt_restore(tty.as_fd());
        Ok(())
    }

    fn vt_switch(&mut self, vt: i32) -> Result<(), Errno> {
        let tty = terminal::open(self.cur_vt).map_err(|err| {
            error!("could not open terminal: {err}");
            err
        })?;
        if let Err(err) = terminal::set_process_switching(tty.as_fd(), true) {
            error!("could not enable process switching: {err}");
        }
        if let Err(err) = terminal::switch_vt(tty.as_fd(), vt) {
            error!("could not switch VT: {err}");
        }
        Ok(())
    }

    fn vt_ack(&mut self, release: bool) {
        let tty = match terminal::open(self.cur_vt) {
            Ok(fd) => fd,
            Err(err) => {
                error!("unable to open terminal: {err}");
                return;
            }
        };
        let res = if release {
            terminal::ack_release(tty.as_fd())
        } else {
            terminal::ack_acquire(tty.as_fd())
        };
        if let Err(err) = res {
            error!("could not ack VT signal: {err}");
        }
    }

    /// Attach a client to this seat. Assigns the client's session: the
    /// current VT number when VT-bound, a seat-local sequence otherwise.
    pub fn add_client(&mut self, seat_index: usize, client: &mut Client) -> Result<(), Errno> {
        if client.seat.is_some() {
            error!("cannot add client: client is already a member of a seat");
            return Err(Errno::EBUSY);
        }

        if self.vt_bound && !self.clients.is_empty() {
            error!("cannot add client: seat is VT-bound and already has a client");
            return Err(Errno::EBUSY);
        }

        if client.session != -1 {
            error!("cannot add client: client cannot be reused");
            return Err(Errno::EINVAL);
        }

        if self.vt_bound {
            self.update_vt();
            if self.cur_vt == -1 {
                error!("could not determine VT for client");
                return Err(Errno::EINVAL);
            }
            client.session = self.cur_vt;
        } else {
            client.session = self.session_cnt;
            self.session_cnt += 1;
        }

        client.seat = Some(seat_index);
        self.clients.push(client.id());
        info!("added client {}", client.session);
        Ok(())
    }

    /// Detach a client: close all of its devices, promote a successor if it
    /// was active, and mark it CLOSED. A closed client cannot re-attach.
    pub fn remove_client(&mut self, clients: &mut ClientMap, id: ClientId) {
        if self.next_client == Some(id) {
            self.next_client = None;
        }

        self.close_client(clients, id);

        let client = clients.get_mut(&id).unwrap();
        client.seat = None;
        info!("removed client {}", client.session);
    }

    fn close_client(&mut self, clients: &mut ClientMap, id: ClientId) {
        let client = clients.get_mut(&id).unwrap();

        while let Some(device) = client.devices.last() {
            let device_id = device.device_id();
            if let Err(err) = self.close_device(client, device_id) {
                error!("unable to close device {device_id}: {err}");
                client.devices.pop();
            }
        }

        let session = client.session;
        let state = client.state;

        let was_active = self.active_client == Some(id);
        if was_active {
            self.active_client = None;
        }
        self.clients.retain(|c| *c != id);
        if was_active {
            let _ = self.activate(clients);
        }

        if self.vt_bound {
            if was_active && self.active_client.is_none() {
                // No client was waiting to take this VT, so clean it up.
                debug!("closing active VT");
                self.vt_close();
            } else if !was_active && state != ClientState::Closed {
                // The client was running in the background and left its tty
                // in graphics mode with the keyboard off.
                debug!("closing inactive VT");
                let _ = self.vt_close_num(session);
            }
        }

        clients.get_mut(&id).unwrap().state = ClientState::Closed;
        info!("closed client {session}");
    }

    /// Enable a NEW or DISABLED client: open its VT if VT-bound, re-activate
    /// its devices, and send `ENABLE_SEAT`.
    pub fn open_client(&mut self, clients: &mut ClientMap, id: ClientId) -> Result<(), Errno> {
        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;
        let session = client.session;

        if client.state != ClientState::New && client.state != ClientState::Disabled {
            error!("could not enable client {session}: client is not new or disabled");
            return Err(Errno::EALREADY);
        }

        if self.active_client.is_some() {
            error!("could not enable client {session}: seat already has active client");
            return Err(Errno::EBUSY);
        }

        if self.vt_bound {
            if let Err(err) = self.vt_open(session) {
                error!("could not open VT for client {session}");
                self.vt_close();
                return Err(err);
            }
        }

        let client = clients.get_mut(&id).unwrap();
        for device in &mut client.devices {
            if let Err(err) = activate_device(device) {
                error!(
                    "unable to activate '{}' for client {session}: {err}",
                    device.path.display()
                );
            }
        }

        client.state = ClientState::Active;
        let sent = client.send_enable();
        self.active_client = Some(id);

        if let Err(err) = sent {
            error!("could not send enable signal to client {session}");
            if self.vt_bound {
                self.vt_close();
            }
            return Err(io_errno(&err));
        }

        info!("enabled client {session}");
        Ok(())
    }

    /// Begin the disable handshake for the active client.
    ///
    /// All of the client's devices are deactivated up front, so the hardware
    /// is safe the moment this returns. The fds are kept open: downstream
    /// state such as DRM GEM handles is bound to the file description and
    /// must survive until re-activation.
    fn disable_client(&mut self, clients: &mut ClientMap, id: ClientId) -> Result<(), Errno> {
        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;

        if client.state != ClientState::Active {
            error!("client not active");
            return Err(Errno::EBUSY);
        }
        debug_assert_eq!(self.active_client, Some(id));

        for device in &mut client.devices {
            if let Err(err) = deactivate_device(device) {
                error!("unable to deactivate '{}': {err}", device.path.display());
            }
        }

        client.state = ClientState::PendingDisable;
        if let Err(err) = client.send_disable() {
            error!("could not send disable event");
            return Err(io_errno(&err));
        }

        info!("disabling client {}", client.session);
        Ok(())
    }

    /// The client acknowledged `DISABLE_SEAT`; finish the handover.
    pub fn ack_disable_client(&mut self, clients: &mut ClientMap, id: ClientId) -> Result<(), Errno> {
        let client = clients.get_mut(&id).ok_or(Errno::ENOENT)?;

        if client.state != ClientState::PendingDisable {
            error!("client not pending disable");
            return Err(Errno::EBUSY);
        }

        client.state = ClientState::Disabled;
        info!("disabled client {}", client.session);

        if self.active_client != Some(id) {
            return Ok(());
        }

        self.active_client = None;
        // If VT-bound, we have either disabled a client on a foreign VT, in
        // which case there is nothing to activate, or the current VT, in
        // which case activation just re-opens it.
        let _ = self.activate(clients);
        Ok(())
    }

    /// Pick the next client to enable when no client is active.
    fn activate(&mut self, clients: &mut ClientMap) -> Result<(), Errno> {
        if self.active_client.is_some() {
            return Ok(());
        }

        let next = if let Some(next) = self.next_client.take() {
            debug!("activating next queued client");
            next
        } else if self.clients.is_empty() {
            info!("no clients on seat to activate");
            return Err(Errno::ENOENT);
        } else if self.vt_bound && self.cur_vt == -1 {
            return Err(Errno::ENOENT);
        } else if self.vt_bound {
            let cur_vt = self.cur_vt;
            match self
                .clients
                .iter()
                .copied()
                .find(|cid| clients.get(cid).is_some_and(|c| c.session == cur_vt))
            {
                Some(cid) => {
                    debug!("activating client belonging to VT {cur_vt}");
                    cid
                }
                None => {
                    info!("no clients belonging to VT {cur_vt} to activate");
                    return Err(Errno::ENOENT);
                }
            }
        } else {
            debug!("activating first client on seat");
            self.clients[0]
        };

        self.open_client(clients, next)
    }

    /// Queue a session switch on behalf of the active client.
    pub fn set_next_session(
        &mut self,
        clients: &mut ClientMap,
        id: ClientId,
        session: i32,
    ) -> Result<(), Errno> {
        let client = clients.get(&id).ok_or(Errno::ENOENT)?;

        if client.state != ClientState::Active {
            error!("client is not active");
            return Err(Errno::EPERM);
        }
        debug_assert_eq!(self.active_client, Some(id));

        if session <= 0 {
            error!("invalid session value: {session}");
            return Err(Errno::EINVAL);
        }

        if session == client.session {
            info!("requested session is already active");
            return Ok(());
        }

        if self.next_client.is_some() {
            info!("switch is already queued");
            return Ok(());
        }

        if self.vt_bound {
            // The actual change-over happens asynchronously through the VT
            // release/acquire signals.
            info!("switching to VT {session} from VT {}", self.cur_vt);
            return self.vt_switch(session);
        }

        let target = self
            .clients
            .iter()
            .copied()
            .find(|cid| clients.get(cid).is_some_and(|c| c.session == session));
        let Some(target) = target else {
            error!("no valid switch available");
            return Err(Errno::EINVAL);
        };

        info!("queuing switch client with session {session}");
        self.next_client = Some(target);
        let _ = self.disable_client(clients, id);
        Ok(())
    }

    /// Kernel acquire signal: we own the VT again.
    pub fn vt_activate(&mut self, clients: &mut ClientMap) -> Result<(), Errno> {
        if !self.vt_bound {
            debug!("VT activation on non VT-bound seat, ignoring");
            return Err(Errno::EINVAL);
        }
        self.update_vt();
        debug!("activating VT");
        self.vt_ack(false);
        if self.active_client.is_none() {
            let _ = self.activate(clients);
        }
        Ok(())
    }

    /// Kernel release signal: another session wants the VT.
    ///
    /// The disable handshake starts before we ack the release. The client
    /// may still be draining, but its devices were already deactivated, so
    /// letting the kernel complete the switch is safe.
    pub fn vt_release(&mut self, clients: &mut ClientMap) -> Result<(), Errno> {
        if !self.vt_bound {
            debug!("VT release request on non VT-bound seat, ignoring");
            return Err(Errno::EINVAL);
        }
        self.update_vt();
        debug!("releasing VT");
        if let Some(active) = self.active_client {
            let _ = self.disable_client(clients, active);
        }
        self.vt_ack(true);
        self.cur_vt = -1;
        Ok(())
    }

    /// Detach and close every client, then restore the VT.
    pub fn destroy(&mut self, clients: &mut ClientMap) {
        while let Some(&id) = self.clients.first() {
            self.remove_client(clients, id);
        }
        self.vt_close();
    }

    /// Open a device for the active client. A path already held by the
    /// client coalesces onto the existing device, bumping its ref count.
    pub fn open_device(&mut self, client: &mut Client, path: &Path) -> Result<i32, Errno> {
        if client.state != ClientState::Active {
            error!("client is not active");
            return Err(Errno::EPERM);
        }
        debug_assert_eq!(self.active_client, Some(client.id()));

        let sanitized = std::fs::canonicalize(path).map_err(|err| {
            error!("invalid path '{}': {err}", path.display());
            io_errno(&err)
        })?;

        let Some(ty) = devices::device_type(&sanitized) else {
            error!("invalid path '{}'", sanitized.display());
            return Err(Errno::ENOENT);
        };

        let mut device_id = 1;
        for device in &mut client.devices {
            if device.path == sanitized {
                device.ref_cnt += 1;
                debug!(
                    "seat: '{}', client: {}, path: '{}', device_id: {}, ref_cnt: {}",
                    self.name,
                    client.session,
                    device.path.display(),
                    device.device_id,
                    device.ref_cnt
                );
                return Ok(device.device_id);
            }
            if device.device_id >= device_id {
                device_id = device.device_id + 1;
            }
        }

        if client.devices.len() >= MAX_SEAT_DEVICES {
            error!("max seat devices exceeded");
            return Err(Errno::EMFILE);
        }

        let fd = nix::fcntl::open(
            &sanitized,
            OFlag::O_RDWR
                | OFlag::O_NOCTTY
                | OFlag::O_NOFOLLOW
                | OFlag::O_CLOEXEC
                | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|err| {
            error!("could not open file: {err}");
            err
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        if ty == DeviceType::Drm {
            if let Err(err) = devices::drm_set_master(fd.as_fd()) {
                error!("could not make device fd drm master: {err}");
            }
        }

        debug!(
            "seat: '{}', client: {}, path: '{}', device_id: {device_id}, ref_cnt: 1",
            self.name,
            client.session,
            sanitized.display(),
        );

        client.devices.push(SeatDevice {
            device_id,
            path: sanitized,
            fd,
            ref_cnt: 1,
            ty,
            active: true,
        });
        Ok(device_id)
    }

    /// Drop one reference to a device; the fd closes when the last one goes.
    pub fn close_device(&mut self, client: &mut Client, device_id: i32) -> Result<(), Errno> {
        let idx = client
            .devices
            .iter()
            .position(|d| d.device_id == device_id)
            .ok_or(Errno::ENOENT)?;

        let device = &mut client.devices[idx];
        debug!(
            "seat: '{}', client: {}, path: '{}', device_id: {}, ref_cnt: {}",
            self.name,
            client.session,
            device.path.display(),
            device.device_id,
            device.ref_cnt
        );

        device.ref_cnt -= 1;
        if device.ref_cnt > 0 {
            return Ok(());
        }

        let mut device = client.devices.remove(idx);
        let _ = deactivate_device(&mut device);
        Ok(())
    }
}

fn vt_restore(tty: BorrowedFd) {
    let _ = terminal::set_process_switching(tty, true);
    let _ = terminal::set_keyboard(tty, true);
    let _ = terminal::set_graphics(tty, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, IoMode};
    use crate::protocol::{self, Header};
    use std::os::unix::net::UnixStream;

    struct TestPeer {
        conn: Connection,
    }

    impl TestPeer {
        fn next_opcode(&mut self) -> u16 {
            while self.conn.pending() < Header::SIZE {
                assert_ne!(self.conn.read(IoMode::Blocking).unwrap(), 0);
            }
            self.conn.get_header().unwrap().opcode
        }

        fn assert_idle(&mut self) {
            assert_eq!(self.conn.pending(), 0);
        }
    }

    fn new_client(id: ClientId) -> (Client, TestPeer) {
        let (a, b) = UnixStream::pair().unwrap();
        let client = Client::new(a, id).unwrap();
        (client, TestPeer { conn: Connection::from(b) })
    }

    fn seat_with_clients(n: usize) -> (Seat, ClientMap, Vec<ClientId>, Vec<TestPeer>) {
        let mut seat = Seat::new("seat0", false);
        let mut clients = ClientMap::new();
        let mut ids = Vec::new();
        let mut peers = Vec::new();
        let mut id = ClientId::first();
        for _ in 0..n {
            let (mut client, peer) = new_client(id);
            seat.add_client(0, &mut client).unwrap();
            clients.insert(id, client);
            ids.push(id);
            peers.push(peer);
            id = id.next();
        }
        (seat, clients, ids, peers)
    }

    #[test]
    fn attach_assigns_sequential_sessions() {
        let (_seat, clients, ids, _peers) = seat_with_clients(3);
        assert_eq!(clients[&ids[0]].session, 0);
        assert_eq!(clients[&ids[1]].session, 1);
        assert_eq!(clients[&ids[2]].session, 2);
    }

    #[test]
    fn double_attach_is_rejected() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(1);
        let client = clients.get_mut(&ids[0]).unwrap();
        assert_eq!(seat.add_client(0, client), Err(Errno::EBUSY));
    }

    #[test]
    fn closed_client_is_single_use() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(1);
        seat.remove_client(&mut clients, ids[0]);
        let client = clients.get_mut(&ids[0]).unwrap();
        assert_eq!(client.state, ClientState::Closed);
        // The session assignment is sticky, so re-attaching fails.
        assert_eq!(seat.add_client(0, client), Err(Errno::EINVAL));
    }

    #[test]
    fn enable_sends_event_and_is_exclusive() {
        let (mut seat, mut clients, ids, mut peers) = seat_with_clients(2);

        seat.open_client(&mut clients, ids[0]).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_ENABLE_SEAT);
        assert_eq!(seat.active_client(), Some(ids[0]));
        assert_eq!(clients[&ids[0]].state, ClientState::Active);

        // At most one active client at a time.
        assert_eq!(seat.open_client(&mut clients, ids[1]), Err(Errno::EBUSY));
        peers[1].assert_idle();
    }

    #[test]
    fn switch_session_handshake() {
        let (mut seat, mut clients, ids, mut peers) = seat_with_clients(2);
        seat.open_client(&mut clients, ids[0]).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_ENABLE_SEAT);

        // A asks for B's session; A is told to disable first.
        seat.set_next_session(&mut clients, ids[0], 1).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_DISABLE_SEAT);
        assert_eq!(clients[&ids[0]].state, ClientState::PendingDisable);
        // Nothing reaches B until A acks.
        peers[1].assert_idle();
        assert_eq!(seat.active_client(), Some(ids[0]));

        // A is mid-handshake and no longer active, so it cannot queue
        // another switch.
        seat.set_next_session(&mut clients, ids[0], 1).unwrap_err();

        seat.ack_disable_client(&mut clients, ids[0]).unwrap();
        assert_eq!(clients[&ids[0]].state, ClientState::Disabled);
        assert_eq!(clients[&ids[1]].state, ClientState::Active);
        assert_eq!(seat.active_client(), Some(ids[1]));
        assert_eq!(peers[1].next_opcode(), protocol::SERVER_ENABLE_SEAT);
    }

    #[test]
    fn switch_to_own_session_is_a_noop() {
        let (mut seat, mut clients, ids, mut peers) = seat_with_clients(2);
        seat.open_client(&mut clients, ids[0]).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_ENABLE_SEAT);
        seat.set_next_session(&mut clients, ids[0], 1).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_DISABLE_SEAT);
        seat.ack_disable_client(&mut clients, ids[0]).unwrap();
        assert_eq!(peers[1].next_opcode(), protocol::SERVER_ENABLE_SEAT);

        // B is active with session 1; switching to 1 succeeds and changes
        // nothing.
        seat.set_next_session(&mut clients, ids[1], 1).unwrap();
        assert_eq!(clients[&ids[1]].state, ClientState::Active);
        assert_eq!(seat.active_client(), Some(ids[1]));
        peers[1].assert_idle();
    }

    #[test]
    fn switch_to_unknown_session_fails() {
        let (mut seat, mut clients, ids, mut peers) = seat_with_clients(1);
        seat.open_client(&mut clients, ids[0]).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_ENABLE_SEAT);
        assert_eq!(
            seat.set_next_session(&mut clients, ids[0], 7),
            Err(Errno::EINVAL)
        );
        assert_eq!(
            seat.set_next_session(&mut clients, ids[0], 0),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn switch_requires_active_client() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(2);
        seat.open_client(&mut clients, ids[0]).unwrap();
        assert_eq!(
            seat.set_next_session(&mut clients, ids[1], 0),
            Err(Errno::EPERM)
        );
    }

    #[test]
    fn detach_promotes_successor() {
        let (mut seat, mut clients, ids, mut peers) = seat_with_clients(2);
        seat.open_client(&mut clients, ids[0]).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_ENABLE_SEAT);

        seat.remove_client(&mut clients, ids[0]);
        assert_eq!(clients[&ids[0]].state, ClientState::Closed);
        assert_eq!(seat.active_client(), Some(ids[1]));
        assert_eq!(peers[1].next_opcode(), protocol::SERVER_ENABLE_SEAT);
        assert_eq!(seat.clients(), &[ids[1]]);
    }

    #[test]
    fn queued_switch_target_may_disconnect() {
        let (mut seat, mut clients, ids, mut peers) = seat_with_clients(3);
        seat.open_client(&mut clients, ids[0]).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_ENABLE_SEAT);

        seat.set_next_session(&mut clients, ids[0], 1).unwrap();
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_DISABLE_SEAT);

        // The queued target goes away before the ack; the handover falls
        // back to the head of the list.
        seat.remove_client(&mut clients, ids[1]);
        clients.remove(&ids[1]);
        seat.ack_disable_client(&mut clients, ids[0]).unwrap();
        assert_eq!(seat.active_client(), Some(ids[0]));
        assert_eq!(peers[0].next_opcode(), protocol::SERVER_ENABLE_SEAT);
    }

    #[test]
    fn ack_without_pending_disable_fails() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(1);
        assert_eq!(
            seat.ack_disable_client(&mut clients, ids[0]),
            Err(Errno::EBUSY)
        );
        seat.open_client(&mut clients, ids[0]).unwrap();
        assert_eq!(
            seat.ack_disable_client(&mut clients, ids[0]),
            Err(Errno::EBUSY)
        );
    }

    #[test]
    fn open_device_requires_active_client() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(2);
        seat.open_client(&mut clients, ids[0]).unwrap();
        let client = clients.get_mut(&ids[1]).unwrap();
        assert_eq!(
            seat.open_device(client, Path::new("/dev/dri/card0")),
            Err(Errno::EPERM)
        );
    }

    #[test]
    fn open_device_rejects_non_device_paths() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(1);
        seat.open_client(&mut clients, ids[0]).unwrap();
        let client = clients.get_mut(&ids[0]).unwrap();
        assert_eq!(
            seat.open_device(client, Path::new("/etc/passwd")),
            Err(Errno::ENOENT)
        );
        assert_eq!(
            seat.open_device(client, Path::new("/no/such/node")),
            Err(Errno::ENOENT)
        );
    }

    fn stand_in_device(device_id: i32, path: &str) -> SeatDevice {
        let (fd, _tx) = crate::pipe().unwrap();
        SeatDevice {
            device_id,
            path: PathBuf::from(path),
            fd,
            ref_cnt: 1,
            ty: DeviceType::Drm,
            active: false,
        }
    }

    #[test]
    fn device_ref_count_releases_at_zero() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(1);
        seat.open_client(&mut clients, ids[0]).unwrap();
        let client = clients.get_mut(&ids[0]).unwrap();

        let mut device = stand_in_device(1, "/dev/dri/card9");
        device.ref_cnt = 2;
        client.devices.push(device);

        seat.close_device(client, 1).unwrap();
        assert_eq!(client.devices.len(), 1);
        assert_eq!(client.devices[0].ref_cnt, 1);

        seat.close_device(client, 1).unwrap();
        assert!(client.devices.is_empty());
        assert_eq!(seat.close_device(client, 1), Err(Errno::ENOENT));
    }

    #[test]
    fn find_device_by_id() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(1);
        seat.open_client(&mut clients, ids[0]).unwrap();
        let client = clients.get_mut(&ids[0]).unwrap();
        client.devices.push(stand_in_device(1, "/dev/dri/card9"));
        client.devices.push(stand_in_device(2, "/dev/input/event9"));

        assert_eq!(client.find_device(2).unwrap().device_id(), 2);
        assert!(client.find_device(3).is_none());
    }

    #[test]
    fn detach_closes_devices() {
        let (mut seat, mut clients, ids, _peers) = seat_with_clients(1);
        seat.open_client(&mut clients, ids[0]).unwrap();
        let client = clients.get_mut(&ids[0]).unwrap();
        let mut device = stand_in_device(1, "/dev/dri/card9");
        device.ref_cnt = 3;
        client.devices.push(device);
        client.devices.push(stand_in_device(2, "/dev/input/event9"));

        seat.remove_client(&mut clients, ids[0]);
        assert!(clients[&ids[0]].devices.is_empty());
    }
}
