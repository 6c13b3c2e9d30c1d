//! Client library for seatd-compatible seat brokers.
//!
//! A [`Seat`] is an opaque handle to one session on a seat. Opening it
//! negotiates with a broker (or a forked built-in server), after which
//! devices can be opened and closed while the session is active. The broker
//! drives activation: the listener callback receives [`SeatEvent::Enable`]
//! when this session takes the seat and [`SeatEvent::Disable`] when it must
//! let go. A disable must be acknowledged with [`Seat::disable`] once the
//! hardware is no longer in use.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;

mod backend;

use backend::Backend;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The broker answered the request with an error code.
    #[error("server error: {0}")]
    Server(Errno),
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("server disconnected")]
    Disconnected,
    #[error("no seat backend available")]
    NoBackend,
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Io(errno.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatEvent {
    /// The session now holds the seat and may open and use devices.
    Enable,
    /// The seat is being taken away. Stop using all devices, then call
    /// [`Seat::disable`] to acknowledge.
    Disable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct DeviceId(i32);

impl DeviceId {
    pub fn as_raw(self) -> i32 {
        self.0
    }
}

type SeatListener = Box<dyn FnMut(&mut Seat, SeatEvent)>;

pub struct Seat {
    backend: Backend,
    /// Taken out while a notification callback runs, which also keeps a
    /// re-entrant dispatch from delivering events recursively.
    listener: Option<SeatListener>,
}

impl Seat {
    /// Open a seat and register the notification listener.
    ///
    /// `SEATD_SOCK` overrides the broker socket path, `LIBSEAT_BACKEND`
    /// restricts backend probing to one name and `SEATD_LOGLEVEL`
    /// (`silent`/`info`/`debug`) selects the library log verbosity.
    ///
    /// The listener only ever fires from inside [`Seat::dispatch`].
    pub fn open<F>(listener: F) -> Result<Self, Error>
    where
        F: FnMut(&mut Seat, SeatEvent) + 'static,
    {
        init_log();
        let backend = Backend::open()?;
        Ok(Self {
            backend,
            listener: Some(Box::new(listener)),
        })
    }

    /// Name of the seat this session is attached to.
    pub fn name(&self) -> &str {
        self.backend.engine_ref().name()
    }

    /// Open a device by path, receiving its fd and a stable device id.
    ///
    /// Only works while the session is active. The fd stays open across a
    /// disable/enable cycle but is powerless while disabled: a DRM fd loses
    /// master and an evdev fd is revoked outright.
    pub fn open_device<P: AsRef<Path>>(&mut self, path: P) -> Result<(OwnedFd, DeviceId), Error> {
        self.backend.engine().open_device(path.as_ref())
    }

    /// Release one reference to an opened device.
    pub fn close_device(&mut self, device_id: DeviceId) -> Result<(), Error> {
        self.backend.engine().close_device(device_id)
    }

    /// Acknowledge a [`SeatEvent::Disable`] notification. The session stays
    /// disabled until a later [`SeatEvent::Enable`].
    pub fn disable(&mut self) -> Result<(), Error> {
        self.backend.engine().disable_seat()
    }

    /// Ask the broker to switch to another session. The switch, if any,
    /// happens asynchronously; assume the current session continues until a
    /// disable notification says otherwise.
    pub fn switch_session(&mut self, session: i32) -> Result<(), Error> {
        self.backend.engine().switch_session(session)
    }

    /// The connection fd, pollable for readability from the caller's own
    /// event loop. When it fires, call [`Seat::dispatch`].
    pub fn get_fd(&self) -> BorrowedFd {
        self.backend.engine_ref().get_fd()
    }

    /// Read and deliver pending notifications. `timeout_ms` bounds the wait
    /// for data: 0 returns immediately, −1 waits indefinitely. Returns the
    /// number of notifications processed.
    pub fn dispatch(&mut self, timeout_ms: i32) -> Result<usize, Error> {
        let dispatched = self.backend.engine().dispatch_background(timeout_ms)?;
        self.deliver_events();
        Ok(dispatched)
    }

    fn deliver_events(&mut self) {
        loop {
            let Some(mut listener) = self.listener.take() else {
                return;
            };
            let Some(event) = self.backend.engine().pop_event() else {
                self.listener = Some(listener);
                return;
            };
            listener(self, event);
            self.listener = Some(listener);
        }
    }
}

impl Drop for Seat {
    fn drop(&mut self) {
        let _ = self.backend.engine().close_seat();
    }
}

fn init_log() {
    let level = match std::env::var("SEATD_LOGLEVEL").as_deref() {
        Ok("debug") => log::LevelFilter::Debug,
        Ok("info") => log::LevelFilter::Info,
        _ => log::LevelFilter::Off,
    };
    // A logger installed by the application wins.
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .try_init();
}
