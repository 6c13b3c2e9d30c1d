//! Backend selection.
//!
//! Probing order is seatd then builtin, unless `LIBSEAT_BACKEND` names a
//! single backend to try.

use log::{debug, info};

use crate::Error;

mod builtin;
pub(crate) mod seatd;

use seatd::SeatdBackend;

pub(crate) enum Backend {
    /// Connected to a seat broker's socket.
    Seatd(SeatdBackend),
    /// Talking to a forked single-client server over a socketpair.
    Builtin(SeatdBackend),
}

const BACKEND_NAMES: [&str; 2] = ["seatd", "builtin"];

impl Backend {
    pub(crate) fn open() -> Result<Self, Error> {
        let restrict = std::env::var("LIBSEAT_BACKEND").ok();
        let mut last_err = Error::NoBackend;

        for name in BACKEND_NAMES {
            if restrict.as_deref().is_some_and(|r| r != name) {
                continue;
            }
            debug!("trying backend '{name}'");
            let result = match name {
                "seatd" => SeatdBackend::connect()
                    .map_err(Error::from)
                    .and_then(SeatdBackend::open_seat)
                    .map(Backend::Seatd),
                "builtin" => builtin::open().map(Backend::Builtin),
                _ => unreachable!(),
            };
            match result {
                Ok(backend) => {
                    info!("seat opened with backend '{name}'");
                    return Ok(backend);
                }
                Err(err) => {
                    debug!("backend '{name}' failed: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    pub(crate) fn engine(&mut self) -> &mut SeatdBackend {
        match self {
            Backend::Seatd(engine) | Backend::Builtin(engine) => engine,
        }
    }

    pub(crate) fn engine_ref(&self) -> &SeatdBackend {
        match self {
            Backend::Seatd(engine) | Backend::Builtin(engine) => engine,
        }
    }
}
