//! Built-in backend: fork a child that runs the server core over a
//! socketpair, for rootless single-process setups.

use std::os::unix::net::UnixStream;
use std::process;

use log::error;
use nix::unistd::{fork, ForkResult};

use seatmux::Server;

use super::seatd::SeatdBackend;
use crate::Error;

pub(crate) fn open() -> Result<SeatdBackend, Error> {
    let (parent_sock, child_sock) = UnixStream::pair()?;

    match unsafe { fork() }.map_err(Error::from)? {
        ForkResult::Child => {
            drop(parent_sock);
            let code = match run_server(child_sock) {
                Ok(()) => 0,
                Err(err) => {
                    error!("builtin seat server failed: {err}");
                    1
                }
            };
            process::exit(code);
        }
        ForkResult::Parent { .. } => {
            drop(child_sock);
            SeatdBackend::open_seat(parent_sock)
        }
    }
}

/// The child serves exactly one client and exits when it goes away.
fn run_server(stream: UnixStream) -> std::io::Result<()> {
    let vt_bound = std::env::var("SEATD_VTBOUND").map_or(true, |v| v != "0");
    let mut server = Server::new(vt_bound)?;
    server.add_client(stream)?;
    server.run()
}
