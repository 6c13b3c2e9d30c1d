//! Minimal session client: wait for activation, open a DRM device, clean up.

use std::cell::Cell;
use std::rc::Rc;

use libseatmux::{Seat, SeatEvent};

fn main() {
    let active = Rc::new(Cell::new(0i32));
    let active_cb = active.clone();

    let mut seat = Seat::open(move |seat, event| match event {
        SeatEvent::Enable => active_cb.set(active_cb.get() + 1),
        SeatEvent::Disable => {
            active_cb.set(active_cb.get() - 1);
            seat.disable().expect("could not ack disable");
        }
    })
    .expect("could not open seat");
    eprintln!("opened seat '{}'", seat.name());

    while active.get() == 0 {
        eprintln!("waiting for activation...");
        seat.dispatch(-1).expect("dispatch failed");
    }
    eprintln!("active!");

    let (fd, device) = seat
        .open_device("/dev/dri/card0")
        .expect("could not open device");
    eprintln!("opened /dev/dri/card0 as device {}", device.as_raw());

    drop(fd);
    seat.close_device(device).expect("could not close device");
}
