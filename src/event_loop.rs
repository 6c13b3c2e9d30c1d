use std::collections::HashMap;
use std::ffi::c_int;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::client::ClientId;

pub struct EventLoop {
    epoll: OwnedFd,
    data_map: HashMap<RawFd, Event>,
    event_buf: [libc::epoll_event; 32],
    event_cnt: usize,
    event_head: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Listener,
    Client(ClientId),
    VtRelease,
    VtAcquire,
    Quit,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl EventLoop {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            epoll: epoll_create1(libc::EPOLL_CLOEXEC)?,
            data_map: HashMap::new(),
            event_buf: unsafe { std::mem::zeroed() },
            event_cnt: 0,
            event_head: 0,
        })
    }

    pub fn add_fd(&mut self, fd: RawFd, event: Event) -> io::Result<()> {
        let mut epoll_event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: fd as u64,
        };

        if unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                fd,
                &mut epoll_event,
            )
        } == -1
        {
            return Err(io::Error::last_os_error());
        }

        self.data_map.insert(fd, event);
        Ok(())
    }

    /// Adjust the interest set of a registered fd. Readability is always
    /// watched; writability only while `writable` is set.
    pub fn update(&mut self, fd: RawFd, writable: bool) -> io::Result<()> {
        let mut events = libc::EPOLLIN as u32;
        if writable {
            events |= libc::EPOLLOUT as u32;
        }
        let mut epoll_event = libc::epoll_event {
            events,
            u64: fd as u64,
        };

        if unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_MOD,
                fd,
                &mut epoll_event,
            )
        } == -1
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        self.data_map.remove(&fd);
        if unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        } == -1
        {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn poll(&mut self) -> io::Result<(Event, Readiness)> {
        loop {
            if self.event_cnt > 0 {
                let event = self.event_buf[self.event_head];
                self.event_cnt -= 1;
                self.event_head += 1;

                // The fd may have been removed by an earlier event of the
                // same batch; its remaining readiness is stale.
                let Some(&data) = self.data_map.get(&(event.u64 as RawFd)) else {
                    continue;
                };
                let readiness = Readiness {
                    readable: event.events & libc::EPOLLIN as u32 != 0,
                    writable: event.events & libc::EPOLLOUT as u32 != 0,
                    hangup: event.events & libc::EPOLLHUP as u32 != 0,
                    error: event.events & libc::EPOLLERR as u32 != 0,
                };
                return Ok((data, readiness));
            }

            let wait_result = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    self.event_buf.as_mut_ptr(),
                    self.event_buf.len() as i32,
                    -1,
                )
            };
            if wait_result == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            assert_ne!(wait_result, 0, "timeout is -1, zero is impossible");

            self.event_cnt = wait_result as usize;
            self.event_head = 0;
        }
    }
}

fn epoll_create1(flags: c_int) -> io::Result<OwnedFd> {
    match unsafe { libc::epoll_create1(flags) } {
        -1 => Err(io::Error::last_os_error()),
        fd => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
    }
}
