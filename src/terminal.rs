//! Virtual terminal control.
//!
//! Thin wrappers around the VT and console ioctls. Every tty fd handed out
//! here is short-lived: callers open a terminal, poke it, and close it
//! again, except for the seat's "current VT" fd which lives until the next
//! handover.

#[cfg(target_os = "linux")]
pub use imp::*;

#[cfg(target_os = "linux")]
mod imp {
    use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

    use log::debug;
    use nix::fcntl::OFlag;
    use nix::sys::stat::Mode;

    const KDSETMODE: libc::c_ulong = 0x4b3a;
    const KDSKBMODE: libc::c_ulong = 0x4b45;
    const VT_SETMODE: libc::c_ulong = 0x5602;
    const VT_GETSTATE: libc::c_ulong = 0x5603;
    const VT_RELDISP: libc::c_ulong = 0x5605;
    const VT_ACTIVATE: libc::c_ulong = 0x5606;

    const KD_TEXT: libc::c_int = 0x00;
    const KD_GRAPHICS: libc::c_int = 0x01;
    const K_UNICODE: libc::c_int = 0x03;
    const K_OFF: libc::c_int = 0x04;
    const VT_AUTO: libc::c_char = 0x00;
    const VT_PROCESS: libc::c_char = 0x01;
    const VT_ACKACQ: libc::c_int = 0x02;

    #[repr(C)]
    struct VtMode {
        mode: libc::c_char,
        waitv: libc::c_char,
        relsig: libc::c_short,
        acqsig: libc::c_short,
        frsig: libc::c_short,
    }

    #[repr(C)]
    #[derive(Default)]
    struct VtStat {
        v_active: libc::c_ushort,
        v_signal: libc::c_ushort,
        v_state: libc::c_ushort,
    }

    nix::ioctl_write_int_bad!(kd_setmode, KDSETMODE as libc::c_int);
    nix::ioctl_write_int_bad!(kd_skbmode, KDSKBMODE as libc::c_int);
    nix::ioctl_write_ptr_bad!(vt_setmode, VT_SETMODE as libc::c_int, VtMode);
    nix::ioctl_read_bad!(vt_getstate, VT_GETSTATE as libc::c_int, VtStat);
    nix::ioctl_write_int_bad!(vt_reldisp, VT_RELDISP as libc::c_int);
    nix::ioctl_write_int_bad!(vt_activate, VT_ACTIVATE as libc::c_int);

    fn raw(fd: BorrowedFd) -> RawFd {
        fd.as_raw_fd()
    }

    /// Open `/dev/tty<vt>`. VT 0 is the console multiplexer, useful only
    /// for queries like [`current_vt`].
    pub fn open(vt: i32) -> nix::Result<OwnedFd> {
        debug!("terminal: opening /dev/tty{vt}");
        let fd = nix::fcntl::open(
            format!("/dev/tty{vt}").as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Number of the VT that is currently in the foreground.
    pub fn current_vt(fd: BorrowedFd) -> nix::Result<i32> {
        let mut state = VtStat::default();
        unsafe { vt_getstate(raw(fd), &mut state) }?;
        Ok(state.v_active as i32)
    }

    /// Put the tty into process-controlled switching: the kernel signals us
    /// with SIGUSR1 before releasing the VT and SIGUSR2 after acquiring it,
    /// and waits for our ack.
    pub fn set_process_switching(fd: BorrowedFd, enable: bool) -> nix::Result<()> {
        debug!("terminal: setting process switching to {enable}");
        let mode = VtMode {
            mode: if enable { VT_PROCESS } else { VT_AUTO },
            waitv: 0,
            relsig: if enable { libc::SIGUSR1 as libc::c_short } else { 0 },
            acqsig: if enable { libc::SIGUSR2 as libc::c_short } else { 0 },
            frsig: 0,
        };
        unsafe { vt_setmode(raw(fd), &mode) }.map(drop)
    }

    pub fn set_keyboard(fd: BorrowedFd, enable: bool) -> nix::Result<()> {
        debug!("terminal: setting KB to {enable}");
        unsafe { kd_skbmode(raw(fd), if enable { K_UNICODE } else { K_OFF }) }.map(drop)
    }

    pub fn set_graphics(fd: BorrowedFd, enable: bool) -> nix::Result<()> {
        debug!("terminal: setting graphics to {enable}");
        unsafe { kd_setmode(raw(fd), if enable { KD_GRAPHICS } else { KD_TEXT }) }.map(drop)
    }

    /// Ask the kernel to switch to `vt`. Under process-controlled switching
    /// the change completes asynchronously via the release/acquire signals.
    pub fn switch_vt(fd: BorrowedFd, vt: i32) -> nix::Result<()> {
        debug!("terminal: switching to VT {vt}");
        unsafe { vt_activate(raw(fd), vt) }.map(drop)
    }

    pub fn ack_release(fd: BorrowedFd) -> nix::Result<()> {
        unsafe { vt_reldisp(raw(fd), 1) }.map(drop)
    }

    pub fn ack_acquire(fd: BorrowedFd) -> nix::Result<()> {
        unsafe { vt_reldisp(raw(fd), VT_ACKACQ) }.map(drop)
    }
}

// VT juggling is console-specific; elsewhere seats simply run non-VT-bound.
#[cfg(not(target_os = "linux"))]
pub use stub::*;

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::os::fd::{BorrowedFd, OwnedFd};

    use nix::errno::Errno;

    pub fn open(_vt: i32) -> nix::Result<OwnedFd> {
        Err(Errno::ENOTSUP)
    }

    pub fn current_vt(_fd: BorrowedFd) -> nix::Result<i32> {
        Err(Errno::ENOTSUP)
    }

    pub fn set_process_switching(_fd: BorrowedFd, _enable: bool) -> nix::Result<()> {
        Err(Errno::ENOTSUP)
    }

    pub fn set_keyboard(_fd: BorrowedFd, _enable: bool) -> nix::Result<()> {
        Err(Errno::ENOTSUP)
    }

    pub fn set_graphics(_fd: BorrowedFd, _enable: bool) -> nix::Result<()> {
        Err(Errno::ENOTSUP)
    }

    pub fn switch_vt(_fd: BorrowedFd, _vt: i32) -> nix::Result<()> {
        Err(Errno::ENOTSUP)
    }

    pub fn ack_release(_fd: BorrowedFd) -> nix::Result<()> {
        Err(Errno::ENOTSUP)
    }

    pub fn ack_acquire(_fd: BorrowedFd) -> nix::Result<()> {
        Err(Errno::ENOTSUP)
    }
}
