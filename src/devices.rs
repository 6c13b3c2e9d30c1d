//! Device classification and the two privileged device ioctls.
//!
//! DRM master follows the fd it was acquired on, and an evdev revoke is
//! permanent for that file description, so both operate on borrowed fds
//! owned elsewhere.

use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Drm,
    Evdev,
}

#[cfg(target_os = "linux")]
pub fn device_type(path: &Path) -> Option<DeviceType> {
    use nix::sys::stat;

    const DRM_MAJOR: u64 = 226;
    const INPUT_MAJOR: u64 = 13;
    // Minors below 64 belong to other input interfaces (mice, joysticks).
    const EVDEV_MINOR_BASE: u64 = 64;

    let st = stat::stat(path).ok()?;
    let major = stat::major(st.st_rdev);
    let minor = stat::minor(st.st_rdev);
    if major == DRM_MAJOR {
        Some(DeviceType::Drm)
    } else if major == INPUT_MAJOR && minor >= EVDEV_MINOR_BASE {
        Some(DeviceType::Evdev)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
pub fn device_type(path: &Path) -> Option<DeviceType> {
    // devfs has no stable majors; go by the canonical path instead.
    if path.starts_with("/dev/dri") {
        Some(DeviceType::Drm)
    } else if path.starts_with("/dev/input") {
        Some(DeviceType::Evdev)
    } else {
        None
    }
}

nix::ioctl_none!(drm_ioctl_set_master, b'd', 0x1e);
nix::ioctl_none!(drm_ioctl_drop_master, b'd', 0x1f);
nix::ioctl_write_ptr!(evdev_ioctl_revoke, b'E', 0x91, libc::c_int);

/// Acquire DRM master on the device fd.
pub fn drm_set_master(fd: BorrowedFd) -> nix::Result<()> {
    unsafe { drm_ioctl_set_master(fd.as_raw_fd()) }.map(drop)
}

/// Release DRM master held by the device fd.
pub fn drm_drop_master(fd: BorrowedFd) -> nix::Result<()> {
    unsafe { drm_ioctl_drop_master(fd.as_raw_fd()) }.map(drop)
}

/// Permanently detach the evdev fd from its event stream. The fd stays
/// open but delivers nothing from now on.
pub fn evdev_revoke(fd: BorrowedFd) -> nix::Result<()> {
    unsafe { evdev_ioctl_revoke(fd.as_raw_fd(), &0) }.map(drop)
}
