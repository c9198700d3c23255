use std::{
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicBool, Ordering},
};

use libc::{EFD_CLOEXEC, EFD_NONBLOCK, c_void, eventfd};
use log::debug;

/// Wakes the controller worker out of `poll()` so it can tear down.
///
/// Requesting shutdown may happen from any thread, any number of times.
/// Only the first request writes to the eventfd.
pub struct ShutdownEventFd {
    fd: OwnedFd,
    requested: AtomicBool,
}

impl ShutdownEventFd {
    pub fn new() -> Result<Self, io::Error> {
        // SAFETY: eventfd() is safe to call, we check for errors
        let fd = unsafe { eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            // SAFETY: fd was just created and nothing else owns it
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            requested: AtomicBool::new(false),
        })
    }

    pub fn request(&self) -> Result<(), io::Error> {
        if self.requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("shutdown requested");
        signal_eventfd(self.fd.as_raw_fd())
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl AsRawFd for ShutdownEventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Adds one to an eventfd counter.
pub fn signal_eventfd(fd: RawFd) -> Result<(), io::Error> {
    let val: u64 = 1;
    // SAFETY: fd is a valid eventfd, val is properly initialized
    let ret = unsafe { libc::write(fd, &val as *const u64 as *const c_void, mem::size_of::<u64>()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Resets an eventfd counter, returning its previous value.
pub fn drain_eventfd(fd: RawFd) -> Result<u64, io::Error> {
    let mut val: u64 = 0;
    // SAFETY: fd is a valid eventfd, val is a writable u64
    let ret = unsafe { libc::read(fd, &mut val as *mut u64 as *mut c_void, mem::size_of::<u64>()) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(val)
}
