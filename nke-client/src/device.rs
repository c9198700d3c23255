//! [`FilterService`] over the filter's character device.

use std::{
    fs::{File, OpenOptions},
    io,
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
    ptr::{self, NonNull},
};

use libc::{
    EBUSY, EFD_CLOEXEC, EFD_NONBLOCK, MAP_FAILED, MAP_SHARED, O_CLOEXEC, PROT_READ, PROT_WRITE,
    c_void, eventfd,
};
use log::{debug, info};
use nke_common::{
    NKE_IOC_FILTER_RESPONSE, NKE_IOC_OPEN_CLIENT, NKE_IOC_REGION_INFO, NKE_IOC_SET_NOTIFY,
    RegionInfo, SocketFilterResponse,
};

use crate::{
    error::FilterError,
    filter::{FilterService, MappedRegion, Region},
};

const FALLBACK_PAGE_SIZE: usize = 4096;

/// A client connection to the filter device. Dropping it closes the
/// connection.
pub struct DeviceFilter {
    device: File,
    page_size: usize,
}

impl DeviceFilter {
    pub fn connect(path: &Path) -> Result<Self, FilterError> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_CLOEXEC)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => FilterError::ServiceNotFound {
                    path: path.display().to_string(),
                    source: e,
                },
                _ if e.raw_os_error() == Some(EBUSY) => FilterError::Busy,
                _ => FilterError::Open(e),
            })?;

        // SAFETY: sysconf has no preconditions
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let filter = Self {
            device,
            page_size: usize::try_from(page_size).unwrap_or(FALLBACK_PAGE_SIZE),
        };

        filter
            .ioctl(NKE_IOC_OPEN_CLIENT, ptr::null_mut::<c_void>())
            .map_err(|e| match e.raw_os_error() {
                Some(EBUSY) => FilterError::Busy,
                _ => FilterError::Open(e),
            })?;
        info!("connected to filter service at {}", path.display());
        Ok(filter)
    }

    fn ioctl<T>(&self, request: u32, arg: *mut T) -> io::Result<()> {
        // SAFETY: every request number is paired with its argument type by the caller
        let ret = unsafe { libc::ioctl(self.device.as_raw_fd(), request as libc::Ioctl, arg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn region_size(&self, region: Region) -> io::Result<usize> {
        let mut info = RegionInfo {
            memory_type: region.memory_type(),
            ..Default::default()
        };
        self.ioctl(NKE_IOC_REGION_INFO, ptr::from_mut(&mut info))?;
        usize::try_from(info.size)
            .ok()
            .filter(|&size| size > 0)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("filter reported a {} byte {region}", info.size),
                )
            })
    }
}

impl FilterService for DeviceFilter {
    fn map_region(&self, region: Region) -> Result<MappedRegion, FilterError> {
        let map_failed = |source| FilterError::MapFailed { region, source };

        let size = self.region_size(region).map_err(map_failed)?;
        let prot = match region {
            Region::BufferSlot(_) => PROT_READ,
            // the consumer publishes `head` into the queue header
            Region::NotificationQueue => PROT_READ | PROT_WRITE,
        };
        let offset = region.memory_type() as usize * self.page_size;

        // SAFETY: a fresh shared mapping of the device; the result is checked
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                prot,
                MAP_SHARED,
                self.device.as_raw_fd(),
                offset as libc::off_t,
            )
        };
        if addr == MAP_FAILED {
            return Err(map_failed(io::Error::last_os_error()));
        }
        let addr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| map_failed(io::Error::from(io::ErrorKind::AddrNotAvailable)))?;

        // SAFETY: the mapping stays valid until `unmap_region` hands it to munmap
        Ok(unsafe { MappedRegion::new(region, addr, size) })
    }

    fn unmap_region(&self, mapping: MappedRegion) -> Result<(), FilterError> {
        // SAFETY: the region came from `map_region` and is unmapped exactly once
        let ret = unsafe { libc::munmap(mapping.as_ptr() as *mut c_void, mapping.len()) };
        if ret < 0 {
            return Err(FilterError::UnmapFailed {
                region: mapping.region(),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn register_notification_waiter(&self) -> Result<OwnedFd, FilterError> {
        // SAFETY: eventfd() is safe to call, we check for errors
        let fd = unsafe { eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if fd < 0 {
            return Err(FilterError::RegisterFailed(io::Error::last_os_error()));
        }
        // SAFETY: freshly created descriptor
        let notify = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut raw = notify.as_raw_fd();
        self.ioctl(NKE_IOC_SET_NOTIFY, ptr::from_mut(&mut raw))
            .map_err(FilterError::RegisterFailed)?;
        Ok(notify)
    }

    fn unregister_notification_waiter(&self) -> Result<(), FilterError> {
        let mut raw: i32 = -1;
        self.ioctl(NKE_IOC_SET_NOTIFY, ptr::from_mut(&mut raw))
            .map_err(FilterError::CallFailed)
    }

    fn send_decision(&self, response: &SocketFilterResponse) -> Result<(), FilterError> {
        let mut response = *response;
        self.ioctl(NKE_IOC_FILTER_RESPONSE, ptr::from_mut(&mut response))
            .map_err(FilterError::CallFailed)
    }
}

impl Drop for DeviceFilter {
    fn drop(&mut self) {
        debug!("closing filter service (fd {})", self.device.as_raw_fd());
    }
}
