//! Boundary with the in-kernel socket filter.
//!
//! The controller only sees the filter through [`FilterService`]: memory the
//! filter shares with us, a descriptor it signals when records are queued,
//! and a synchronous call carrying decisions back.

use std::{fmt, mem::ManuallyDrop, ops::Deref, os::fd::OwnedFd, ptr::NonNull};

use log::{debug, warn};
use nke_common::{NOTIFY_TYPE_SOCKET_FILTER, SOCKET_DATA_BASE, SocketFilterResponse};

use crate::error::FilterError;

/// A memory type the filter can map into the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    BufferSlot(usize),
    NotificationQueue,
}

impl Region {
    pub fn memory_type(self) -> u32 {
        match self {
            Region::BufferSlot(index) => SOCKET_DATA_BASE + index as u32,
            Region::NotificationQueue => NOTIFY_TYPE_SOCKET_FILTER,
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::BufferSlot(index) => write!(f, "buffer slot {index}"),
            Region::NotificationQueue => f.write_str("notification queue"),
        }
    }
}

/// Filter-owned memory mapped into this process.
#[derive(Debug)]
pub struct MappedRegion {
    region: Region,
    addr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    /// # Safety
    ///
    /// `addr` must point to `len` readable bytes that stay mapped until the
    /// region is handed back through [`FilterService::unmap_region`].
    pub unsafe fn new(region: Region, addr: NonNull<u8>, len: usize) -> Self {
        Self { region, addr, len }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Bounds-checked view of `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.len {
            return None;
        }
        // SAFETY: the range lies inside the mapping, which outlives `self`
        Some(unsafe { std::slice::from_raw_parts(self.addr.as_ptr().add(offset), len) })
    }
}

// SAFETY: the mapping is process-wide memory that is only read through
// `&self`, apart from atomics the queue consumer uses on its header.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

/// Operations the filter service exposes to its controller.
pub trait FilterService {
    fn map_region(&self, region: Region) -> Result<MappedRegion, FilterError>;

    fn unmap_region(&self, mapping: MappedRegion) -> Result<(), FilterError>;

    /// Returns an eventfd-like descriptor the filter makes readable whenever
    /// it enqueues a record.
    fn register_notification_waiter(&self) -> Result<OwnedFd, FilterError>;

    fn unregister_notification_waiter(&self) -> Result<(), FilterError>;

    /// Blocks until the filter has taken the decision.
    fn send_decision(&self, response: &SocketFilterResponse) -> Result<(), FilterError>;

    fn map_buffer_slot(&self, index: usize) -> Result<MappedRegion, FilterError> {
        self.map_region(Region::BufferSlot(index))
    }

    fn map_notification_queue(&self) -> Result<MappedRegion, FilterError> {
        self.map_region(Region::NotificationQueue)
    }
}

/// A mapped region that is unmapped when dropped.
pub struct Mapping<'a, S: FilterService + ?Sized> {
    service: &'a S,
    region: ManuallyDrop<MappedRegion>,
}

impl<'a, S: FilterService + ?Sized> Mapping<'a, S> {
    pub fn new(service: &'a S, region: Region) -> Result<Self, FilterError> {
        let mapped = match region {
            Region::BufferSlot(index) => service.map_buffer_slot(index)?,
            Region::NotificationQueue => service.map_notification_queue()?,
        };
        debug!("mapped {} ({} bytes)", region, mapped.len());
        Ok(Self {
            service,
            region: ManuallyDrop::new(mapped),
        })
    }
}

impl<S: FilterService + ?Sized> Deref for Mapping<'_, S> {
    type Target = MappedRegion;

    fn deref(&self) -> &MappedRegion {
        &self.region
    }
}

impl<S: FilterService + ?Sized> Drop for Mapping<'_, S> {
    fn drop(&mut self) {
        // SAFETY: the region is taken exactly once, here
        let mapped = unsafe { ManuallyDrop::take(&mut self.region) };
        let region = mapped.region();
        match self.service.unmap_region(mapped) {
            Ok(()) => debug!("unmapped {region}"),
            Err(e) => warn!("{e}"),
        }
    }
}
