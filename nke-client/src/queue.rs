//! Consumer side of the notification queue.
//!
//! The filter produces fixed-size records into a ring living in a shared
//! mapping. The controller reads records and publishes how far it got by
//! advancing `head`; it never writes record data.

use std::{
    io,
    os::fd::{AsRawFd, OwnedFd},
    sync::atomic::{AtomicU32, Ordering},
};

use bytes::BytesMut;
use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL, poll, pollfd};
use log::{debug, trace, warn};
use nke_common::{
    DATA_QUEUE_ENTRY_HEADER_SIZE, DATA_QUEUE_HEAD_OFFSET, DATA_QUEUE_MEMORY_HEADER_SIZE,
    DATA_QUEUE_QUEUE_SIZE_OFFSET, DATA_QUEUE_TAIL_OFFSET,
};

use crate::{
    error::{FilterError, QueueError},
    filter::{FilterService, Mapping},
    shutdown::{ShutdownEventFd, drain_eventfd},
};

fn entry_advance(size: u32) -> u64 {
    DATA_QUEUE_ENTRY_HEADER_SIZE as u64 + ((size as u64 + 3) & !3)
}

pub struct NotificationQueue<'a, S: FilterService + ?Sized> {
    mapping: Mapping<'a, S>,
    capacity: u32,
}

impl<'a, S: FilterService + ?Sized> NotificationQueue<'a, S> {
    pub fn attach(mapping: Mapping<'a, S>) -> Result<Self, QueueError> {
        if mapping.len() < DATA_QUEUE_MEMORY_HEADER_SIZE || mapping.as_ptr().align_offset(4) != 0 {
            return Err(QueueError::RegionTooSmall {
                len: mapping.len(),
                capacity: 0,
            });
        }
        let mut queue = Self {
            mapping,
            capacity: 0,
        };
        let capacity = queue.word(DATA_QUEUE_QUEUE_SIZE_OFFSET).load(Ordering::Acquire);
        if DATA_QUEUE_MEMORY_HEADER_SIZE + capacity as usize > queue.mapping.len() {
            return Err(QueueError::RegionTooSmall {
                len: queue.mapping.len(),
                capacity,
            });
        }
        queue.capacity = capacity;
        debug!("notification queue attached, {capacity} byte ring");
        Ok(queue)
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: header words are 4-byte aligned and inside the mapping
        // (checked in `attach`), and the mapping outlives the borrow.
        unsafe { AtomicU32::from_ptr(self.mapping.as_ptr().add(offset) as *mut u32) }
    }

    fn entry_size(&self, offset: u32) -> Option<u32> {
        let bytes = self.mapping.bytes(
            DATA_QUEUE_MEMORY_HEADER_SIZE + offset as usize,
            DATA_QUEUE_ENTRY_HEADER_SIZE,
        )?;
        Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn data_available(&self) -> bool {
        self.word(DATA_QUEUE_HEAD_OFFSET).load(Ordering::Relaxed)
            != self.word(DATA_QUEUE_TAIL_OFFSET).load(Ordering::Acquire)
    }

    /// Copies the next record into `record` and releases its ring space.
    ///
    /// Returns `Ok(None)` when the queue is empty.
    pub fn dequeue(&self, record: &mut BytesMut) -> Result<Option<usize>, QueueError> {
        let head = self.word(DATA_QUEUE_HEAD_OFFSET).load(Ordering::Relaxed);
        let tail = self.word(DATA_QUEUE_TAIL_OFFSET).load(Ordering::Acquire);
        if head == tail {
            return Ok(None);
        }

        let capacity = self.capacity as u64;
        let fits_at = |offset: u32, size: u32| offset as u64 + entry_advance(size) <= capacity;

        let mut offset = head;
        let mut size = if head as u64 + DATA_QUEUE_ENTRY_HEADER_SIZE as u64 > capacity {
            None
        } else {
            self.entry_size(head)
        };
        // An entry that does not fit before the end of the ring was written at offset 0.
        if !size.is_some_and(|size| fits_at(head, size)) {
            trace!("queue wraps at offset {head}");
            offset = 0;
            size = self.entry_size(0);
        }
        let size = size.ok_or(QueueError::Corrupted { offset, size: 0 })?;
        if !fits_at(offset, size) {
            return Err(QueueError::Corrupted { offset, size });
        }

        let data = self
            .mapping
            .bytes(
                DATA_QUEUE_MEMORY_HEADER_SIZE + offset as usize + DATA_QUEUE_ENTRY_HEADER_SIZE,
                size as usize,
            )
            .ok_or(QueueError::Corrupted { offset, size })?;
        record.clear();
        record.extend_from_slice(data);

        self.word(DATA_QUEUE_HEAD_OFFSET)
            .store((offset as u64 + entry_advance(size)) as u32, Ordering::Release);
        Ok(Some(size as usize))
    }
}

/// The notification descriptor registered with the filter.
///
/// Dropping the waiter unregisters it and closes the descriptor.
pub struct NotificationWaiter<'a, S: FilterService + ?Sized> {
    service: &'a S,
    notify: OwnedFd,
}

impl<'a, S: FilterService + ?Sized> NotificationWaiter<'a, S> {
    pub fn register(service: &'a S) -> Result<Self, FilterError> {
        let notify = service.register_notification_waiter()?;
        debug!("notification waiter registered (fd {})", notify.as_raw_fd());
        Ok(Self { service, notify })
    }

    /// Blocks until `queue` has data, or fails with [`QueueError::Closed`]
    /// once shutdown is requested or the filter hangs up.
    pub fn wait_for_data(
        &self,
        queue: &NotificationQueue<'_, S>,
        shutdown: &ShutdownEventFd,
    ) -> Result<(), QueueError> {
        loop {
            if shutdown.is_requested() {
                return Err(QueueError::Closed);
            }
            // Checked before blocking so a record queued ahead of its wakeup
            // is never missed.
            if queue.data_available() {
                return Ok(());
            }

            let mut fds = [
                pollfd {
                    fd: self.notify.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                },
                pollfd {
                    fd: shutdown.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                },
            ];
            // SAFETY: fds is properly initialized, timeout -1 means wait indefinitely
            let ret = unsafe { poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(QueueError::WaitFailed(err));
            }

            if fds[1].revents != 0 {
                return Err(QueueError::Closed);
            }
            if (fds[0].revents & (POLLERR | POLLHUP | POLLNVAL)) != 0 {
                warn!("notification descriptor hung up (revents {:#x})", fds[0].revents);
                return Err(QueueError::Closed);
            }
            if (fds[0].revents & POLLIN) != 0 {
                drain_eventfd(self.notify.as_raw_fd()).map_err(QueueError::WaitFailed)?;
            }
        }
    }
}

impl<S: FilterService + ?Sized> Drop for NotificationWaiter<'_, S> {
    fn drop(&mut self) {
        match self.service.unregister_notification_waiter() {
            Ok(()) => debug!("notification waiter unregistered"),
            Err(e) => warn!("failed to unregister notification waiter: {e}"),
        }
    }
}
