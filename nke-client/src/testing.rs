//! Test doubles for the filter side of the protocol.

use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    ptr::{self, NonNull},
    sync::{
        Mutex, Once,
        atomic::{AtomicU32, Ordering},
    },
};

use libc::{EFD_CLOEXEC, EFD_NONBLOCK, eventfd};
use log::LevelFilter;
use nke_common::{
    DATA_QUEUE_ENTRY_HEADER_SIZE, DATA_QUEUE_HEAD_OFFSET, DATA_QUEUE_MEMORY_HEADER_SIZE,
    DATA_QUEUE_QUEUE_SIZE_OFFSET, DATA_QUEUE_TAIL_OFFSET, INVALID_BUFFER_INDEX,
    SOCKET_BUFFERS_NUMBER, SocketDataEvent, SocketEventKind, SocketFilterNotification,
    SocketFilterResponse, data_queue_entry_advance,
};

use crate::{
    decoder::DataPayload,
    error::FilterError,
    filter::{FilterService, MappedRegion, Region},
    shutdown::signal_eventfd,
};

pub const SLOT_SIZE: usize = 256;
const DEFAULT_QUEUE_CAPACITY: u32 = 4096;

/// Everything the controller asked the mock filter to do.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    pub mapped: Vec<Region>,
    pub unmapped: Vec<Region>,
    pub unmap_failures: Vec<Region>,
    pub decisions: Vec<SocketFilterResponse>,
    pub waiters_registered: usize,
    pub waiters_unregistered: usize,
}

impl Tracker {
    /// Every mapped region was unmapped exactly once, and every waiter was
    /// unregistered.
    pub fn balanced(&self) -> bool {
        let mut counts: HashMap<Region, isize> = HashMap::new();
        for region in &self.mapped {
            *counts.entry(*region).or_default() += 1;
        }
        for region in &self.unmapped {
            *counts.entry(*region).or_default() -= 1;
        }
        counts.values().all(|&c| c == 0) && self.waiters_registered == self.waiters_unregistered
    }
}

/// In-process filter: buffer slots and the notification ring live on the
/// heap, and the test plays the producer.
pub struct MockFilter {
    slots: Vec<Box<[u8]>>,
    queue: NonNull<u32>,
    queue_words: usize,
    notify: Mutex<Option<OwnedFd>>,
    tracker: Mutex<Tracker>,
    fail_map: Option<Region>,
    fail_unmap: Option<Region>,
    fail_send: bool,
}

// SAFETY: the ring is only touched through atomics for the indices and
// through raw copies into space the consumer does not own.
unsafe impl Send for MockFilter {}
unsafe impl Sync for MockFilter {}

impl MockFilter {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(capacity: u32) -> Self {
        let queue_words = (DATA_QUEUE_MEMORY_HEADER_SIZE + capacity as usize).div_ceil(4);
        let memory = vec![0u32; queue_words].into_boxed_slice();
        let queue = NonNull::new(Box::into_raw(memory) as *mut u32).unwrap();

        let mock = Self {
            slots: (0..SOCKET_BUFFERS_NUMBER)
                .map(|_| vec![0u8; SLOT_SIZE].into_boxed_slice())
                .collect(),
            queue,
            queue_words,
            notify: Mutex::new(None),
            tracker: Mutex::new(Tracker::default()),
            fail_map: None,
            fail_unmap: None,
            fail_send: false,
        };
        mock.word(DATA_QUEUE_QUEUE_SIZE_OFFSET).store(capacity, Ordering::Release);
        mock
    }

    pub fn fail_map(mut self, region: Region) -> Self {
        self.fail_map = Some(region);
        self
    }

    pub fn fail_unmap(mut self, region: Region) -> Self {
        self.fail_unmap = Some(region);
        self
    }

    pub fn fail_send(mut self) -> Self {
        self.fail_send = true;
        self
    }

    pub fn with_slot_data(mut self, index: usize, data: &[u8]) -> Self {
        self.slots[index][..data.len()].copy_from_slice(data);
        self
    }

    pub fn tracker(&self) -> Tracker {
        self.tracker.lock().unwrap().clone()
    }

    fn queue_bytes(&self) -> *mut u8 {
        self.queue.as_ptr() as *mut u8
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: header words are aligned and inside the ring allocation
        unsafe { AtomicU32::from_ptr(self.queue_bytes().add(offset) as *mut u32) }
    }

    fn write_at(&self, offset: u32, bytes: &[u8]) {
        let start = DATA_QUEUE_MEMORY_HEADER_SIZE + offset as usize;
        assert!(start + bytes.len() <= self.queue_words * 4);
        // SAFETY: bounds checked above, the consumer does not read this range yet
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.queue_bytes().add(start), bytes.len()) };
    }

    fn write_entry(&self, offset: u32, data: &[u8]) {
        self.write_at(offset, &(data.len() as u32).to_ne_bytes());
        self.write_at(offset + DATA_QUEUE_ENTRY_HEADER_SIZE as u32, data);
    }

    /// Enqueues one record the way the filter does, then signals the waiter.
    /// Returns false when the ring has no room.
    pub fn push(&self, data: &[u8]) -> bool {
        let capacity = self.word(DATA_QUEUE_QUEUE_SIZE_OFFSET).load(Ordering::Relaxed);
        let advance = data_queue_entry_advance(data.len() as u32);
        let head = self.word(DATA_QUEUE_HEAD_OFFSET).load(Ordering::Acquire);
        let tail = self.word(DATA_QUEUE_TAIL_OFFSET).load(Ordering::Relaxed);

        let new_tail = if tail >= head {
            if tail + advance <= capacity {
                self.write_entry(tail, data);
                tail + advance
            } else if head > advance {
                self.write_entry(0, data);
                if tail + DATA_QUEUE_ENTRY_HEADER_SIZE as u32 <= capacity {
                    // leave the size behind so the consumer knows to wrap
                    self.write_at(tail, &(data.len() as u32).to_ne_bytes());
                }
                advance
            } else {
                return false;
            }
        } else if head - tail > advance {
            self.write_entry(tail, data);
            tail + advance
        } else {
            return false;
        };

        self.word(DATA_QUEUE_TAIL_OFFSET).store(new_tail, Ordering::Release);
        self.notify();
        true
    }

    /// Publishes an entry header claiming `size` bytes without the data.
    pub fn corrupt_next_entry(&self, size: u32) {
        let tail = self.word(DATA_QUEUE_TAIL_OFFSET).load(Ordering::Relaxed);
        self.write_at(tail, &size.to_ne_bytes());
        self.word(DATA_QUEUE_TAIL_OFFSET)
            .store(tail + DATA_QUEUE_ENTRY_HEADER_SIZE as u32, Ordering::Release);
        self.notify();
    }

    pub fn set_declared_queue_size(&self, size: u32) {
        self.word(DATA_QUEUE_QUEUE_SIZE_OFFSET).store(size, Ordering::Release);
    }

    /// Wakes the registered waiter, if any, without queueing anything.
    pub fn notify(&self) {
        if let Some(fd) = self.notify.lock().unwrap().as_ref() {
            signal_eventfd(fd.as_raw_fd()).unwrap();
        }
    }
}

impl Drop for MockFilter {
    fn drop(&mut self) {
        // SAFETY: `queue` came from a boxed slice of `queue_words` words
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.queue.as_ptr(),
                self.queue_words,
            )));
        }
    }
}

impl FilterService for MockFilter {
    fn map_region(&self, region: Region) -> Result<MappedRegion, FilterError> {
        if self.fail_map == Some(region) {
            return Err(FilterError::MapFailed {
                region,
                source: io::Error::other("injected failure"),
            });
        }
        let (addr, len) = match region {
            Region::BufferSlot(index) => {
                let slot = self.slots.get(index).ok_or_else(|| FilterError::MapFailed {
                    region,
                    source: io::Error::from(io::ErrorKind::InvalidInput),
                })?;
                (slot.as_ptr() as *mut u8, slot.len())
            }
            Region::NotificationQueue => (self.queue_bytes(), self.queue_words * 4),
        };
        self.tracker.lock().unwrap().mapped.push(region);
        // SAFETY: the memory lives as long as the mock, which outlives every session
        Ok(unsafe { MappedRegion::new(region, NonNull::new(addr).unwrap(), len) })
    }

    fn unmap_region(&self, mapping: MappedRegion) -> Result<(), FilterError> {
        let region = mapping.region();
        let mut tracker = self.tracker.lock().unwrap();
        if self.fail_unmap == Some(region) {
            tracker.unmap_failures.push(region);
            return Err(FilterError::UnmapFailed {
                region,
                source: io::Error::other("injected failure"),
            });
        }
        tracker.unmapped.push(region);
        Ok(())
    }

    fn register_notification_waiter(&self) -> Result<OwnedFd, FilterError> {
        // SAFETY: eventfd() is safe to call, we check for errors
        let fd = unsafe { eventfd(0, EFD_NONBLOCK | EFD_CLOEXEC) };
        if fd < 0 {
            return Err(FilterError::RegisterFailed(io::Error::last_os_error()));
        }
        // SAFETY: freshly created descriptor
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        *self.notify.lock().unwrap() = Some(fd.try_clone().map_err(FilterError::RegisterFailed)?);
        self.tracker.lock().unwrap().waiters_registered += 1;
        Ok(fd)
    }

    fn unregister_notification_waiter(&self) -> Result<(), FilterError> {
        *self.notify.lock().unwrap() = None;
        self.tracker.lock().unwrap().waiters_unregistered += 1;
        Ok(())
    }

    fn send_decision(&self, response: &SocketFilterResponse) -> Result<(), FilterError> {
        if self.fail_send {
            return Err(FilterError::CallFailed(io::Error::other("injected failure")));
        }
        self.tracker.lock().unwrap().decisions.push(*response);
        Ok(())
    }
}

pub fn notification(
    kind: SocketEventKind,
    socket_id: u64,
    slots: &[u32],
    data_size: u32,
    data_index: u32,
) -> SocketFilterNotification {
    let mut buffers = [INVALID_BUFFER_INDEX; SOCKET_BUFFERS_NUMBER];
    buffers[..slots.len()].copy_from_slice(slots);
    SocketFilterNotification {
        event: kind as u32,
        _pad: 0,
        socket_id,
        data: SocketDataEvent {
            buffers,
            data_size,
            data_index,
        },
    }
}

pub fn data_payload(slots: &[u32], data_size: u32, data_index: u32) -> DataPayload {
    let mut buffers = [INVALID_BUFFER_INDEX; SOCKET_BUFFERS_NUMBER];
    buffers[..slots.len()].copy_from_slice(slots);
    DataPayload {
        buffers,
        data_size,
        data_index,
    }
}

struct CaptureLogger;

thread_local! {
    static CAPTURED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

impl log::Log for CaptureLogger {
    fn enabled(&self, _metadata: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        CAPTURED.with(|c| c.borrow_mut().push(record.args().to_string()));
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;

/// Starts collecting log lines emitted on the current thread.
pub fn capture_logs() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(LevelFilter::Trace);
    });
    CAPTURED.with(|c| c.borrow_mut().clear());
}

pub fn captured_logs() -> Vec<String> {
    CAPTURED.with(|c| c.borrow().clone())
}
