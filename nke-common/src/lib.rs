#![no_std]

use core::{fmt, mem, slice};

// Shared payload buffers exposed by the filter (K)
pub const SOCKET_BUFFERS_NUMBER: usize = 8;

// Property slots in a filter response (P)
pub const RESPONSE_PROPERTIES_NUMBER: usize = 4;

// Marks an unused entry in a buffer index array
pub const INVALID_BUFFER_INDEX: u32 = u32::MAX;

// Memory types passed to the filter when mapping
pub const NOTIFY_TYPE_SOCKET_FILTER: u32 = 0x1;
pub const SOCKET_DATA_BASE: u32 = 0x10;

// Notification queue layout: { queue_size: u32, head: u32, tail: u32 } then ring data
pub const DATA_QUEUE_MEMORY_HEADER_SIZE: usize = 12;
pub const DATA_QUEUE_QUEUE_SIZE_OFFSET: usize = 0;
pub const DATA_QUEUE_HEAD_OFFSET: usize = 4;
pub const DATA_QUEUE_TAIL_OFFSET: usize = 8;
// Each entry is { size: u32, data: [u8; size] }, padded to 4 bytes
pub const DATA_QUEUE_ENTRY_HEADER_SIZE: usize = 4;

/// Ring bytes consumed by an entry carrying `size` bytes of data.
pub const fn data_queue_entry_advance(size: u32) -> u32 {
    DATA_QUEUE_ENTRY_HEADER_SIZE as u32 + ((size + 3) & !3)
}

/// Socket lifecycle events reported by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SocketEventKind {
    Unknown = 0,
    Connected = 1,
    Disconnected = 2,
    Shutdown = 3,
    CantRecvMore = 4,
    CantSendMore = 5,
    Closing = 6,
    Bound = 7,
    DataIn = 8,
    DataOut = 9,
}

impl SocketEventKind {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Self::Unknown,
            1 => Self::Connected,
            2 => Self::Disconnected,
            3 => Self::Shutdown,
            4 => Self::CantRecvMore,
            5 => Self::CantSendMore,
            6 => Self::Closing,
            7 => Self::Bound,
            8 => Self::DataIn,
            9 => Self::DataOut,
            _ => return None,
        })
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Shutdown => "Shutdown",
            Self::CantRecvMore => "CantRecvMore",
            Self::CantSendMore => "CantSendMore",
            Self::Closing => "Closing",
            Self::Bound => "Bound",
            Self::DataIn => "DataIn",
            Self::DataOut => "DataOut",
        }
    }

    /// DataIn and DataOut hold data in the filter until a response arrives.
    pub const fn is_gating(self) -> bool {
        matches!(self, Self::DataIn | Self::DataOut)
    }
}

impl fmt::Display for SocketEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Payload part of a notification, meaningful for DataIn/DataOut only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SocketDataEvent {
    pub buffers: [u32; SOCKET_BUFFERS_NUMBER], // slot indices, unused = INVALID_BUFFER_INDEX
    pub data_size: u32,                        // valid bytes in the first slot
    pub data_index: u32,                       // chunk position within the socket stream
}

// One record in the notification queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SocketFilterNotification {
    pub event: u32, // SocketEventKind
    pub _pad: u32,
    pub socket_id: u64,
    pub data: SocketDataEvent,
}

impl SocketFilterNotification {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) with explicit padding fields, every byte is initialized
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, mem::size_of::<Self>()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SocketDataPropertyType {
    Unknown = 0, // terminates the property list
    Permission = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct PermissionValue {
    pub allow_data: u32,
    pub _reserved: u32,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub union SocketDataPropertyValue {
    pub permission: PermissionValue,
    pub raw: u64,
}

impl fmt::Debug for SocketDataPropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: both variants are plain integers covering the same 8 bytes
        let raw = unsafe { self.raw };
        write!(f, "{raw:#018x}")
    }
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SocketDataProperty {
    pub type_: u32, // SocketDataPropertyType
    pub _pad: u32,
    pub socket_id: u64,
    pub data_index: u32,
    pub _pad2: u32,
    pub value: SocketDataPropertyValue,
}

impl SocketDataProperty {
    pub const fn terminator() -> Self {
        Self {
            type_: SocketDataPropertyType::Unknown as u32,
            _pad: 0,
            socket_id: 0,
            data_index: 0,
            _pad2: 0,
            value: SocketDataPropertyValue { raw: 0 },
        }
    }

    pub const fn permission(socket_id: u64, data_index: u32, allow_data: bool) -> Self {
        Self {
            type_: SocketDataPropertyType::Permission as u32,
            _pad: 0,
            socket_id,
            data_index,
            _pad2: 0,
            value: SocketDataPropertyValue {
                permission: PermissionValue {
                    allow_data: allow_data as u32,
                    _reserved: 0,
                },
            },
        }
    }

    pub fn allow_data(&self) -> Option<bool> {
        if self.type_ != SocketDataPropertyType::Permission as u32 {
            return None;
        }
        // SAFETY: a Permission entry carries the permission variant
        Some(unsafe { self.value.permission.allow_data } != 0)
    }
}

// Decision record sent back to the filter
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SocketFilterResponse {
    pub buffers_to_release: [u32; SOCKET_BUFFERS_NUMBER],
    pub property: [SocketDataProperty; RESPONSE_PROPERTIES_NUMBER],
}

impl SocketFilterResponse {
    /// Every property is an Unknown terminator and no buffer is released.
    pub const fn empty() -> Self {
        Self {
            buffers_to_release: [INVALID_BUFFER_INDEX; SOCKET_BUFFERS_NUMBER],
            property: [SocketDataProperty::terminator(); RESPONSE_PROPERTIES_NUMBER],
        }
    }

    /// Properties up to, not including, the Unknown terminator.
    pub fn properties(&self) -> impl Iterator<Item = &SocketDataProperty> {
        self.property
            .iter()
            .take_while(|p| p.type_ != SocketDataPropertyType::Unknown as u32)
    }
}

// Size of a mappable memory type, filled in by the filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegionInfo {
    pub memory_type: u32,
    pub _pad: u32,
    pub size: u64,
}

const _: () = assert!(mem::size_of::<SocketDataEvent>() == 40);
const _: () = assert!(mem::size_of::<SocketFilterNotification>() == 56);
const _: () = assert!(mem::size_of::<SocketDataProperty>() == 32);
const _: () = assert!(mem::size_of::<SocketFilterResponse>() == 160);
const _: () = assert!(mem::size_of::<RegionInfo>() == 16);

// ioctl request encoding, same as the kernel's _IOC
const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | (((size as u32) & 0x3fff) << 16) | ((ty as u32) << 8) | nr as u32
}

// Filter service device
pub const NKE_IOC_OPEN_CLIENT: u32 = ioc(IOC_NONE, b'F', 0x10, 0);
pub const NKE_IOC_REGION_INFO: u32 = ioc(
    IOC_READ | IOC_WRITE,
    b'F',
    0x11,
    mem::size_of::<RegionInfo>(),
);
pub const NKE_IOC_SET_NOTIFY: u32 = ioc(IOC_WRITE, b'F', 0x12, mem::size_of::<i32>());
pub const NKE_IOC_FILTER_RESPONSE: u32 = ioc(
    IOC_READ | IOC_WRITE,
    b'F',
    0x13,
    mem::size_of::<SocketFilterResponse>(),
);

// Diversion control device
pub const NKE_START_DIVERTING: u32 = ioc(IOC_NONE, b'Z', 1, 0);
pub const NKE_STOP_DIVERTING: u32 = ioc(IOC_NONE, b'Z', 2, 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_raw_values() {
        for raw in 0..10 {
            let kind = SocketEventKind::from_raw(raw).unwrap();
            assert_eq!(kind as u32, raw);
        }
        assert_eq!(SocketEventKind::from_raw(10), None);
        assert!(SocketEventKind::DataOut.is_gating());
        assert!(!SocketEventKind::Closing.is_gating());
    }

    #[test]
    fn entry_advance_is_word_aligned() {
        assert_eq!(data_queue_entry_advance(0), 4);
        assert_eq!(data_queue_entry_advance(1), 8);
        assert_eq!(data_queue_entry_advance(56), 60);
    }

    #[test]
    fn diversion_requests_match_io_macro() {
        // _IO('Z', 1) and _IO('Z', 2)
        assert_eq!(NKE_START_DIVERTING, 0x5a01);
        assert_eq!(NKE_STOP_DIVERTING, 0x5a02);
    }

    #[test]
    fn permission_property_reads_back() {
        let prop = SocketDataProperty::permission(42, 1, true);
        assert_eq!(prop.allow_data(), Some(true));
        assert_eq!(SocketDataProperty::terminator().allow_data(), None);

        let mut response = SocketFilterResponse::empty();
        assert_eq!(response.properties().count(), 0);
        response.property[0] = prop;
        assert_eq!(response.properties().count(), 1);
    }
}
