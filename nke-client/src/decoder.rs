use std::mem;

use nke_common::{
    INVALID_BUFFER_INDEX, SOCKET_BUFFERS_NUMBER, SocketEventKind, SocketFilterNotification,
};

use crate::error::ProtocolError;

/// Size every queue record must have.
pub const RECORD_SIZE: usize = mem::size_of::<SocketFilterNotification>();

/// Payload description carried by DataIn/DataOut events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPayload {
    pub buffers: [u32; SOCKET_BUFFERS_NUMBER],
    pub data_size: u32,
    pub data_index: u32,
}

impl DataPayload {
    /// Slot indices in order, up to the first unused entry.
    pub fn slot_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.buffers
            .iter()
            .copied()
            .take_while(|&index| index != INVALID_BUFFER_INDEX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketEvent {
    pub kind: SocketEventKind,
    pub socket_id: u64,
    pub payload: Option<DataPayload>,
}

/// Interprets one dequeued record. Kinds the controller does not know are
/// reported as [`SocketEventKind::Unknown`].
pub fn decode(raw: &[u8]) -> Result<SocketEvent, ProtocolError> {
    if raw.len() != RECORD_SIZE {
        return Err(ProtocolError::SizeMismatch {
            expected: RECORD_SIZE,
            actual: raw.len(),
        });
    }

    let ptr = raw.as_ptr() as *const SocketFilterNotification;
    // SAFETY: length checked above, every field is a plain integer
    let notification = unsafe { ptr.read_unaligned() };

    let kind = SocketEventKind::from_raw(notification.event).unwrap_or(SocketEventKind::Unknown);
    let payload = kind.is_gating().then_some(DataPayload {
        buffers: notification.data.buffers,
        data_size: notification.data.data_size,
        data_index: notification.data.data_index,
    });

    Ok(SocketEvent {
        kind,
        socket_id: notification.socket_id,
        payload,
    })
}
