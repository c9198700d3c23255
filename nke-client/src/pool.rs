use log::{debug, warn};
use nke_common::SOCKET_BUFFERS_NUMBER;

use crate::{
    decoder::DataPayload,
    error::{FilterError, ProtocolError},
    filter::{FilterService, MappedRegion, Mapping, Region},
};

/// The filter's payload buffers, all mapped for the lifetime of a session.
pub struct BufferPool<'a, S: FilterService + ?Sized> {
    slots: Vec<Mapping<'a, S>>,
}

impl<'a, S: FilterService + ?Sized> BufferPool<'a, S> {
    /// Maps every slot. If one fails, the slots mapped so far are unmapped
    /// before the error is returned.
    pub fn map_all(service: &'a S) -> Result<Self, FilterError> {
        let mut slots = Vec::with_capacity(SOCKET_BUFFERS_NUMBER);
        for index in 0..SOCKET_BUFFERS_NUMBER {
            match Mapping::new(service, Region::BufferSlot(index)) {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    warn!("mapped {} of {SOCKET_BUFFERS_NUMBER} buffer slots", slots.len());
                    return Err(e);
                }
            }
        }
        let pool = Self { slots };
        debug!("{} buffer slots mapped", pool.len());
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: u32) -> Result<&MappedRegion, ProtocolError> {
        self.slots
            .get(index as usize)
            .map(|slot| &**slot)
            .ok_or(ProtocolError::BufferIndexOutOfRange {
                index,
                count: self.len(),
            })
    }

    /// Checks every slot index of `payload` and returns the valid bytes of
    /// the first slot. `data_size` is clamped to the slot size.
    pub fn payload(&self, payload: &DataPayload) -> Result<&[u8], ProtocolError> {
        let mut first = None;
        for index in payload.slot_indices() {
            let slot = self.slot(index)?;
            first.get_or_insert(slot);
        }
        let Some(slot) = first else {
            return Ok(&[]);
        };

        let mut len = payload.data_size as usize;
        if len > slot.len() {
            warn!(
                "data size {} exceeds {} of {} bytes, clamping",
                len,
                slot.region(),
                slot.len()
            );
            len = slot.len();
        }
        Ok(slot.bytes(0, len).unwrap_or_default())
    }
}
