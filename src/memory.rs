//! Registered memory regions and the fixed message-slot layout built on them.
//!
//! Regions are created once at session start and deregistered at teardown;
//! they are never resized or reregistered mid-session.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::fabric::{FabricError, Lkey, SlotIndex};
use crate::protocol::{RegionDescriptor, MESSAGE_SIZE};

/// Handle to a region registered with the fabric.
///
/// The buffer is shared with the fabric backend: inbound messages are written
/// into receive regions, and remote-accessible regions may be mutated by peer
/// one-sided writes at any time.
#[derive(Clone)]
pub struct RegionHandle {
    lkey: Lkey,
    buf: Arc<Mutex<Vec<u8>>>,
    descriptor: Option<RegionDescriptor>,
}

impl RegionHandle {
    pub(crate) fn new(
        lkey: Lkey,
        buf: Arc<Mutex<Vec<u8>>>,
        descriptor: Option<RegionDescriptor>,
    ) -> Self {
        Self {
            lkey,
            buf,
            descriptor,
        }
    }

    pub fn lkey(&self) -> Lkey {
        self.lkey
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Descriptor granting the peer one-sided write access, present only for
    /// regions registered remote-accessible.
    pub fn descriptor(&self) -> Option<RegionDescriptor> {
        self.descriptor
    }

    /// Copy `data` into the region at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), FabricError> {
        let mut buf = self.buf.lock();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= buf.len())
            .ok_or(FabricError::OutOfBounds {
                offset,
                len: data.len(),
                region: buf.len(),
            })?;
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Copy `len` bytes out of the region at `offset`.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>, FabricError> {
        let buf = self.buf.lock();
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= buf.len())
            .ok_or(FabricError::OutOfBounds {
                offset,
                len,
                region: buf.len(),
            })?;
        Ok(buf[offset..end].to_vec())
    }

    pub(crate) fn shared_buf(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.buf)
    }
}

/// The single-message staging area sends are posted from. Not present on
/// inline-send sessions.
pub struct SendRegion {
    region: RegionHandle,
}

impl SendRegion {
    pub fn new(region: RegionHandle) -> Self {
        Self { region }
    }

    /// Stage one encoded frame at the start of the region.
    pub fn stage(&self, frame: &[u8]) -> Result<(), FabricError> {
        self.region.write_at(0, frame)
    }

    pub fn handle(&self) -> &RegionHandle {
        &self.region
    }
}

/// Fixed ring of receive frames, one message per slot. The slot index is the
/// tag that correlates a receive completion back to its buffer.
pub struct RecvRing {
    region: RegionHandle,
    slots: usize,
}

impl RecvRing {
    pub fn new(region: RegionHandle, slots: usize) -> Self {
        debug_assert_eq!(region.len(), slots * MESSAGE_SIZE);
        Self { region, slots }
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Byte offset of `slot` within the region.
    pub fn offset_of(&self, slot: SlotIndex) -> usize {
        slot * MESSAGE_SIZE
    }

    /// Copy out the frame held in `slot`.
    pub fn frame(&self, slot: SlotIndex) -> Result<Vec<u8>, FabricError> {
        self.region.read_at(self.offset_of(slot), MESSAGE_SIZE)
    }

    pub fn handle(&self) -> &RegionHandle {
        &self.region
    }
}
