//! Pre-registered buffer pool.
//!
//! The pool owns one registered memory region per [`BufferClass`]. Each region
//! is carved into `capacity` equally sized slots; a slot is identified by its
//! index and addressed by computed offset, so all slots of a class share the
//! region's remote key. Allocation is a first-free scan over a fixed occupancy
//! array.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RdmtError, Result};
use crate::transport::{AccessFlags, LocalBuffer, RemoteKey, TransportProvider};

/// Wire size of a command message, and so of each command slot.
pub const COMMAND_SLOT_SIZE: usize = 24;

/// Default bulk slot size.
pub const DEFAULT_BULK_SIZE: usize = 4096;

/// Default number of slots per class.
pub const DEFAULT_CAPACITY: usize = 16;

/// A contiguous byte region that can be registered with a provider.
///
/// Cloning yields another handle to the same memory.
#[derive(Debug, Clone)]
pub struct MemoryRegion {
    buffer: Arc<Mutex<Vec<u8>>>,
    length: usize,
}

impl MemoryRegion {
    /// Allocates a zeroed region of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(vec![0u8; len])),
            length: len,
        }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.length
    }

    /// True for a zero-length region.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Copies `len` bytes starting at `offset`, or `None` when out of bounds.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let buf = self.buffer.lock();
        let end = offset.checked_add(len)?;
        if end > buf.len() {
            return None;
        }
        Some(buf[offset..end].to_vec())
    }

    /// Writes `data` at `offset`. Returns false when out of bounds.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut buf = self.buffer.lock();
        let end = match offset.checked_add(data.len()) {
            Some(end) => end,
            None => return false,
        };
        if end > buf.len() {
            return false;
        }
        buf[offset..end].copy_from_slice(data);
        true
    }

    /// True when both handles refer to the same memory.
    pub fn same_region(&self, other: &MemoryRegion) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

/// The two slot classes of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferClass {
    /// Small slots holding one wire command.
    Command,
    /// Large slots holding bulk payloads.
    Bulk,
}

/// An allocated slot.
///
/// Not `Clone`: handing the slot back to [`BufferPool::free`] consumes it, so
/// a slot cannot be freed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferSlot {
    class: BufferClass,
    index: usize,
    key: RemoteKey,
    offset: usize,
    len: usize,
}

impl BufferSlot {
    /// The slot's class.
    pub fn class(&self) -> BufferClass {
        self.class
    }

    /// Index within the class.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Remote key shared by every slot of the class.
    pub fn key(&self) -> RemoteKey {
        self.key
    }

    /// Byte offset of the slot inside the class region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Slot size in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-sized slot.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Configuration for the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolConfig {
    /// Slots per class.
    pub capacity: usize,
    /// Size of each command slot.
    pub command_size: usize,
    /// Size of each bulk slot.
    pub bulk_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            command_size: COMMAND_SLOT_SIZE,
            bulk_size: DEFAULT_BULK_SIZE,
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPoolStats {
    /// Slots per class.
    pub capacity: usize,
    /// Command slots in use.
    pub command_in_use: usize,
    /// Bulk slots in use.
    pub bulk_in_use: usize,
}

struct SlotArray {
    class: BufferClass,
    region: MemoryRegion,
    key: RemoteKey,
    slot_size: usize,
    occupied: Vec<bool>,
}

impl SlotArray {
    fn allocate(&mut self) -> Option<BufferSlot> {
        let index = self.occupied.iter().position(|used| !used)?;
        self.occupied[index] = true;
        Some(BufferSlot {
            class: self.class,
            index,
            key: self.key,
            offset: index * self.slot_size,
            len: self.slot_size,
        })
    }

    fn in_use(&self) -> usize {
        self.occupied.iter().filter(|used| **used).count()
    }
}

/// Fixed-capacity pool of pre-registered command and bulk slots.
pub struct BufferPool<P: TransportProvider> {
    provider: Arc<P>,
    command: SlotArray,
    bulk: SlotArray,
    released: bool,
}

impl<P: TransportProvider> BufferPool<P> {
    /// Allocates and registers both class regions.
    ///
    /// If the second registration fails the first is deregistered before the
    /// error is returned.
    pub fn new(provider: Arc<P>, config: BufferPoolConfig) -> Result<Self> {
        if config.capacity == 0 || config.command_size == 0 || config.bulk_size == 0 {
            return Err(RdmtError::Setup {
                stage: "buffer pool",
                reason: "capacity and slot sizes must be non-zero".into(),
            });
        }

        let region_len = |slot_size: usize, class: &str| {
            config
                .capacity
                .checked_mul(slot_size)
                .ok_or_else(|| RdmtError::Setup {
                    stage: "buffer pool",
                    reason: format!(
                        "{} region of {} slots of {} bytes overflows",
                        class, config.capacity, slot_size
                    ),
                })
        };
        let command_len = region_len(config.command_size, "command")?;
        let bulk_len = region_len(config.bulk_size, "bulk")?;

        let command_region = MemoryRegion::new(command_len);
        let command_key = provider
            .register_memory(
                &command_region,
                AccessFlags::SEND
                    | AccessFlags::RECV
                    | AccessFlags::LOCAL_READ
                    | AccessFlags::LOCAL_WRITE,
            )
            .map_err(|e| e.at_setup("register command region"))?;

        let bulk_region = MemoryRegion::new(bulk_len);
        let bulk_key = match provider.register_memory(&bulk_region, AccessFlags::ALL) {
            Ok(key) => key,
            Err(e) => {
                if let Err(dereg) = provider.deregister_memory(command_key) {
                    warn!("rollback: failed to deregister command region: {}", dereg);
                }
                return Err(e.at_setup("register bulk region"));
            }
        };

        debug!(
            capacity = config.capacity,
            bulk_size = config.bulk_size,
            "buffer pool registered"
        );

        Ok(Self {
            provider,
            command: SlotArray {
                class: BufferClass::Command,
                region: command_region,
                key: command_key,
                slot_size: config.command_size,
                occupied: vec![false; config.capacity],
            },
            bulk: SlotArray {
                class: BufferClass::Bulk,
                region: bulk_region,
                key: bulk_key,
                slot_size: config.bulk_size,
                occupied: vec![false; config.capacity],
            },
            released: false,
        })
    }

    fn array(&self, class: BufferClass) -> &SlotArray {
        match class {
            BufferClass::Command => &self.command,
            BufferClass::Bulk => &self.bulk,
        }
    }

    fn array_mut(&mut self, class: BufferClass) -> &mut SlotArray {
        match class {
            BufferClass::Command => &mut self.command,
            BufferClass::Bulk => &mut self.bulk,
        }
    }

    /// Takes the lowest free slot of `class`, or `None` when all are in use.
    pub fn allocate(&mut self, class: BufferClass) -> Option<BufferSlot> {
        let slot = self.array_mut(class).allocate();
        if slot.is_none() {
            debug!(?class, "buffer pool exhausted");
        }
        slot
    }

    /// Returns a slot to the pool.
    pub fn free(&mut self, slot: BufferSlot) {
        let array = self.array_mut(slot.class);
        match array.occupied.get_mut(slot.index) {
            Some(used) if *used && slot.key == array.key => *used = false,
            _ => warn!(
                class = ?slot.class,
                index = slot.index,
                "freeing a slot this pool did not hand out"
            ),
        }
    }

    /// Slots per class.
    pub fn capacity(&self) -> usize {
        self.command.occupied.len()
    }

    /// Slots of `class` currently allocated.
    pub fn in_use(&self, class: BufferClass) -> usize {
        self.array(class).in_use()
    }

    /// Size of a slot of `class`.
    pub fn slot_size(&self, class: BufferClass) -> usize {
        self.array(class).slot_size
    }

    /// The remote key of `class`.
    pub fn key(&self, class: BufferClass) -> RemoteKey {
        self.array(class).key
    }

    /// The registered region of `class`.
    pub fn region(&self, class: BufferClass) -> &MemoryRegion {
        &self.array(class).region
    }

    /// A provider window over the first `len` bytes of `slot`.
    pub fn local(&self, slot: &BufferSlot, len: usize) -> Result<LocalBuffer<'_>> {
        if len > slot.len {
            return Err(RdmtError::OutOfBounds {
                offset: 0,
                len,
                capacity: slot.len,
            });
        }
        Ok(LocalBuffer {
            region: self.region(slot.class),
            offset: slot.offset,
            len,
        })
    }

    /// Copies the first `len` bytes of `slot`.
    pub fn read(&self, slot: &BufferSlot, len: usize) -> Result<Vec<u8>> {
        if len > slot.len {
            return Err(RdmtError::OutOfBounds {
                offset: 0,
                len,
                capacity: slot.len,
            });
        }
        self.region(slot.class)
            .read_at(slot.offset, len)
            .ok_or(RdmtError::OutOfBounds {
                offset: slot.offset,
                len,
                capacity: self.region(slot.class).len(),
            })
    }

    /// Copies `data` to the start of `slot`.
    pub fn write(&self, slot: &BufferSlot, data: &[u8]) -> Result<()> {
        if data.len() > slot.len {
            return Err(RdmtError::OutOfBounds {
                offset: 0,
                len: data.len(),
                capacity: slot.len,
            });
        }
        if self.region(slot.class).write_at(slot.offset, data) {
            Ok(())
        } else {
            Err(RdmtError::OutOfBounds {
                offset: slot.offset,
                len: data.len(),
                capacity: self.region(slot.class).len(),
            })
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            capacity: self.capacity(),
            command_in_use: self.command.in_use(),
            bulk_in_use: self.bulk.in_use(),
        }
    }

    /// Deregisters both regions. Failures are logged; calling twice is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        for array in [&self.bulk, &self.command] {
            if let Err(e) = self.provider.deregister_memory(array.key) {
                warn!(class = ?array.class, "failed to deregister region: {}", e);
            }
        }
    }
}

impl<P: TransportProvider> Drop for BufferPool<P> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<P: TransportProvider> std::fmt::Debug for BufferPool<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimFabric;

    fn pool(capacity: usize) -> BufferPool<crate::sim::SimNode> {
        let node = Arc::new(SimFabric::new().node("pool"));
        BufferPool::new(
            node,
            BufferPoolConfig {
                capacity,
                ..BufferPoolConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_memory_region_read_write() {
        let mr = MemoryRegion::new(16);
        assert!(mr.write_at(4, &[1, 2, 3]));
        assert_eq!(mr.read_at(4, 3), Some(vec![1, 2, 3]));
        assert_eq!(mr.read_at(15, 2), None);
        assert!(!mr.write_at(14, &[0; 3]));
        assert!(!mr.write_at(usize::MAX, &[0]));
    }

    #[test]
    fn test_memory_region_clone_shares_memory() {
        let mr = MemoryRegion::new(8);
        let alias = mr.clone();
        assert!(alias.write_at(0, b"abc"));
        assert_eq!(mr.read_at(0, 3).unwrap(), b"abc");
        assert!(mr.same_region(&alias));
        assert!(!mr.same_region(&MemoryRegion::new(8)));
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let mut pool = pool(3);
        let slots: Vec<_> = (0..3)
            .map(|_| pool.allocate(BufferClass::Bulk).unwrap())
            .collect();
        assert!(pool.allocate(BufferClass::Bulk).is_none());
        assert_eq!(pool.in_use(BufferClass::Bulk), 3);
        assert_eq!(pool.in_use(BufferClass::Command), 0);

        let indices: Vec<_> = slots.iter().map(|s| s.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(slots[2].offset(), 2 * DEFAULT_BULK_SIZE);
    }

    #[test]
    fn test_free_makes_lowest_slot_available() {
        let mut pool = pool(3);
        let a = pool.allocate(BufferClass::Command).unwrap();
        let b = pool.allocate(BufferClass::Command).unwrap();
        let _c = pool.allocate(BufferClass::Command).unwrap();
        pool.free(b);
        pool.free(a);

        let next = pool.allocate(BufferClass::Command).unwrap();
        assert_eq!(next.index(), 0);
        assert_eq!(next.len(), COMMAND_SLOT_SIZE);
    }

    #[test]
    fn test_slots_share_class_key() {
        let mut pool = pool(2);
        let a = pool.allocate(BufferClass::Bulk).unwrap();
        let b = pool.allocate(BufferClass::Bulk).unwrap();
        let c = pool.allocate(BufferClass::Command).unwrap();
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(pool.key(BufferClass::Bulk), a.key());
    }

    #[test]
    fn test_read_write_bounds() {
        let mut pool = pool(2);
        let slot = pool.allocate(BufferClass::Command).unwrap();
        pool.write(&slot, b"hello").unwrap();
        assert_eq!(pool.read(&slot, 5).unwrap(), b"hello");

        let err = pool.write(&slot, &[0u8; COMMAND_SLOT_SIZE + 1]).unwrap_err();
        assert!(matches!(err, RdmtError::OutOfBounds { .. }));
        assert!(pool.read(&slot, COMMAND_SLOT_SIZE + 1).is_err());
        assert!(pool.local(&slot, COMMAND_SLOT_SIZE + 1).is_err());
    }

    #[test]
    fn test_slots_do_not_overlap() {
        let mut pool = pool(2);
        let a = pool.allocate(BufferClass::Bulk).unwrap();
        let b = pool.allocate(BufferClass::Bulk).unwrap();
        pool.write(&a, &[0xAA; 8]).unwrap();
        pool.write(&b, &[0xBB; 8]).unwrap();
        assert_eq!(pool.read(&a, 8).unwrap(), vec![0xAA; 8]);
    }

    #[test]
    fn test_stats_and_release() {
        let fabric = SimFabric::new();
        let node = Arc::new(fabric.node("pool"));
        let mut pool = BufferPool::new(node, BufferPoolConfig::default()).unwrap();
        let _slot = pool.allocate(BufferClass::Bulk).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.capacity, DEFAULT_CAPACITY);
        assert_eq!(stats.bulk_in_use, 1);
        assert_eq!(stats.command_in_use, 0);

        assert_eq!(fabric.registered_regions(), 2);
        pool.release();
        pool.release();
        assert_eq!(fabric.registered_regions(), 0);
    }

    #[test]
    fn test_registration_failure_rolls_back() {
        let fabric = SimFabric::new();
        let node = Arc::new(fabric.node("pool"));
        fabric.fail_next("register_memory", 1);
        assert!(BufferPool::new(node.clone(), BufferPoolConfig::default()).is_err());
        assert_eq!(fabric.registered_regions(), 0);

        // second registration fails: the first must be rolled back
        let fabric = SimFabric::new();
        let node = Arc::new(fabric.node("pool"));
        fabric.fail_nth("register_memory", 2);
        let err = BufferPool::new(node, BufferPoolConfig::default()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Setup);
        assert_eq!(fabric.registered_regions(), 0);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let node = Arc::new(SimFabric::new().node("pool"));
        let config = BufferPoolConfig {
            capacity: 0,
            ..BufferPoolConfig::default()
        };
        assert!(BufferPool::new(node, config).is_err());
    }

    #[test]
    fn test_region_size_overflow_rejected() {
        let fabric = SimFabric::new();
        let node = Arc::new(fabric.node("pool"));
        let config = BufferPoolConfig {
            capacity: usize::MAX / 2,
            command_size: 1,
            bulk_size: 4,
        };
        let err = BufferPool::new(node, config).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Setup);
        assert!(matches!(err, RdmtError::Setup { stage: "buffer pool", .. }));
        assert_eq!(fabric.registered_regions(), 0);
    }
}
