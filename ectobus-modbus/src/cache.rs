//! Register cache shared between a gateway and its coordinator.
//!
//! Readers always get an immutable [`RegisterCache`] snapshot. The
//! coordinator owns the only [`CacheWriter`] and replaces the snapshot
//! wholesale after every successful poll. The gateway's optimistic bit
//! patches go through the same slot and are sequenced against replacement
//! by a generation counter: a patch applied after a cycle started survives
//! that cycle's replace, so a batch read before a confirmed write can never
//! revert it.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

/// Immutable address → raw value map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RegisterCache {
    values: BTreeMap<u16, u16>,
}

impl RegisterCache {
    /// Build a cache from a contiguous block starting at `start`.
    pub fn from_block(start: u16, values: &[u16]) -> Self {
        let mut cache = Self::default();
        cache.insert_block(start, values);
        cache
    }

    /// Add a contiguous block, overwriting existing entries.
    pub fn insert_block(&mut self, start: u16, values: &[u16]) {
        for (addr, value) in (start..=u16::MAX).zip(values.iter().copied()) {
            self.values.insert(addr, value);
        }
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        self.values.get(&address).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.values.iter().map(|(a, v)| (*a, *v))
    }
}

impl FromIterator<(u16, u16)> for RegisterCache {
    fn from_iter<I: IntoIterator<Item = (u16, u16)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Patch {
    generation: u64,
    address: u16,
    value: u16,
}

#[derive(Debug, Default)]
struct CacheSlot {
    current: Arc<RegisterCache>,
    generation: u64,
    patches: Vec<Patch>,
}

type SharedSlot = Arc<RwLock<CacheSlot>>;

fn read(slot: &SharedSlot) -> RwLockReadGuard<'_, CacheSlot> {
    slot.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(slot: &SharedSlot) -> RwLockWriteGuard<'_, CacheSlot> {
    slot.write().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the cache generation at the start of a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTicket(u64);

/// Sole owner of cache replacement. Held by the polling coordinator.
#[derive(Debug)]
pub struct CacheWriter {
    slot: SharedSlot,
}

impl CacheWriter {
    /// Record the generation a cycle's read is based on.
    pub fn begin_cycle(&self) -> CycleTicket {
        CycleTicket(read(&self.slot).generation)
    }

    /// Atomically replace the snapshot with `batch`.
    ///
    /// Patches applied after `ticket` was taken are re-applied on top.
    pub fn replace(&mut self, batch: RegisterCache, ticket: CycleTicket) {
        let mut slot = write(&self.slot);
        let mut next = batch;
        for patch in slot.patches.iter().filter(|p| p.generation > ticket.0) {
            next.values.insert(patch.address, patch.value);
        }
        slot.patches.clear();
        slot.generation += 1;
        slot.current = Arc::new(next);
    }

    /// Read-only handle onto the same slot.
    pub fn handle(&self) -> CacheHandle {
        CacheHandle {
            slot: self.slot.clone(),
        }
    }
}

/// Read access to the cache, plus the gateway's patch path.
#[derive(Debug, Clone)]
pub struct CacheHandle {
    slot: SharedSlot,
}

impl CacheHandle {
    /// Current snapshot. Never torn: it is either the previous or the next batch.
    pub fn snapshot(&self) -> Arc<RegisterCache> {
        read(&self.slot).current.clone()
    }

    pub fn get(&self, address: u16) -> Option<u16> {
        read(&self.slot).current.get(address)
    }

    /// Number of mutations (replacements and patches) applied so far.
    pub fn generation(&self) -> u64 {
        read(&self.slot).generation
    }

    /// Optimistically set one register after a confirmed write.
    pub(crate) fn patch(&self, address: u16, value: u16) {
        let mut slot = write(&self.slot);
        slot.generation += 1;
        let generation = slot.generation;

        let mut next = RegisterCache::clone(&slot.current);
        next.values.insert(address, value);
        slot.current = Arc::new(next);
        // Only the newest patch per address can matter to a replace.
        slot.patches.retain(|p| p.address != address);
        slot.patches.push(Patch {
            generation,
            address,
            value,
        });
    }
}

/// Create a writer and a handle over a fresh, empty cache.
pub fn cache_pair() -> (CacheWriter, CacheHandle) {
    let writer = CacheWriter {
        slot: Arc::new(RwLock::new(CacheSlot::default())),
    };
    let handle = writer.handle();
    (writer, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_block() {
        let cache = RegisterCache::from_block(0x0010, &[1, 2, 3]);
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(0x0010), Some(1));
        assert_eq!(cache.get(0x0012), Some(3));
        assert_eq!(cache.get(0x0013), None);
    }

    #[test]
    fn test_block_at_end_of_address_space() {
        let cache = RegisterCache::from_block(0xFFFF, &[7, 8]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(0xFFFF), Some(7));
    }

    #[test]
    fn test_replace_is_wholesale() {
        let (mut writer, handle) = cache_pair();
        assert!(handle.snapshot().is_empty());

        let ticket = writer.begin_cycle();
        writer.replace(RegisterCache::from_block(0x0010, &[1, 2]), ticket);
        assert_eq!(handle.get(0x0011), Some(2));

        let ticket = writer.begin_cycle();
        writer.replace(RegisterCache::from_block(0x0020, &[9]), ticket);
        assert_eq!(handle.get(0x0011), None);
        assert_eq!(handle.get(0x0020), Some(9));
    }

    #[test]
    fn test_old_snapshot_is_unchanged() {
        let (mut writer, handle) = cache_pair();
        writer.replace(RegisterCache::from_block(0x0010, &[1]), writer.begin_cycle());

        let before = handle.snapshot();
        writer.replace(RegisterCache::from_block(0x0010, &[2]), writer.begin_cycle());

        assert_eq!(before.get(0x0010), Some(1));
        assert_eq!(handle.get(0x0010), Some(2));
    }

    #[test]
    fn test_patch_survives_stale_batch() {
        let (mut writer, handle) = cache_pair();
        writer.replace(RegisterCache::from_block(0x0039, &[0]), writer.begin_cycle());

        // Cycle starts, then a write is confirmed before the batch lands.
        let ticket = writer.begin_cycle();
        handle.patch(0x0039, 0b01);
        assert_eq!(handle.get(0x0039), Some(0b01));

        writer.replace(RegisterCache::from_block(0x0038, &[5, 0]), ticket);
        assert_eq!(handle.get(0x0039), Some(0b01));
        assert_eq!(handle.get(0x0038), Some(5));
    }

    #[test]
    fn test_patch_before_cycle_is_superseded() {
        let (mut writer, handle) = cache_pair();
        handle.patch(0x0039, 0b11);

        // This cycle's read happened after the patch, so its value wins.
        let ticket = writer.begin_cycle();
        writer.replace(RegisterCache::from_block(0x0039, &[0b10]), ticket);
        assert_eq!(handle.get(0x0039), Some(0b10));
    }

    #[test]
    fn test_pending_patches_bounded_per_address() {
        let (mut writer, handle) = cache_pair();
        let ticket = writer.begin_cycle();

        for value in 0..100 {
            handle.patch(0x0039, value % 4);
        }
        handle.patch(0x0010, 7);
        assert_eq!(read(&handle.slot).patches.len(), 2);

        writer.replace(RegisterCache::from_block(0x0039, &[0]), ticket);
        assert_eq!(handle.get(0x0039), Some(99 % 4));
        assert_eq!(handle.get(0x0010), Some(7));
        assert!(read(&handle.slot).patches.is_empty());
    }

    #[test]
    fn test_generation_counts_mutations() {
        let (mut writer, handle) = cache_pair();
        assert_eq!(handle.generation(), 0);

        handle.patch(0x0010, 1);
        writer.replace(RegisterCache::default(), writer.begin_cycle());
        assert_eq!(handle.generation(), 2);
    }
}
