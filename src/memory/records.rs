//! Allocation bookkeeping
//!
//! Driver handles are only unique within one client, so every record is
//! keyed by `(client root, handle)`.

use crate::nvos::NvHandle;

use std::collections::HashMap;

/// Client-scoped driver handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub root: NvHandle,
    pub handle: NvHandle,
}

impl ObjectKey {
    pub fn new(root: NvHandle, handle: NvHandle) -> Self {
        Self { root, handle }
    }
}

/// Live allocations and device objects of this process
#[derive(Debug, Default)]
pub struct AllocationTable {
    memory: HashMap<ObjectKey, u64>,
    objects: HashMap<ObjectKey, u32>,
    allocated: u64,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a memory allocation
    ///
    /// Returns the size of a previous record under the same key, which the
    /// caller must credit back: the driver only reuses a handle after it was
    /// freed, so an old record means the free went unobserved.
    pub fn insert_memory(&mut self, key: ObjectKey, size: u64) -> Option<u64> {
        let old = self.memory.insert(key, size);
        if let Some(old) = old {
            self.allocated = self.allocated.saturating_sub(old);
        }
        self.allocated += size;
        old
    }

    /// Drop a memory record, returning its size
    pub fn remove_memory(&mut self, key: ObjectKey) -> Option<u64> {
        let size = self.memory.remove(&key)?;
        self.allocated = self.allocated.saturating_sub(size);
        Some(size)
    }

    /// Associate a device, subdevice or context object with a device id
    pub fn insert_object(&mut self, key: ObjectKey, device_id: u32) {
        self.objects.insert(key, device_id);
    }

    /// Device id an object belongs to, if known
    pub fn device_of(&self, key: ObjectKey) -> Option<u32> {
        self.objects.get(&key).copied()
    }

    /// Forget an object, returning the device id it was attributed to
    pub fn remove_object(&mut self, key: ObjectKey) -> Option<u32> {
        self.objects.remove(&key)
    }

    /// Bytes held by live allocations
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Number of live allocations
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Number of tracked device objects
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove_memory() {
        let mut table = AllocationTable::new();
        assert!(table.insert_memory(ObjectKey::new(1, 10), 100).is_none());
        assert!(table.insert_memory(ObjectKey::new(1, 11), 50).is_none());
        assert_eq!(table.allocated(), 150);

        assert_eq!(table.remove_memory(ObjectKey::new(1, 10)), Some(100));
        assert_eq!(table.remove_memory(ObjectKey::new(1, 10)), None);
        assert_eq!(table.allocated(), 50);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_handles_scoped_by_root() {
        let mut table = AllocationTable::new();
        table.insert_memory(ObjectKey::new(1, 10), 100);
        table.insert_memory(ObjectKey::new(2, 10), 200);
        assert_eq!(table.remove_memory(ObjectKey::new(2, 10)), Some(200));
        assert_eq!(table.allocated(), 100);
    }

    #[test]
    fn test_reinsert_replaces_record() {
        let mut table = AllocationTable::new();
        table.insert_memory(ObjectKey::new(1, 10), 100);
        assert_eq!(table.insert_memory(ObjectKey::new(1, 10), 30), Some(100));
        assert_eq!(table.allocated(), 30);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_object_attribution() {
        let mut table = AllocationTable::new();
        table.insert_object(ObjectKey::new(1, 0x20), 0);
        assert_eq!(table.device_of(ObjectKey::new(1, 0x20)), Some(0));
        assert_eq!(table.device_of(ObjectKey::new(2, 0x20)), None);
        assert_eq!(table.remove_object(ObjectKey::new(1, 0x20)), Some(0));
        assert_eq!(table.object_count(), 0);
    }
}
