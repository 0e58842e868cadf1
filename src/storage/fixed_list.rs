//! Fixed-size addressable slot array, growing in geometric blocks.
//!
//! Block `i` holds `2^i * base_count` slots of `slot_size` bytes each,
//! allocated as one Store area. Once a block is created its slots are
//! addressable forever; the list only grows, never shrinks.

use crate::error::{Error, Result};
use crate::storage::store::{AreaId, Store};
use std::sync::Arc;

const MAX_BLOCKS: usize = 48;
const DESCRIPTOR_HEADER_LEN: u32 = 4 + 4 + 4 + 8; // version + block_count + base_count + reserved
const BLOCK_ENTRY_LEN: u32 = 8 + 8; // area_id + capacity (slots)
const DESCRIPTOR_AREA_LEN: u32 = DESCRIPTOR_HEADER_LEN + MAX_BLOCKS as u32 * BLOCK_ENTRY_LEN;

struct BlockDescriptor {
    area_id: AreaId,
    capacity: u64,
}

pub struct FixedRecordList {
    store: Arc<Store>,
    descriptor_id: AreaId,
    slot_size: u32,
    base_count: u64,
    blocks: Vec<BlockDescriptor>,
    reserved: i64,
}

impl FixedRecordList {
    /// Allocates a fresh descriptor area with zero blocks.
    pub fn create(store: &Store, slot_size: u32, base_count: u64) -> Result<AreaId> {
        let mut w = store.create_area(DESCRIPTOR_AREA_LEN);
        w.put_i32(1)?; // version
        w.put_i32(0)?; // block_count
        w.put_i64(base_count as i64)?;
        w.put_i64(-1)?; // reserved
        let id = w.finish()?;
        store.flush()?;
        let _ = slot_size;
        Ok(id)
    }

    /// Loads an existing descriptor table.
    pub fn init(store: Arc<Store>, descriptor_id: AreaId, slot_size: u32) -> Result<Self> {
        let reader = store.get_area(descriptor_id)?;
        let bytes = reader.as_bytes();
        let version = reader.read_i32(0);
        if version != 1 {
            return Err(Error::CorruptStore(format!(
                "fixed record list descriptor {descriptor_id}: unknown version {version}"
            )));
        }
        let block_count = reader.read_i32(4) as usize;
        let base_count = reader.read_i64(8) as u64;
        let reserved = reader.read_i64(16);

        let mut blocks = Vec::with_capacity(block_count);
        for i in 0..block_count {
            let off = DESCRIPTOR_HEADER_LEN as usize + i * BLOCK_ENTRY_LEN as usize;
            let area_id = i64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()) as u64;
            let capacity = i64::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap()) as u64;
            blocks.push(BlockDescriptor { area_id, capacity });
        }

        Ok(Self {
            store,
            descriptor_id,
            slot_size,
            base_count,
            blocks,
            reserved,
        })
    }

    pub fn addressable_node_count(&self) -> u64 {
        self.blocks.iter().map(|b| b.capacity).sum()
    }

    /// Allocates the next geometric block (double the previous, or
    /// `base_count` for the first) and appends its descriptor entry.
    pub fn increase_size(&mut self) -> Result<()> {
        if self.blocks.len() >= MAX_BLOCKS {
            return Err(Error::InvalidArgument("fixed record list exhausted its block table".into()));
        }

        let capacity = if self.blocks.is_empty() {
            self.base_count
        } else {
            self.blocks.last().unwrap().capacity * 2
        };

        let block_bytes = capacity * self.slot_size as u64;
        let mut w = self.store.create_area(block_bytes as u32);
        w.put_bytes(&vec![0u8; block_bytes as usize])?;
        let area_id = w.finish()?;

        let block_index = self.blocks.len();
        self.blocks.push(BlockDescriptor { area_id, capacity });

        let mut m = self.store.get_mutable_area(self.descriptor_id)?;
        m.lock_for_write();
        {
            let payload = m.payload_mut();
            payload[4..8].copy_from_slice(&(self.blocks.len() as i32).to_le_bytes());
            let off = DESCRIPTOR_HEADER_LEN as usize + block_index * BLOCK_ENTRY_LEN as usize;
            payload[off..off + 8].copy_from_slice(&(area_id as i64).to_le_bytes());
            payload[off + 8..off + 16].copy_from_slice(&(capacity as i64).to_le_bytes());
        }
        m.check_out()?;
        self.store.flush()?;
        Ok(())
    }

    /// Locates the block and in-block byte offset for a slot index, growing
    /// the list if `index` is beyond the current addressable range.
    fn locate(&mut self, index: u64) -> Result<(AreaId, usize)> {
        loop {
            let mut base = 0u64;
            for block in &self.blocks {
                if index < base + block.capacity {
                    let in_block = index - base;
                    return Ok((block.area_id, (in_block * self.slot_size as u64) as usize));
                }
                base += block.capacity;
            }
            self.increase_size()?;
        }
    }

    pub fn read_slot(&mut self, index: u64) -> Result<Vec<u8>> {
        let (area_id, offset) = self.locate(index)?;
        let reader = self.store.get_area(area_id)?;
        let size = self.slot_size as usize;
        Ok(reader.as_bytes()[offset..offset + size].to_vec())
    }

    pub fn write_slot(&mut self, index: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.slot_size as usize {
            return Err(Error::InvalidArgument(format!(
                "slot write size mismatch: expected {}, got {}",
                self.slot_size,
                bytes.len()
            )));
        }
        let (area_id, offset) = self.locate(index)?;
        let mut m = self.store.get_mutable_area(area_id)?;
        m.lock_for_write();
        m.payload_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        m.check_out()?;
        Ok(())
    }

    pub fn reserved_long(&self) -> i64 {
        self.reserved
    }

    pub fn set_reserved_long(&mut self, v: i64) -> Result<()> {
        self.reserved = v;
        let mut m = self.store.get_mutable_area(self.descriptor_id)?;
        m.lock_for_write();
        m.payload_mut()[16..24].copy_from_slice(&v.to_le_bytes());
        m.check_out()?;
        Ok(())
    }

    pub fn descriptor_id(&self) -> AreaId {
        self.descriptor_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_testing(path: &std::path::Path) -> Arc<Store> {
        let store = Store::open(path).unwrap();
        store.set_dont_sync(true);
        Arc::new(store)
    }

    #[test]
    fn test_create_and_grow() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));

        let descriptor_id = FixedRecordList::create(&store, 12, 4).unwrap();
        let mut list = FixedRecordList::init(store, descriptor_id, 12).unwrap();
        assert_eq!(list.addressable_node_count(), 0);

        list.increase_size().unwrap();
        assert_eq!(list.addressable_node_count(), 4);

        list.increase_size().unwrap();
        assert_eq!(list.addressable_node_count(), 12); // 4 + 8
    }

    #[test]
    fn test_write_and_read_slot_grows_on_demand() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));

        let descriptor_id = FixedRecordList::create(&store, 8, 4).unwrap();
        let mut list = FixedRecordList::init(store, descriptor_id, 8).unwrap();

        // Index 5 is beyond the first block (capacity 4); should auto-grow.
        list.write_slot(5, &42i64.to_le_bytes()).unwrap();
        let bytes = list.read_slot(5).unwrap();
        assert_eq!(i64::from_le_bytes(bytes.try_into().unwrap()), 42);
    }

    #[test]
    fn test_reserved_long_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));

        let descriptor_id = FixedRecordList::create(&store, 8, 4).unwrap();
        let mut list = FixedRecordList::init(store.clone(), descriptor_id, 8).unwrap();
        assert_eq!(list.reserved_long(), -1);

        list.set_reserved_long(77).unwrap();
        assert_eq!(list.reserved_long(), 77);

        let reloaded = FixedRecordList::init(store, descriptor_id, 8).unwrap();
        assert_eq!(reloaded.reserved_long(), 77);
    }

    #[test]
    fn test_slots_remain_addressable_after_growth() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));

        let descriptor_id = FixedRecordList::create(&store, 8, 2).unwrap();
        let mut list = FixedRecordList::init(store, descriptor_id, 8).unwrap();

        list.write_slot(0, &1i64.to_le_bytes()).unwrap();
        list.write_slot(1, &2i64.to_le_bytes()).unwrap();
        list.write_slot(2, &3i64.to_le_bytes()).unwrap(); // forces growth into block 1

        assert_eq!(i64::from_le_bytes(list.read_slot(0).unwrap().try_into().unwrap()), 1);
        assert_eq!(i64::from_le_bytes(list.read_slot(1).unwrap().try_into().unwrap()), 2);
        assert_eq!(i64::from_le_bytes(list.read_slot(2).unwrap().try_into().unwrap()), 3);
    }
}
