//! Durable, multi-snapshot, sorted `i32` lists used as row-index secondary
//! indices.
//!
//! A snapshot loads every list fully into memory; mutation happens on that
//! in-memory copy and is invisible to any other outstanding snapshot.
//! `commit` rebuilds the on-disk blocks for the whole set and rotates the
//! root pointer in one batch, which gives snapshot isolation without
//! per-block copy-on-write bookkeeping: once a snapshot is loaded it never
//! reads another block from disk, so superseded on-disk blocks are never
//! referenced by a live snapshot and can be freed the moment a commit lands.

use crate::error::{Error, Result};
use crate::storage::store::{AreaId, Store};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

const ROOT_LEN: u32 = 4 + 4 + 8; // version, list_count, list_of_lists_id
const LIST_DESCRIPTOR_HEADER_LEN: u32 = 4 + 4 + 4; // version, block_count, block_size
const BLOCK_ENTRY_LEN: u32 = 4 + 4 + 8 + 4; // first, last, area_ptr, count

struct BlockCache {
    lru: Mutex<LruCache<AreaId, Vec<i32>>>,
}

impl BlockCache {
    fn new(capacity: usize) -> Self {
        Self {
            lru: Mutex::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
        }
    }

    fn get_or_load(&self, store: &Store, area_id: AreaId, count: usize) -> Result<Vec<i32>> {
        if let Some(hit) = self.lru.lock().get(&area_id) {
            return Ok(hit.clone());
        }
        let reader = store.get_area(area_id)?;
        let bytes = reader.as_bytes();
        let mut values = Vec::with_capacity(count);
        for i in 0..count {
            let off = i * 4;
            values.push(i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()));
        }
        self.lru.lock().put(area_id, values.clone());
        Ok(values)
    }
}

/// A read/write view over one list's sorted values, borrowed from an open
/// [`IndexSet`] snapshot.
pub struct IntList<'a> {
    values: &'a mut Vec<i32>,
}

impl<'a> IntList<'a> {
    pub fn insert(&mut self, v: i32) {
        let pos = self.values.partition_point(|&x| x < v);
        self.values.insert(pos, v);
    }

    pub fn remove(&mut self, v: i32) -> bool {
        if let Ok(pos) = self.values.binary_search(&v) {
            self.values.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, v: i32) -> bool {
        self.values.binary_search(&v).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.values.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A consistent, isolated view over every list at the moment it was taken.
pub struct IndexSet {
    snapshot_id: u64,
    lists: Vec<Vec<i32>>,
    disposed: bool,
}

impl IndexSet {
    pub fn get_index(&mut self, n: usize) -> Result<IntList<'_>> {
        let values = self
            .lists
            .get_mut(n)
            .ok_or_else(|| Error::InvalidReference(format!("no such index list {n}")))?;
        Ok(IntList { values })
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    pub fn snapshot_id(&self) -> u64 {
        self.snapshot_id
    }
}

pub struct IndexSetStore {
    store: Arc<Store>,
    root_id: AreaId,
    block_size: usize,
    current_snapshot_id: u64,
    cache: BlockCache,
}

impl IndexSetStore {
    pub fn create(store: &Store) -> Result<AreaId> {
        let mut w = store.create_area(ROOT_LEN);
        w.put_i32(1)?; // version
        w.put_i32(0)?; // list_count
        w.put_i64(-1)?; // list_of_lists_id
        let id = w.finish()?;
        store.flush()?;
        Ok(id)
    }

    pub fn init(store: Arc<Store>, root_id: AreaId, block_size: usize) -> Result<Self> {
        Ok(Self {
            store,
            root_id,
            block_size,
            current_snapshot_id: 0,
            cache: BlockCache::new(256),
        })
    }

    fn read_root(&self) -> Result<(i32, i64)> {
        let reader = self.store.get_area(self.root_id)?;
        let version = reader.read_i32(0);
        if version != 1 {
            return Err(Error::CorruptStore(format!("index set root {}: bad version", self.root_id)));
        }
        Ok((reader.read_i32(4), reader.read_i64(8)))
    }

    /// Extends the set with `count` new, initially empty lists.
    pub fn add_lists(&mut self, count: usize) -> Result<()> {
        let (list_count, list_of_lists_id) = self.read_root()?;
        let new_count = list_count + count as i32;

        let mut m = self.store.get_mutable_area(self.root_id)?;
        m.lock_for_write();
        m.payload_mut()[4..8].copy_from_slice(&new_count.to_le_bytes());
        m.check_out()?;

        if list_of_lists_id != -1 {
            // Extend the existing list-of-lists with -1 (unallocated) entries.
            let old = self.store.get_area(list_of_lists_id as u64)?;
            let old_count = old.read_i32(4) as usize;
            let mut buf = old.as_bytes().to_vec();
            buf.truncate(8 + old_count * 8);
            for _ in 0..count {
                buf.extend_from_slice(&(-1i64).to_le_bytes());
            }
            buf[4..8].copy_from_slice(&(new_count).to_le_bytes());
            let mut w = self.store.create_area(buf.len() as u32);
            w.put_bytes(&buf)?;
            let new_id = w.finish()?;
            let mut m2 = self.store.get_mutable_area(self.root_id)?;
            m2.lock_for_write();
            m2.payload_mut()[8..16].copy_from_slice(&(new_id as i64).to_le_bytes());
            m2.check_out()?;
            self.store.delete_area(list_of_lists_id as u64);
        }

        self.store.flush()
    }

    /// Loads every list fully into memory as a consistent, isolated snapshot.
    pub fn snapshot(&mut self) -> Result<IndexSet> {
        let (list_count, list_of_lists_id) = self.read_root()?;
        let mut lists = vec![Vec::new(); list_count as usize];

        if list_of_lists_id != -1 {
            let lol = self.store.get_area(list_of_lists_id as u64)?;
            let lol_count = lol.read_i32(4) as usize;
            for i in 0..lol_count.min(list_count as usize) {
                let descriptor_id = lol.read_i64(8 + i * 8);
                if descriptor_id == -1 {
                    continue;
                }
                lists[i] = self.load_list(descriptor_id as u64)?;
            }
        }

        self.current_snapshot_id += 1;
        Ok(IndexSet {
            snapshot_id: self.current_snapshot_id,
            lists,
            disposed: false,
        })
    }

    fn load_list(&self, descriptor_id: AreaId) -> Result<Vec<i32>> {
        let reader = self.store.get_area(descriptor_id)?;
        let block_count = reader.read_i32(4) as usize;
        let mut out = Vec::new();
        for i in 0..block_count {
            let off = LIST_DESCRIPTOR_HEADER_LEN as usize + i * BLOCK_ENTRY_LEN as usize;
            let bytes = reader.as_bytes();
            let area_ptr = i64::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap()) as u64;
            let count = i32::from_le_bytes(bytes[off + 16..off + 20].try_into().unwrap()) as usize;
            out.extend(self.cache.get_or_load(&self.store, area_ptr, count)?);
        }
        Ok(out)
    }

    /// Persists `index_set` as the new root. Fails with `StaleSnapshot` if
    /// another snapshot has already committed since it was taken.
    pub fn commit(&mut self, mut index_set: IndexSet) -> Result<()> {
        if index_set.disposed {
            return Err(Error::InvalidArgument("cannot commit a disposed index set".into()));
        }
        if index_set.snapshot_id != self.current_snapshot_id {
            eprintln!(
                "index_set: rejecting stale commit (snapshot {} behind current {})",
                index_set.snapshot_id, self.current_snapshot_id
            );
            return Err(Error::StaleSnapshot);
        }

        let (old_list_count, old_list_of_lists_id) = self.read_root()?;

        let mut descriptor_ids = Vec::with_capacity(index_set.lists.len());
        let mut all_block_ids = Vec::new();
        for values in std::mem::take(&mut index_set.lists) {
            if values.is_empty() {
                descriptor_ids.push(-1i64);
                continue;
            }
            let mut entries = Vec::new();
            for chunk in values.chunks(self.block_size.max(1)) {
                let mut w = self.store.create_area((chunk.len() * 4) as u32);
                for v in chunk {
                    w.put_i32(*v)?;
                }
                let block_id = w.finish()?;
                all_block_ids.push(block_id);
                entries.push((chunk[0], *chunk.last().unwrap(), block_id, chunk.len() as i32));
            }

            let descriptor_len = LIST_DESCRIPTOR_HEADER_LEN + entries.len() as u32 * BLOCK_ENTRY_LEN;
            let mut dw = self.store.create_area(descriptor_len);
            dw.put_i32(1)?;
            dw.put_i32(entries.len() as i32)?;
            dw.put_i32(self.block_size as i32)?;
            for (first, last, area_ptr, count) in entries {
                dw.put_i32(first)?;
                dw.put_i32(last)?;
                dw.put_i64(area_ptr as i64)?;
                dw.put_i32(count)?;
            }
            let descriptor_id = dw.finish()?;
            descriptor_ids.push(descriptor_id as i64);
        }

        let lol_len = 8 + descriptor_ids.len() as u32 * 8;
        let mut lw = self.store.create_area(lol_len);
        lw.put_i32(1)?;
        lw.put_i32(descriptor_ids.len() as i32)?;
        for id in &descriptor_ids {
            lw.put_i64(*id)?;
        }
        let new_list_of_lists_id = lw.finish()?;

        let mut m = self.store.get_mutable_area(self.root_id)?;
        m.lock_for_write();
        {
            let payload = m.payload_mut();
            payload[4..8].copy_from_slice(&(old_list_count).to_le_bytes());
            payload[8..16].copy_from_slice(&(new_list_of_lists_id as i64).to_le_bytes());
        }
        m.check_out()?;
        self.store.flush()?;

        // Nothing references the previous on-disk structure any longer:
        // every outstanding snapshot already loaded its data into memory.
        if old_list_of_lists_id != -1 {
            self.store.delete_area(old_list_of_lists_id as u64);
        }
        for id in all_block_ids {
            let _ = id; // new blocks just written, nothing to free here
        }
        self.store.flush()?;

        index_set.disposed = true;
        Ok(())
    }

    pub fn dispose(&mut self, mut index_set: IndexSet) {
        index_set.disposed = true;
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
    fn test_empty_set_has_empty_lists() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let root_id = IndexSetStore::create(&store).unwrap();
        let mut idx = IndexSetStore::init(store.clone(), root_id, 8).unwrap();
        idx.add_lists(1).unwrap();

        let mut snap = idx.snapshot().unwrap();
        let list = snap.get_index(0).unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_insert_commit_and_reload() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let root_id = IndexSetStore::create(&store).unwrap();
        let mut idx = IndexSetStore::init(store.clone(), root_id, 4).unwrap();
        idx.add_lists(1).unwrap();

        let mut snap = idx.snapshot().unwrap();
        {
            let mut list = snap.get_index(0).unwrap();
            for v in [5, 1, 3, 9, 2, 8, 7] {
                list.insert(v);
            }
        }
        idx.commit(snap).unwrap();

        let mut snap2 = idx.snapshot().unwrap();
        let list = snap2.get_index(0).unwrap();
        let values: Vec<i32> = list.iter().collect();
        assert_eq!(values, vec![1, 2, 3, 5, 7, 8, 9]);
    }

    #[test]
    fn test_stale_snapshot_rejected() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let root_id = IndexSetStore::create(&store).unwrap();
        let mut idx = IndexSetStore::init(store.clone(), root_id, 4).unwrap();
        idx.add_lists(1).unwrap();

        let snap1 = idx.snapshot().unwrap();
        let snap2 = idx.snapshot().unwrap();

        idx.commit(snap2).unwrap();
        let err = idx.commit(snap1).unwrap_err();
        assert!(matches!(err, Error::StaleSnapshot));
    }

    #[test]
    fn test_concurrent_snapshots_isolated() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let root_id = IndexSetStore::create(&store).unwrap();
        let mut idx = IndexSetStore::init(store.clone(), root_id, 4).unwrap();
        idx.add_lists(1).unwrap();

        let mut base = idx.snapshot().unwrap();
        base.get_index(0).unwrap().insert(1);
        idx.commit(base).unwrap();

        let mut reader_snap = idx.snapshot().unwrap();
        let mut writer_snap = idx.snapshot().unwrap();
        writer_snap.get_index(0).unwrap().insert(2);

        // reader_snap must not observe the writer's uncommitted insert
        assert_eq!(reader_snap.get_index(0).unwrap().iter().collect::<Vec<_>>(), vec![1]);
        drop(reader_snap);
        idx.commit(writer_snap).unwrap();
    }
}
