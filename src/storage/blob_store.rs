//! Write-once, reference-counted large object store with per-page
//! optional zlib compression, built on a [`FixedRecordList`] of slots and
//! the Store's area allocator.

use crate::error::{Error, Result};
use crate::storage::fixed_list::FixedRecordList;
use crate::storage::store::{AreaId, Store};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::Arc;

pub const PAGE_SIZE: u64 = 64 * 1024;

const SLOT_SIZE: u32 = 4 + 4 + 8 + 8; // status, ref_count, size, header_ptr
const STATUS_OPEN: i32 = 0;
const STATUS_COMPLETE: i32 = 1;
const STATUS_DELETED: i32 = 0x0002_0000;

const COMPRESSED_BIT: u8 = 0x10;
const KIND_MASK: u8 = 0x0F;

pub const KIND_BINARY: u8 = 2;
pub const KIND_ASCII: u8 = 3;
pub const KIND_UTF16: u8 = 4;

const BLOB_STORE_HEADER_LEN: u32 = 4 + 8 + 8 + 8; // version, slot_descriptor_id, next_slot_index, free_chain_head

/// Handle returned by `allocate`/`get`: everything needed to read or
/// continue writing a blob, without re-reading its header on every call.
#[derive(Debug, Clone, Copy)]
pub struct BlobRef {
    pub id: u64,
    pub kind: u8,
    pub compressed: bool,
    pub size: u64,
    pub header_area: AreaId,
    pub page_count: u64,
}

pub struct BlobStore {
    store: Arc<Store>,
    header_id: AreaId,
    slots: FixedRecordList,
    next_slot_index: u64,
    free_chain_head: i64,
}

impl BlobStore {
    pub fn create(store: &Store) -> Result<AreaId> {
        let slot_descriptor_id = FixedRecordList::create(store, SLOT_SIZE, 64)?;
        let mut w = store.create_area(BLOB_STORE_HEADER_LEN);
        w.put_i32(1)?; // version
        w.put_i64(slot_descriptor_id as i64)?;
        w.put_i64(0)?; // next_slot_index
        w.put_i64(-1)?; // free_chain_head
        let header_id = w.finish()?;
        store.flush()?;
        Ok(header_id)
    }

    pub fn init(store: Arc<Store>, header_id: AreaId) -> Result<Self> {
        let reader = store.get_area(header_id)?;
        let version = reader.read_i32(0);
        if version != 1 {
            return Err(Error::CorruptStore(format!("blob store {header_id}: unknown version {version}")));
        }
        let slot_descriptor_id = reader.read_i64(4) as u64;
        let next_slot_index = reader.read_i64(12) as u64;
        let free_chain_head = reader.read_i64(20);

        let slots = FixedRecordList::init(store.clone(), slot_descriptor_id, SLOT_SIZE)?;

        Ok(Self {
            store,
            header_id,
            slots,
            next_slot_index,
            free_chain_head,
        })
    }

    fn persist_counters(&self) -> Result<()> {
        let mut m = self.store.get_mutable_area(self.header_id)?;
        m.lock_for_write();
        {
            let payload = m.payload_mut();
            payload[12..20].copy_from_slice(&(self.next_slot_index as i64).to_le_bytes());
            payload[20..28].copy_from_slice(&self.free_chain_head.to_le_bytes());
        }
        m.check_out()?;
        Ok(())
    }

    fn read_slot(&mut self, id: u64) -> Result<(i32, i32, u64, AreaId)> {
        let bytes = self.slots.read_slot(id)?;
        let status = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let ref_count = i32::from_le_bytes(bytes[4..8].try_into().unwrap());
        let size = i64::from_le_bytes(bytes[8..16].try_into().unwrap()) as u64;
        let header_ptr = i64::from_le_bytes(bytes[16..24].try_into().unwrap()) as u64;
        Ok((status, ref_count, size, header_ptr))
    }

    fn write_slot(&mut self, id: u64, status: i32, ref_count: i32, size: u64, header_ptr: i64) -> Result<()> {
        let mut bytes = [0u8; SLOT_SIZE as usize];
        bytes[0..4].copy_from_slice(&status.to_le_bytes());
        bytes[4..8].copy_from_slice(&ref_count.to_le_bytes());
        bytes[8..16].copy_from_slice(&(size as i64).to_le_bytes());
        bytes[16..24].copy_from_slice(&header_ptr.to_le_bytes());
        self.slots.write_slot(id, &bytes)
    }

    /// Reserves a slot and a header area with `ceil(size / 64 KiB)` page
    /// pointers initialized to -1. `kind` is the low-nibble payload kind
    /// (binary/ascii/utf16); `compressed` enables per-page zlib DEFLATE.
    pub fn allocate(&mut self, kind: u8, compressed: bool, size: u64) -> Result<BlobRef> {
        let page_count = if size == 0 { 0 } else { (size + PAGE_SIZE - 1) / PAGE_SIZE };
        let header_len = 4 + 4 + 8 + 8 + 8 * page_count;
        let mut w = self.store.create_area(header_len as u32);
        w.put_i32(0)?; // reserved
        let type_byte = (kind & KIND_MASK) | if compressed { COMPRESSED_BIT } else { 0 };
        w.put_i32(type_byte as i32)?;
        w.put_i64(size as i64)?;
        w.put_i64(page_count as i64)?;
        for _ in 0..page_count {
            w.put_i64(-1)?;
        }
        let header_id = w.finish()?;

        let id = if self.free_chain_head != -1 {
            let slot_id = self.free_chain_head as u64;
            let (_, _, _, next_free) = self.read_slot(slot_id)?;
            self.free_chain_head = next_free as i64;
            slot_id
        } else {
            let id = self.next_slot_index;
            self.next_slot_index += 1;
            id
        };

        self.write_slot(id, STATUS_OPEN, 0, size, header_id as i64)?;
        self.persist_counters()?;

        Ok(BlobRef {
            id,
            kind: kind & KIND_MASK,
            compressed,
            size,
            header_area: header_id,
            page_count,
        })
    }

    /// Writes one page of a write-once blob. `offset` must be page-aligned
    /// and `buf` no larger than `PAGE_SIZE`.
    pub fn write(&mut self, blob_ref: &BlobRef, offset: u64, buf: &[u8]) -> Result<()> {
        if offset % PAGE_SIZE != 0 {
            return Err(Error::InvalidBlobIO(format!("offset {offset} is not page-aligned")));
        }
        if buf.len() as u64 > PAGE_SIZE {
            return Err(Error::InvalidBlobIO(format!("write of {} bytes exceeds page size", buf.len())));
        }
        let page_index = offset / PAGE_SIZE;
        if page_index >= blob_ref.page_count {
            return Err(Error::InvalidReference(format!(
                "page {page_index} out of range for blob {}",
                blob_ref.id
            )));
        }

        let header = self.store.get_area(blob_ref.header_area)?;
        let ptr_offset = (24 + page_index * 8) as usize;
        let existing_ptr = header.read_i64(ptr_offset);
        if existing_ptr != -1 {
            return Err(Error::BlobNotWriteOnce(format!(
                "page {page_index} of blob {} already written",
                blob_ref.id
            )));
        }

        let payload = if blob_ref.compressed {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(buf).map_err(Error::Io)?;
            encoder.finish().map_err(Error::Io)?
        } else {
            buf.to_vec()
        };

        let mut pw = self.store.create_area(4 + 4 + payload.len() as u32);
        pw.put_i32(1)?; // page_type
        pw.put_i32(payload.len() as i32)?;
        pw.put_bytes(&payload)?;
        let page_id = pw.finish()?;

        let mut m = self.store.get_mutable_area(blob_ref.header_area)?;
        m.lock_for_write();
        m.payload_mut()[ptr_offset..ptr_offset + 8].copy_from_slice(&(page_id as i64).to_le_bytes());
        m.check_out()?;

        Ok(())
    }

    /// Transitions the slot OPEN -> COMPLETE, making it read-only.
    pub fn complete(&mut self, blob_ref: &BlobRef) -> Result<()> {
        let (status, ref_count, size, header_ptr) = self.read_slot(blob_ref.id)?;
        if status != STATUS_OPEN {
            return Err(Error::InvalidArgument(format!(
                "blob {} is not OPEN (status={status})",
                blob_ref.id
            )));
        }
        self.write_slot(blob_ref.id, STATUS_COMPLETE, ref_count, size, header_ptr as i64)
    }

    pub fn get(&mut self, id: u64) -> Result<BlobRef> {
        let (status, _ref_count, size, header_ptr) = self.read_slot(id)?;
        if status == STATUS_DELETED {
            return Err(Error::InvalidReference(format!("blob {id} was deleted")));
        }
        let header = self.store.get_area(header_ptr)?;
        let type_byte = header.read_i32(4) as u8;
        let page_count = header.read_i64(16) as u64;
        Ok(BlobRef {
            id,
            kind: type_byte & KIND_MASK,
            compressed: type_byte & COMPRESSED_BIT != 0,
            size,
            header_area: header_ptr,
            page_count,
        })
    }

    /// Reads one page, decompressing it if the blob was allocated with
    /// compression enabled.
    pub fn read(&mut self, blob_ref: &BlobRef, offset: u64) -> Result<Vec<u8>> {
        if offset % PAGE_SIZE != 0 {
            return Err(Error::InvalidBlobIO(format!("offset {offset} is not page-aligned")));
        }
        let page_index = offset / PAGE_SIZE;
        if page_index >= blob_ref.page_count {
            return Ok(Vec::new());
        }

        let header = self.store.get_area(blob_ref.header_area)?;
        let ptr_offset = (24 + page_index * 8) as usize;
        let page_id = header.read_i64(ptr_offset);
        if page_id == -1 {
            return Ok(Vec::new());
        }

        let page = self.store.get_area(page_id as u64)?;
        let bytes = page.as_bytes();
        let page_type = i32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if page_type != 1 {
            return Err(Error::CorruptBlob(format!("bad page type at {page_id}")));
        }
        let len = i32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        let raw = &bytes[8..8 + len];

        if blob_ref.compressed {
            let mut decoder = ZlibDecoder::new(raw);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::CorruptBlob(format!("page {page_index} of blob {}: {e}", blob_ref.id)))?;
            Ok(out)
        } else {
            Ok(raw.to_vec())
        }
    }

    /// Caller must hold the Store write lock (the conglomerate serializes
    /// row mutations through its commit_lock, which covers this).
    pub fn establish_reference(&mut self, id: u64) -> Result<()> {
        let (status, ref_count, size, header_ptr) = self.read_slot(id)?;
        if status == STATUS_DELETED {
            return Err(Error::InvalidReference(format!("blob {id} was deleted")));
        }
        self.write_slot(id, status, ref_count + 1, size, header_ptr as i64)
    }

    /// Decrements the reference count; at zero, frees all page areas, the
    /// header area, and pushes the slot onto the blob free chain.
    pub fn release_reference(&mut self, id: u64) -> Result<()> {
        let (status, ref_count, size, header_ptr) = self.read_slot(id)?;
        if status == STATUS_DELETED {
            return Err(Error::InvalidReference(format!("blob {id} was deleted")));
        }
        let new_count = ref_count - 1;
        if new_count > 0 {
            return self.write_slot(id, status, new_count, size, header_ptr as i64);
        }

        let header = self.store.get_area(header_ptr)?;
        let page_count = header.read_i64(16) as u64;
        for p in 0..page_count {
            let ptr = header.read_i64((24 + p * 8) as usize);
            if ptr != -1 {
                self.store.delete_area(ptr as u64);
            }
        }
        self.store.delete_area(header_ptr);

        let old_head = self.free_chain_head;
        self.write_slot(id, STATUS_DELETED, 0, 0, old_head)?;
        self.free_chain_head = id as i64;
        self.persist_counters()?;
        Ok(())
    }

    /// Deep-copies every live blob from `src` into `self`, `1024` slots at a
    /// time with a Store flush as a checkpoint between batches. The
    /// destination free chain stays at its sentinel until the final batch
    /// commits, so a crash mid-copy never leaves a partially linked chain.
    pub fn copy_from(&mut self, src: &mut BlobStore) -> Result<()> {
        const BATCH: u64 = 1024;
        let total = src.next_slot_index;
        let mut start = 0u64;

        while start < total {
            let end = (start + BATCH).min(total);
            for id in start..end {
                let (status, ref_count, size, _header_ptr) = match src.read_slot(id) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                if status == STATUS_DELETED {
                    continue;
                }

                let src_ref = src.get(id)?;
                let dest_ref = self.allocate(src_ref.kind, src_ref.compressed, size)?;
                for p in 0..src_ref.page_count {
                    let bytes = src.read(&src_ref, p * PAGE_SIZE)?;
                    if !bytes.is_empty() {
                        self.write(&dest_ref, p * PAGE_SIZE, &bytes)?;
                    }
                }
                if status == STATUS_COMPLETE {
                    self.complete(&dest_ref)?;
                }
                if ref_count > 0 {
                    let (s, _, sz, hp) = self.read_slot(dest_ref.id)?;
                    self.write_slot(dest_ref.id, s, ref_count, sz, hp as i64)?;
                }
            }
            self.store.flush()?;
            start = end;
        }

        Ok(())
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
    fn test_allocate_write_complete_read() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let header_id = BlobStore::create(&store).unwrap();
        let mut blobs = BlobStore::init(store.clone(), header_id).unwrap();

        let data = vec![7u8; 100];
        let blob_ref = blobs.allocate(KIND_BINARY, false, data.len() as u64).unwrap();
        blobs.write(&blob_ref, 0, &data).unwrap();
        blobs.complete(&blob_ref).unwrap();
        store.flush().unwrap();

        let got = blobs.get(blob_ref.id).unwrap();
        let read_back = blobs.read(&got, 0).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn test_write_once_rejects_second_write() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let header_id = BlobStore::create(&store).unwrap();
        let mut blobs = BlobStore::init(store.clone(), header_id).unwrap();

        let data = vec![1u8; 10];
        let blob_ref = blobs.allocate(KIND_BINARY, false, data.len() as u64).unwrap();
        blobs.write(&blob_ref, 0, &data).unwrap();
        store.flush().unwrap();

        let err = blobs.write(&blob_ref, 0, &data).unwrap_err();
        assert!(matches!(err, Error::BlobNotWriteOnce(_)));
    }

    #[test]
    fn test_compressed_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let header_id = BlobStore::create(&store).unwrap();
        let mut blobs = BlobStore::init(store.clone(), header_id).unwrap();

        let data: Vec<u8> = (0..2000u32).map(|i| (i % 7) as u8).collect();
        let blob_ref = blobs.allocate(KIND_BINARY, true, data.len() as u64).unwrap();
        blobs.write(&blob_ref, 0, &data).unwrap();
        store.flush().unwrap();

        let read_back = blobs.read(&blob_ref, 0).unwrap();
        assert_eq!(read_back, data);
    }

    #[test]
    fn test_refcount_reclaim_onto_free_chain() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let header_id = BlobStore::create(&store).unwrap();
        let mut blobs = BlobStore::init(store.clone(), header_id).unwrap();

        let data = vec![9u8; 50];
        let blob_ref = blobs.allocate(KIND_BINARY, false, data.len() as u64).unwrap();
        blobs.write(&blob_ref, 0, &data).unwrap();
        blobs.complete(&blob_ref).unwrap();
        blobs.establish_reference(blob_ref.id).unwrap();
        store.flush().unwrap();

        blobs.release_reference(blob_ref.id).unwrap();
        blobs.release_reference(blob_ref.id).unwrap();
        store.flush().unwrap();

        let err = blobs.get(blob_ref.id).unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));

        let next_ref = blobs.allocate(KIND_BINARY, false, 4).unwrap();
        assert_eq!(next_ref.id, blob_ref.id, "freed slot should be reused");
    }

    #[test]
    fn test_multi_page_blob() {
        let dir = tempdir().unwrap();
        let store = open_testing(&dir.path().join("t.store"));
        let header_id = BlobStore::create(&store).unwrap();
        let mut blobs = BlobStore::init(store.clone(), header_id).unwrap();

        let size = PAGE_SIZE + 1;
        let blob_ref = blobs.allocate(KIND_BINARY, false, size).unwrap();
        assert_eq!(blob_ref.page_count, 2);

        let page0 = vec![1u8; PAGE_SIZE as usize];
        let page1 = vec![2u8; 1];
        blobs.write(&blob_ref, 0, &page0).unwrap();
        blobs.write(&blob_ref, PAGE_SIZE, &page1).unwrap();
        store.flush().unwrap();

        assert_eq!(blobs.read(&blob_ref, 0).unwrap(), page0);
        assert_eq!(blobs.read(&blob_ref, PAGE_SIZE).unwrap(), page1);
    }
}
