//! Variable-length record storage over the page pool (spec §4.4).
//!
//! A blob occupies a run of pages starting at a header-carrying page
//! (the blob id *is* that page's address) followed by zero or more
//! continuation pages. The first page's payload opens with a small fixed
//! record (`BLOB_HEADER_SIZE` bytes: logical length, stored length, and a
//! compressed flag) before the record bytes begin. Every page of the run,
//! continuation pages included, carries the page manager's ordinary header
//! and CRC32 — there is no separate per-blob checksum layered on top.
//!
//! Small, uncompressed blobs are packed several to a page instead of each
//! claiming a dedicated run (`try_pack`/`PackedPage`); the packed blob id
//! folds a slot number into its low bits so `read`/`free`/etc. can tell a
//! packed reference from a dedicated one without a second lookup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::compression::Compressor;
use crate::error::{Error, Result};
use crate::page::{PageType, PAGE_HEADER_SIZE};
use crate::page_manager::{FetchFlags, PageManager};

/// `real_len(8) + stored_len(8) + flags(1) + reserved(7)`.
const BLOB_HEADER_SIZE: usize = 24;
const FLAG_COMPRESSED: u8 = 1 << 0;

/// Per-entry overhead in a packed page: `present(1) + len(4)`.
const PACKED_ENTRY_OVERHEAD: usize = 5;
/// `entry_count(2)`.
const PACKED_PAGE_HEADER_SIZE: usize = 2;

pub trait BlobManager: Send + Sync {
    /// Store `data`, returning an opaque id to fetch it back by.
    fn store(&self, data: &[u8]) -> Result<u64>;

    fn read(&self, id: u64) -> Result<Vec<u8>>;

    /// Replace the record at `id` with `data`. May return a new id if the
    /// new payload no longer fits the pages originally reserved.
    fn overwrite(&self, id: u64, data: &[u8]) -> Result<u64>;

    /// Patch disjoint byte ranges of an existing record in place without
    /// rewriting the whole thing (spec §4.4 "partial overwrite").
    fn overwrite_regions(&self, id: u64, regions: &[(usize, &[u8])]) -> Result<()>;

    fn blob_size(&self, id: u64) -> Result<u64>;

    fn free(&self, id: u64) -> Result<()>;
}

#[derive(Clone)]
struct PackedEntry {
    present: bool,
    data: Vec<u8>,
}

fn decode_packed(buf: &[u8]) -> Result<Vec<PackedEntry>> {
    if buf.len() < PACKED_PAGE_HEADER_SIZE {
        return Err(Error::IntegrityViolated("packed blob page too small for header"));
    }
    let count = u16::from_le_bytes(buf[0..2].try_into().unwrap()) as usize;
    let mut pos = PACKED_PAGE_HEADER_SIZE;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let present = *buf
            .get(pos)
            .ok_or(Error::IntegrityViolated("packed blob entry truncated"))?
            != 0;
        pos += 1;
        let len = u32::from_le_bytes(
            buf.get(pos..pos + 4)
                .ok_or(Error::IntegrityViolated("packed blob entry truncated"))?
                .try_into()
                .unwrap(),
        ) as usize;
        pos += 4;
        let data = buf
            .get(pos..pos + len)
            .ok_or(Error::IntegrityViolated("packed blob entry truncated"))?
            .to_vec();
        pos += len;
        entries.push(PackedEntry { present, data });
    }
    Ok(entries)
}

fn encode_packed(entries: &[PackedEntry], buf: &mut [u8]) -> Result<()> {
    let mut pos = PACKED_PAGE_HEADER_SIZE;
    for entry in entries {
        pos += PACKED_ENTRY_OVERHEAD + entry.data.len();
    }
    if pos > buf.len() {
        return Err(Error::LimitsReached("packed blob page overflowed its capacity"));
    }
    buf[0..2].copy_from_slice(&(entries.len() as u16).to_le_bytes());
    let mut pos = PACKED_PAGE_HEADER_SIZE;
    for entry in entries {
        buf[pos] = entry.present as u8;
        pos += 1;
        buf[pos..pos + 4].copy_from_slice(&(entry.data.len() as u32).to_le_bytes());
        pos += 4;
        buf[pos..pos + entry.data.len()].copy_from_slice(&entry.data);
        pos += entry.data.len();
    }
    buf[pos..].fill(0);
    Ok(())
}

/// Blob manager backed by the page pool, with an optional compression hook.
pub struct DiskBlobManager {
    pages: Arc<PageManager>,
    compressor: Arc<dyn Compressor>,
}

impl DiskBlobManager {
    pub fn new(pages: Arc<PageManager>, compressor: Arc<dyn Compressor>) -> Self {
        Self { pages, compressor }
    }

    /// Payload capacity of a continuation (or packed) page: the full page,
    /// minus the page-manager header every page now carries.
    fn continuation_capacity(&self) -> usize {
        self.pages.page_size() - PAGE_HEADER_SIZE
    }

    fn pages_needed(&self, stored_len: usize) -> u64 {
        let page_size = self.pages.page_size();
        let first_capacity = page_size.saturating_sub(PAGE_HEADER_SIZE + BLOB_HEADER_SIZE);
        if stored_len <= first_capacity {
            return 1;
        }
        let remaining = stored_len - first_capacity;
        let continuation_capacity = self.continuation_capacity();
        1 + ((remaining + continuation_capacity - 1) / continuation_capacity) as u64
    }

    fn try_compress<'a>(&self, data: &'a [u8], scratch: &'a mut Vec<u8>) -> (bool, &'a [u8]) {
        scratch.resize(data.len(), 0);
        match self.compressor.compress(data, scratch) {
            Ok(n) if n < data.len() => {
                scratch.truncate(n);
                (true, &scratch[..])
            }
            _ => (false, data),
        }
    }

    /// A packed id splits into `(page address, slot + 1)`; slot `0` always
    /// means "this id is itself the address of a dedicated blob's first
    /// page" (every dedicated blob id is page-aligned, so its low bits are
    /// naturally zero).
    fn decode_id(&self, id: u64) -> (u64, u64) {
        let page_size = self.pages.page_size() as u64;
        let slot = id % page_size;
        (id - slot, slot)
    }

    /// Blobs small enough (and plain enough) to be worth packing several to
    /// a page rather than claiming a dedicated run of their own.
    fn is_packable(&self, stored_len: usize, compressed: bool) -> bool {
        if compressed {
            return false;
        }
        let capacity = self.continuation_capacity() - PACKED_PAGE_HEADER_SIZE;
        stored_len + PACKED_ENTRY_OVERHEAD <= capacity / 4
    }

    /// Try to append `stored` onto the page named by the page manager's
    /// last-packed-page hint. Returns `None` if there's no hint yet, the
    /// hint page isn't a packed page, or it has no room left.
    fn try_pack_into_hint(&self, stored: &[u8]) -> Result<Option<u64>> {
        let hint = self.pages.last_blob_page_hint();
        if hint == 0 {
            return Ok(None);
        }
        let Some(handle) = self.pages.fetch(hint, FetchFlags::empty())? else {
            return Ok(None);
        };
        let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
        if guard.page_type()? != PageType::BlobPacked {
            return Ok(None);
        }
        let mut entries = decode_packed(guard.payload())?;
        let slot = entries.len();
        entries.push(PackedEntry {
            present: true,
            data: stored.to_vec(),
        });
        if encode_packed(&entries, guard.payload_mut()).is_err() {
            return Ok(None);
        }
        guard.mark_dirty();
        Ok(Some(hint + slot as u64 + 1))
    }

    /// Allocate a fresh packed page and store `stored` as its first slot.
    fn pack_into_new_page(&self, stored: &[u8]) -> Result<u64> {
        let handle = self.pages.alloc(PageType::BlobPacked, false)?;
        let addr = handle.lock().unwrap_or_else(|p| p.into_inner()).address();
        let entries = vec![PackedEntry {
            present: true,
            data: stored.to_vec(),
        }];
        {
            let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            encode_packed(&entries, guard.payload_mut())?;
            guard.mark_dirty();
        }
        self.pages.set_last_blob_page_hint(addr);
        Ok(addr + 1)
    }

    fn read_packed_slot(&self, addr: u64, slot: u64) -> Result<Vec<u8>> {
        let handle = self
            .pages
            .fetch(addr, FetchFlags::empty())?
            .ok_or(Error::BlobNotFound(addr))?;
        let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
        let entries = decode_packed(guard.payload())?;
        let entry = entries
            .get((slot - 1) as usize)
            .filter(|e| e.present)
            .ok_or(Error::BlobNotFound(addr + slot))?;
        Ok(entry.data.clone())
    }

    fn write_run(&self, first_addr: u64, page_count: u64, real_len: u64, compressed: bool, payload: &[u8]) -> Result<()> {
        let page_size = self.pages.page_size();
        let first_capacity = page_size - PAGE_HEADER_SIZE - BLOB_HEADER_SIZE;

        let first = self
            .pages
            .fetch(first_addr, FetchFlags::empty())?
            .ok_or(Error::BlobNotFound(first_addr))?;
        {
            let mut guard = first.lock().unwrap_or_else(|p| p.into_inner());
            guard.set_page_type(PageType::Blob);
            let mut header = [0u8; BLOB_HEADER_SIZE];
            header[0..8].copy_from_slice(&real_len.to_le_bytes());
            header[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
            header[16] = if compressed { FLAG_COMPRESSED } else { 0 };
            let body = guard.payload_mut();
            body[..BLOB_HEADER_SIZE].copy_from_slice(&header);
            let n = payload.len().min(first_capacity);
            body[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + n].copy_from_slice(&payload[..n]);
            guard.mark_dirty();
        }

        let mut written = payload.len().min(first_capacity);
        for i in 1..page_count {
            let addr = first_addr + i * page_size as u64;
            let handle = self
                .pages
                .fetch(addr, FetchFlags::empty())?
                .ok_or(Error::BlobNotFound(addr))?;
            let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            let body = guard.payload_mut();
            let remaining = payload.len() - written;
            let n = remaining.min(body.len());
            body[..n].copy_from_slice(&payload[written..written + n]);
            if n < body.len() {
                body[n..].fill(0);
            }
            guard.mark_dirty();
            written += n;
        }

        self.pages.set_last_blob_page_hint(first_addr);
        Ok(())
    }

    fn read_header(&self, id: u64) -> Result<(u64, u64, bool)> {
        let first = self
            .pages
            .fetch(id, FetchFlags::empty())?
            .ok_or(Error::BlobNotFound(id))?;
        let guard = first.lock().unwrap_or_else(|p| p.into_inner());
        let body = guard.payload();
        if body.len() < BLOB_HEADER_SIZE {
            return Err(Error::IntegrityViolated("blob header truncated"));
        }
        let real_len = u64::from_le_bytes(body[0..8].try_into().unwrap());
        let stored_len = u64::from_le_bytes(body[8..16].try_into().unwrap());
        let compressed = body[16] & FLAG_COMPRESSED != 0;
        Ok((real_len, stored_len, compressed))
    }

    /// Tombstone a packed slot, freeing the whole page once every slot in
    /// it has been tombstoned.
    fn free_packed_slot(&self, addr: u64, slot: u64) -> Result<()> {
        let handle = self
            .pages
            .fetch(addr, FetchFlags::empty())?
            .ok_or(Error::BlobNotFound(addr))?;
        let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
        let mut entries = decode_packed(guard.payload())?;
        let entry = entries
            .get_mut((slot - 1) as usize)
            .filter(|e| e.present)
            .ok_or(Error::BlobNotFound(addr + slot))?;
        entry.present = false;
        entry.data.clear();
        let all_gone = entries.iter().all(|e| !e.present);
        encode_packed(&entries, guard.payload_mut())?;
        guard.mark_dirty();
        drop(guard);
        if all_gone {
            self.pages.free_range(addr, 1);
            if self.pages.last_blob_page_hint() == addr {
                self.pages.set_last_blob_page_hint(0);
            }
        }
        Ok(())
    }
}

impl BlobManager for DiskBlobManager {
    fn store(&self, data: &[u8]) -> Result<u64> {
        let mut scratch = Vec::new();
        let (compressed, stored) = self.try_compress(data, &mut scratch);

        if self.is_packable(stored.len(), compressed) {
            if let Some(id) = self.try_pack_into_hint(stored)? {
                return Ok(id);
            }
            return self.pack_into_new_page(stored);
        }

        let page_count = self.pages_needed(stored.len());
        let (first_addr, _) = self.pages.alloc_multiple(page_count)?;
        self.write_run(first_addr, page_count, data.len() as u64, compressed, stored)?;
        Ok(first_addr)
    }

    fn read(&self, id: u64) -> Result<Vec<u8>> {
        let (addr, slot) = self.decode_id(id);
        if slot != 0 {
            return self.read_packed_slot(addr, slot);
        }

        let (real_len, stored_len, compressed) = self.read_header(id)?;
        let page_size = self.pages.page_size();
        let first_capacity = page_size - PAGE_HEADER_SIZE - BLOB_HEADER_SIZE;
        let page_count = self.pages_needed(stored_len as usize);

        let mut stored = Vec::with_capacity(stored_len as usize);
        {
            let first = self
                .pages
                .fetch(id, FetchFlags::empty())?
                .ok_or(Error::BlobNotFound(id))?;
            let guard = first.lock().unwrap_or_else(|p| p.into_inner());
            let body = guard.payload();
            let n = (stored_len as usize).min(first_capacity);
            stored.extend_from_slice(&body[BLOB_HEADER_SIZE..BLOB_HEADER_SIZE + n]);
        }
        for i in 1..page_count {
            let addr = id + i * page_size as u64;
            let handle = self
                .pages
                .fetch(addr, FetchFlags::empty())?
                .ok_or(Error::BlobNotFound(addr))?;
            let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            let body = guard.payload();
            let remaining = stored_len as usize - stored.len();
            let n = remaining.min(body.len());
            stored.extend_from_slice(&body[..n]);
        }

        if !compressed {
            return Ok(stored);
        }
        let mut out = vec![0u8; real_len as usize];
        self.compressor.decompress(&stored, &mut out)?;
        Ok(out)
    }

    fn overwrite(&self, id: u64, data: &[u8]) -> Result<u64> {
        let (addr, slot) = self.decode_id(id);
        if slot != 0 {
            self.free_packed_slot(addr, slot)?;
            return self.store(data);
        }

        let (_, old_stored_len, _) = self.read_header(id)?;
        let old_pages = self.pages_needed(old_stored_len as usize);

        let mut scratch = Vec::new();
        let (compressed, stored) = self.try_compress(data, &mut scratch);
        let new_pages = self.pages_needed(stored.len());

        if new_pages <= old_pages {
            self.write_run(id, old_pages, data.len() as u64, compressed, stored)?;
            if new_pages < old_pages {
                let page_size = self.pages.page_size() as u64;
                self.pages
                    .free_range(id + new_pages * page_size, old_pages - new_pages);
            }
            Ok(id)
        } else {
            self.free(id)?;
            self.store(data)
        }
    }

    fn overwrite_regions(&self, id: u64, regions: &[(usize, &[u8])]) -> Result<()> {
        let (addr, slot) = self.decode_id(id);
        if slot != 0 {
            let handle = self
                .pages
                .fetch(addr, FetchFlags::empty())?
                .ok_or(Error::BlobNotFound(addr))?;
            let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            let mut entries = decode_packed(guard.payload())?;
            let entry = entries
                .get_mut((slot - 1) as usize)
                .filter(|e| e.present)
                .ok_or(Error::BlobNotFound(id))?;
            for &(offset, bytes) in regions {
                if offset + bytes.len() > entry.data.len() {
                    return Err(Error::InvalidParameter(
                        "region overwrite extends past the stored blob length",
                    ));
                }
                entry.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            }
            encode_packed(&entries, guard.payload_mut())?;
            guard.mark_dirty();
            return Ok(());
        }

        let (_, stored_len, compressed) = self.read_header(id)?;
        if compressed {
            return Err(Error::InvalidParameter(
                "cannot patch regions of a compressed blob",
            ));
        }
        let page_size = self.pages.page_size();
        let first_capacity = page_size - PAGE_HEADER_SIZE - BLOB_HEADER_SIZE;
        let continuation_capacity = self.continuation_capacity();

        for &(offset, bytes) in regions {
            if offset + bytes.len() > stored_len as usize {
                return Err(Error::InvalidParameter(
                    "region overwrite extends past the stored blob length",
                ));
            }
            let mut remaining_offset = offset;
            let mut remaining_bytes = bytes;
            while !remaining_bytes.is_empty() {
                let (page_index, in_page_offset, capacity) = if remaining_offset < first_capacity {
                    (0u64, BLOB_HEADER_SIZE + remaining_offset, first_capacity - remaining_offset)
                } else {
                    let past = remaining_offset - first_capacity;
                    let idx = 1 + (past / continuation_capacity) as u64;
                    let in_page = past % continuation_capacity;
                    (idx, in_page, continuation_capacity - in_page)
                };
                let n = remaining_bytes.len().min(capacity);
                let addr = id + page_index * page_size as u64;
                let handle = self
                    .pages
                    .fetch(addr, FetchFlags::empty())?
                    .ok_or(Error::BlobNotFound(addr))?;
                let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                let body = guard.payload_mut();
                body[in_page_offset..in_page_offset + n].copy_from_slice(&remaining_bytes[..n]);
                guard.mark_dirty();
                remaining_offset += n;
                remaining_bytes = &remaining_bytes[n..];
            }
        }
        Ok(())
    }

    fn blob_size(&self, id: u64) -> Result<u64> {
        let (addr, slot) = self.decode_id(id);
        if slot != 0 {
            let handle = self
                .pages
                .fetch(addr, FetchFlags::empty())?
                .ok_or(Error::BlobNotFound(addr))?;
            let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            let entries = decode_packed(guard.payload())?;
            let entry = entries
                .get((slot - 1) as usize)
                .filter(|e| e.present)
                .ok_or(Error::BlobNotFound(id))?;
            return Ok(entry.data.len() as u64);
        }
        Ok(self.read_header(id)?.0)
    }

    fn free(&self, id: u64) -> Result<()> {
        let (addr, slot) = self.decode_id(id);
        if slot != 0 {
            return self.free_packed_slot(addr, slot);
        }
        let (_, stored_len, _) = self.read_header(id)?;
        let page_count = self.pages_needed(stored_len as usize);
        self.pages.free_range(id, page_count);
        Ok(())
    }
}

/// In-memory blob manager for `DbFlags::IN_MEMORY` environments; no page
/// pool involvement, no compression (nothing to save by compressing RAM),
/// and no packing (nothing to save by packing RAM either).
pub struct MemBlobManager {
    blobs: Mutex<HashMap<u64, Vec<u8>>>,
    next_id: Mutex<u64>,
}

impl Default for MemBlobManager {
    fn default() -> Self {
        Self {
            blobs: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }
}

impl BlobManager for MemBlobManager {
    fn store(&self, data: &[u8]) -> Result<u64> {
        let mut next_id = self.next_id.lock().unwrap_or_else(|p| p.into_inner());
        let id = *next_id;
        *next_id += 1;
        self.blobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, data.to_vec());
        Ok(id)
    }

    fn read(&self, id: u64) -> Result<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
            .ok_or(Error::BlobNotFound(id))
    }

    fn overwrite(&self, id: u64, data: &[u8]) -> Result<u64> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(slot) = blobs.get_mut(&id) {
            *slot = data.to_vec();
            Ok(id)
        } else {
            Err(Error::BlobNotFound(id))
        }
    }

    fn overwrite_regions(&self, id: u64, regions: &[(usize, &[u8])]) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|p| p.into_inner());
        let slot = blobs.get_mut(&id).ok_or(Error::BlobNotFound(id))?;
        for &(offset, bytes) in regions {
            if offset + bytes.len() > slot.len() {
                return Err(Error::InvalidParameter(
                    "region overwrite extends past the stored blob length",
                ));
            }
            slot[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn blob_size(&self, id: u64) -> Result<u64> {
        self.blobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .map(|b| b.len() as u64)
            .ok_or(Error::BlobNotFound(id))
    }

    fn free(&self, id: u64) -> Result<()> {
        self.blobs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::BlobNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::NoopCompressor;
    use crate::device::MemDevice;
    use crate::page::PageType;

    fn blob_manager(page_size: usize) -> DiskBlobManager {
        let device = Box::new(MemDevice::new(0));
        let pages = Arc::new(PageManager::new(
            device,
            page_size,
            page_size * 64,
            false,
            0,
            page_size as u64,
            Arc::new(crate::metrics::Metrics::default()),
        ));
        // reserve the header/state pages so blob allocs don't collide with them
        let _ = pages.alloc(PageType::Header, true).unwrap();
        let _ = pages.alloc(PageType::PageManagerState, true).unwrap();
        DiskBlobManager::new(pages, Arc::new(NoopCompressor))
    }

    #[test]
    fn store_and_read_small_blob_round_trips() {
        let mgr = blob_manager(4096);
        // large enough to miss the packing threshold, so it gets a dedicated page
        let data = vec![0x11u8; 1024];
        let id = mgr.store(&data).unwrap();
        assert_eq!(mgr.read(id).unwrap(), data);
    }

    #[test]
    fn store_and_read_multi_page_blob() {
        let mgr = blob_manager(128);
        let data = vec![0x42u8; 1000];
        let id = mgr.store(&data).unwrap();
        assert_eq!(mgr.read(id).unwrap(), data);
    }

    #[test]
    fn overwrite_region_patches_in_place() {
        let mgr = blob_manager(128);
        let data = vec![0u8; 300];
        let id = mgr.store(&data).unwrap();
        mgr.overwrite_regions(id, &[(10, &[1, 2, 3])]).unwrap();
        let back = mgr.read(id).unwrap();
        assert_eq!(&back[10..13], &[1, 2, 3]);
    }

    #[test]
    fn overwrite_shrinking_blob_frees_trailing_pages() {
        let mgr = blob_manager(128);
        let big = vec![7u8; 1000];
        let id = mgr.store(&big).unwrap();
        let small = vec![9u8; 10];
        let id2 = mgr.overwrite(id, &small).unwrap();
        assert_eq!(id2, id);
        assert_eq!(mgr.read(id).unwrap(), small);
    }

    #[test]
    fn small_blobs_pack_into_a_shared_page() {
        let mgr = blob_manager(4096);
        let a = mgr.store(b"small blob one").unwrap();
        let b = mgr.store(b"small blob two").unwrap();
        // both ids land on the same packed page, distinguished only by slot
        let (addr_a, slot_a) = mgr.decode_id(a);
        let (addr_b, slot_b) = mgr.decode_id(b);
        assert_eq!(addr_a, addr_b);
        assert_ne!(slot_a, slot_b);
        assert_eq!(mgr.read(a).unwrap(), b"small blob one");
        assert_eq!(mgr.read(b).unwrap(), b"small blob two");
    }

    #[test]
    fn freeing_every_packed_slot_reclaims_the_page() {
        let mgr = blob_manager(4096);
        let a = mgr.store(b"one").unwrap();
        let b = mgr.store(b"two").unwrap();
        mgr.free(a).unwrap();
        assert!(mgr.read(a).is_err());
        assert_eq!(mgr.read(b).unwrap(), b"two");
        mgr.free(b).unwrap();
        assert_eq!(mgr.pages.last_blob_page_hint(), 0);
    }

    #[test]
    fn large_blob_is_not_packed() {
        let mgr = blob_manager(256);
        let data = vec![5u8; 200];
        let id = mgr.store(&data).unwrap();
        let (_, slot) = mgr.decode_id(id);
        assert_eq!(slot, 0);
    }
}
