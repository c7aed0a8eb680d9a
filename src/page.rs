//! Fixed-size page with header, payload, dirty bit, and lock (spec §3, §4.2).
//!
//! The "mutex for exclusive use during flush or mutation" spec §3 describes
//! is not a field on `Page` itself: the page manager's cache stores each
//! page as `Arc<Mutex<Page>>`, and that outer mutex *is* the page lock. This
//! keeps locking uniform with the cache's own bookkeeping instead of
//! layering a second lock inside the struct it protects.

use crate::device::PageBuffer;
use crate::error::{Error, Result};

/// Persistent type tag stamped into a page's header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Unknown = 0,
    Header = 1,
    BtreeRoot = 2,
    BtreeInternal = 3,
    BtreeLeaf = 4,
    PageManagerState = 5,
    Blob = 6,
    /// A page holding several small blobs packed together rather than one
    /// dedicated run (spec §4.4 "pack small blobs into shared blob pages").
    BlobPacked = 7,
}

impl PageType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::Unknown,
            1 => Self::Header,
            2 => Self::BtreeRoot,
            3 => Self::BtreeInternal,
            4 => Self::BtreeLeaf,
            5 => Self::PageManagerState,
            6 => Self::Blob,
            7 => Self::BlobPacked,
            _ => return Err(Error::IntegrityViolated("unrecognized page type tag")),
        })
    }

    /// Whether this page type carries a persistent header (spec §3: "Blob
    /// continuation pages have no header").
    pub fn has_header(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Size of the persistent header stamped at the front of every
/// header-carrying page: `type(1) + reserved(3) + crc32(4) + lsn(8)`.
pub const PAGE_HEADER_SIZE: usize = 16;

/// A fixed-size page, owned by the page manager's cache.
pub struct Page {
    /// File offset; always a multiple of the configured page size.
    address: u64,
    /// True if this page was fetched with `no_header` (a blob continuation page).
    no_header: bool,
    buffer: PageBuffer,
    dirty: bool,
    /// Cursors currently coupled to a slot on this page.
    cursors: Vec<u64>,
}

impl Page {
    /// Wrap a freshly fetched or allocated buffer as a page.
    pub fn new(address: u64, buffer: PageBuffer, no_header: bool) -> Self {
        Self {
            address,
            no_header,
            buffer,
            dirty: false,
            cursors: Vec::new(),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn is_mapped(&self) -> bool {
        self.buffer.is_mapped()
    }

    pub fn payload(&self) -> &[u8] {
        let data = self.buffer.as_slice();
        if self.no_header || !self.has_header_bytes() {
            data
        } else {
            &data[PAGE_HEADER_SIZE..]
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let has_header = !self.no_header && self.has_header_bytes();
        let data = self.buffer.as_mut_slice();
        if has_header {
            &mut data[PAGE_HEADER_SIZE..]
        } else {
            data
        }
    }

    pub fn raw(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn raw_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut_slice()
    }

    fn has_header_bytes(&self) -> bool {
        self.buffer.as_slice().len() >= PAGE_HEADER_SIZE
    }

    pub fn page_type(&self) -> Result<PageType> {
        if self.no_header {
            return Ok(PageType::Unknown);
        }
        PageType::from_u8(self.buffer.as_slice()[0])
    }

    pub fn set_page_type(&mut self, ty: PageType) {
        if !self.no_header {
            self.buffer.as_mut_slice()[0] = ty as u8;
        }
    }

    pub fn lsn(&self) -> u64 {
        if self.no_header || !self.has_header_bytes() {
            return 0;
        }
        let data = self.buffer.as_slice();
        u64::from_le_bytes(data[8..16].try_into().unwrap())
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        if self.no_header {
            return;
        }
        let data = self.buffer.as_mut_slice();
        data[8..16].copy_from_slice(&lsn.to_le_bytes());
    }

    fn stored_crc32(&self) -> u32 {
        let data = self.buffer.as_slice();
        u32::from_le_bytes(data[4..8].try_into().unwrap())
    }

    fn compute_crc32(&self) -> u32 {
        crc32fast::hash(&self.buffer.as_slice()[PAGE_HEADER_SIZE..])
    }

    /// Recompute and stamp the CRC32 over the payload, matching
    /// spec §4.4's "containing page's CRC" policy for single-page blobs.
    pub fn stamp_crc32(&mut self) {
        if self.no_header {
            return;
        }
        let crc = self.compute_crc32();
        self.buffer.as_mut_slice()[4..8].copy_from_slice(&crc.to_le_bytes());
    }

    /// Verify the stored CRC32 against the payload; spec §4.2 "Fetch contract".
    pub fn verify_crc32(&self) -> Result<()> {
        if self.no_header {
            return Ok(());
        }
        if self.stored_crc32() != self.compute_crc32() {
            return Err(Error::IntegrityViolated("page CRC32 mismatch"));
        }
        Ok(())
    }

    /// Attach a cursor to this page's list (spec §3 cursor coupling invariant).
    pub fn attach_cursor(&mut self, cursor_id: u64) {
        if !self.cursors.contains(&cursor_id) {
            self.cursors.push(cursor_id);
        }
    }

    pub fn detach_cursor(&mut self, cursor_id: u64) {
        self.cursors.retain(|&c| c != cursor_id);
    }

    pub fn coupled_cursors(&self) -> &[u64] {
        &self.cursors
    }

    pub fn has_coupled_cursors(&self) -> bool {
        !self.cursors.is_empty()
    }

    /// Drain this page's coupled-cursor list, returning the ids that were
    /// attached. Called whenever a structural mutation (split, merge,
    /// erase) invalidates every cursor currently sitting on the page.
    pub fn take_cursors(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.cursors)
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("address", &self.address)
            .field("dirty", &self.dirty)
            .field("mapped", &self.is_mapped())
            .field("cursors", &self.cursors.len())
            .finish()
    }
}
