//! Block-addressable file abstraction (spec §4.1).
//!
//! Two implementations sit behind [`Device`]: a file-backed device that
//! optionally mmaps its live region, and an in-memory device for
//! `IN_MEMORY` environments. Both speak in absolute byte offsets; callers
//! above this layer translate page numbers to offsets themselves.
//!
//! The mmap path needs a small, contained amount of `unsafe` to hand back
//! `'static` slices into the map — the same trick the teacher's
//! `RawMemory`/`StorageInner` pair uses. The lifetime contract is upheld by
//! construction: a `Device` is only ever dropped after every `Page` holding
//! a mapped buffer has been dropped (the environment owns both and tears
//! down pages before the device).

use std::fs::File;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions, MmapRaw};

use crate::error::{Error, Result};

/// A page-sized (or blob-run-sized) buffer backing a [`crate::page::Page`].
///
/// Mirrors spec §9's redesign note: "manually managed page buffers that may
/// be either an allocation or an mmap slice" becomes an explicit sum type
/// instead of a boolean flag plus a raw pointer.
pub enum PageBuffer {
    /// Heap-owned bytes: read in via `pread`, or the whole of an in-memory device.
    Owned(Box<[u8]>),
    /// A slice directly into a live memory map. Never outlives the map.
    Mapped(&'static mut [u8]),
}

impl PageBuffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            PageBuffer::Owned(b) => b,
            PageBuffer::Mapped(s) => s,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            PageBuffer::Owned(b) => b,
            PageBuffer::Mapped(s) => s,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, PageBuffer::Mapped(_))
    }
}

/// A block-addressable backing store: a file (optionally mmapped) or an
/// in-memory arena. Implementations must tolerate `read`/`alloc_page` being
/// called from different threads (spec §4.1 "Concurrency").
pub trait Device: Send + Sync {
    /// Total size of the backing store, in bytes.
    fn file_size(&self) -> Result<u64>;

    /// Grow the backing store by `len` bytes, returning the start offset of
    /// the new region.
    fn alloc(&mut self, len: u64) -> Result<u64>;

    /// Shrink the backing store to `size` bytes. `size` must not exceed the
    /// current size.
    fn truncate(&mut self, size: u64) -> Result<()>;

    /// Read `len` bytes at `offset` into an owned buffer.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Write `buf` at `offset`.
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Fetch a page-sized region, preferring a zero-copy mmap slice when the
    /// region is mapped and mmap is enabled.
    ///
    /// # Safety
    /// The returned buffer must not outlive `self`.
    unsafe fn read_page(&self, offset: u64, len: usize) -> Result<PageBuffer>;

    /// True if `[offset, offset+size)` is currently backed by a live mmap.
    fn is_mapped(&self, offset: u64, size: usize) -> bool;

    /// Flush all dirty mapped pages (and, for file devices, fsync).
    fn flush(&self) -> Result<()>;

    /// Flush just one page-sized range.
    fn flush_range(&self, offset: u64, size: usize) -> Result<()>;
}

/// File-backed device, with an optional private mapping of the live region.
pub struct FileDevice {
    file: File,
    maps: Vec<MmapRaw>,
    mmap_enabled: bool,
    size: u64,
}

impl FileDevice {
    pub fn create<P: AsRef<Path>>(path: P, mmap_enabled: bool) -> Result<Self> {
        use fs4::fs_std::FileExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::WouldBlock)?;
        let size = file.metadata()?.len();
        let mut dev = Self {
            file,
            maps: Vec::new(),
            mmap_enabled,
            size,
        };
        if mmap_enabled && size > 0 {
            dev.remap_all()?;
        }
        Ok(dev)
    }

    pub fn open<P: AsRef<Path>>(path: P, read_only: bool, mmap_enabled: bool) -> Result<Self> {
        use fs4::fs_std::FileExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        if read_only {
            file.try_lock_shared().map_err(|_| Error::WouldBlock)?;
        } else {
            file.try_lock_exclusive().map_err(|_| Error::WouldBlock)?;
        }
        let size = file.metadata()?.len();
        let mut dev = Self {
            file,
            maps: Vec::new(),
            mmap_enabled,
            size,
        };
        if mmap_enabled && size > 0 {
            dev.remap_all()?;
        }
        Ok(dev)
    }

    fn remap_all(&mut self) -> Result<()> {
        self.maps.clear();
        if self.size == 0 {
            return Ok(());
        }
        let map = MmapOptions::new()
            .len(self.size as usize)
            .map_raw(&self.file)
            .map_err(Error::Io)?;
        self.maps.push(map);
        Ok(())
    }

    /// Borrow a `'static` mutable slice into a live map, matching the
    /// requested range exactly.
    ///
    /// # Safety
    /// See the module-level note on [`PageBuffer::Mapped`] lifetime discipline.
    unsafe fn map_slice(&self, offset: u64, len: usize) -> Option<&'static mut [u8]> {
        let mut start = 0u64;
        for map in &self.maps {
            let end = start + map.len() as u64;
            if offset >= start && offset + len as u64 <= end {
                let rel = (offset - start) as usize;
                let ptr = unsafe { map.as_mut_ptr().add(rel) };
                return Some(unsafe { std::slice::from_raw_parts_mut(ptr, len) });
            }
            start = end;
        }
        None
    }
}

impl Device for FileDevice {
    fn file_size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn alloc(&mut self, len: u64) -> Result<u64> {
        let start = self.size;
        let new_size = start + len;
        self.file.set_len(new_size)?;
        self.size = new_size;
        if self.mmap_enabled {
            // Linux can often grow the map in place; fall back to a full remap.
            #[cfg(target_os = "linux")]
            {
                if let Some(map) = self.maps.last_mut() {
                    if map
                        .remap(
                            new_size as usize,
                            memmap2::RemapOptions::new().may_move(false),
                        )
                        .is_ok()
                    {
                        return Ok(start);
                    }
                }
            }
            self.remap_all()?;
        }
        Ok(start)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        // Windows refuses to shrink a file that still has a live mapping over
        // the truncated region, unlike Linux; drop the maps first there and
        // pay for a full remap afterward instead of the Linux in-place path.
        #[cfg(windows)]
        if self.mmap_enabled {
            self.maps.clear();
        }
        self.file.set_len(size)?;
        self.size = size;
        if self.mmap_enabled {
            self.remap_all()?;
        }
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        use std::io::Read;
        use std::os::unix::fs::FileExt as _;
        let mut buf = vec![0u8; len];
        #[cfg(unix)]
        {
            self.file.read_exact_at(&mut buf, offset)?;
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom};
            let mut f = self.file.try_clone()?;
            f.seek(SeekFrom::Start(offset))?;
            f.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt as _;
            self.file.write_all_at(buf, offset)?;
        }
        #[cfg(not(unix))]
        {
            use std::io::{Seek, SeekFrom, Write};
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(buf)?;
        }
        if self.mmap_enabled && self.is_mapped(offset, buf.len()) {
            // Keep the mapped view coherent for readers that fetch it next.
            if let Some(slice) = unsafe { self.map_slice(offset, buf.len()) } {
                slice.copy_from_slice(buf);
            }
        }
        Ok(())
    }

    unsafe fn read_page(&self, offset: u64, len: usize) -> Result<PageBuffer> {
        if self.mmap_enabled {
            if let Some(slice) = unsafe { self.map_slice(offset, len) } {
                return Ok(PageBuffer::Mapped(slice));
            }
        }
        Ok(PageBuffer::Owned(self.read(offset, len)?.into_boxed_slice()))
    }

    fn is_mapped(&self, offset: u64, size: usize) -> bool {
        if !self.mmap_enabled {
            return false;
        }
        let mut start = 0u64;
        for map in &self.maps {
            let end = start + map.len() as u64;
            if offset >= start && offset + size as u64 <= end {
                return true;
            }
            start = end;
        }
        false
    }

    fn flush(&self) -> Result<()> {
        for map in &self.maps {
            map.flush().map_err(Error::Io)?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn flush_range(&self, offset: u64, size: usize) -> Result<()> {
        let mut start = 0u64;
        for map in &self.maps {
            let end = start + map.len() as u64;
            if offset >= start && offset + size as u64 <= end {
                let rel = (offset - start) as usize;
                map.flush_range(rel, size).map_err(Error::Io)?;
                return Ok(());
            }
            start = end;
        }
        Ok(())
    }
}

/// In-memory device: a growable arena, no backing file, no mapping.
pub struct MemDevice {
    arena: Vec<u8>,
}

impl MemDevice {
    pub fn new(initial: usize) -> Self {
        Self {
            arena: vec![0u8; initial],
        }
    }
}

impl Device for MemDevice {
    fn file_size(&self) -> Result<u64> {
        Ok(self.arena.len() as u64)
    }

    fn alloc(&mut self, len: u64) -> Result<u64> {
        let start = self.arena.len() as u64;
        self.arena.resize(self.arena.len() + len as usize, 0);
        Ok(start)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.arena.truncate(size as usize);
        Ok(())
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = offset as usize;
        self.arena
            .get(start..start + len)
            .map(|s| s.to_vec())
            .ok_or(Error::InvalidParameter("read past end of in-memory arena"))
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let dst = self
            .arena
            .get_mut(start..start + buf.len())
            .ok_or(Error::InvalidParameter("write past end of in-memory arena"))?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    unsafe fn read_page(&self, offset: u64, len: usize) -> Result<PageBuffer> {
        Ok(PageBuffer::Owned(self.read(offset, len)?.into_boxed_slice()))
    }

    fn is_mapped(&self, _offset: u64, _size: usize) -> bool {
        false
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn flush_range(&self, _offset: u64, _size: usize) -> Result<()> {
        Ok(())
    }
}
