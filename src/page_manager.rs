//! Cache + allocator for the fixed-size page pool (spec §4.2).
//!
//! Internal state (cache, freelist, counters) is guarded by a real spinlock
//! (`spin::Mutex`) rather than a blocking mutex, per spec §4.2's explicit
//! "a spinlock protects the internal state"; flush I/O itself runs without
//! holding it, dispatched to an owned worker thread.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Mutex};

use spin::Mutex as Spinlock;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::freelist::Freelist;
use crate::metrics::Metrics;
use crate::page::{Page, PageType, PAGE_HEADER_SIZE};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FetchFlags: u32 {
        /// Don't add the fetched page to the caller's changeset (a read-only fetch).
        const READ_ONLY       = 1 << 0;
        /// Fail instead of reading through to the device on a cache miss.
        const ONLY_FROM_CACHE = 1 << 1;
        /// Treat the fetched page as headerless (a blob continuation page).
        const NO_HEADER       = 1 << 2;
    }
}

/// A handle to a cached page. Cloning is cheap (it's an `Arc`); mutation
/// goes through the inner `Mutex`, which doubles as the page's exclusive-use
/// lock for flush/mutation (see `page.rs`'s module doc).
pub type PageHandle = Arc<Mutex<Page>>;

struct CacheEntry {
    page: PageHandle,
    /// Position in the approximate-LRU queue; bumped to the back on touch.
    generation: u64,
}

struct ManagerState {
    cache: HashMap<u64, CacheEntry>,
    /// Approximate LRU queue of addresses, oldest first. May contain stale
    /// entries for addresses that were touched again since being queued;
    /// `generation` on the cache entry disambiguates.
    lru_queue: VecDeque<u64>,
    freelist: Freelist,
    cache_bytes: usize,
    cache_capacity_bytes: usize,
    page_size: usize,
    last_blob_page_hint: u64,
    state_dirty: bool,
    generation_counter: u64,
}

impl ManagerState {
    fn touch(&mut self, address: u64) {
        self.generation_counter += 1;
        let gen = self.generation_counter;
        if let Some(entry) = self.cache.get_mut(&address) {
            entry.generation = gen;
        }
        self.lru_queue.push_back(address);
    }
}

/// Message sent to the async flush worker thread.
enum FlushMsg {
    Flush(Vec<PageHandle>, Option<mpsc::Sender<()>>),
    Shutdown,
}

pub struct PageManager {
    state: Spinlock<ManagerState>,
    device: Arc<Mutex<Box<dyn Device>>>,
    flush_tx: mpsc::Sender<FlushMsg>,
    flush_worker: Option<std::thread::JoinHandle<()>>,
    crc32_enabled: bool,
    metrics: Arc<Metrics>,
    /// The header page and the page-manager state page are always resident
    /// and are never considered for eviction.
    pinned: [u64; 2],
}

/// Resident chain of page-manager state pages, per spec §4.2 "State
/// persistence": first page carries the last-blob-page hint followed by the
/// freelist stream; any overflow spills into continuation pages.
pub const STATE_PAGE_HINT_SIZE: usize = 8;
/// `body_len(4) + xxh3_64 checksum(8)` trailing the hint and freelist body.
const STATE_PAGE_TRAILER_SIZE: usize = 4 + 8;

impl PageManager {
    pub fn new(
        device: Box<dyn Device>,
        page_size: usize,
        cache_capacity_bytes: usize,
        crc32_enabled: bool,
        header_page: u64,
        state_page: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let device = Arc::new(Mutex::new(device));
        let (flush_tx, flush_rx) = mpsc::channel::<FlushMsg>();
        let worker_device = device.clone();
        let worker_metrics = metrics.clone();
        let flush_worker = std::thread::Builder::new()
            .name("ferrokv-flusher".into())
            .spawn(move || flush_worker_loop(flush_rx, worker_device, worker_metrics))
            .expect("spawning the page flush worker thread");

        Self {
            state: Spinlock::new(ManagerState {
                cache: HashMap::new(),
                lru_queue: VecDeque::new(),
                freelist: Freelist::new(),
                cache_bytes: 0,
                cache_capacity_bytes,
                page_size,
                last_blob_page_hint: 0,
                state_dirty: false,
                generation_counter: 0,
            }),
            device,
            flush_tx,
            flush_worker: Some(flush_worker),
            crc32_enabled,
            metrics,
            pinned: [header_page, state_page],
        }
    }

    pub fn page_size(&self) -> usize {
        self.state.lock().page_size
    }

    /// `fetch(address, flags)` — spec §4.2 "Fetch contract".
    pub fn fetch(&self, address: u64, flags: FetchFlags) -> Result<Option<PageHandle>> {
        self.metrics.page_fetches.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.cache.get(&address) {
                let handle = entry.page.clone();
                state.touch(address);
                self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(handle));
            }
            if flags.contains(FetchFlags::ONLY_FROM_CACHE) {
                return Ok(None);
            }
        }

        let page_size = self.state.lock().page_size;
        let no_header = flags.contains(FetchFlags::NO_HEADER);
        let buffer = {
            let device = self.device.lock().unwrap_or_else(|p| p.into_inner());
            unsafe { device.read_page(address, page_size)? }
        };
        let mut page = Page::new(address, buffer, no_header);
        if self.crc32_enabled && !no_header && page.page_type()?.has_header() {
            page.verify_crc32()?;
        }

        let handle = Arc::new(Mutex::new(page));
        let mut state = self.state.lock();
        state.cache_bytes += page_size;
        state.generation_counter += 1;
        let gen = state.generation_counter;
        state.cache.insert(
            address,
            CacheEntry {
                page: handle.clone(),
                generation: gen,
            },
        );
        state.lru_queue.push_back(address);
        Ok(Some(handle))
    }

    /// `alloc(type, flags)` — spec §4.2 "Alloc contract".
    pub fn alloc(&self, ty: PageType, ignore_freelist: bool) -> Result<PageHandle> {
        let page_size = self.state.lock().page_size;
        let address = {
            let mut state = self.state.lock();
            if !ignore_freelist {
                if let Some(page_no) = state.freelist.alloc(1) {
                    state.state_dirty = true;
                    Some(page_no * page_size as u64)
                } else {
                    None
                }
            } else {
                None
            }
        };

        let address = match address {
            Some(a) => a,
            None => {
                let mut device = self.device.lock().unwrap_or_else(|p| p.into_inner());
                device.alloc(page_size as u64)?
            }
        };

        self.metrics.page_allocs.fetch_add(1, Ordering::Relaxed);
        let buffer = {
            let device = self.device.lock().unwrap_or_else(|p| p.into_inner());
            unsafe { device.read_page(address, page_size)? }
        };
        let mut page = Page::new(address, buffer, false);
        page.raw_mut()[..PAGE_HEADER_SIZE.min(page_size)].fill(0);
        page.set_page_type(ty);
        page.set_lsn(0);
        page.mark_dirty();

        let handle = Arc::new(Mutex::new(page));
        let mut state = self.state.lock();
        state.cache_bytes += page_size;
        state.generation_counter += 1;
        let gen = state.generation_counter;
        state.cache.insert(
            address,
            CacheEntry {
                page: handle.clone(),
                generation: gen,
            },
        );
        state.lru_queue.push_back(address);
        Ok(handle)
    }

    /// `alloc_multiple(count)` — contiguous run for a multi-page blob
    /// (spec §4.2 "Multi-page blob alloc"). Returns the first page's address
    /// and the total page count actually reserved.
    pub fn alloc_multiple(&self, count: u64) -> Result<(u64, u64)> {
        debug_assert!(count >= 1);
        let page_size = self.state.lock().page_size;
        let first_addr = {
            let mut state = self.state.lock();
            if let Some(page_no) = state.freelist.alloc(count) {
                state.state_dirty = true;
                Some(page_no * page_size as u64)
            } else {
                None
            }
        };

        let first_addr = match first_addr {
            Some(a) => a,
            None => {
                let mut device = self.device.lock().unwrap_or_else(|p| p.into_inner());
                device.alloc(page_size as u64 * count)?
            }
        };

        for i in 0..count {
            let address = first_addr + i * page_size as u64;
            let buffer = {
                let device = self.device.lock().unwrap_or_else(|p| p.into_inner());
                unsafe { device.read_page(address, page_size)? }
            };
            // Every page of a blob run carries its own header and CRC32, the
            // continuation pages included (spec §4.4: "multi-page blob
            // continuation pages carry their own CRC").
            let mut page = Page::new(address, buffer, false);
            page.raw_mut()[..PAGE_HEADER_SIZE.min(page_size)].fill(0);
            page.set_page_type(PageType::Blob);
            page.mark_dirty();
            let handle = Arc::new(Mutex::new(page));
            let mut state = self.state.lock();
            state.cache_bytes += page_size;
            state.generation_counter += 1;
            let gen = state.generation_counter;
            state.cache.insert(
                address,
                CacheEntry {
                    page: handle,
                    generation: gen,
                },
            );
            state.lru_queue.push_back(address);
        }

        self.metrics
            .page_allocs
            .fetch_add(count, Ordering::Relaxed);
        Ok((first_addr, count))
    }

    /// Return an address range to the freelist (spec §4.3).
    pub fn free_range(&self, address: u64, count: u64) {
        let mut state = self.state.lock();
        let page_size = state.page_size as u64;
        state.freelist.put(address / page_size, count);
        state.state_dirty = true;
    }

    pub fn set_last_blob_page_hint(&self, address: u64) {
        let mut state = self.state.lock();
        if state.last_blob_page_hint != address {
            state.last_blob_page_hint = address;
            state.state_dirty = true;
        }
    }

    pub fn last_blob_page_hint(&self) -> u64 {
        self.state.lock().last_blob_page_hint
    }

    /// Evict approximately-LRU clean pages until the cache is back under
    /// budget, and asynchronously flush dirty ones first. Pages pinned by a
    /// changeset/cursor (tracked by the caller holding an `Arc` clone and by
    /// `Page::has_coupled_cursors`) are skipped.
    pub fn evict_to_budget(&self) -> Result<()> {
        let mut to_flush = Vec::new();
        let mut to_drop = Vec::new();

        {
            let mut state = self.state.lock();
            while state.cache_bytes > state.cache_capacity_bytes {
                let Some(address) = state.lru_queue.pop_front() else {
                    break;
                };
                if self.pinned.contains(&address) {
                    continue;
                }
                let Some(entry) = state.cache.get(&address) else {
                    continue;
                };
                // Anything else holding a strong reference (a changeset or
                // cursor) keeps the refcount above 1; never evict that.
                if Arc::strong_count(&entry.page) > 1 {
                    continue;
                }
                let page = entry.page.clone();
                let is_dirty = page.lock().unwrap_or_else(|p| p.into_inner()).is_dirty();
                let has_cursors = page
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .has_coupled_cursors();
                if has_cursors {
                    continue;
                }
                state.cache.remove(&address);
                state.cache_bytes = state.cache_bytes.saturating_sub(state.page_size);
                if is_dirty {
                    to_flush.push(page);
                } else {
                    to_drop.push(page);
                }
            }
        }

        if !to_flush.is_empty() {
            let _ = self.flush_tx.send(FlushMsg::Flush(to_flush, None));
        }
        drop(to_drop);
        Ok(())
    }

    /// Hand a changeset's dirty pages to the worker thread for async
    /// writeback (spec §4.7).
    pub fn schedule_flush(&self, pages: Vec<PageHandle>) {
        let _ = self.flush_tx.send(FlushMsg::Flush(pages, None));
    }

    /// Block until all previously scheduled flushes, plus every currently
    /// dirty resident page, have reached the device (spec §4.2
    /// "`flush_all_pages`, `close_database`").
    pub fn flush_all_pages(&self) -> Result<()> {
        let pages: Vec<PageHandle> = {
            let state = self.state.lock();
            state.cache.values().map(|e| e.page.clone()).collect()
        };
        let (done_tx, done_rx) = mpsc::channel();
        let _ = self.flush_tx.send(FlushMsg::Flush(pages, Some(done_tx)));
        let _ = done_rx.recv();
        let device = self.device.lock().unwrap_or_else(|p| p.into_inner());
        device.flush()
    }

    /// Idempotent: only writes the state page chain if the freelist or
    /// last-blob-page hint changed since the last call (spec §4.2
    /// "State persistence"). The hint, a length-prefixed freelist body, and a
    /// trailing xxh3_64 checksum over both are stamped together so a torn or
    /// bit-rotted state page is caught on the next `load_state` rather than
    /// silently decoded as a bogus freelist.
    pub fn store_state(&self, state_page: &PageHandle) -> Result<()> {
        let mut mgr = self.state.lock();
        if !mgr.state_dirty && !mgr.freelist.is_dirty() {
            return Ok(());
        }
        let mut body = Vec::new();
        mgr.freelist.encode_state(&mut body);
        mgr.freelist.clear_dirty();
        mgr.state_dirty = false;
        let hint = mgr.last_blob_page_hint;
        drop(mgr);

        let mut buf = Vec::with_capacity(STATE_PAGE_HINT_SIZE + 4 + body.len());
        buf.extend_from_slice(&hint.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&body);
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf);

        let mut page = state_page.lock().unwrap_or_else(|p| p.into_inner());
        let payload = page.payload_mut();
        let total = buf.len() + 8;
        if total > payload.len() {
            return Err(Error::LimitsReached(
                "freelist state does not fit in the configured page size",
            ));
        }
        payload[..buf.len()].copy_from_slice(&buf);
        payload[buf.len()..total].copy_from_slice(&checksum.to_le_bytes());
        payload[total..].fill(0);
        page.mark_dirty();
        Ok(())
    }

    pub fn load_state(&self, payload: &[u8]) -> Result<()> {
        if payload.len() < STATE_PAGE_HINT_SIZE + STATE_PAGE_TRAILER_SIZE {
            return Err(Error::IntegrityViolated("state page too short"));
        }
        let hint = u64::from_le_bytes(payload[0..8].try_into().unwrap());
        let body_len = u32::from_le_bytes(payload[8..12].try_into().unwrap()) as usize;
        let body_end = 12 + body_len;
        if body_end + 8 > payload.len() {
            return Err(Error::IntegrityViolated("freelist state length out of range"));
        }
        let stored_checksum = u64::from_le_bytes(payload[body_end..body_end + 8].try_into().unwrap());
        if xxhash_rust::xxh3::xxh3_64(&payload[..body_end]) != stored_checksum {
            return Err(Error::IntegrityViolated("page-manager state checksum mismatch"));
        }
        let mut freelist = Freelist::new();
        freelist.decode_state(&payload[12..body_end])?;
        let mut state = self.state.lock();
        state.last_blob_page_hint = hint;
        state.freelist = freelist;
        Ok(())
    }

    /// Overwrite a page's on-disk bytes directly, bypassing the cache, and
    /// drop any cached copy so the next `fetch` reads the fresh image. Used
    /// only during crash recovery, before normal cached access resumes
    /// (spec §4.6 "redo the last changeset").
    pub fn restore_page_image(&self, address: u64, image: &[u8]) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.cache.remove(&address);
        }
        let mut device = self.device.lock().unwrap_or_else(|p| p.into_inner());
        device.write(address, image)
    }

    /// Every currently dirty resident page, in no particular order — used
    /// to assemble a changeset covering a whole batch of committed
    /// transactions right before they're materialized into the tree.
    pub fn dirty_pages(&self) -> Vec<PageHandle> {
        let state = self.state.lock();
        state
            .cache
            .values()
            .filter(|entry| {
                entry
                    .page
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .is_dirty()
            })
            .map(|entry| entry.page.clone())
            .collect()
    }

    pub fn cache_stats(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.cache_bytes, state.cache_capacity_bytes)
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        let _ = self.flush_tx.send(FlushMsg::Shutdown);
        if let Some(handle) = self.flush_worker.take() {
            let _ = handle.join();
        }
    }
}

fn flush_worker_loop(
    rx: mpsc::Receiver<FlushMsg>,
    device: Arc<Mutex<Box<dyn Device>>>,
    metrics: Arc<Metrics>,
) {
    while let Ok(msg) = rx.recv() {
        match msg {
            FlushMsg::Shutdown => break,
            FlushMsg::Flush(pages, done) => {
                for page in pages {
                    // trylock: skip pages that are busy elsewhere, matching
                    // spec §4.2's async flush contract. They stay dirty and
                    // will be retried on the next flush pass.
                    let Ok(mut guard) = page.try_lock() else {
                        continue;
                    };
                    if !guard.is_dirty() {
                        continue;
                    }
                    guard.stamp_crc32();
                    let address = guard.address();
                    let raw = guard.raw().to_vec();
                    let write_result = {
                        let mut dev = device.lock().unwrap_or_else(|p| p.into_inner());
                        dev.write(address, &raw)
                    };
                    match write_result {
                        Ok(()) => {
                            guard.clear_dirty();
                            metrics.flushes.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            log::warn!("page flush failed for {address:#x}: {e}; retaining dirty bit");
                        }
                    }
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
        }
    }
}
