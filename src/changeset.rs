//! Per-operation dirty page tracking feeding the write-ahead journal (spec §4.6).
//!
//! Every logical mutation (a B+tree insert/erase, a blob overwrite) touches
//! one or more pages. The changeset collects those pages, in first-touched
//! order and deduplicated by address, so the journal can physically log
//! exactly the pages that changed rather than the whole cache.

use std::collections::BTreeMap;

use crate::page_manager::PageHandle;

/// The set of pages dirtied by one logical operation, keyed by address to
/// keep insertion order stable and each page recorded once (spec §4.6
/// "single-page-write atomicity exception": a changeset touching exactly
/// one page never needs the full journal round-trip since the page write
/// itself is atomic at the device level).
#[derive(Default)]
pub struct Changeset {
    pages: BTreeMap<u64, PageHandle>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, address: u64, page: PageHandle) {
        self.pages.entry(address).or_insert(page);
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// True when a changeset is small enough to skip the logical journal
    /// entry and rely on the page write's own atomicity.
    pub fn is_single_page(&self) -> bool {
        self.pages.len() == 1
    }

    pub fn pages(&self) -> impl Iterator<Item = &PageHandle> {
        self.pages.values()
    }

    pub fn addresses(&self) -> impl Iterator<Item = u64> + '_ {
        self.pages.keys().copied()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PageBuffer;
    use crate::page::Page;
    use std::sync::{Arc, Mutex};

    fn handle(addr: u64) -> PageHandle {
        Arc::new(Mutex::new(Page::new(
            addr,
            PageBuffer::Owned(vec![0u8; 64].into_boxed_slice()),
            false,
        )))
    }

    #[test]
    fn recording_same_address_twice_keeps_one_entry() {
        let mut cs = Changeset::new();
        cs.record(100, handle(100));
        cs.record(100, handle(100));
        cs.record(200, handle(200));
        assert_eq!(cs.len(), 2);
        assert!(!cs.is_single_page());
    }

    #[test]
    fn single_page_changeset_is_detected() {
        let mut cs = Changeset::new();
        cs.record(42, handle(42));
        assert!(cs.is_single_page());
    }
}
