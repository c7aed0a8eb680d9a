//! Ordered index over the page pool (spec §4.5).
//!
//! A classic B+tree: all records live in leaves, internal nodes hold only
//! separator keys and child pointers, and leaves are threaded into a doubly
//! linked list for cheap range scans. Splits propagate upward along the
//! descent path; a split at the root grows the tree by one level. Erases
//! that empty a leaf collapse its edge out of the parent, and a parent left
//! with no separators of its own is either folded into the root or repointed
//! from its grandparent, so the tree shrinks back down the same path it grew.

pub mod cursor;
pub mod extended_key;
pub mod node;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::blob_manager::BlobManager;
use crate::btree::extended_key::KeyRef;
use crate::btree::node::{InternalEntry, LeafEntry, Node, NodeLayout, RecordRef, INLINE_VALUE_LIMIT};
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::page::PageType;
use crate::page_manager::{FetchFlags, PageHandle, PageManager};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct InsertFlags: u32 {
        /// Replace the sole existing record for this key instead of erroring.
        const OVERWRITE = 1 << 0;
        /// Keep the existing record(s) and add this as an additional duplicate.
        const DUPLICATE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Approximate-match modes for [`BtreeIndex::find_with_flags`] (spec §4.5
    /// "find(key, flags)... approximate matches").
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FindFlags: u32 {
        /// Largest key strictly less than the probe.
        const LT = 1 << 0;
        /// Smallest key strictly greater than the probe.
        const GT = 1 << 1;
        /// Largest key less than or equal to the probe.
        const LE = 1 << 2;
        /// Smallest key greater than or equal to the probe.
        const GE = 1 << 3;
    }
}

/// Where to splice a new record into an existing duplicate group (spec §4.5
/// "duplicate keys"; `original_source/src/3btree/btree_cursor.h`'s
/// `insert_duplicate` position argument).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicatePosition {
    First,
    Last,
    Before(usize),
    After(usize),
}

/// An index over one key space, backed by a root page address that moves
/// when the tree grows or shrinks by a level.
pub struct BtreeIndex {
    pages: Arc<PageManager>,
    blobs: Arc<dyn BlobManager>,
    comparator: Arc<dyn Comparator>,
    root: Mutex<u64>,
    next_cursor_id: AtomicU64,
    /// Cursor ids decoupled out from under a page that was structurally
    /// mutated; polled and cleared by `Cursor::current()` on next access.
    invalidated_cursors: Mutex<HashSet<u64>>,
    /// Mirrors `DbFlags::DISABLE_RECLAIM_INTERNAL`: when set, an erase that
    /// empties a leaf leaves the empty page in place instead of collapsing
    /// its edge out of the tree.
    disable_reclaim: bool,
    /// Wire layout every page of this tree is encoded and decoded in. Fixed
    /// at creation; never changes for the life of the tree.
    layout: NodeLayout,
}

impl BtreeIndex {
    pub fn create(
        pages: Arc<PageManager>,
        blobs: Arc<dyn BlobManager>,
        comparator: Arc<dyn Comparator>,
        disable_reclaim: bool,
        layout: NodeLayout,
    ) -> Result<Self> {
        let root_handle = pages.alloc(PageType::BtreeLeaf, false)?;
        let root_addr = root_handle.lock().unwrap_or_else(|p| p.into_inner()).address();
        Node::new_leaf().encode(&mut root_handle.lock().unwrap_or_else(|p| p.into_inner()), layout)?;
        Ok(Self {
            pages,
            blobs,
            comparator,
            root: Mutex::new(root_addr),
            next_cursor_id: AtomicU64::new(1),
            invalidated_cursors: Mutex::new(HashSet::new()),
            disable_reclaim,
            layout,
        })
    }

    pub fn open(
        pages: Arc<PageManager>,
        blobs: Arc<dyn BlobManager>,
        comparator: Arc<dyn Comparator>,
        root_addr: u64,
        disable_reclaim: bool,
        layout: NodeLayout,
    ) -> Self {
        Self {
            pages,
            blobs,
            comparator,
            root: Mutex::new(root_addr),
            next_cursor_id: AtomicU64::new(1),
            invalidated_cursors: Mutex::new(HashSet::new()),
            disable_reclaim,
            layout,
        }
    }

    pub fn root_address(&self) -> u64 {
        *self.root.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn fetch(&self, address: u64) -> Result<PageHandle> {
        self.pages
            .fetch(address, FetchFlags::empty())?
            .ok_or(Error::IntegrityViolated("dangling child page address"))
    }

    /// Record a page's coupled cursors as invalidated; called whenever a
    /// structural mutation (insert, erase, split, collapse) changes the
    /// slot layout a coupled cursor was relying on.
    fn invalidate(&self, ids: Vec<u64>) {
        if ids.is_empty() {
            return;
        }
        let mut set = self.invalidated_cursors.lock().unwrap_or_else(|p| p.into_inner());
        set.extend(ids);
    }

    fn invalidate_page_cursors(&self, handle: &PageHandle) {
        let ids = {
            let mut page = handle.lock().unwrap_or_else(|p| p.into_inner());
            page.take_cursors()
        };
        self.invalidate(ids);
    }

    /// Called by `Cursor::current()`; returns `true` (and clears the entry)
    /// if `id` was invalidated since it last checked.
    pub(crate) fn check_and_clear_invalidated(&self, id: u64) -> bool {
        let mut set = self.invalidated_cursors.lock().unwrap_or_else(|p| p.into_inner());
        set.remove(&id)
    }

    /// Walk from the root to the leaf that would hold `key`, returning the
    /// full descent path (root first, leaf last).
    fn descend_path(&self, key: &[u8]) -> Result<Vec<u64>> {
        let mut path = vec![self.root_address()];
        loop {
            let addr = *path.last().unwrap();
            let handle = self.fetch(addr)?;
            let node = {
                let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                Node::decode(&guard)?
            };
            match node {
                Node::Leaf { .. } => return Ok(path),
                Node::Internal {
                    leftmost_child,
                    entries,
                } => {
                    let idx = Node::Internal {
                        leftmost_child,
                        entries: entries.clone(),
                    }
                    .find_position(key, self.comparator.as_ref(), self.blobs.as_ref())?;
                    let child = if idx == 0 {
                        leftmost_child
                    } else {
                        entries[idx - 1].child
                    };
                    path.push(child);
                }
            }
        }
    }

    fn load_entry(&self, entries: &[LeafEntry], idx: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        let entry = &entries[idx];
        let key = entry.key.load_full(self.blobs.as_ref())?;
        let record = entry
            .records
            .first()
            .ok_or(Error::IntegrityViolated("leaf entry with no records"))?;
        let value = record.load_full(self.blobs.as_ref())?;
        Ok((key, value))
    }

    /// Walk the leaf doubly-linked list starting at `leaf_addr`, returning
    /// the first (`forward`) or last (`!forward`) entry of the first
    /// non-empty leaf encountered. Used by `find_with_flags` to cross a leaf
    /// boundary when the approximate match isn't on the descended-to leaf.
    fn scan_from(&self, mut leaf_addr: u64, forward: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            if leaf_addr == 0 {
                return Ok(None);
            }
            let handle = self.fetch(leaf_addr)?;
            let node = {
                let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                Node::decode(&guard)?
            };
            let Node::Leaf {
                entries,
                prev_leaf,
                next_leaf,
            } = node
            else {
                return Err(Error::IntegrityViolated("leaf sibling pointer hit a non-leaf"));
            };
            if !entries.is_empty() {
                let idx = if forward { 0 } else { entries.len() - 1 };
                return Ok(Some(self.load_entry(&entries, idx)?));
            }
            leaf_addr = if forward { next_leaf } else { prev_leaf };
        }
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.find_with_flags(key, FindFlags::empty())?.map(|(_, v)| v))
    }

    /// Exact or approximate-match lookup (spec §4.5). An empty `flags` is an
    /// exact match, equivalent to `find`. `LT`/`GT`/`LE`/`GE` look for the
    /// nearest key on the requested side when `key` itself isn't present
    /// (or, for `LT`/`GT`, even when it is).
    pub fn find_with_flags(&self, key: &[u8], flags: FindFlags) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let leaf_addr = *self.descend_path(key)?.last().unwrap();
        let handle = self.fetch(leaf_addr)?;
        let node = {
            let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Leaf {
            entries,
            prev_leaf,
            next_leaf,
        } = node
        else {
            return Err(Error::IntegrityViolated("expected leaf at bottom of descent"));
        };

        let idx = Node::Leaf {
            entries: entries.clone(),
            prev_leaf,
            next_leaf,
        }
        .find_position(key, self.comparator.as_ref(), self.blobs.as_ref())?;
        let exact = idx < entries.len()
            && entries[idx].key.compare_to(key, self.comparator.as_ref(), self.blobs.as_ref())?
                == std::cmp::Ordering::Equal;

        if flags.is_empty() {
            return if exact { Ok(Some(self.load_entry(&entries, idx)?)) } else { Ok(None) };
        }
        if flags.contains(FindFlags::LE) {
            if exact {
                return Ok(Some(self.load_entry(&entries, idx)?));
            }
            return if idx > 0 {
                Ok(Some(self.load_entry(&entries, idx - 1)?))
            } else {
                self.scan_from(prev_leaf, false)
            };
        }
        if flags.contains(FindFlags::LT) {
            return if idx > 0 {
                Ok(Some(self.load_entry(&entries, idx - 1)?))
            } else {
                self.scan_from(prev_leaf, false)
            };
        }
        if flags.contains(FindFlags::GE) {
            return if idx < entries.len() {
                Ok(Some(self.load_entry(&entries, idx)?))
            } else {
                self.scan_from(next_leaf, true)
            };
        }
        if flags.contains(FindFlags::GT) {
            let start = if exact { idx + 1 } else { idx };
            return if start < entries.len() {
                Ok(Some(self.load_entry(&entries, start)?))
            } else {
                self.scan_from(next_leaf, true)
            };
        }
        Ok(None)
    }

    fn make_record(&self, value: &[u8]) -> Result<RecordRef> {
        match self.layout {
            NodeLayout::FixedKeyRecordId { .. } => Ok(RecordRef::BlobRef(self.blobs.store(value)?)),
            NodeLayout::PaxFixed { record_width, .. } => {
                if value.len() != record_width {
                    return Err(Error::InvalidParameter(
                        "value length does not match this database's fixed record width",
                    ));
                }
                Ok(RecordRef::Inline(value.to_vec()))
            }
            NodeLayout::VariableInlineOrOverflow => {
                if value.len() > INLINE_VALUE_LIMIT {
                    Ok(RecordRef::BlobRef(self.blobs.store(value)?))
                } else {
                    Ok(RecordRef::Inline(value.to_vec()))
                }
            }
        }
    }

    pub fn insert(&self, key: &[u8], value: &[u8], flags: InsertFlags) -> Result<()> {
        let path = self.descend_path(key)?;
        let leaf_addr = *path.last().unwrap();
        let leaf_handle = self.fetch(leaf_addr)?;

        let mut node = {
            let guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Leaf { entries, .. } = &mut node else {
            return Err(Error::IntegrityViolated("expected leaf at bottom of descent"));
        };

        let idx = Node::Leaf {
            entries: entries.clone(),
            prev_leaf: 0,
            next_leaf: 0,
        }
        .find_position(key, self.comparator.as_ref(), self.blobs.as_ref())?;

        let exact = idx < entries.len()
            && entries[idx]
                .key
                .compare_to(key, self.comparator.as_ref(), self.blobs.as_ref())?
                == std::cmp::Ordering::Equal;

        let record = self.make_record(value)?;
        if exact {
            if flags.contains(InsertFlags::DUPLICATE) {
                entries[idx].records.push(record);
            } else if flags.contains(InsertFlags::OVERWRITE) || entries[idx].records.len() <= 1 {
                for old in entries[idx].records.drain(..) {
                    old.free(self.blobs.as_ref())?;
                }
                entries[idx].records.push(record);
            } else {
                return Err(Error::DuplicateKey);
            }
        } else {
            let key_ref = KeyRef::from_full_key(key, self.blobs.as_ref())?;
            entries.insert(
                idx,
                LeafEntry {
                    key: key_ref,
                    records: vec![record],
                },
            );
        }

        self.invalidate_page_cursors(&leaf_handle);

        {
            let mut guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
            if node.encode(&mut guard, self.layout).is_ok() {
                return Ok(());
            }
        }

        // Didn't fit: split the leaf and propagate the new separator upward.
        self.split_and_propagate(path, node, idx)
    }

    /// Insert an additional duplicate for an existing key at a specific
    /// position within its duplicate group (spec §4.5; `original_source`'s
    /// `btree_cursor.h` duplicate-position argument), rather than always
    /// appending to the end the way `insert(.., DUPLICATE)` does.
    pub fn insert_duplicate(&self, key: &[u8], value: &[u8], position: DuplicatePosition) -> Result<()> {
        let path = self.descend_path(key)?;
        let leaf_addr = *path.last().unwrap();
        let leaf_handle = self.fetch(leaf_addr)?;

        let mut node = {
            let guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Leaf { entries, .. } = &mut node else {
            return Err(Error::IntegrityViolated("expected leaf at bottom of descent"));
        };

        let idx = Node::Leaf {
            entries: entries.clone(),
            prev_leaf: 0,
            next_leaf: 0,
        }
        .find_position(key, self.comparator.as_ref(), self.blobs.as_ref())?;
        let exact = idx < entries.len()
            && entries[idx]
                .key
                .compare_to(key, self.comparator.as_ref(), self.blobs.as_ref())?
                == std::cmp::Ordering::Equal;
        if !exact {
            return Err(Error::KeyNotFound);
        }

        let record = self.make_record(value)?;
        let records = &mut entries[idx].records;
        let insert_at = match position {
            DuplicatePosition::First => 0,
            DuplicatePosition::Last => records.len(),
            DuplicatePosition::Before(i) => i.min(records.len()),
            DuplicatePosition::After(i) => (i + 1).min(records.len()),
        };
        records.insert(insert_at, record);

        self.invalidate_page_cursors(&leaf_handle);

        {
            let mut guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
            if node.encode(&mut guard, self.layout).is_ok() {
                return Ok(());
            }
        }

        self.split_and_propagate(path, node, idx)
    }

    /// Pick the split point for a leaf/internal node overflowing at
    /// `mutated_idx`. Sequential append (`mutated_idx` at the tail) and
    /// sequential prepend (`mutated_idx == 0`) bias the split so the
    /// existing page stays nearly full instead of halving every time,
    /// matching the append-heavy access pattern spec §8's bulk-load
    /// scenarios exercise; any other insertion position splits evenly.
    fn choose_split_mid(len: usize, mutated_idx: usize) -> usize {
        if len < 4 {
            return (len / 2).max(1).min(len.saturating_sub(1).max(1));
        }
        if mutated_idx + 1 >= len {
            (len - 1).max(len / 2)
        } else if mutated_idx == 0 {
            1
        } else {
            len / 2
        }
        .clamp(1, len - 1)
    }

    fn split_and_propagate(&self, mut path: Vec<u64>, node: Node, mutated_idx: usize) -> Result<()> {
        let leaf_addr = path.pop().unwrap();
        let Node::Leaf {
            mut entries,
            prev_leaf,
            next_leaf,
        } = node
        else {
            return Err(Error::IntegrityViolated("split_and_propagate on non-leaf"));
        };

        let mid = Self::choose_split_mid(entries.len(), mutated_idx);
        let upper = entries.split_off(mid);
        let separator = upper[0].key.clone();

        let new_handle = self.pages.alloc(PageType::BtreeLeaf, false)?;
        let new_addr = new_handle.lock().unwrap_or_else(|p| p.into_inner()).address();

        let old_next = next_leaf;
        let lower_node = Node::Leaf {
            entries,
            prev_leaf,
            next_leaf: new_addr,
        };
        let upper_node = Node::Leaf {
            entries: upper,
            prev_leaf: leaf_addr,
            next_leaf: old_next,
        };

        {
            let leaf_handle = self.fetch(leaf_addr)?;
            let mut guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
            lower_node.encode(&mut guard, self.layout)?;
        }
        {
            let mut guard = new_handle.lock().unwrap_or_else(|p| p.into_inner());
            upper_node.encode(&mut guard, self.layout)?;
        }
        if old_next != 0 {
            if let Some(next_handle) = self.pages.fetch(old_next, FetchFlags::empty())? {
                let mut guard = next_handle.lock().unwrap_or_else(|p| p.into_inner());
                if let Node::Leaf { entries, next_leaf, .. } = Node::decode(&guard)? {
                    Node::Leaf { entries, prev_leaf: new_addr, next_leaf }.encode(&mut guard, self.layout)?;
                }
            }
        }

        self.propagate_split(path, leaf_addr, new_addr, separator)
    }

    /// Insert a new `(separator, right_child)` pair into the parent named by
    /// the last entry of `path`, splitting it (and recursing upward) as
    /// needed. An empty `path` means `left_addr` was the root: allocate a
    /// new internal root above it.
    fn propagate_split(
        &self,
        mut path: Vec<u64>,
        left_child: u64,
        right_child: u64,
        separator: KeyRef,
    ) -> Result<()> {
        let Some(parent_addr) = path.pop() else {
            let new_root = self.pages.alloc(PageType::BtreeInternal, false)?;
            let new_root_addr = new_root.lock().unwrap_or_else(|p| p.into_inner()).address();
            let node = Node::Internal {
                leftmost_child: left_child,
                entries: vec![InternalEntry {
                    key: separator,
                    child: right_child,
                }],
            };
            {
                let mut guard = new_root.lock().unwrap_or_else(|p| p.into_inner());
                node.encode(&mut guard, self.layout)?;
            }
            *self.root.lock().unwrap_or_else(|p| p.into_inner()) = new_root_addr;
            return Ok(());
        };

        let parent_handle = self.fetch(parent_addr)?;
        let mut node = {
            let guard = parent_handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Internal {
            leftmost_child,
            entries,
        } = &mut node
        else {
            return Err(Error::IntegrityViolated("descent path parent is not internal"));
        };

        // Use the separator's actual bytes (not just its 16-byte sort-key
        // prefix) as the probe: two Extended keys sharing a common prefix
        // would otherwise be misordered by `find_position`.
        let probe = separator.load_full(self.blobs.as_ref())?;
        let idx = Node::Internal {
            leftmost_child: *leftmost_child,
            entries: entries.clone(),
        }
        .find_position(&probe, self.comparator.as_ref(), self.blobs.as_ref())?;
        entries.insert(
            idx,
            InternalEntry {
                key: separator,
                child: right_child,
            },
        );

        {
            let mut guard = parent_handle.lock().unwrap_or_else(|p| p.into_inner());
            if node.encode(&mut guard, self.layout).is_ok() {
                return Ok(());
            }
        }

        // Parent overflowed too: split it and keep propagating.
        let Node::Internal {
            leftmost_child,
            mut entries,
        } = node
        else {
            unreachable!()
        };
        let mid = Self::choose_split_mid(entries.len(), idx);
        let mut upper = entries.split_off(mid);
        let promoted = upper.remove(0);
        let new_right_addr = {
            let handle = self.pages.alloc(PageType::BtreeInternal, false)?;
            let addr = handle.lock().unwrap_or_else(|p| p.into_inner()).address();
            let right_node = Node::Internal {
                leftmost_child: promoted.child,
                entries: upper,
            };
            let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            right_node.encode(&mut guard, self.layout)?;
            addr
        };
        let left_node = Node::Internal {
            leftmost_child,
            entries,
        };
        {
            let mut guard = parent_handle.lock().unwrap_or_else(|p| p.into_inner());
            left_node.encode(&mut guard, self.layout)?;
        }

        self.propagate_split(path, parent_addr, new_right_addr, promoted.key)
    }

    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        let path = self.descend_path(key)?;
        let leaf_addr = *path.last().unwrap();
        let leaf_handle = self.fetch(leaf_addr)?;
        let mut node = {
            let guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Leaf { entries, .. } = &mut node else {
            return Err(Error::IntegrityViolated("expected leaf at bottom of descent"));
        };

        let Some(idx) = entries.iter().position(|e| {
            e.key
                .compare_to(key, self.comparator.as_ref(), self.blobs.as_ref())
                .map(|o| o == std::cmp::Ordering::Equal)
                .unwrap_or(false)
        }) else {
            return Ok(false);
        };

        let removed = entries.remove(idx);
        removed.key.free(self.blobs.as_ref())?;
        for record in &removed.records {
            record.free(self.blobs.as_ref())?;
        }
        let now_empty = entries.is_empty();

        self.invalidate_page_cursors(&leaf_handle);

        if now_empty && !self.disable_reclaim {
            let Node::Leaf { prev_leaf, next_leaf, .. } = node else {
                unreachable!()
            };
            return self.collapse_empty_leaf(path, leaf_addr, prev_leaf, next_leaf);
        }

        let mut guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
        node.encode(&mut guard, self.layout)?;
        Ok(true)
    }

    /// Erase just one duplicate of `key`, leaving the rest of the group in
    /// place (spec §4.5 "`erase(key | cursor, duplicate_index, flags)`").
    /// Removes the whole entry once its last duplicate is gone.
    pub fn erase_duplicate(&self, key: &[u8], dup_index: usize) -> Result<bool> {
        let path = self.descend_path(key)?;
        let leaf_addr = *path.last().unwrap();
        let leaf_handle = self.fetch(leaf_addr)?;
        let mut node = {
            let guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Leaf { entries, .. } = &mut node else {
            return Err(Error::IntegrityViolated("expected leaf at bottom of descent"));
        };

        let Some(idx) = entries.iter().position(|e| {
            e.key
                .compare_to(key, self.comparator.as_ref(), self.blobs.as_ref())
                .map(|o| o == std::cmp::Ordering::Equal)
                .unwrap_or(false)
        }) else {
            return Ok(false);
        };
        if dup_index >= entries[idx].records.len() {
            return Ok(false);
        }

        let record = entries[idx].records.remove(dup_index);
        record.free(self.blobs.as_ref())?;
        if entries[idx].records.is_empty() {
            let removed = entries.remove(idx);
            removed.key.free(self.blobs.as_ref())?;
        }
        let now_empty = entries.is_empty();

        self.invalidate_page_cursors(&leaf_handle);

        if now_empty && !self.disable_reclaim {
            let Node::Leaf { prev_leaf, next_leaf, .. } = node else {
                unreachable!()
            };
            return self.collapse_empty_leaf(path, leaf_addr, prev_leaf, next_leaf);
        }

        let mut guard = leaf_handle.lock().unwrap_or_else(|p| p.into_inner());
        node.encode(&mut guard, self.layout)?;
        Ok(true)
    }

    /// An erase left `leaf_addr` with zero entries: unlink it from the leaf
    /// list, free its page, and remove its edge from the tree above it. A
    /// parent left with no separators (routing only through
    /// `leftmost_child`) is folded into the root if it was the root, or
    /// repointed from its own parent otherwise — a repoint changes no entry
    /// count, so this never needs to cascade past the grandparent.
    fn collapse_empty_leaf(
        &self,
        mut path: Vec<u64>,
        leaf_addr: u64,
        prev_leaf: u64,
        next_leaf: u64,
    ) -> Result<()> {
        debug_assert_eq!(path.last().copied(), Some(leaf_addr));
        path.pop();

        if prev_leaf != 0 {
            if let Some(handle) = self.pages.fetch(prev_leaf, FetchFlags::empty())? {
                let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                if let Node::Leaf { entries, prev_leaf: pp, .. } = Node::decode(&guard)? {
                    Node::Leaf { entries, prev_leaf: pp, next_leaf }.encode(&mut guard, self.layout)?;
                }
            }
        }
        if next_leaf != 0 {
            if let Some(handle) = self.pages.fetch(next_leaf, FetchFlags::empty())? {
                let mut guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                if let Node::Leaf { entries, next_leaf: nn, .. } = Node::decode(&guard)? {
                    Node::Leaf { entries, prev_leaf, next_leaf: nn }.encode(&mut guard, self.layout)?;
                }
            }
        }

        self.pages.free_range(leaf_addr, 1);

        let Some(parent_addr) = path.pop() else {
            // the emptied leaf was the root; an empty root leaf is valid.
            return Ok(());
        };

        let parent_handle = self.fetch(parent_addr)?;
        let mut node = {
            let guard = parent_handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Internal {
            leftmost_child,
            entries,
        } = &mut node
        else {
            return Err(Error::IntegrityViolated("collapse parent is not internal"));
        };

        if *leftmost_child == leaf_addr {
            let promoted = entries
                .first()
                .cloned()
                .ok_or(Error::IntegrityViolated("internal node left with no children"))?;
            entries.remove(0);
            *leftmost_child = promoted.child;
            promoted.key.free(self.blobs.as_ref())?;
        } else {
            let idx = entries
                .iter()
                .position(|e| e.child == leaf_addr)
                .ok_or(Error::IntegrityViolated("parent has no edge to erased leaf"))?;
            let removed = entries.remove(idx);
            removed.key.free(self.blobs.as_ref())?;
        }

        if !entries.is_empty() {
            let mut guard = parent_handle.lock().unwrap_or_else(|p| p.into_inner());
            node.encode(&mut guard, self.layout)?;
            return Ok(());
        }

        // Parent is now a pure pass-through (only `leftmost_child` routes
        // anywhere): fold it away.
        let Node::Internal { leftmost_child, .. } = node else {
            unreachable!()
        };

        let Some(grandparent_addr) = path.pop() else {
            // parent was the root: the tree shrinks by one level.
            *self.root.lock().unwrap_or_else(|p| p.into_inner()) = leftmost_child;
            self.pages.free_range(parent_addr, 1);
            return Ok(());
        };

        let grandparent_handle = self.fetch(grandparent_addr)?;
        let mut gp_node = {
            let guard = grandparent_handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Internal {
            leftmost_child: gp_left,
            entries: gp_entries,
        } = &mut gp_node
        else {
            return Err(Error::IntegrityViolated("grandparent is not internal"));
        };
        if *gp_left == parent_addr {
            *gp_left = leftmost_child;
        } else if let Some(entry) = gp_entries.iter_mut().find(|e| e.child == parent_addr) {
            entry.child = leftmost_child;
        } else {
            return Err(Error::IntegrityViolated("grandparent has no edge to collapsed parent"));
        }
        {
            let mut guard = grandparent_handle.lock().unwrap_or_else(|p| p.into_inner());
            gp_node.encode(&mut guard, self.layout)?;
        }
        self.pages.free_range(parent_addr, 1);
        Ok(())
    }

    pub fn cursor(self: &Arc<Self>) -> cursor::Cursor {
        let id = self.next_cursor_id.fetch_add(1, Ordering::Relaxed);
        cursor::Cursor::new(id, self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_manager::DiskBlobManager;
    use crate::comparator::LexicographicComparator;
    use crate::compression::NoopCompressor;
    use crate::device::MemDevice;
    use crate::metrics::Metrics;
    use crate::page::PageType as PT;

    fn new_index(page_size: usize) -> Arc<BtreeIndex> {
        let device = Box::new(MemDevice::new(0));
        let pages = Arc::new(PageManager::new(
            device,
            page_size,
            page_size * 1024,
            false,
            0,
            page_size as u64,
            Arc::new(Metrics::default()),
        ));
        let _ = pages.alloc(PT::Header, true).unwrap();
        let _ = pages.alloc(PT::PageManagerState, true).unwrap();
        let blobs: Arc<dyn BlobManager> =
            Arc::new(DiskBlobManager::new(pages.clone(), Arc::new(NoopCompressor)));
        let comparator: Arc<dyn Comparator> = Arc::new(LexicographicComparator);
        Arc::new(BtreeIndex::create(pages, blobs, comparator, false, NodeLayout::VariableInlineOrOverflow).unwrap())
    }

    #[test]
    fn insert_and_find_round_trips() {
        let index = new_index(512);
        index.insert(b"k1", b"v1", InsertFlags::empty()).unwrap();
        index.insert(b"k2", b"v2", InsertFlags::empty()).unwrap();
        assert_eq!(index.find(b"k1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(index.find(b"k2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(index.find(b"missing").unwrap(), None);
    }

    #[test]
    fn insert_duplicate_without_flags_errors() {
        let index = new_index(512);
        index.insert(b"k1", b"v1", InsertFlags::empty()).unwrap();
        let err = index.insert(b"k1", b"v2", InsertFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::DuplicateKey));
    }

    #[test]
    fn overwrite_replaces_value() {
        let index = new_index(512);
        index.insert(b"k1", b"v1", InsertFlags::empty()).unwrap();
        index
            .insert(b"k1", b"v2", InsertFlags::OVERWRITE)
            .unwrap();
        assert_eq!(index.find(b"k1").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn erase_removes_key() {
        let index = new_index(512);
        index.insert(b"k1", b"v1", InsertFlags::empty()).unwrap();
        assert!(index.erase(b"k1").unwrap());
        assert_eq!(index.find(b"k1").unwrap(), None);
        assert!(!index.erase(b"k1").unwrap());
    }

    #[test]
    fn many_inserts_force_leaf_and_root_splits() {
        let index = new_index(256);
        for i in 0..500u32 {
            let key = i.to_be_bytes();
            let value = format!("value-{i}");
            index
                .insert(&key, value.as_bytes(), InsertFlags::empty())
                .unwrap();
        }
        for i in 0..500u32 {
            let key = i.to_be_bytes();
            let expect = format!("value-{i}");
            assert_eq!(index.find(&key).unwrap(), Some(expect.into_bytes()));
        }
        // the tree grew past a single leaf, so the root must now be internal
        let root_handle = index.pages.fetch(index.root_address(), FetchFlags::empty()).unwrap().unwrap();
        let guard = root_handle.lock().unwrap();
        assert!(!Node::decode(&guard).unwrap().is_leaf());
    }

    #[test]
    fn cursor_walks_in_order() {
        let index = new_index(256);
        for key in ["c", "a", "b"] {
            index
                .insert(key.as_bytes(), b"x", InsertFlags::empty())
                .unwrap();
        }
        let mut cursor = index.cursor();
        let mut seen = Vec::new();
        let mut item = cursor.mv(cursor::CursorMove::First).unwrap();
        while let Some((key, _)) = item {
            seen.push(key);
            item = cursor.mv(cursor::CursorMove::Next).unwrap();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn duplicate_records_navigate_with_next_duplicate() {
        let index = new_index(256);
        index
            .insert(b"k", b"v1", InsertFlags::empty())
            .unwrap();
        index
            .insert(b"k", b"v2", InsertFlags::DUPLICATE)
            .unwrap();
        let mut cursor = index.cursor();
        assert!(cursor.find(b"k").unwrap());
        let (_, first) = cursor.current().unwrap().unwrap();
        assert_eq!(first, b"v1");
        let (_, second) = cursor.mv(cursor::CursorMove::NextDuplicate).unwrap().unwrap();
        assert_eq!(second, b"v2");
    }

    #[test]
    fn duplicate_insert_can_be_positioned_first() {
        let index = new_index(256);
        index.insert(b"k", b"v1", InsertFlags::empty()).unwrap();
        index
            .insert_duplicate(b"k", b"v0", DuplicatePosition::First)
            .unwrap();
        let mut cursor = index.cursor();
        assert!(cursor.find(b"k").unwrap());
        let (_, first) = cursor.current().unwrap().unwrap();
        assert_eq!(first, b"v0");
        let (_, second) = cursor.mv(cursor::CursorMove::NextDuplicate).unwrap().unwrap();
        assert_eq!(second, b"v1");
    }

    #[test]
    fn find_with_flags_locates_nearest_match() {
        let index = new_index(256);
        for key in ["b", "d", "f"] {
            index.insert(key.as_bytes(), b"x", InsertFlags::empty()).unwrap();
        }
        assert_eq!(
            index.find_with_flags(b"c", FindFlags::LT).unwrap().map(|(k, _)| k),
            Some(b"b".to_vec())
        );
        assert_eq!(
            index.find_with_flags(b"c", FindFlags::GT).unwrap().map(|(k, _)| k),
            Some(b"d".to_vec())
        );
        assert_eq!(
            index.find_with_flags(b"d", FindFlags::LE).unwrap().map(|(k, _)| k),
            Some(b"d".to_vec())
        );
        assert_eq!(
            index.find_with_flags(b"d", FindFlags::GT).unwrap().map(|(k, _)| k),
            Some(b"f".to_vec())
        );
        assert_eq!(index.find_with_flags(b"a", FindFlags::LT).unwrap(), None);
        assert_eq!(index.find_with_flags(b"z", FindFlags::GT).unwrap(), None);
    }

    #[test]
    fn erasing_every_key_collapses_back_to_an_empty_root() {
        let index = new_index(256);
        for i in 0..500u32 {
            let key = i.to_be_bytes();
            index.insert(&key, b"v", InsertFlags::empty()).unwrap();
        }
        let root_handle = index.pages.fetch(index.root_address(), FetchFlags::empty()).unwrap().unwrap();
        assert!(!Node::decode(&root_handle.lock().unwrap()).unwrap().is_leaf());

        for i in 0..500u32 {
            let key = i.to_be_bytes();
            assert!(index.erase(&key).unwrap());
        }
        for i in 0..500u32 {
            let key = i.to_be_bytes();
            assert_eq!(index.find(&key).unwrap(), None);
        }

        // the whole tree collapsed back down to a single, empty leaf root
        let root_handle = index.pages.fetch(index.root_address(), FetchFlags::empty()).unwrap().unwrap();
        let node = Node::decode(&root_handle.lock().unwrap()).unwrap();
        assert!(node.is_leaf());
        assert_eq!(node.len(), 0);
    }
}
