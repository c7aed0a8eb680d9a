//! Cursor coupling and movement (spec §4.5, §4.6).
//!
//! A cursor is either uncoupled (tracking a key and a duplicate index,
//! re-locating its slot on every access) or coupled directly to a page and
//! slot. Coupling is what lets repeated `next`/`previous` calls avoid a full
//! re-descent; it is dropped whenever the underlying node is mutated out
//! from under the cursor (a split, an erase elsewhere on the page).

use std::cmp::Ordering;
use std::sync::Arc;

use crate::btree::node::Node;
use crate::btree::BtreeIndex;
use crate::error::{Error, Result};
use crate::page_manager::FetchFlags;

#[derive(Clone, Debug, PartialEq, Eq)]
enum CursorState {
    Nil,
    Coupled {
        leaf_addr: u64,
        slot: usize,
        dup_index: usize,
    },
    Uncoupled {
        key: Vec<u8>,
        dup_index: usize,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorMove {
    First,
    Last,
    Next,
    Previous,
    /// Advance to the next duplicate of the current key, without moving to
    /// a different key.
    NextDuplicate,
    PreviousDuplicate,
    /// Advance to the next distinct key, skipping any remaining duplicates.
    NextKey,
    PreviousKey,
}

pub struct Cursor {
    id: u64,
    index: Arc<BtreeIndex>,
    state: CursorState,
}

impl Cursor {
    pub(crate) fn new(id: u64, index: Arc<BtreeIndex>) -> Self {
        Self {
            id,
            index,
            state: CursorState::Nil,
        }
    }

    fn decouple(&mut self) -> Result<()> {
        if let CursorState::Coupled { leaf_addr, .. } = self.state {
            if let Some(handle) = self.index.pages.fetch(leaf_addr, FetchFlags::ONLY_FROM_CACHE)? {
                handle
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .detach_cursor(self.id);
            }
        }
        Ok(())
    }

    fn couple_to(&mut self, leaf_addr: u64, slot: usize, dup_index: usize) -> Result<()> {
        self.decouple()?;
        if let Some(handle) = self.index.pages.fetch(leaf_addr, FetchFlags::empty())? {
            handle
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .attach_cursor(self.id);
        }
        self.state = CursorState::Coupled {
            leaf_addr,
            slot,
            dup_index,
        };
        Ok(())
    }

    /// Current `(key, value)` without moving, re-locating the slot if the
    /// cursor is uncoupled.
    pub fn current(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if matches!(self.state, CursorState::Coupled { .. }) && self.index.check_and_clear_invalidated(self.id) {
            self.state = CursorState::Nil;
        }
        match self.state.clone() {
            CursorState::Nil => Ok(None),
            CursorState::Coupled {
                leaf_addr,
                slot,
                dup_index,
            } => self.read_slot(leaf_addr, slot, dup_index),
            CursorState::Uncoupled { key, dup_index } => {
                let leaf_addr = *self.index.descend_path(&key)?.last().unwrap();
                let handle = self.index.fetch(leaf_addr)?;
                let node = {
                    let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                    Node::decode(&guard)?
                };
                let Node::Leaf { entries, .. } = node else {
                    return Err(Error::IntegrityViolated("cursor recoupling hit non-leaf"));
                };
                let slot = entries.iter().position(|e| {
                    e.key
                        .compare_to(&key, self.index.comparator.as_ref(), self.index.blobs.as_ref())
                        .map(|o| o == Ordering::Equal)
                        .unwrap_or(false)
                });
                match slot {
                    Some(slot) => {
                        self.couple_to(leaf_addr, slot, dup_index)?;
                        self.read_slot(leaf_addr, slot, dup_index)
                    }
                    None => {
                        self.state = CursorState::Nil;
                        Ok(None)
                    }
                }
            }
        }
    }

    fn read_slot(
        &self,
        leaf_addr: u64,
        slot: usize,
        dup_index: usize,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let handle = self.index.fetch(leaf_addr)?;
        let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
        let node = Node::decode(&guard)?;
        let Node::Leaf { entries, .. } = node else {
            return Err(Error::IntegrityViolated("cursor slot read hit non-leaf"));
        };
        let Some(entry) = entries.get(slot) else {
            return Ok(None);
        };
        let Some(record) = entry.records.get(dup_index) else {
            return Ok(None);
        };
        let key = entry.key.load_full(self.index.blobs.as_ref())?;
        let value = record.load_full(self.index.blobs.as_ref())?;
        Ok(Some((key, value)))
    }

    /// Position the cursor at `key`'s first duplicate. Returns `false`
    /// without moving the cursor if the key doesn't exist.
    pub fn find(&mut self, key: &[u8]) -> Result<bool> {
        let leaf_addr = *self.index.descend_path(key)?.last().unwrap();
        let handle = self.index.fetch(leaf_addr)?;
        let node = {
            let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            Node::decode(&guard)?
        };
        let Node::Leaf { entries, .. } = node else {
            return Err(Error::IntegrityViolated("cursor find hit non-leaf"));
        };
        let slot = entries.iter().position(|e| {
            e.key
                .compare_to(key, self.index.comparator.as_ref(), self.index.blobs.as_ref())
                .map(|o| o == Ordering::Equal)
                .unwrap_or(false)
        });
        match slot {
            Some(slot) => {
                self.couple_to(leaf_addr, slot, 0)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn mv(&mut self, step: CursorMove) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match step {
            CursorMove::First => self.to_first_leaf(),
            CursorMove::Last => self.to_last_leaf(),
            CursorMove::Next | CursorMove::NextKey => self.step(true, matches!(step, CursorMove::NextKey)),
            CursorMove::Previous | CursorMove::PreviousKey => {
                self.step(false, matches!(step, CursorMove::PreviousKey))
            }
            CursorMove::NextDuplicate => self.step_duplicate(true),
            CursorMove::PreviousDuplicate => self.step_duplicate(false),
        }
    }

    fn to_first_leaf(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut addr = self.index.root_address();
        loop {
            let handle = self.index.fetch(addr)?;
            let node = {
                let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                Node::decode(&guard)?
            };
            match node {
                Node::Leaf { .. } => break,
                Node::Internal { leftmost_child, .. } => addr = leftmost_child,
            }
        }
        if self.leaf_entry_count(addr)? == 0 {
            self.state = CursorState::Nil;
            return Ok(None);
        }
        self.couple_to(addr, 0, 0)?;
        self.read_slot(addr, 0, 0)
    }

    fn to_last_leaf(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut addr = self.index.root_address();
        loop {
            let handle = self.index.fetch(addr)?;
            let node = {
                let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
                Node::decode(&guard)?
            };
            match node {
                Node::Leaf { .. } => break,
                Node::Internal {
                    leftmost_child,
                    entries,
                } => {
                    addr = entries.last().map(|e| e.child).unwrap_or(leftmost_child);
                }
            }
        }
        let count = self.leaf_entry_count(addr)?;
        if count == 0 {
            self.state = CursorState::Nil;
            return Ok(None);
        }
        let last_dup = self.dup_count(addr, count - 1)?.saturating_sub(1);
        self.couple_to(addr, count - 1, last_dup)?;
        self.read_slot(addr, count - 1, last_dup)
    }

    fn leaf_entry_count(&self, addr: u64) -> Result<usize> {
        let handle = self.index.fetch(addr)?;
        let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
        match Node::decode(&guard)? {
            Node::Leaf { entries, .. } => Ok(entries.len()),
            _ => Err(Error::IntegrityViolated("expected leaf")),
        }
    }

    fn dup_count(&self, addr: u64, slot: usize) -> Result<usize> {
        let handle = self.index.fetch(addr)?;
        let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
        match Node::decode(&guard)? {
            Node::Leaf { entries, .. } => Ok(entries.get(slot).map(|e| e.records.len()).unwrap_or(0)),
            _ => Err(Error::IntegrityViolated("expected leaf")),
        }
    }

    fn step(&mut self, forward: bool, skip_duplicates: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let _ = skip_duplicates;
        self.current()?;
        let CursorState::Coupled {
            leaf_addr,
            slot,
            ..
        } = self.state.clone()
        else {
            return if forward { self.to_first_leaf() } else { self.to_last_leaf() };
        };

        let handle = self.index.fetch(leaf_addr)?;
        let (entry_count, sibling) = {
            let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            match Node::decode(&guard)? {
                Node::Leaf {
                    entries,
                    next_leaf,
                    prev_leaf,
                } => (entries.len(), if forward { next_leaf } else { prev_leaf }),
                _ => return Err(Error::IntegrityViolated("expected leaf")),
            }
        };

        if forward {
            if slot + 1 < entry_count {
                self.couple_to(leaf_addr, slot + 1, 0)?;
                return self.read_slot(leaf_addr, slot + 1, 0);
            }
        } else if slot > 0 {
            let dup = self.dup_count(leaf_addr, slot - 1)?.saturating_sub(1);
            self.couple_to(leaf_addr, slot - 1, dup)?;
            return self.read_slot(leaf_addr, slot - 1, dup);
        }

        if sibling == 0 {
            self.state = CursorState::Nil;
            return Ok(None);
        }
        let count = self.leaf_entry_count(sibling)?;
        if count == 0 {
            self.state = CursorState::Nil;
            return Ok(None);
        }
        let new_slot = if forward { 0 } else { count - 1 };
        let dup = if forward { 0 } else { self.dup_count(sibling, new_slot)?.saturating_sub(1) };
        self.couple_to(sibling, new_slot, dup)?;
        self.read_slot(sibling, new_slot, dup)
    }

    fn step_duplicate(&mut self, forward: bool) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.current()?;
        let CursorState::Coupled {
            leaf_addr,
            slot,
            dup_index,
        } = self.state.clone()
        else {
            return Ok(None);
        };
        let dup_count = self.dup_count(leaf_addr, slot)?;
        if forward {
            if dup_index + 1 < dup_count {
                self.couple_to(leaf_addr, slot, dup_index + 1)?;
                return self.read_slot(leaf_addr, slot, dup_index + 1);
            }
        } else if dup_index > 0 {
            self.couple_to(leaf_addr, slot, dup_index - 1)?;
            return self.read_slot(leaf_addr, slot, dup_index - 1);
        }
        Ok(None)
    }

    /// Uncouple without discarding position; used when a page the cursor is
    /// coupled to is about to be structurally mutated by another operation.
    pub fn uncouple(&mut self) -> Result<()> {
        if let CursorState::Coupled {
            leaf_addr,
            slot,
            dup_index,
        } = self.state.clone()
        {
            if let Some((key, _)) = self.read_slot(leaf_addr, slot, dup_index)? {
                self.decouple()?;
                self.state = CursorState::Uncoupled { key, dup_index };
            }
        }
        Ok(())
    }

    /// Erase the duplicate the cursor currently points at (spec §4.5
    /// "erase(key | cursor, duplicate_index, flags)": deletes at the coupled
    /// slot rather than a generic re-traversal by key).
    pub fn erase_current(&mut self) -> Result<()> {
        let Some((key, _)) = self.current()? else {
            return Err(Error::KeyNotFound);
        };
        let dup_index = match &self.state {
            CursorState::Coupled { dup_index, .. } => *dup_index,
            CursorState::Uncoupled { dup_index, .. } => *dup_index,
            CursorState::Nil => 0,
        };
        self.decouple()?;
        self.state = CursorState::Nil;
        self.index.erase_duplicate(&key, dup_index)?;
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let _ = self.decouple();
    }
}
