//! On-page layout for B+tree leaf and internal nodes (spec §4.5).
//!
//! Nodes are decoded fully into an in-memory `Vec` of entries, mutated, and
//! re-encoded back into the page payload. This trades the zero-copy slotted
//! layouts larger engines use for a layout simple enough to reason about
//! without a compiler to catch mistakes — pages are small and entry counts
//! modest, so the cost is a non-issue in practice.
//!
//! The wire format for keys and records is itself pluggable
//! ([`NodeLayout`]): a database picks one layout at creation time and every
//! page of its tree is written and read in that format. The persisted
//! layout tag makes `decode` self-describing, so callers never need to pass
//! it in; only `encode` needs to be told which layout a freshly-written page
//! should use.

use byteorder::{ByteOrder, LittleEndian};

use crate::blob_manager::BlobManager;
use crate::btree::extended_key::KeyRef;
use crate::comparator::Comparator;
use crate::error::{Error, Result};
use crate::page::Page;

/// A leaf record: either the value bytes themselves, or a pointer to a blob
/// holding them (spec §4.5 "large values spill to the blob manager").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecordRef {
    Inline(Vec<u8>),
    BlobRef(u64),
}

impl RecordRef {
    pub fn load_full(&self, blobs: &dyn BlobManager) -> Result<Vec<u8>> {
        match self {
            RecordRef::Inline(bytes) => Ok(bytes.clone()),
            RecordRef::BlobRef(id) => blobs.read(*id),
        }
    }

    pub fn free(&self, blobs: &dyn BlobManager) -> Result<()> {
        if let RecordRef::BlobRef(id) = self {
            blobs.free(*id)?;
        }
        Ok(())
    }
}

/// A key above which values move out of the node into the blob manager
/// (spec §4.5 "inline value threshold"). Only consulted by
/// [`NodeLayout::VariableInlineOrOverflow`]; the fixed layouts decide
/// in/out-of-line placement from their own width, not this constant.
pub const INLINE_VALUE_LIMIT: usize = 128;

/// How keys and records are arranged in a node's page payload (spec §4.5
/// "Generic over a node layout... the implementation picks one per database
/// based on configuration"). All three share the same in-memory
/// `LeafEntry`/`InternalEntry` shape; they differ only in the bytes written
/// to the page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeLayout {
    /// PAX-style: fixed-size keys and fixed-size inline records, both
    /// pre-sized from a per-slot width rather than length-prefixed. Suits
    /// small fixed-width keys and values (e.g. a `u32` key with a `u64`
    /// counter for a value).
    PaxFixed { key_width: usize, record_width: usize },
    /// Fixed-size keys; records are always out-of-line, stored as an
    /// 8-byte record id (a blob address) rather than carrying a value
    /// width of their own.
    FixedKeyRecordId { key_width: usize },
    /// Variable-size keys with inline-or-overflow records, each
    /// length-prefixed. The default: no shared width assumption, so
    /// arbitrary byte strings of any length are supported directly.
    VariableInlineOrOverflow,
}

impl Default for NodeLayout {
    fn default() -> Self {
        NodeLayout::VariableInlineOrOverflow
    }
}

#[derive(Clone, Debug)]
pub struct LeafEntry {
    pub key: KeyRef,
    /// Usually one record; more than one when duplicate keys are enabled
    /// (spec §4.5 "duplicate keys").
    pub records: Vec<RecordRef>,
}

#[derive(Clone, Debug)]
pub struct InternalEntry {
    pub key: KeyRef,
    /// Address of the child subtree holding keys >= `key`.
    pub child: u64,
}

pub enum Node {
    Leaf {
        entries: Vec<LeafEntry>,
        prev_leaf: u64,
        next_leaf: u64,
    },
    Internal {
        /// Child holding keys less than `entries[0].key`.
        leftmost_child: u64,
        entries: Vec<InternalEntry>,
    },
}

fn write_layout_header(buf: &mut Vec<u8>, layout: NodeLayout) {
    match layout {
        NodeLayout::PaxFixed { key_width, record_width } => {
            buf.push(0);
            buf.extend_from_slice(&(key_width as u16).to_le_bytes());
            buf.extend_from_slice(&(record_width as u16).to_le_bytes());
        }
        NodeLayout::FixedKeyRecordId { key_width } => {
            buf.push(1);
            buf.extend_from_slice(&(key_width as u16).to_le_bytes());
        }
        NodeLayout::VariableInlineOrOverflow => {
            buf.push(2);
        }
    }
}

fn read_layout_header(buf: &[u8], pos: &mut usize) -> Result<NodeLayout> {
    let tag = *buf
        .get(*pos)
        .ok_or(Error::IntegrityViolated("node buffer truncated (layout tag)"))?;
    *pos += 1;
    match tag {
        0 => {
            let key_width = LittleEndian::read_u16(buf.get(*pos..*pos + 2).ok_or(
                Error::IntegrityViolated("node buffer truncated (layout key width)"),
            )?) as usize;
            *pos += 2;
            let record_width = LittleEndian::read_u16(buf.get(*pos..*pos + 2).ok_or(
                Error::IntegrityViolated("node buffer truncated (layout record width)"),
            )?) as usize;
            *pos += 2;
            Ok(NodeLayout::PaxFixed { key_width, record_width })
        }
        1 => {
            let key_width = LittleEndian::read_u16(buf.get(*pos..*pos + 2).ok_or(
                Error::IntegrityViolated("node buffer truncated (layout key width)"),
            )?) as usize;
            *pos += 2;
            Ok(NodeLayout::FixedKeyRecordId { key_width })
        }
        2 => Ok(NodeLayout::VariableInlineOrOverflow),
        _ => Err(Error::IntegrityViolated("unrecognized node layout tag")),
    }
}

fn write_key(buf: &mut Vec<u8>, key: &KeyRef, layout: NodeLayout) -> Result<()> {
    match layout {
        NodeLayout::VariableInlineOrOverflow => {
            match key {
                KeyRef::Inline(bytes) => {
                    buf.push(0);
                    let mut len_buf = [0u8; 4];
                    LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
                    buf.extend_from_slice(&len_buf);
                    buf.extend_from_slice(bytes);
                }
                KeyRef::Extended {
                    prefix,
                    blob_id,
                    full_len,
                } => {
                    buf.push(1);
                    buf.extend_from_slice(prefix);
                    let mut id_buf = [0u8; 8];
                    LittleEndian::write_u64(&mut id_buf, *blob_id);
                    buf.extend_from_slice(&id_buf);
                    let mut len_buf = [0u8; 4];
                    LittleEndian::write_u32(&mut len_buf, *full_len);
                    buf.extend_from_slice(&len_buf);
                }
            }
            Ok(())
        }
        NodeLayout::PaxFixed { key_width, .. } | NodeLayout::FixedKeyRecordId { key_width } => {
            let KeyRef::Inline(bytes) = key else {
                return Err(Error::InvalidParameter(
                    "fixed-width node layouts only accept inline keys, never extended ones",
                ));
            };
            if bytes.len() != key_width {
                return Err(Error::InvalidParameter(
                    "key length does not match this database's fixed key width",
                ));
            }
            buf.extend_from_slice(bytes);
            Ok(())
        }
    }
}

fn read_key(buf: &[u8], pos: &mut usize, layout: NodeLayout) -> Result<KeyRef> {
    match layout {
        NodeLayout::VariableInlineOrOverflow => {
            let tag = *buf
                .get(*pos)
                .ok_or(Error::IntegrityViolated("node buffer truncated (key tag)"))?;
            *pos += 1;
            match tag {
                0 => {
                    let len = LittleEndian::read_u32(buf.get(*pos..*pos + 4).ok_or(
                        Error::IntegrityViolated("node buffer truncated (key len)"),
                    )?) as usize;
                    *pos += 4;
                    let bytes = buf
                        .get(*pos..*pos + len)
                        .ok_or(Error::IntegrityViolated("node buffer truncated (key bytes)"))?
                        .to_vec();
                    *pos += len;
                    Ok(KeyRef::Inline(bytes))
                }
                1 => {
                    let prefix_bytes = buf.get(*pos..*pos + 16).ok_or(Error::IntegrityViolated(
                        "node buffer truncated (key prefix)",
                    ))?;
                    let mut prefix = [0u8; 16];
                    prefix.copy_from_slice(prefix_bytes);
                    *pos += 16;
                    let blob_id = LittleEndian::read_u64(buf.get(*pos..*pos + 8).ok_or(
                        Error::IntegrityViolated("node buffer truncated (key blob id)"),
                    )?);
                    *pos += 8;
                    let full_len = LittleEndian::read_u32(buf.get(*pos..*pos + 4).ok_or(
                        Error::IntegrityViolated("node buffer truncated (key full len)"),
                    )?);
                    *pos += 4;
                    Ok(KeyRef::Extended {
                        prefix,
                        blob_id,
                        full_len,
                    })
                }
                _ => Err(Error::IntegrityViolated("unrecognized key tag")),
            }
        }
        NodeLayout::PaxFixed { key_width, .. } | NodeLayout::FixedKeyRecordId { key_width } => {
            let bytes = buf
                .get(*pos..*pos + key_width)
                .ok_or(Error::IntegrityViolated("node buffer truncated (fixed key)"))?
                .to_vec();
            *pos += key_width;
            Ok(KeyRef::Inline(bytes))
        }
    }
}

fn write_record(buf: &mut Vec<u8>, record: &RecordRef, layout: NodeLayout) -> Result<()> {
    match layout {
        NodeLayout::VariableInlineOrOverflow => {
            match record {
                RecordRef::Inline(bytes) => {
                    buf.push(0);
                    let mut len_buf = [0u8; 4];
                    LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
                    buf.extend_from_slice(&len_buf);
                    buf.extend_from_slice(bytes);
                }
                RecordRef::BlobRef(id) => {
                    buf.push(1);
                    let mut id_buf = [0u8; 8];
                    LittleEndian::write_u64(&mut id_buf, *id);
                    buf.extend_from_slice(&id_buf);
                }
            }
            Ok(())
        }
        NodeLayout::PaxFixed { record_width, .. } => {
            let RecordRef::Inline(bytes) = record else {
                return Err(Error::InvalidParameter(
                    "the PAX node layout only accepts inline records",
                ));
            };
            if bytes.len() != record_width {
                return Err(Error::InvalidParameter(
                    "record length does not match this database's fixed record width",
                ));
            }
            buf.extend_from_slice(bytes);
            Ok(())
        }
        NodeLayout::FixedKeyRecordId { .. } => {
            let RecordRef::BlobRef(id) = record else {
                return Err(Error::InvalidParameter(
                    "the fixed-key/record-id layout only accepts out-of-line records",
                ));
            };
            let mut id_buf = [0u8; 8];
            LittleEndian::write_u64(&mut id_buf, *id);
            buf.extend_from_slice(&id_buf);
            Ok(())
        }
    }
}

fn read_record(buf: &[u8], pos: &mut usize, layout: NodeLayout) -> Result<RecordRef> {
    match layout {
        NodeLayout::VariableInlineOrOverflow => {
            let tag = *buf.get(*pos).ok_or(Error::IntegrityViolated(
                "node buffer truncated (record tag)",
            ))?;
            *pos += 1;
            match tag {
                0 => {
                    let len = LittleEndian::read_u32(buf.get(*pos..*pos + 4).ok_or(
                        Error::IntegrityViolated("node buffer truncated (record len)"),
                    )?) as usize;
                    *pos += 4;
                    let bytes = buf
                        .get(*pos..*pos + len)
                        .ok_or(Error::IntegrityViolated(
                            "node buffer truncated (record bytes)",
                        ))?
                        .to_vec();
                    *pos += len;
                    Ok(RecordRef::Inline(bytes))
                }
                1 => {
                    let id = LittleEndian::read_u64(buf.get(*pos..*pos + 8).ok_or(
                        Error::IntegrityViolated("node buffer truncated (record blob id)"),
                    )?);
                    *pos += 8;
                    Ok(RecordRef::BlobRef(id))
                }
                _ => Err(Error::IntegrityViolated("unrecognized record tag")),
            }
        }
        NodeLayout::PaxFixed { record_width, .. } => {
            let bytes = buf
                .get(*pos..*pos + record_width)
                .ok_or(Error::IntegrityViolated("node buffer truncated (fixed record)"))?
                .to_vec();
            *pos += record_width;
            Ok(RecordRef::Inline(bytes))
        }
        NodeLayout::FixedKeyRecordId { .. } => {
            let id = LittleEndian::read_u64(buf.get(*pos..*pos + 8).ok_or(
                Error::IntegrityViolated("node buffer truncated (record id)"),
            )?);
            *pos += 8;
            Ok(RecordRef::BlobRef(id))
        }
    }
}

impl Node {
    pub fn new_leaf() -> Self {
        Node::Leaf {
            entries: Vec::new(),
            prev_leaf: 0,
            next_leaf: 0,
        }
    }

    pub fn new_internal(leftmost_child: u64) -> Self {
        Node::Internal {
            leftmost_child,
            entries: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf { .. })
    }

    pub fn len(&self) -> usize {
        match self {
            Node::Leaf { entries, .. } => entries.len(),
            Node::Internal { entries, .. } => entries.len(),
        }
    }

    /// Decode a node from its page. Self-describing: the layout a page was
    /// encoded with is read back from its own header, so callers never need
    /// to track which layout a given tree uses just to read it.
    pub fn decode(page: &Page) -> Result<Self> {
        let buf = page.payload();
        if buf.is_empty() {
            return Err(Error::IntegrityViolated("node page too small for header"));
        }
        let mut pos = 0;
        let layout = read_layout_header(buf, &mut pos)?;
        let is_leaf = page.page_type()?.eq(&crate::page::PageType::BtreeLeaf);
        let count = LittleEndian::read_u16(
            buf.get(pos..pos + 2)
                .ok_or(Error::IntegrityViolated("node header truncated (count)"))?,
        ) as usize;
        pos += 2;
        if is_leaf {
            let prev_leaf = LittleEndian::read_u64(buf.get(pos..pos + 8).ok_or(
                Error::IntegrityViolated("leaf header truncated"),
            )?);
            pos += 8;
            let next_leaf = LittleEndian::read_u64(buf.get(pos..pos + 8).ok_or(
                Error::IntegrityViolated("leaf header truncated"),
            )?);
            pos += 8;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = read_key(buf, &mut pos, layout)?;
                let record_count = LittleEndian::read_u16(buf.get(pos..pos + 2).ok_or(
                    Error::IntegrityViolated("leaf entry truncated (record count)"),
                )?) as usize;
                pos += 2;
                let mut records = Vec::with_capacity(record_count);
                for _ in 0..record_count {
                    records.push(read_record(buf, &mut pos, layout)?);
                }
                entries.push(LeafEntry { key, records });
            }
            Ok(Node::Leaf {
                entries,
                prev_leaf,
                next_leaf,
            })
        } else {
            let leftmost_child = LittleEndian::read_u64(buf.get(pos..pos + 8).ok_or(
                Error::IntegrityViolated("internal header truncated"),
            )?);
            pos += 8;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let key = read_key(buf, &mut pos, layout)?;
                let child = LittleEndian::read_u64(buf.get(pos..pos + 8).ok_or(
                    Error::IntegrityViolated("internal entry truncated (child)"),
                )?);
                pos += 8;
                entries.push(InternalEntry { key, child });
            }
            Ok(Node::Internal {
                leftmost_child,
                entries,
            })
        }
    }

    /// Encode into `page` using `layout`. A node re-encoded in place (after
    /// a mutation) must be passed the same layout it was decoded with —
    /// `BtreeIndex` always does, since a tree's layout is fixed at creation.
    pub fn encode(&self, page: &mut Page, layout: NodeLayout) -> Result<()> {
        let mut buf = Vec::new();
        write_layout_header(&mut buf, layout);
        match self {
            Node::Leaf {
                entries,
                prev_leaf,
                next_leaf,
            } => {
                let mut count_buf = [0u8; 2];
                LittleEndian::write_u16(&mut count_buf, entries.len() as u16);
                buf.extend_from_slice(&count_buf);
                let mut sib_buf = [0u8; 8];
                LittleEndian::write_u64(&mut sib_buf, *prev_leaf);
                buf.extend_from_slice(&sib_buf);
                LittleEndian::write_u64(&mut sib_buf, *next_leaf);
                buf.extend_from_slice(&sib_buf);
                for entry in entries {
                    write_key(&mut buf, &entry.key, layout)?;
                    let mut rc_buf = [0u8; 2];
                    LittleEndian::write_u16(&mut rc_buf, entry.records.len() as u16);
                    buf.extend_from_slice(&rc_buf);
                    for record in &entry.records {
                        write_record(&mut buf, record, layout)?;
                    }
                }
            }
            Node::Internal {
                leftmost_child,
                entries,
            } => {
                let mut count_buf = [0u8; 2];
                LittleEndian::write_u16(&mut count_buf, entries.len() as u16);
                buf.extend_from_slice(&count_buf);
                let mut child_buf = [0u8; 8];
                LittleEndian::write_u64(&mut child_buf, *leftmost_child);
                buf.extend_from_slice(&child_buf);
                for entry in entries {
                    write_key(&mut buf, &entry.key, layout)?;
                    LittleEndian::write_u64(&mut child_buf, entry.child);
                    buf.extend_from_slice(&child_buf);
                }
            }
        }

        let payload = page.payload_mut();
        if buf.len() > payload.len() {
            return Err(Error::LimitsReached(
                "node contents do not fit the configured page size",
            ));
        }
        payload[..buf.len()].copy_from_slice(&buf);
        payload[buf.len()..].fill(0);
        page.mark_dirty();
        Ok(())
    }

    /// Index of the first entry whose key is >= `probe` (a leaf: insertion
    /// point; an internal node: the child to descend into is `index - 1`,
    /// or `leftmost_child` if `index == 0`).
    pub fn find_position(
        &self,
        probe: &[u8],
        comparator: &dyn Comparator,
        blobs: &dyn BlobManager,
    ) -> Result<usize> {
        let keys: Vec<&KeyRef> = match self {
            Node::Leaf { entries, .. } => entries.iter().map(|e| &e.key).collect(),
            Node::Internal { entries, .. } => entries.iter().map(|e| &e.key).collect(),
        };
        for (i, key) in keys.iter().enumerate() {
            if key.compare_to(probe, comparator, blobs)? != std::cmp::Ordering::Less {
                return Ok(i);
            }
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_manager::MemBlobManager;
    use crate::comparator::LexicographicComparator;
    use crate::device::PageBuffer;
    use crate::page::{Page, PageType};

    fn leaf_page(size: usize) -> Page {
        let mut page = Page::new(0, PageBuffer::Owned(vec![0u8; size].into_boxed_slice()), false);
        page.set_page_type(PageType::BtreeLeaf);
        page
    }

    #[test]
    fn leaf_round_trips_through_encode_decode() {
        let mut page = leaf_page(512);
        let node = Node::Leaf {
            entries: vec![
                LeafEntry {
                    key: KeyRef::Inline(b"alpha".to_vec()),
                    records: vec![RecordRef::Inline(b"1".to_vec())],
                },
                LeafEntry {
                    key: KeyRef::Inline(b"beta".to_vec()),
                    records: vec![RecordRef::Inline(b"2".to_vec()), RecordRef::Inline(b"2b".to_vec())],
                },
            ],
            prev_leaf: 0,
            next_leaf: 4096,
        };
        node.encode(&mut page, NodeLayout::VariableInlineOrOverflow).unwrap();
        let decoded = Node::decode(&page).unwrap();
        match decoded {
            Node::Leaf { entries, next_leaf, .. } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(next_leaf, 4096);
                assert_eq!(entries[1].records.len(), 2);
            }
            _ => panic!("expected leaf"),
        }
    }

    #[test]
    fn pax_fixed_layout_round_trips_fixed_width_entries() {
        let mut page = leaf_page(512);
        let layout = NodeLayout::PaxFixed { key_width: 4, record_width: 8 };
        let node = Node::Leaf {
            entries: vec![LeafEntry {
                key: KeyRef::Inline(7u32.to_le_bytes().to_vec()),
                records: vec![RecordRef::Inline(42u64.to_le_bytes().to_vec())],
            }],
            prev_leaf: 0,
            next_leaf: 0,
        };
        node.encode(&mut page, layout).unwrap();
        let decoded = Node::decode(&page).unwrap();
        let Node::Leaf { entries, .. } = decoded else { panic!("expected leaf") };
        assert_eq!(entries[0].key, KeyRef::Inline(7u32.to_le_bytes().to_vec()));
        assert_eq!(entries[0].records[0], RecordRef::Inline(42u64.to_le_bytes().to_vec()));
    }

    #[test]
    fn pax_fixed_layout_rejects_mismatched_widths() {
        let mut page = leaf_page(512);
        let layout = NodeLayout::PaxFixed { key_width: 4, record_width: 8 };
        let node = Node::Leaf {
            entries: vec![LeafEntry {
                key: KeyRef::Inline(b"toolong-key".to_vec()),
                records: vec![RecordRef::Inline(42u64.to_le_bytes().to_vec())],
            }],
            prev_leaf: 0,
            next_leaf: 0,
        };
        assert!(node.encode(&mut page, layout).is_err());
    }

    #[test]
    fn fixed_key_record_id_layout_round_trips() {
        let mut page = leaf_page(512);
        let layout = NodeLayout::FixedKeyRecordId { key_width: 8 };
        let node = Node::Leaf {
            entries: vec![LeafEntry {
                key: KeyRef::Inline(99u64.to_le_bytes().to_vec()),
                records: vec![RecordRef::BlobRef(12345)],
            }],
            prev_leaf: 0,
            next_leaf: 0,
        };
        node.encode(&mut page, layout).unwrap();
        let decoded = Node::decode(&page).unwrap();
        let Node::Leaf { entries, .. } = decoded else { panic!("expected leaf") };
        assert_eq!(entries[0].key, KeyRef::Inline(99u64.to_le_bytes().to_vec()));
        assert_eq!(entries[0].records[0], RecordRef::BlobRef(12345));
    }

    #[test]
    fn find_position_locates_insertion_point() {
        let node = Node::Leaf {
            entries: vec![
                LeafEntry { key: KeyRef::Inline(b"b".to_vec()), records: vec![] },
                LeafEntry { key: KeyRef::Inline(b"d".to_vec()), records: vec![] },
            ],
            prev_leaf: 0,
            next_leaf: 0,
        };
        let blobs = MemBlobManager::default();
        let comparator = LexicographicComparator;
        assert_eq!(node.find_position(b"a", &comparator, &blobs).unwrap(), 0);
        assert_eq!(node.find_position(b"c", &comparator, &blobs).unwrap(), 1);
        assert_eq!(node.find_position(b"e", &comparator, &blobs).unwrap(), 2);
    }
}
