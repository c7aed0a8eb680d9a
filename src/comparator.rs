//! Key-ordering strategies consumed by the B+tree (spec §4.5, §9 "Callback-
//! based compression and comparator... specify them as small object
//! interfaces the core consumes").

use std::cmp::Ordering;
use std::sync::Arc;

use crate::btree::node::NodeLayout;
use crate::error::{Error, Result};

/// A stateless key comparator.
pub trait Comparator: Send + Sync {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Plain byte-lexicographic ordering — the default for arbitrary keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct LexicographicComparator;

impl Comparator for LexicographicComparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Numeric comparator for 4-byte little-endian `u32` keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct U32Comparator;

impl Comparator for U32Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a = u32::from_le_bytes(a[..4].try_into().unwrap_or_default());
        let b = u32::from_le_bytes(b[..4].try_into().unwrap_or_default());
        a.cmp(&b)
    }
}

/// Numeric comparator for 8-byte little-endian `u64` keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct U64Comparator;

impl Comparator for U64Comparator {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let a = u64::from_le_bytes(a[..8].try_into().unwrap_or_default());
        let b = u64::from_le_bytes(b[..8].try_into().unwrap_or_default());
        a.cmp(&b)
    }
}

/// Which comparator a database was created with, persisted in the header
/// page's catalogue entry (spec §6 "catalogue of databases (name, type,
/// per-db flags, root page id)") so a reopen picks the same ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DbType {
    Lexicographic = 0,
    U32Key = 1,
    U64Key = 2,
}

impl DbType {
    pub fn comparator(self) -> Arc<dyn Comparator> {
        match self {
            DbType::Lexicographic => Arc::new(LexicographicComparator),
            DbType::U32Key => Arc::new(U32Comparator),
            DbType::U64Key => Arc::new(U64Comparator),
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(DbType::Lexicographic),
            1 => Ok(DbType::U32Key),
            2 => Ok(DbType::U64Key),
            _ => Err(Error::IntegrityViolated("unknown database type in catalog")),
        }
    }

    /// Node wire layout paired with this comparator (spec §4.5: "the
    /// implementation picks one [layout] per database based on
    /// configuration"). Fixed-width numeric keys get a fixed-width node
    /// layout to match; arbitrary byte keys keep the variable one.
    pub fn default_node_layout(self) -> NodeLayout {
        match self {
            DbType::Lexicographic => NodeLayout::VariableInlineOrOverflow,
            DbType::U32Key => NodeLayout::PaxFixed {
                key_width: 4,
                record_width: 8,
            },
            DbType::U64Key => NodeLayout::FixedKeyRecordId { key_width: 8 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicographic_orders_bytes() {
        let c = LexicographicComparator;
        assert_eq!(c.compare(b"abc", b"abd"), Ordering::Less);
        assert_eq!(c.compare(b"abc", b"abc"), Ordering::Equal);
    }

    #[test]
    fn u64_orders_numerically_not_lexicographically() {
        let c = U64Comparator;
        // 2 < 10 numerically, but "2" as a u64 LE byte string would sort
        // after "10" lexicographically if compared as raw bytes.
        assert_eq!(c.compare(&2u64.to_le_bytes(), &10u64.to_le_bytes()), Ordering::Less);
    }

    #[test]
    fn db_type_round_trips_through_its_byte_tag() {
        for t in [DbType::Lexicographic, DbType::U32Key, DbType::U64Key] {
            assert_eq!(DbType::from_u8(t as u8).unwrap(), t);
        }
        assert!(DbType::from_u8(99).is_err());
    }
}
