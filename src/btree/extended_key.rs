//! Keys too large to store inline in a node slot (spec §4.5 "extended keys").
//!
//! A key above [`INLINE_KEY_LIMIT`] is split into a short prefix kept inline
//! in the node (for fast comparison) and the remainder, stored as a blob.
//! Comparisons only fetch the blob when two keys tie on the inline prefix.

use std::cmp::Ordering;

use crate::blob_manager::BlobManager;
use crate::comparator::Comparator;
use crate::error::Result;

pub const INLINE_KEY_LIMIT: usize = 64;
pub const EXTENDED_KEY_PREFIX_LEN: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyRef {
    Inline(Vec<u8>),
    Extended {
        prefix: [u8; EXTENDED_KEY_PREFIX_LEN],
        blob_id: u64,
        full_len: u32,
    },
}

impl KeyRef {
    pub fn from_full_key(key: &[u8], blobs: &dyn BlobManager) -> Result<Self> {
        if key.len() <= INLINE_KEY_LIMIT {
            return Ok(KeyRef::Inline(key.to_vec()));
        }
        let mut prefix = [0u8; EXTENDED_KEY_PREFIX_LEN];
        let n = key.len().min(EXTENDED_KEY_PREFIX_LEN);
        prefix[..n].copy_from_slice(&key[..n]);
        let blob_id = blobs.store(key)?;
        Ok(KeyRef::Extended {
            prefix,
            blob_id,
            full_len: key.len() as u32,
        })
    }

    pub fn load_full(&self, blobs: &dyn BlobManager) -> Result<Vec<u8>> {
        match self {
            KeyRef::Inline(bytes) => Ok(bytes.clone()),
            KeyRef::Extended { blob_id, .. } => blobs.read(*blob_id),
        }
    }

    /// Release the backing blob, if any. A no-op for inline keys.
    pub fn free(&self, blobs: &dyn BlobManager) -> Result<()> {
        if let KeyRef::Extended { blob_id, .. } = self {
            blobs.free(*blob_id)?;
        }
        Ok(())
    }

    pub fn compare_to(
        &self,
        probe: &[u8],
        comparator: &dyn Comparator,
        blobs: &dyn BlobManager,
    ) -> Result<Ordering> {
        match self {
            KeyRef::Inline(bytes) => Ok(comparator.compare(bytes, probe)),
            KeyRef::Extended { prefix, full_len, .. } => {
                let window = probe.len().min(EXTENDED_KEY_PREFIX_LEN);
                let ord = comparator.compare(&prefix[..window], &probe[..window]);
                if ord == Ordering::Equal && (probe.len() > EXTENDED_KEY_PREFIX_LEN || probe.len() as u32 != *full_len)
                {
                    let full = self.load_full(blobs)?;
                    Ok(comparator.compare(&full, probe))
                } else {
                    Ok(ord)
                }
            }
        }
    }

    /// A lightweight in-memory ordering used for sorting already-loaded
    /// entries within a node (no blob access, inline prefix only — good
    /// enough since node entries are already distinct keys).
    pub fn sort_key(&self) -> &[u8] {
        match self {
            KeyRef::Inline(bytes) => bytes,
            KeyRef::Extended { prefix, .. } => prefix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_manager::MemBlobManager;
    use crate::comparator::LexicographicComparator;

    #[test]
    fn short_key_stays_inline() {
        let blobs = MemBlobManager::default();
        let key_ref = KeyRef::from_full_key(b"short", &blobs).unwrap();
        assert!(matches!(key_ref, KeyRef::Inline(_)));
    }

    #[test]
    fn long_key_round_trips_through_blob() {
        let blobs = MemBlobManager::default();
        let long_key: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        let key_ref = KeyRef::from_full_key(&long_key, &blobs).unwrap();
        assert!(matches!(key_ref, KeyRef::Extended { .. }));
        assert_eq!(key_ref.load_full(&blobs).unwrap(), long_key);

        let comparator = LexicographicComparator;
        assert_eq!(
            key_ref.compare_to(&long_key, &comparator, &blobs).unwrap(),
            Ordering::Equal
        );
    }
}
