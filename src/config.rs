//! Configuration knobs consumed directly by the core (spec §6).
//!
//! The transport/CLI layers that would normally populate a [`Config`] are out
//! of scope for this crate; callers build one directly, mirroring the way
//! the teacher's `OpenOptions` builder worked.

use bitflags::bitflags;

bitflags! {
    /// Persistent and session flags that shape how the environment behaves.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        /// Refuse all mutation; `insert`/`erase`/`begin_txn` (read-write) fail.
        const READ_ONLY               = 1 << 0;
        /// Back the environment with an anonymous memory arena, not a file.
        const IN_MEMORY               = 1 << 1;
        /// Never mmap the backing file; all reads go through `pread`-style I/O.
        const DISABLE_MMAP            = 1 << 2;
        /// Ask the OS to sync file contents on every durable commit.
        const ENABLE_FSYNC            = 1 << 3;
        /// Verify (and stamp) a CRC32 on every page with a persistent header.
        const ENABLE_CRC32            = 1 << 4;
        /// Enable transactions; without this, every call is its own implicit txn.
        const ENABLE_TRANSACTIONS     = 1 << 5;
        /// Replay the journal (if present) when opening.
        const ENABLE_RECOVERY         = 1 << 6;
        /// Disable proactive leaf merge/root collapse during traversal.
        const DISABLE_RECLAIM_INTERNAL = 1 << 7;
    }
}

/// Advice passed down to the device about expected access pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PosixAdvice {
    #[default]
    Normal,
    Random,
    Sequential,
}

/// The page size (in bytes). Must be a power of two; spec default is 16 KiB.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
/// Default page cache budget, in bytes.
pub const DEFAULT_CACHE_SIZE: usize = 2 * 1024 * 1024;
/// Default number of queued committed transactions before a forced flush
/// into the B+tree (spec §9 Open Question, resolved in SPEC_FULL.md).
pub const DEFAULT_COMMIT_THRESHOLD: usize = 8;
/// Default number of open+closed transactions a journal file absorbs before
/// rotation is considered (spec §4.6 "Rotation policy").
pub const DEFAULT_JOURNAL_ROTATION_THRESHOLD: usize = 1024;

/// Configuration consumed when opening or creating an [`crate::environment::Environment`].
#[derive(Clone, Debug)]
pub struct Config {
    pub page_size_bytes: usize,
    pub cache_size_bytes: usize,
    pub file_size_limit_bytes: Option<u64>,
    pub flags: DbFlags,
    pub posix_advice: PosixAdvice,
    pub encryption_key: Option<[u8; 32]>,
    pub commit_threshold: usize,
    pub journal_rotation_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size_bytes: DEFAULT_PAGE_SIZE,
            cache_size_bytes: DEFAULT_CACHE_SIZE,
            file_size_limit_bytes: None,
            flags: DbFlags::ENABLE_CRC32 | DbFlags::ENABLE_TRANSACTIONS | DbFlags::ENABLE_RECOVERY,
            posix_advice: PosixAdvice::Normal,
            encryption_key: None,
            commit_threshold: DEFAULT_COMMIT_THRESHOLD,
            journal_rotation_threshold: DEFAULT_JOURNAL_ROTATION_THRESHOLD,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size_bytes = size;
        self
    }

    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size_bytes = size;
        self
    }

    pub fn file_size_limit(mut self, limit: u64) -> Self {
        self.file_size_limit_bytes = Some(limit);
        self
    }

    pub fn flags(mut self, flags: DbFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn posix_advice(mut self, advice: PosixAdvice) -> Self {
        self.posix_advice = advice;
        self
    }

    pub fn encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self.flags |= DbFlags::ENABLE_CRC32;
        self
    }

    pub fn commit_threshold(mut self, threshold: usize) -> Self {
        self.commit_threshold = threshold;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.flags.contains(DbFlags::READ_ONLY)
    }

    pub fn is_in_memory(&self) -> bool {
        self.flags.contains(DbFlags::IN_MEMORY)
    }

    pub fn crc32_enabled(&self) -> bool {
        self.flags.contains(DbFlags::ENABLE_CRC32)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if !self.page_size_bytes.is_power_of_two() || self.page_size_bytes < 512 {
            return Err(crate::error::Error::InvalidParameter(
                "page_size_bytes must be a power of two >= 512",
            ));
        }
        Ok(())
    }
}
