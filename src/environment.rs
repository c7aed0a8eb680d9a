//! The top-level handle binding the page pool, blob manager, journal, and
//! transaction manager into one open database (spec §4.8, §5 "Environment").
//!
//! `Environment::create`/`open` mirror the teacher's `alloc_open`-style
//! entry points, but return a single owning handle instead of free
//! functions: every other module here is reached only through it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};

use crate::blob_manager::{BlobManager, DiskBlobManager, MemBlobManager};
use crate::btree::cursor::Cursor;
use crate::btree::{BtreeIndex, InsertFlags};
use crate::comparator::DbType;
use crate::compression::{Compressor, NoopCompressor};
use crate::config::{Config, DbFlags};
use crate::device::{FileDevice, MemDevice};
use crate::error::{Error, Result};
use crate::journal::{self, Journal};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::page::PageType;
use crate::page_manager::{FetchFlags, PageManager};
use crate::txn::{Transaction, TransactionManager};

const HEADER_MAGIC: &[u8; 8] = b"FKVENV01";
const HEADER_VERSION: u8 = 1;

/// One named key space's catalog entry, persisted in the header page
/// (spec §6 "catalogue of databases (name, type, per-db flags, root page id)").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DatabaseDescriptor {
    pub name: u16,
    pub db_type: DbType,
    pub flags: u32,
    pub root_address: u64,
}

/// Default database name, opened automatically by `create`/`open` so a
/// caller with a single key space never has to name it.
pub const DEFAULT_DATABASE: u16 = 0;

fn encode_header(page_size: u32, env_flags: u32, descriptors: &[DatabaseDescriptor]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(HEADER_MAGIC);
    buf.push(HEADER_VERSION);
    let mut u32_buf = [0u8; 4];
    LittleEndian::write_u32(&mut u32_buf, page_size);
    buf.extend_from_slice(&u32_buf);
    LittleEndian::write_u32(&mut u32_buf, env_flags);
    buf.extend_from_slice(&u32_buf);
    let mut u16_buf = [0u8; 2];
    LittleEndian::write_u16(&mut u16_buf, descriptors.len() as u16);
    buf.extend_from_slice(&u16_buf);
    for d in descriptors {
        LittleEndian::write_u16(&mut u16_buf, d.name);
        buf.extend_from_slice(&u16_buf);
        buf.push(d.db_type as u8);
        LittleEndian::write_u32(&mut u32_buf, d.flags);
        buf.extend_from_slice(&u32_buf);
        let mut u64_buf = [0u8; 8];
        LittleEndian::write_u64(&mut u64_buf, d.root_address);
        buf.extend_from_slice(&u64_buf);
    }
    buf
}

fn decode_header(buf: &[u8]) -> Result<(u32, u32, Vec<DatabaseDescriptor>)> {
    if buf.len() < 8 + 1 + 4 + 4 + 2 || &buf[0..8] != HEADER_MAGIC {
        return Err(Error::InvalidFileHeader);
    }
    let version = buf[8];
    if version != HEADER_VERSION {
        return Err(Error::InvalidFileVersion {
            expected: HEADER_VERSION,
            found: version,
        });
    }
    let page_size = LittleEndian::read_u32(&buf[9..13]);
    let env_flags = LittleEndian::read_u32(&buf[13..17]);
    let count = LittleEndian::read_u16(&buf[17..19]) as usize;
    let mut pos = 19;
    let mut descriptors = Vec::with_capacity(count);
    for _ in 0..count {
        let name = LittleEndian::read_u16(
            buf.get(pos..pos + 2)
                .ok_or(Error::IntegrityViolated("header catalog truncated"))?,
        );
        pos += 2;
        let db_type = DbType::from_u8(
            *buf.get(pos)
                .ok_or(Error::IntegrityViolated("header catalog truncated"))?,
        )?;
        pos += 1;
        let flags = LittleEndian::read_u32(
            buf.get(pos..pos + 4)
                .ok_or(Error::IntegrityViolated("header catalog truncated"))?,
        );
        pos += 4;
        let root_address = LittleEndian::read_u64(
            buf.get(pos..pos + 8)
                .ok_or(Error::IntegrityViolated("header catalog truncated"))?,
        );
        pos += 8;
        descriptors.push(DatabaseDescriptor {
            name,
            db_type,
            flags,
            root_address,
        });
    }
    Ok((page_size, env_flags, descriptors))
}

/// A database's open tree plus the catalog metadata needed to persist and
/// reopen it with the same comparator.
struct OpenDatabase {
    index: Arc<BtreeIndex>,
    db_type: DbType,
    flags: u32,
}

struct EnvironmentInner {
    config: Config,
    pages: Arc<PageManager>,
    blobs: Arc<dyn BlobManager>,
    databases: Mutex<HashMap<u16, OpenDatabase>>,
    txn_manager: Option<Arc<TransactionManager>>,
    metrics: Arc<Metrics>,
    journal_dir: Option<PathBuf>,
}

/// Rewrite the header page's database catalog from the current set of open
/// trees. Every root-moving mutation (a leaf or internal split) calls this
/// afterward so a reopen never reads a stale root address.
fn rewrite_catalog_inner(inner: &EnvironmentInner, databases: &HashMap<u16, OpenDatabase>) -> Result<()> {
    let descriptors: Vec<DatabaseDescriptor> = databases
        .iter()
        .map(|(name, db)| DatabaseDescriptor {
            name: *name,
            db_type: db.db_type,
            flags: db.flags,
            root_address: db.index.root_address(),
        })
        .collect();
    let header_handle = inner
        .pages
        .fetch(0, FetchFlags::empty())?
        .ok_or(Error::IntegrityViolated("missing header page"))?;
    let mut guard = header_handle.lock().unwrap_or_else(|p| p.into_inner());
    let bytes = encode_header(
        inner.config.page_size_bytes as u32,
        inner.config.flags.bits(),
        &descriptors,
    );
    let payload = guard.payload_mut();
    if bytes.len() > payload.len() {
        return Err(Error::LimitsReached("header catalog exceeds one page"));
    }
    payload[..bytes.len()].copy_from_slice(&bytes);
    payload[bytes.len()..].fill(0);
    guard.mark_dirty();
    Ok(())
}

/// An open database. Cloning is cheap and shares the same underlying state
/// (all the interior state lives behind `Arc`s).
#[derive(Clone)]
pub struct Environment {
    inner: Arc<EnvironmentInner>,
}

/// Base path the journal derives its sibling `.jrn0`/`.jrn1` file names
/// from (see [`crate::journal::Journal::create`]).
fn journal_base_for(path: &Path) -> PathBuf {
    path.to_path_buf()
}

fn default_compressor() -> Arc<dyn Compressor> {
    Arc::new(NoopCompressor)
}

impl Environment {
    pub fn create<P: AsRef<Path>>(path: Option<P>, config: Config) -> Result<Self> {
        config.validate()?;
        let path = path.map(|p| p.as_ref().to_path_buf());
        if config.is_in_memory() != path.is_none() {
            return Err(Error::InvalidParameter(
                "IN_MEMORY must be set exactly when no path is given",
            ));
        }

        let device: Box<dyn crate::device::Device> = if config.is_in_memory() {
            Box::new(MemDevice::new(0))
        } else {
            Box::new(FileDevice::create(
                path.as_ref().unwrap(),
                !config.flags.contains(DbFlags::DISABLE_MMAP),
            )?)
        };

        let metrics = Arc::new(Metrics::default());
        let pages = Arc::new(PageManager::new(
            device,
            config.page_size_bytes,
            config.cache_size_bytes,
            config.crc32_enabled(),
            0,
            config.page_size_bytes as u64,
            metrics.clone(),
        ));

        let header_handle = pages.alloc(PageType::Header, true)?;
        let state_handle = pages.alloc(PageType::PageManagerState, true)?;

        let blobs: Arc<dyn BlobManager> = if config.is_in_memory() {
            Arc::new(MemBlobManager::default())
        } else {
            Arc::new(DiskBlobManager::new(pages.clone(), default_compressor()))
        };
        let default_db_type = DbType::Lexicographic;
        let disable_reclaim = config.flags.contains(DbFlags::DISABLE_RECLAIM_INTERNAL);
        let default_index = Arc::new(BtreeIndex::create(
            pages.clone(),
            blobs.clone(),
            default_db_type.comparator(),
            disable_reclaim,
            default_db_type.default_node_layout(),
        )?);
        let descriptors = vec![DatabaseDescriptor {
            name: DEFAULT_DATABASE,
            db_type: default_db_type,
            flags: 0,
            root_address: default_index.root_address(),
        }];

        {
            let mut guard = header_handle.lock().unwrap_or_else(|p| p.into_inner());
            let bytes = encode_header(
                config.page_size_bytes as u32,
                config.flags.bits(),
                &descriptors,
            );
            let payload = guard.payload_mut();
            if bytes.len() > payload.len() {
                return Err(Error::LimitsReached("header catalog exceeds one page"));
            }
            payload[..bytes.len()].copy_from_slice(&bytes);
            payload[bytes.len()..].fill(0);
            guard.mark_dirty();
        }

        let mut databases = HashMap::new();
        databases.insert(
            DEFAULT_DATABASE,
            OpenDatabase {
                index: default_index,
                db_type: default_db_type,
                flags: 0,
            },
        );

        let (txn_manager, journal_dir) = if config.flags.contains(DbFlags::ENABLE_TRANSACTIONS) && !config.is_in_memory()
        {
            let base = journal_base_for(path.as_ref().unwrap());
            let journal = Journal::create(
                &base,
                config.journal_rotation_threshold,
                config.flags.contains(DbFlags::ENABLE_FSYNC),
            )?;
            let txm = Arc::new(TransactionManager::new(
                journal,
                databases[&DEFAULT_DATABASE].index.clone(),
                pages.clone(),
                config.commit_threshold,
            ));
            (Some(txm), Some(base))
        } else {
            (None, None)
        };

        pages.store_state(&state_handle)?;
        pages.flush_all_pages()?;

        Ok(Self {
            inner: Arc::new(EnvironmentInner {
                config,
                pages,
                blobs,
                databases: Mutex::new(databases),
                txn_manager,
                metrics,
                journal_dir,
            }),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let device = Box::new(FileDevice::open(
            &path,
            config.is_read_only(),
            !config.flags.contains(DbFlags::DISABLE_MMAP),
        )?);

        let metrics = Arc::new(Metrics::default());
        let pages = Arc::new(PageManager::new(
            device,
            config.page_size_bytes,
            config.cache_size_bytes,
            config.crc32_enabled(),
            0,
            config.page_size_bytes as u64,
            metrics.clone(),
        ));

        let header_handle = pages
            .fetch(0, FetchFlags::empty())?
            .ok_or(Error::InvalidFileHeader)?;
        let (page_size, flags_bits, mut descriptors) = {
            let guard = header_handle.lock().unwrap_or_else(|p| p.into_inner());
            decode_header(guard.payload())?
        };
        if page_size as usize != config.page_size_bytes {
            return Err(Error::InvalidParameter(
                "configured page_size_bytes does not match the file's header",
            ));
        }
        let flags = DbFlags::from_bits_truncate(flags_bits);

        let state_handle = pages
            .fetch(config.page_size_bytes as u64, FetchFlags::empty())?
            .ok_or(Error::IntegrityViolated("missing page-manager state page"))?;
        {
            let guard = state_handle.lock().unwrap_or_else(|p| p.into_inner());
            pages.load_state(guard.payload())?;
        }

        let blobs: Arc<dyn BlobManager> = Arc::new(DiskBlobManager::new(pages.clone(), default_compressor()));
        let disable_reclaim = flags.contains(DbFlags::DISABLE_RECLAIM_INTERNAL);

        let journal_dir = journal_base_for(&path);
        let mut recovered_ops = Vec::new();
        let txn_manager = if flags.contains(DbFlags::ENABLE_TRANSACTIONS) {
            let (recovered_journal, entries) = if flags.contains(DbFlags::ENABLE_RECOVERY) {
                Journal::recover(
                    &journal_dir,
                    config.journal_rotation_threshold,
                    config.flags.contains(DbFlags::ENABLE_FSYNC),
                )?
            } else {
                (
                    Journal::create(&journal_dir, config.journal_rotation_threshold, false)?,
                    Vec::new(),
                )
            };

            if flags.contains(DbFlags::ENABLE_RECOVERY) {
                let (changeset_images, logical) = journal::plan_recovery(entries);
                if let Some(images) = changeset_images {
                    for (address, image) in images {
                        pages.restore_page_image(address, &image)?;
                    }
                    // re-read the catalog in case the changeset touched it
                    let guard = header_handle.lock().unwrap_or_else(|p| p.into_inner());
                    if let Ok((_, _, fresh)) = decode_header(guard.payload()) {
                        descriptors = fresh;
                    }
                }
                recovered_ops = crate::txn::logical_ops_from_journal(logical);
            }

            let default_descriptor = descriptors
                .iter()
                .find(|d| d.name == DEFAULT_DATABASE)
                .ok_or(Error::IntegrityViolated("missing default database descriptor"))?;
            let default_index = Arc::new(BtreeIndex::open(
                pages.clone(),
                blobs.clone(),
                default_descriptor.db_type.comparator(),
                default_descriptor.root_address,
                disable_reclaim,
                default_descriptor.db_type.default_node_layout(),
            ));
            let txm = Arc::new(TransactionManager::new(
                recovered_journal,
                default_index,
                pages.clone(),
                config.commit_threshold,
            ));
            Some(txm)
        } else {
            None
        };

        let mut databases = HashMap::new();
        for d in &descriptors {
            let index = Arc::new(BtreeIndex::open(
                pages.clone(),
                blobs.clone(),
                d.db_type.comparator(),
                d.root_address,
                disable_reclaim,
                d.db_type.default_node_layout(),
            ));
            databases.insert(
                d.name,
                OpenDatabase {
                    index,
                    db_type: d.db_type,
                    flags: d.flags,
                },
            );
        }

        if let Some(txm) = &txn_manager {
            if !recovered_ops.is_empty() {
                txm.replay_logical(recovered_ops)?;
                txm.flush_all()?;
            }
        }

        Ok(Self {
            inner: Arc::new(EnvironmentInner {
                config,
                pages,
                blobs,
                databases: Mutex::new(databases),
                txn_manager,
                metrics,
                journal_dir: Some(journal_dir),
            }),
        })
    }

    /// Create a new named key space, ordered by `db_type`'s comparator.
    pub fn create_database(&self, name: u16, db_type: DbType) -> Result<()> {
        let mut databases = self.inner.databases.lock().unwrap_or_else(|p| p.into_inner());
        if databases.contains_key(&name) {
            return Err(Error::InvalidParameter("database name already in use"));
        }
        let index = Arc::new(BtreeIndex::create(
            self.inner.pages.clone(),
            self.inner.blobs.clone(),
            db_type.comparator(),
            self.inner.config.flags.contains(DbFlags::DISABLE_RECLAIM_INTERNAL),
            db_type.default_node_layout(),
        )?);
        databases.insert(
            name,
            OpenDatabase {
                index,
                db_type,
                flags: 0,
            },
        );
        rewrite_catalog_inner(&self.inner, &databases)
    }

    pub fn database(&self, name: u16) -> Result<Database> {
        let databases = self.inner.databases.lock().unwrap_or_else(|p| p.into_inner());
        let index = databases
            .get(&name)
            .map(|d| d.index.clone())
            .ok_or(Error::InvalidParameter("no such database"))?;
        Ok(Database {
            env: self.inner.clone(),
            index,
        })
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Flush every pending transaction and page to disk, then sync.
    pub fn close(&self) -> Result<()> {
        if let Some(txm) = &self.inner.txn_manager {
            if txm.has_live_transactions() {
                return Err(Error::InvalidParameter(
                    "live transactions must be committed or aborted before close",
                ));
            }
            txm.flush_all()?;
        }
        {
            let databases = self.inner.databases.lock().unwrap_or_else(|p| p.into_inner());
            rewrite_catalog_inner(&self.inner, &databases)?;
        }
        let state_handle = self
            .inner
            .pages
            .fetch(self.inner.config.page_size_bytes as u64, FetchFlags::empty())?
            .ok_or(Error::IntegrityViolated("missing page-manager state page"))?;
        self.inner.pages.store_state(&state_handle)?;
        self.inner.pages.flush_all_pages()
    }
}

/// One named key space within an [`Environment`].
#[derive(Clone)]
pub struct Database {
    env: Arc<EnvironmentInner>,
    index: Arc<BtreeIndex>,
}

impl Database {
    fn sync_catalog(&self) -> Result<()> {
        let databases = self.env.databases.lock().unwrap_or_else(|p| p.into_inner());
        rewrite_catalog_inner(&self.env, &databases)
    }

    /// Insert or overwrite, outside any explicit transaction (an implicit
    /// one-operation transaction when transactions are enabled).
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert_with_flags(key, value, InsertFlags::OVERWRITE)
    }

    /// Insert with explicit `OVERWRITE`/`DUPLICATE` flags, outside any
    /// explicit transaction.
    pub fn insert_with_flags(&self, key: &[u8], value: &[u8], flags: InsertFlags) -> Result<()> {
        if self.env.config.is_read_only() {
            return Err(Error::InvalidParameter("environment is read-only"));
        }
        match &self.env.txn_manager {
            Some(txm) => {
                let mut txn = txm.begin()?;
                txm.insert_with_flags(&mut txn, key, value, flags);
                txm.commit(txn)?;
            }
            None => self.index.insert(key, value, flags)?,
        }
        self.sync_catalog()
    }

    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match &self.env.txn_manager {
            Some(txm) => {
                let txn = txm.begin()?;
                let result = txm.find(&txn, key);
                txm.commit(txn)?;
                result
            }
            None => self.index.find(key),
        }
    }

    /// Approximate-match lookup (spec §4.5 `find(key, flags)`). Reads
    /// directly against the tree rather than through the transaction
    /// overlay, so it sees the last committed state, not an in-flight
    /// transaction's buffered writes.
    pub fn find_with_flags(&self, key: &[u8], flags: crate::btree::FindFlags) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.index.find_with_flags(key, flags)
    }

    pub fn erase(&self, key: &[u8]) -> Result<bool> {
        if self.env.config.is_read_only() {
            return Err(Error::InvalidParameter("environment is read-only"));
        }
        let erased = match &self.env.txn_manager {
            Some(txm) => {
                let mut txn = txm.begin()?;
                txm.erase(&mut txn, key);
                txm.commit(txn)?;
                true
            }
            None => self.index.erase(key)?,
        };
        self.sync_catalog()?;
        Ok(erased)
    }

    pub fn begin_txn(&self) -> Result<Transaction> {
        self.env
            .txn_manager
            .as_ref()
            .ok_or(Error::InvalidParameter("transactions are not enabled"))?
            .begin()
    }

    pub fn insert_txn(&self, txn: &mut Transaction, key: &[u8], value: &[u8]) -> Result<()> {
        self.insert_txn_with_flags(txn, key, value, InsertFlags::OVERWRITE)
    }

    pub fn insert_txn_with_flags(
        &self,
        txn: &mut Transaction,
        key: &[u8],
        value: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let txm = self
            .env
            .txn_manager
            .as_ref()
            .ok_or(Error::InvalidParameter("transactions are not enabled"))?;
        txm.insert_with_flags(txn, key, value, flags);
        Ok(())
    }

    pub fn erase_txn(&self, txn: &mut Transaction, key: &[u8]) -> Result<()> {
        let txm = self
            .env
            .txn_manager
            .as_ref()
            .ok_or(Error::InvalidParameter("transactions are not enabled"))?;
        txm.erase(txn, key);
        Ok(())
    }

    pub fn find_txn(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let txm = self
            .env
            .txn_manager
            .as_ref()
            .ok_or(Error::InvalidParameter("transactions are not enabled"))?;
        txm.find(txn, key)
    }

    pub fn commit(&self, txn: Transaction) -> Result<()> {
        let txm = self
            .env
            .txn_manager
            .as_ref()
            .ok_or(Error::InvalidParameter("transactions are not enabled"))?;
        txm.commit(txn)?;
        self.sync_catalog()
    }

    pub fn abort(&self, txn: Transaction) -> Result<()> {
        let txm = self
            .env
            .txn_manager
            .as_ref()
            .ok_or(Error::InvalidParameter("transactions are not enabled"))?;
        txm.abort(txn)
    }

    pub fn cursor(&self) -> Cursor {
        self.index.cursor()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_config() -> Config {
        Config::new().flags(DbFlags::IN_MEMORY).page_size(512)
    }

    #[test]
    fn create_in_memory_and_round_trip_insert() {
        let env = Environment::create::<&str>(None, mem_config()).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        db.insert(b"hello", b"world").unwrap();
        assert_eq!(db.find(b"hello").unwrap(), Some(b"world".to_vec()));
        assert_eq!(db.find(b"missing").unwrap(), None);
    }

    #[test]
    fn erase_then_find_returns_none() {
        let env = Environment::create::<&str>(None, mem_config()).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        db.insert(b"k", b"v").unwrap();
        assert!(db.erase(b"k").unwrap());
        assert_eq!(db.find(b"k").unwrap(), None);
    }

    #[test]
    fn create_database_adds_a_second_key_space() {
        let env = Environment::create::<&str>(None, mem_config()).unwrap();
        env.create_database(7, DbType::Lexicographic).unwrap();
        let db = env.database(7).unwrap();
        db.insert(b"a", b"1").unwrap();
        let default_db = env.database(DEFAULT_DATABASE).unwrap();
        assert_eq!(default_db.find(b"a").unwrap(), None);
        assert_eq!(db.find(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn duplicate_insert_adds_a_second_record_under_the_same_key() {
        use crate::btree::cursor::CursorMove;

        let env = Environment::create::<&str>(None, mem_config()).unwrap();
        let db = env.database(DEFAULT_DATABASE).unwrap();
        db.insert(b"k", b"v1").unwrap();
        db.insert_with_flags(b"k", b"v2", InsertFlags::DUPLICATE).unwrap();

        let mut cursor = db.cursor();
        assert!(cursor.find(b"k").unwrap());
        let (_, first) = cursor.current().unwrap().unwrap();
        assert_eq!(first, b"v1".to_vec());
        let (_, second) = cursor.mv(CursorMove::NextDuplicate).unwrap().unwrap();
        assert_eq!(second, b"v2".to_vec());
    }

    #[test]
    fn survives_close_and_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.db");
        let config = Config::new().page_size(512);
        {
            let env = Environment::create(Some(&path), config.clone()).unwrap();
            let db = env.database(DEFAULT_DATABASE).unwrap();
            for i in 0..200u32 {
                db.insert(format!("k{i}").as_bytes(), format!("v{i}").as_bytes())
                    .unwrap();
            }
            env.close().unwrap();
        }
        {
            let env = Environment::open(&path, config).unwrap();
            let db = env.database(DEFAULT_DATABASE).unwrap();
            for i in 0..200u32 {
                assert_eq!(
                    db.find(format!("k{i}").as_bytes()).unwrap(),
                    Some(format!("v{i}").into_bytes())
                );
            }
        }
    }
}
