//! Write-ahead journal: two rotating files recording both the logical
//! operation stream and periodic physical page-image changesets (spec §4.6).
//!
//! Two files, `<dbpath>.jrn0` and `<dbpath>.jrn1`, sit as siblings of the
//! database file itself (no subdirectory) and take turns being the "active"
//! file; once the active file's entry count passes `journal_rotation_threshold`,
//! the writer rotates to the other file, which is truncated first. A
//! changeset entry is a physical redo record: it carries the entire byte
//! image of every page a logical operation dirtied. Recovery replays the
//! most recent changeset's page images directly, then re-applies any
//! logical operations recorded after it (operations the transaction
//! manager had batched but not yet materialized into a changeset).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::changeset::Changeset;
use crate::error::{Error, Result};

const FILE_HEADER_LEN: usize = 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    TxnBegin { txn_id: u64 },
    TxnCommit { txn_id: u64 },
    TxnAbort { txn_id: u64 },
    Insert { txn_id: u64, key: Vec<u8>, value: Vec<u8>, flags: u8 },
    Erase { txn_id: u64, key: Vec<u8> },
    Changeset { txn_id: u64, pages: Vec<(u64, Vec<u8>)> },
}

impl JournalEntry {
    fn type_tag(&self) -> u8 {
        match self {
            JournalEntry::TxnBegin { .. } => 0,
            JournalEntry::TxnCommit { .. } => 1,
            JournalEntry::TxnAbort { .. } => 2,
            JournalEntry::Insert { .. } => 3,
            JournalEntry::Erase { .. } => 4,
            JournalEntry::Changeset { .. } => 5,
        }
    }

    fn txn_id(&self) -> u64 {
        match self {
            JournalEntry::TxnBegin { txn_id }
            | JournalEntry::TxnCommit { txn_id }
            | JournalEntry::TxnAbort { txn_id }
            | JournalEntry::Insert { txn_id, .. }
            | JournalEntry::Erase { txn_id, .. }
            | JournalEntry::Changeset { txn_id, .. } => *txn_id,
        }
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            JournalEntry::TxnBegin { .. }
            | JournalEntry::TxnCommit { .. }
            | JournalEntry::TxnAbort { .. } => {}
            JournalEntry::Insert { key, value, flags, .. } => {
                write_bytes(&mut buf, key);
                write_bytes(&mut buf, value);
                buf.push(*flags);
            }
            JournalEntry::Erase { key, .. } => {
                write_bytes(&mut buf, key);
            }
            JournalEntry::Changeset { pages, .. } => {
                let mut count_buf = [0u8; 4];
                LittleEndian::write_u32(&mut count_buf, pages.len() as u32);
                buf.extend_from_slice(&count_buf);
                for (address, image) in pages {
                    let mut addr_buf = [0u8; 8];
                    LittleEndian::write_u64(&mut addr_buf, *address);
                    buf.extend_from_slice(&addr_buf);
                    write_bytes(&mut buf, image);
                }
            }
        }
        buf
    }

    fn decode(tag: u8, txn_id: u64, payload: &[u8]) -> Result<Self> {
        let mut pos = 0usize;
        Ok(match tag {
            0 => JournalEntry::TxnBegin { txn_id },
            1 => JournalEntry::TxnCommit { txn_id },
            2 => JournalEntry::TxnAbort { txn_id },
            3 => {
                let key = read_bytes(payload, &mut pos)?;
                let value = read_bytes(payload, &mut pos)?;
                let flags = *payload
                    .get(pos)
                    .ok_or(Error::IntegrityViolated("journal insert record truncated (flags)"))?;
                JournalEntry::Insert { txn_id, key, value, flags }
            }
            4 => {
                let key = read_bytes(payload, &mut pos)?;
                JournalEntry::Erase { txn_id, key }
            }
            5 => {
                let count = LittleEndian::read_u32(
                    payload
                        .get(pos..pos + 4)
                        .ok_or(Error::IntegrityViolated("journal changeset header truncated"))?,
                ) as usize;
                pos += 4;
                let mut pages = Vec::with_capacity(count);
                for _ in 0..count {
                    let address = LittleEndian::read_u64(payload.get(pos..pos + 8).ok_or(
                        Error::IntegrityViolated("journal changeset entry truncated"),
                    )?);
                    pos += 8;
                    let image = read_bytes(payload, &mut pos)?;
                    pages.push((address, image));
                }
                JournalEntry::Changeset { txn_id, pages }
            }
            _ => return Err(Error::IntegrityViolated("unrecognized journal entry tag")),
        })
    }
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
    buf.extend_from_slice(&len_buf);
    buf.extend_from_slice(bytes);
}

fn read_bytes(buf: &[u8], pos: &mut usize) -> Result<Vec<u8>> {
    let len = LittleEndian::read_u32(
        buf.get(*pos..*pos + 4)
            .ok_or(Error::IntegrityViolated("journal record truncated (len)"))?,
    ) as usize;
    *pos += 4;
    let bytes = buf
        .get(*pos..*pos + len)
        .ok_or(Error::IntegrityViolated("journal record truncated (bytes)"))?
        .to_vec();
    *pos += len;
    Ok(bytes)
}

/// Encode one record as `[tag:1][txn_id:8][len:4][payload][crc32:4]`.
fn encode_record(entry: &JournalEntry) -> Vec<u8> {
    let payload = entry.encode_payload();
    let mut record = Vec::with_capacity(1 + 8 + 4 + payload.len() + 4);
    record.push(entry.type_tag());
    let mut id_buf = [0u8; 8];
    LittleEndian::write_u64(&mut id_buf, entry.txn_id());
    record.extend_from_slice(&id_buf);
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, payload.len() as u32);
    record.extend_from_slice(&len_buf);
    record.extend_from_slice(&payload);
    let crc = crc32fast::hash(&record);
    record.extend_from_slice(&crc.to_le_bytes());
    record
}

fn decode_all(bytes: &[u8]) -> Vec<JournalEntry> {
    let mut entries = Vec::new();
    let mut pos = FILE_HEADER_LEN.min(bytes.len());
    while pos + 1 + 8 + 4 <= bytes.len() {
        let tag = bytes[pos];
        let txn_id = LittleEndian::read_u64(&bytes[pos + 1..pos + 9]);
        let payload_len = LittleEndian::read_u32(&bytes[pos + 9..pos + 13]) as usize;
        let record_len = 1 + 8 + 4 + payload_len + 4;
        if pos + record_len > bytes.len() {
            break; // a torn write at the tail; stop here (spec §4.6 "torn tail tolerance")
        }
        let record = &bytes[pos..pos + record_len];
        let stored_crc = LittleEndian::read_u32(&record[record_len - 4..]);
        let computed_crc = crc32fast::hash(&record[..record_len - 4]);
        if stored_crc != computed_crc {
            break;
        }
        let payload = &bytes[pos + 13..pos + 13 + payload_len];
        match JournalEntry::decode(tag, txn_id, payload) {
            Ok(entry) => entries.push(entry),
            Err(_) => break,
        }
        pos += record_len;
    }
    entries
}

struct JournalFile {
    path: PathBuf,
    file: File,
    entry_count: usize,
    generation: u64,
}

impl JournalFile {
    fn open_or_create(path: PathBuf, generation: u64) -> Result<Self> {
        let fresh = !path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if fresh {
            let mut header = [0u8; FILE_HEADER_LEN];
            LittleEndian::write_u64(&mut header, generation);
            file.write_all(&header)?;
            file.flush()?;
        }
        Ok(Self {
            path,
            file,
            entry_count: 0,
            generation,
        })
    }

    fn reset(&mut self, generation: u64) -> Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; FILE_HEADER_LEN];
        LittleEndian::write_u64(&mut header, generation);
        self.file.write_all(&header)?;
        self.file.flush()?;
        self.generation = generation;
        self.entry_count = 0;
        Ok(())
    }

    fn append(&mut self, entry: &JournalEntry, fsync: bool) -> Result<()> {
        let record = encode_record(entry);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&record)?;
        if fsync {
            self.file.sync_data()?;
        }
        self.entry_count += 1;
        Ok(())
    }

    fn read_all(&mut self) -> Result<(u64, Vec<JournalEntry>)> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::new();
        self.file.read_to_end(&mut bytes)?;
        if bytes.len() < FILE_HEADER_LEN {
            return Ok((0, Vec::new()));
        }
        let generation = LittleEndian::read_u64(&bytes[..FILE_HEADER_LEN]);
        Ok((generation, decode_all(&bytes)))
    }
}

/// The two-file rotating journal.
pub struct Journal {
    files: [JournalFile; 2],
    active: usize,
    rotation_threshold: usize,
    fsync_on_commit: bool,
    next_generation: u64,
}

/// Sibling journal file path: `<base>.jrn0` / `<base>.jrn1`, alongside
/// `base` rather than inside a subdirectory of it.
fn sibling_path(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl Journal {
    pub fn create<P: AsRef<Path>>(base: P, rotation_threshold: usize, fsync_on_commit: bool) -> Result<Self> {
        let base = base.as_ref();
        let f0 = JournalFile::open_or_create(sibling_path(base, ".jrn0"), 0)?;
        let f1 = JournalFile::open_or_create(sibling_path(base, ".jrn1"), 1)?;
        Ok(Self {
            files: [f0, f1],
            active: 0,
            rotation_threshold,
            fsync_on_commit,
            next_generation: 2,
        })
    }

    /// Read both files and return their entries ordered oldest generation
    /// first, along with which file is the (now) active one to keep writing.
    pub fn recover<P: AsRef<Path>>(
        base: P,
        rotation_threshold: usize,
        fsync_on_commit: bool,
    ) -> Result<(Self, Vec<JournalEntry>)> {
        let base = base.as_ref();
        let mut f0 = JournalFile::open_or_create(sibling_path(base, ".jrn0"), 0)?;
        let mut f1 = JournalFile::open_or_create(sibling_path(base, ".jrn1"), 1)?;
        let (gen0, entries0) = f0.read_all()?;
        let (gen1, entries1) = f1.read_all()?;

        let (ordered, active, next_generation) = if gen0 <= gen1 {
            (
                [entries0, entries1].concat(),
                1,
                gen1.max(gen0) + 1,
            )
        } else {
            (
                [entries1, entries0].concat(),
                0,
                gen0.max(gen1) + 1,
            )
        };

        f0.entry_count = 0;
        f1.entry_count = 0;
        let journal = Self {
            files: [f0, f1],
            active,
            rotation_threshold,
            fsync_on_commit,
            next_generation,
        };
        Ok((journal, ordered))
    }

    fn active_file(&mut self) -> &mut JournalFile {
        &mut self.files[self.active]
    }

    fn maybe_rotate(&mut self) -> Result<()> {
        if self.active_file().entry_count < self.rotation_threshold {
            return Ok(());
        }
        let next = 1 - self.active;
        let generation = self.next_generation;
        self.next_generation += 1;
        self.files[next].reset(generation)?;
        self.active = next;
        Ok(())
    }

    pub fn log_begin(&mut self, txn_id: u64) -> Result<()> {
        self.active_file().append(&JournalEntry::TxnBegin { txn_id }, false)
    }

    pub fn log_insert(&mut self, txn_id: u64, key: &[u8], value: &[u8], flags: u32) -> Result<()> {
        self.active_file().append(
            &JournalEntry::Insert {
                txn_id,
                key: key.to_vec(),
                value: value.to_vec(),
                flags: flags as u8,
            },
            false,
        )
    }

    pub fn log_erase(&mut self, txn_id: u64, key: &[u8]) -> Result<()> {
        self.active_file()
            .append(&JournalEntry::Erase { txn_id, key: key.to_vec() }, false)
    }

    pub fn log_commit(&mut self, txn_id: u64) -> Result<()> {
        let fsync = self.fsync_on_commit;
        self.active_file()
            .append(&JournalEntry::TxnCommit { txn_id }, fsync)?;
        self.maybe_rotate()
    }

    pub fn log_abort(&mut self, txn_id: u64) -> Result<()> {
        self.active_file().append(&JournalEntry::TxnAbort { txn_id }, false)
    }

    /// Write a physical redo record for everything a flush-to-tree pass is
    /// about to materialize (spec §4.6 "changeset logging").
    pub fn log_changeset(&mut self, txn_id: u64, changeset: &Changeset) -> Result<()> {
        let mut pages = Vec::with_capacity(changeset.len());
        for handle in changeset.pages() {
            let guard = handle.lock().unwrap_or_else(|p| p.into_inner());
            pages.push((guard.address(), guard.raw().to_vec()));
        }
        let fsync = self.fsync_on_commit;
        self.active_file()
            .append(&JournalEntry::Changeset { txn_id, pages }, fsync)?;
        self.maybe_rotate()
    }

    /// Discard both files' content after a checkpoint made them redundant
    /// (every page image they describe is now durable in the tree).
    pub fn checkpoint(&mut self) -> Result<()> {
        let gen_a = self.next_generation;
        let gen_b = self.next_generation + 1;
        self.next_generation += 2;
        self.files[0].reset(gen_a)?;
        self.files[1].reset(gen_b)?;
        self.active = 0;
        Ok(())
    }
}

/// Split recovered entries into the last physical changeset (the redo
/// image to apply directly) and the logical operations of committed
/// transactions recorded after it (spec §4.6 "recovery algorithm").
pub fn plan_recovery(entries: Vec<JournalEntry>) -> (Option<Vec<(u64, Vec<u8>)>>, Vec<JournalEntry>) {
    let last_changeset_pos = entries
        .iter()
        .rposition(|e| matches!(e, JournalEntry::Changeset { .. }));

    let Some(pos) = last_changeset_pos else {
        return (None, filter_committed(&entries, 0));
    };
    let JournalEntry::Changeset { pages, .. } = &entries[pos] else {
        unreachable!()
    };
    (Some(pages.clone()), filter_committed(&entries, pos + 1))
}

/// Of the logical entries after `from`, keep only `Insert`/`Erase` whose
/// transaction reached a `TxnCommit` somewhere in the full log and never an
/// abort.
fn filter_committed(entries: &[JournalEntry], from: usize) -> Vec<JournalEntry> {
    use std::collections::HashSet;
    let mut committed = HashSet::new();
    let mut aborted = HashSet::new();
    for entry in entries {
        match entry {
            JournalEntry::TxnCommit { txn_id } => {
                committed.insert(*txn_id);
            }
            JournalEntry::TxnAbort { txn_id } => {
                aborted.insert(*txn_id);
            }
            _ => {}
        }
    }
    entries[from..]
        .iter()
        .filter(|e| match e {
            JournalEntry::Insert { txn_id, .. } | JournalEntry::Erase { txn_id, .. } => {
                committed.contains(txn_id) && !aborted.contains(txn_id)
            }
            _ => false,
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_entries_round_trip_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("test.db");
        {
            let mut journal = Journal::create(&base, 1024, false).unwrap();
            journal.log_begin(1).unwrap();
            journal.log_insert(1, b"k1", b"v1", 0).unwrap();
            journal.log_commit(1).unwrap();
        }
        let (_, entries) = Journal::recover(&base, 1024, false).unwrap();
        assert!(entries.iter().any(|e| matches!(e, JournalEntry::Insert { key, .. } if key == b"k1")));
    }

    #[test]
    fn aborted_transaction_is_excluded_from_recovery_plan() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("test.db");
        {
            let mut journal = Journal::create(&base, 1024, false).unwrap();
            journal.log_begin(1).unwrap();
            journal.log_insert(1, b"k1", b"v1", 0).unwrap();
            journal.log_abort(1).unwrap();
            journal.log_begin(2).unwrap();
            journal.log_insert(2, b"k2", b"v2", 0).unwrap();
            journal.log_commit(2).unwrap();
        }
        let (_, entries) = Journal::recover(&base, 1024, false).unwrap();
        let (changeset, logical) = plan_recovery(entries);
        assert!(changeset.is_none());
        assert_eq!(logical.len(), 1);
        assert!(matches!(&logical[0], JournalEntry::Insert { key, .. } if key == b"k2"));
    }

    #[test]
    fn rotation_switches_active_file_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("test.db");
        let mut journal = Journal::create(&base, 2, false).unwrap();
        journal.log_begin(1).unwrap();
        journal.log_insert(1, b"a", b"1", 0).unwrap();
        journal.log_commit(1).unwrap();
        assert_eq!(journal.active, 1);
    }
}
