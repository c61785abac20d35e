//! Durable append-only ledger backend.
//!
//! The ledger file *is* the store: every committed transaction appends
//! its entries before the in-memory state is touched, and reopening
//! replays the file from the header. Recovery and audit replay are the
//! same code path.
//!
//! # Crash safety
//! A torn write leaves a truncated or checksum-failing tail; recovery
//! keeps the longest valid prefix and truncates the rest, so the store
//! reopens at the last fully committed transaction boundary observed on
//! disk.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::entity::{Entity, EntityCategory, EntityId};
use crate::ledger::{ProvenanceEntry, ReplayState};
use crate::relationship::{RelationshipId, RelationshipRecord};
use crate::storage::memory::MemoryStore;
use crate::storage::traits::{CommitReceipt, KnowledgeStore, StorageError, Transaction};

use super::codec;
use super::file_lock::FileLock;

const LEDGER_FILE: &str = "ledger.canon";

/// Configuration for the durable backend.
#[derive(Debug, Clone, Copy)]
pub struct DurableConfig {
    /// Whether to fsync after every commit (slower but safer).
    pub sync_on_write: bool,
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self { sync_on_write: true }
    }
}

struct LedgerFileWriter {
    writer: BufWriter<File>,
    sync_on_write: bool,
}

impl LedgerFileWriter {
    /// Appends a batch of entries as one buffered write.
    fn append(&mut self, entries: &[ProvenanceEntry]) -> IoResult<()> {
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&codec::encode(entry)?);
        }
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        if self.sync_on_write {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// Durable knowledge store: in-memory state backed by an append-only
/// ledger file with CRC-checked framing and an exclusive file lock.
pub struct DurableStore {
    memory: MemoryStore,
    file: Mutex<LedgerFileWriter>,
    path: PathBuf,
    _lock: FileLock,
}

impl DurableStore {
    /// Opens or creates a durable store in `dir`.
    ///
    /// # Errors
    /// - [`StorageError::Backend`] if the directory cannot be prepared,
    ///   another process holds the lock, or I/O fails.
    /// - [`StorageError::Corrupt`] if the recovered prefix of the ledger
    ///   does not replay.
    pub fn open(dir: impl AsRef<Path>, config: DurableConfig) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let lock = FileLock::acquire(dir).map_err(io_err)?;

        let path = dir.join(LEDGER_FILE);
        let entries = if path.exists() {
            recover(&path).map_err(io_err)?
        } else {
            let mut file = File::create(&path).map_err(io_err)?;
            codec::write_header(&mut file).map_err(io_err)?;
            if config.sync_on_write {
                file.sync_all().map_err(io_err)?;
            }
            Vec::new()
        };

        debug!(entries = entries.len(), path = %path.display(), "ledger opened");

        let state = ReplayState::from_entries(&entries)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let memory = MemoryStore::from_parts(state, entries);

        let file = OpenOptions::new().append(true).open(&path).map_err(io_err)?;
        let writer = LedgerFileWriter {
            writer: BufWriter::new(file),
            sync_on_write: config.sync_on_write,
        };

        Ok(Self {
            memory,
            file: Mutex::new(writer),
            path,
            _lock: lock,
        })
    }

    /// Path of the backing ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_err(e: IoError) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Reads the longest valid prefix of the ledger file, truncating any
/// torn or corrupt tail.
fn recover(path: &Path) -> IoResult<Vec<ProvenanceEntry>> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let total_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    codec::read_header(&mut reader)?;
    let mut good_len = codec::HEADER_SIZE;
    let mut entries = Vec::new();

    loop {
        match codec::decode::<ProvenanceEntry>(&mut reader) {
            Ok(entry) => {
                entries.push(entry);
                good_len = reader.stream_position()?;
            }
            Err(e) => {
                if good_len < total_len {
                    warn!(
                        recovered = entries.len(),
                        discarded_bytes = total_len - good_len,
                        error = %e,
                        "ledger tail unreadable; truncating to last valid entry"
                    );
                    let file = reader.into_inner();
                    file.set_len(good_len)?;
                }
                break;
            }
        }
    }

    Ok(entries)
}

impl KnowledgeStore for DurableStore {
    fn commit(&self, txn: Transaction) -> Result<CommitReceipt, StorageError> {
        self.memory.commit_with(&txn, |entries| {
            let mut file = self
                .file
                .lock()
                .map_err(|_| StorageError::Backend("poisoned lock: ledger file".to_string()))?;
            file.append(entries).map_err(io_err)
        })
    }

    fn entity(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        self.memory.entity(id)
    }

    fn entity_raw(&self, id: EntityId) -> Result<Option<Entity>, StorageError> {
        self.memory.entity_raw(id)
    }

    fn entities_by_category(
        &self,
        category: EntityCategory,
    ) -> Result<Vec<Entity>, StorageError> {
        self.memory.entities_by_category(category)
    }

    fn relationship(
        &self,
        id: RelationshipId,
    ) -> Result<Option<RelationshipRecord>, StorageError> {
        self.memory.relationship(id)
    }

    fn relationships_for(
        &self,
        entity: EntityId,
    ) -> Result<Vec<RelationshipRecord>, StorageError> {
        self.memory.relationships_for(entity)
    }

    fn relationships(&self) -> Result<Vec<RelationshipRecord>, StorageError> {
        self.memory.relationships()
    }

    fn ledger(&self) -> Result<Vec<ProvenanceEntry>, StorageError> {
        self.memory.ledger()
    }

    fn ledger_for_entity(&self, id: EntityId) -> Result<Vec<ProvenanceEntry>, StorageError> {
        self.memory.ledger_for_entity(id)
    }

    fn ledger_len(&self) -> Result<u64, StorageError> {
        self.memory.ledger_len()
    }

    fn snapshot(&self) -> Result<ReplayState, StorageError> {
        self.memory.snapshot()
    }
}
