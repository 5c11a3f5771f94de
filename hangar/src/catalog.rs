//! In-memory table catalog
//!
//! Maps [`TableKey`]s to committed [`ChunkedTable`]s. Puts are staged in a
//! private buffer and only become visible on commit, when the new buffer
//! replaces any previous entry in one swap under the map's write lock.
//! Committed buffers are shared as `Arc`s and never mutated again, so
//! readers holding one see a consistent table however long they keep it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::buffer::{ChunkedTable, TableSummary};
use crate::key::TableKey;
use crate::{HangarError, Result};

/// Outcome of a committed put, also sent to the client as the put ack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub rows: usize,
    pub bytes: usize,
    pub batches: usize,
    /// Whether a previously committed entry was replaced
    pub replaced: bool,
}

/// A put in progress. Dropping it without committing discards the data.
pub struct StagingHandle {
    key: TableKey,
    buffer: ChunkedTable,
    staged: Arc<AtomicUsize>,
}

impl StagingHandle {
    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn declare_schema(&mut self, schema: SchemaRef) -> Result<()> {
        self.buffer.declare_schema(schema)
    }

    pub fn has_schema(&self) -> bool {
        self.buffer.schema().is_some()
    }

    pub fn num_rows(&self) -> usize {
        self.buffer.num_rows()
    }
}

impl Drop for StagingHandle {
    fn drop(&mut self) {
        self.staged.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Lazy listing over the entries present when `Catalog::list` was called.
///
/// Holds no lock; concurrent puts and drops neither show up in nor disturb
/// an ongoing iteration.
pub struct CatalogListing {
    entries: std::vec::IntoIter<(TableKey, Arc<ChunkedTable>)>,
}

impl Iterator for CatalogListing {
    type Item = (TableKey, TableSummary);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries
            .next()
            .map(|(key, table)| (key, table.summary()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for CatalogListing {}

/// Thread-safe key -> table store
pub struct Catalog {
    tables: RwLock<AHashMap<TableKey, Arc<ChunkedTable>>>,
    staged: Arc<AtomicUsize>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(AHashMap::new()),
            staged: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start a put. The returned handle is invisible to `get` and `list`.
    pub fn put_begin(&self, key: TableKey) -> StagingHandle {
        self.staged.fetch_add(1, Ordering::Relaxed);
        StagingHandle {
            key,
            buffer: ChunkedTable::new(),
            staged: Arc::clone(&self.staged),
        }
    }

    pub fn put_append(&self, handle: &mut StagingHandle, batch: RecordBatch) -> Result<()> {
        handle.buffer.append(batch)
    }

    /// Publish the staged buffer as the entry for its key.
    pub fn put_commit(&self, mut handle: StagingHandle) -> CommitReceipt {
        let key = handle.key.clone();
        let buffer = std::mem::take(&mut handle.buffer);
        drop(handle);

        let mut receipt = CommitReceipt {
            rows: buffer.num_rows(),
            bytes: buffer.byte_size(),
            batches: buffer.num_batches(),
            replaced: false,
        };
        let previous = self.tables.write().insert(key, Arc::new(buffer));
        receipt.replaced = previous.is_some();
        receipt
    }

    pub fn get(&self, key: &TableKey) -> Result<Arc<ChunkedTable>> {
        self.tables
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| HangarError::NotFound(key.to_string()))
    }

    pub fn contains(&self, key: &TableKey) -> bool {
        self.tables.read().contains_key(key)
    }

    /// Snapshot of the committed entries, ordered by key
    pub fn list(&self) -> CatalogListing {
        let mut entries: Vec<(TableKey, Arc<ChunkedTable>)> = self
            .tables
            .read()
            .iter()
            .map(|(key, table)| (key.clone(), Arc::clone(table)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        CatalogListing {
            entries: entries.into_iter(),
        }
    }

    /// Remove one entry and hand it back. The write lock is released before
    /// the caller lets go of the table.
    pub fn drop_table(&self, key: &TableKey) -> Result<Arc<ChunkedTable>> {
        let removed = self.tables.write().remove(key);
        removed.ok_or_else(|| HangarError::NotFound(key.to_string()))
    }

    /// Remove every entry; returns how many were removed
    pub fn clear(&self) -> usize {
        let removed = std::mem::take(&mut *self.tables.write());
        removed.len()
    }

    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    /// Number of puts begun but neither committed nor discarded
    pub fn staged_puts(&self) -> usize {
        self.staged.load(Ordering::Relaxed)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
