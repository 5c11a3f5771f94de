//! Put and get transfer flows
//!
//! Each flow is a small state machine driven by the service for one call.
//!
//! Put: `Opened -> Streaming -> Committing -> {Acked, Aborted}`
//!
//! Get: `Resolving -> Streaming -> {Completed, Aborted}`
//!
//! A put only touches the catalog on commit. A get streams from an `Arc`
//! of a committed, immutable buffer, so stopping early cannot affect the
//! catalog.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::datatypes::{Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::buffer::ChunkedTable;
use crate::catalog::{Catalog, CommitReceipt, StagingHandle};
use crate::key::TableKey;
use crate::{HangarError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutState {
    Opened,
    Streaming,
    Committing,
    Acked,
    Aborted,
}

impl PutState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PutState::Acked | PutState::Aborted)
    }
}

/// Reject schemas no table can be built from
pub fn validate_schema(schema: &Schema) -> Result<()> {
    if schema.fields().is_empty() {
        return Err(HangarError::InvalidSchema("schema has no fields".to_string()));
    }
    let mut seen = HashSet::with_capacity(schema.fields().len());
    for field in schema.fields() {
        if field.name().is_empty() {
            return Err(HangarError::InvalidSchema("empty field name".to_string()));
        }
        if !seen.insert(field.name().as_str()) {
            return Err(HangarError::InvalidSchema(format!(
                "duplicate field name {:?}",
                field.name()
            )));
        }
    }
    Ok(())
}

/// Server side of one put call
pub struct PutFlow {
    catalog: Arc<Catalog>,
    key: TableKey,
    staging: Option<StagingHandle>,
    state: PutState,
    batches: usize,
}

impl PutFlow {
    pub fn open(catalog: Arc<Catalog>, key: TableKey) -> Self {
        let staging = catalog.put_begin(key.clone());
        Self {
            catalog,
            key,
            staging: Some(staging),
            state: PutState::Opened,
            batches: 0,
        }
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn state(&self) -> PutState {
        self.state
    }

    /// Schema message. The first one moves the flow to `Streaming`; later
    /// ones must agree with it.
    pub fn on_schema(&mut self, schema: SchemaRef) -> Result<()> {
        match self.state {
            PutState::Opened => {
                if let Err(e) = validate_schema(&schema) {
                    return Err(self.fail(e));
                }
                self.declare(schema)?;
                self.state = PutState::Streaming;
                Ok(())
            }
            PutState::Streaming => self.declare(schema),
            state => Err(self.illegal("schema", state)),
        }
    }

    pub fn on_batch(&mut self, batch: RecordBatch) -> Result<()> {
        if self.state != PutState::Streaming {
            let state = self.state;
            return Err(self.illegal("batch", state));
        }
        let staging = match self.staging.as_mut() {
            Some(staging) => staging,
            None => return Err(self.fail(missing_staging())),
        };
        if let Err(e) = self.catalog.put_append(staging, batch) {
            return Err(self.fail(e));
        }
        self.batches += 1;
        Ok(())
    }

    /// Commit only if the client's declared row count matches what arrived.
    pub fn commit(&mut self, expected_rows: usize) -> Result<CommitReceipt> {
        if self.state == PutState::Streaming {
            let received = self.staging.as_ref().map_or(0, StagingHandle::num_rows);
            if received != expected_rows {
                return Err(self.fail(HangarError::Aborted(format!(
                    "commit declares {} rows, {} were received",
                    expected_rows, received
                ))));
            }
        }
        self.close()
    }

    /// The inbound stream ended without a commit.
    pub fn disconnect(&mut self) -> HangarError {
        self.fail(HangarError::Disconnected(
            "put stream ended before commit".to_string(),
        ))
    }

    /// The client finished sending: commit and acknowledge.
    pub fn close(&mut self) -> Result<CommitReceipt> {
        match self.state {
            PutState::Streaming => {}
            PutState::Opened => {
                return Err(self.fail(HangarError::InvalidSchema(
                    "put stream closed before a schema was sent".to_string(),
                )))
            }
            state => return Err(self.illegal("close", state)),
        }

        self.state = PutState::Committing;
        let staging = match self.staging.take() {
            Some(staging) => staging,
            None => return Err(self.fail(missing_staging())),
        };
        let receipt = self.catalog.put_commit(staging);
        self.state = PutState::Acked;
        log::debug!(
            "put {} committed: {} rows in {} batches, {} bytes",
            self.key,
            receipt.rows,
            receipt.batches,
            receipt.bytes
        );
        Ok(receipt)
    }

    /// Discard everything staged so far. No-op once terminal.
    pub fn abort(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        log::warn!(
            "put {} aborted in {:?} after {} batches: {}",
            self.key,
            self.state,
            self.batches,
            reason
        );
        self.staging = None;
        self.state = PutState::Aborted;
    }

    fn declare(&mut self, schema: SchemaRef) -> Result<()> {
        let result = match self.staging.as_mut() {
            Some(staging) => staging.declare_schema(schema),
            None => Err(missing_staging()),
        };
        result.map_err(|e| self.fail(e))
    }

    fn fail(&mut self, err: HangarError) -> HangarError {
        self.abort(&err.to_string());
        err
    }

    fn illegal(&mut self, event: &str, state: PutState) -> HangarError {
        self.fail(HangarError::Aborted(format!(
            "unexpected {} while put is {:?}",
            event, state
        )))
    }
}

impl Drop for PutFlow {
    fn drop(&mut self) {
        self.abort("flow dropped before close");
    }
}

fn missing_staging() -> HangarError {
    HangarError::Aborted("put has no staging buffer".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetState {
    Resolving,
    Streaming,
    Completed,
    Aborted,
}

/// Server side of one get call; iterates the table's batches in append order.
pub struct GetFlow {
    key: TableKey,
    table: Option<Arc<ChunkedTable>>,
    next: usize,
    state: GetState,
}

impl GetFlow {
    pub fn new(key: TableKey) -> Self {
        Self {
            key,
            table: None,
            next: 0,
            state: GetState::Resolving,
        }
    }

    /// Resolve and start streaming in one step
    pub fn open(catalog: &Catalog, key: TableKey) -> Result<Self> {
        let mut flow = Self::new(key);
        flow.resolve(catalog)?;
        Ok(flow)
    }

    /// Look the key up. A miss aborts the flow before any stream exists.
    pub fn resolve(&mut self, catalog: &Catalog) -> Result<SchemaRef> {
        if self.state != GetState::Resolving {
            return Err(HangarError::Aborted(format!(
                "get {} resolved twice",
                self.key
            )));
        }
        match catalog.get(&self.key) {
            Ok(table) => {
                let schema = table.summary().schema;
                self.table = Some(table);
                self.state = GetState::Streaming;
                Ok(schema)
            }
            Err(e) => {
                self.state = GetState::Aborted;
                Err(e)
            }
        }
    }

    pub fn key(&self) -> &TableKey {
        &self.key
    }

    pub fn state(&self) -> GetState {
        self.state
    }

    pub fn remaining(&self) -> usize {
        match (&self.table, self.state) {
            (Some(table), GetState::Streaming) => table.num_batches() - self.next,
            _ => 0,
        }
    }

    /// Stop early. The catalog is untouched.
    pub fn abort(&mut self) {
        if self.state == GetState::Streaming {
            log::debug!(
                "get {} stopped after {} batches",
                self.key,
                self.next
            );
            self.state = GetState::Aborted;
        }
        self.table = None;
    }
}

impl Iterator for GetFlow {
    type Item = RecordBatch;

    fn next(&mut self) -> Option<RecordBatch> {
        if self.state != GetState::Streaming {
            return None;
        }
        let batch = self
            .table
            .as_ref()
            .and_then(|table| table.batches().get(self.next).cloned());
        match batch {
            Some(batch) => {
                self.next += 1;
                Some(batch)
            }
            None => {
                self.state = GetState::Completed;
                self.table = None;
                None
            }
        }
    }
}

impl Drop for GetFlow {
    fn drop(&mut self) {
        self.abort();
    }
}
