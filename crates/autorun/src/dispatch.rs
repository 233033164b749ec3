//! Execution dispatch: decides whether a cell runs and asks the kernel to run it.
//!
//! A single logical edit usually reaches the dispatcher several times: once
//! per keystroke from the realtime observer, again when the document watcher
//! settles, and again from a structural re-scan. The per-cell cooldown in the
//! [`ExecutionRecord`] collapses those into one execution.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;

use crate::document::NotebookDocument;

/// Cell id → time of the last dispatched execution.
///
/// Shared by every open document. Entries are overwritten, never evicted;
/// staleness is purely a time comparison.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRecord {
    inner: Arc<StdMutex<HashMap<String, Instant>>>,
}

impl ExecutionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `now` for `cell_id` unless the last dispatch is within `cooldown`.
    ///
    /// Returns `false` when the cell is still cooling down. Check and record
    /// happen under one lock so two near-simultaneous triggers cannot both pass.
    pub fn try_claim(&self, cell_id: &str, now: Instant, cooldown: Duration) -> bool {
        let mut record = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = record.get(cell_id) {
            if now.saturating_duration_since(*last) < cooldown {
                return false;
            }
        }
        record.insert(cell_id.to_string(), now);
        true
    }

    /// When `cell_id` was last dispatched.
    pub fn last_dispatch(&self, cell_id: &str) -> Option<Instant> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cell_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What happened to one dispatch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The kernel ran the cell.
    Executed,
    /// No kernel attached; silently skipped.
    NoKernel,
    /// The position no longer refers to a cell.
    StaleIndex,
    /// The cell at the position is not a code cell.
    NotCode,
    /// The same cell id was dispatched within the cooldown window.
    CoolingDown,
    /// The kernel rejected or failed the execution (already logged).
    Failed,
}

/// Runs cells on behalf of the observers and the document watcher.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    record: ExecutionRecord,
    cooldown: Duration,
}

impl Dispatcher {
    pub fn new(record: ExecutionRecord, cooldown: Duration) -> Self {
        Self { record, cooldown }
    }

    pub fn record(&self) -> &ExecutionRecord {
        &self.record
    }

    /// Run the code cell at `index` unless it is missing, not code, the
    /// document has no kernel, or the cell id is cooling down.
    ///
    /// The active cell is moved to the target for the duration of the request
    /// and restored afterwards, whether the kernel succeeds or fails. Kernel
    /// failures are logged and reported as [`DispatchOutcome::Failed`]; they
    /// never propagate.
    pub async fn dispatch(&self, doc: &dyn NotebookDocument, index: usize) -> DispatchOutcome {
        if !doc.has_kernel() {
            debug!(
                "[autorun-dispatch] No kernel for {}, skipping cell {}",
                doc.id(),
                index
            );
            return DispatchOutcome::NoKernel;
        }

        let cell = match doc.cell_at(index) {
            Some(cell) => cell,
            None => return DispatchOutcome::StaleIndex,
        };
        if !cell.kind.is_code() {
            return DispatchOutcome::NotCode;
        }

        if !self.record.try_claim(&cell.id, Instant::now(), self.cooldown) {
            debug!(
                "[autorun-dispatch] Cell {} ({}) ran recently, skipping",
                index, cell.id
            );
            return DispatchOutcome::CoolingDown;
        }

        info!(
            "[autorun-dispatch] Running cell {} ({}) in {}",
            index,
            cell.id,
            doc.id()
        );

        doc.scroll_to_cell(index);
        let previous = doc.active_cell();
        doc.set_active_cell(Some(index));

        let result = doc.execute_cell(index).await;

        doc.set_active_cell(previous);

        match result {
            Ok(()) => DispatchOutcome::Executed,
            Err(e) => {
                warn!("[autorun-dispatch] Cell {} failed: {}", index, e);
                DispatchOutcome::Failed
            }
        }
    }
}
