//! Document-level watcher for out-of-band (OOB) changes.
//!
//! Whole-document changes that no per-cell observer attributes to a peer
//! (a file reload, a bulk paste, a notebook rewritten by a tool) are caught
//! here by diffing snapshots.
//!
//! ## States
//!
//! ```text
//!            change              change (re-arm, keep baseline)
//!   Idle ──────────────► Capturing ──► Debouncing ◄──┐
//!    ▲                                    │  └───────┘
//!    │                      debounce fires│
//!    │                                    ▼
//!    └────────────────────────────── Processing
//!         diff done / failed         settle → snapshot → classify →
//!                                    dispatch each → fresh baseline
//! ```
//!
//! Change notifications that arrive while `Processing` are dropped. That is
//! what keeps a cycle's own executions (which rewrite outputs and execution
//! counts) from scheduling another cycle, and edits made meanwhile are folded
//! into the fresh snapshot taken at the end of the cycle.
//!
//! Structural insertions bypass the debounce: inserted code cells get an
//! observer after a short materialization delay, and cells a peer inserted are
//! run directly.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::coordinator::DocumentContext;
use crate::document::{DocumentError, DocumentEvent, Origin};
use crate::observer::Subscription;
use crate::snapshot::{classify, Snapshot};

/// Where a document watcher is in its change cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// No change seen since the last cycle.
    Idle,
    /// First change after quiet; the baseline is being captured.
    Capturing,
    /// Waiting for the quiet period to elapse.
    Debouncing,
    /// Settle, diff and dispatch in flight.
    Processing,
}

/// Subscribe to the document's change notifications and route them.
pub(crate) fn spawn(ctx: &Arc<DocumentContext>) -> Subscription {
    let mut rx = ctx.doc.subscribe();
    let ctx = Arc::clone(ctx);

    Subscription::new(tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(n)) => {
                    // Missed events may include content changes; treat as one.
                    warn!(
                        "[autorun-watch] {} missed {} document events",
                        ctx.doc.id(),
                        n
                    );
                    DocumentEvent::ContentChanged
                }
                Err(RecvError::Closed) => break,
            };
            handle_event(&ctx, event);
        }
        debug!("[autorun-watch] Event stream ended for {}", ctx.doc.id());
    }))
}

fn handle_event(ctx: &Arc<DocumentContext>, event: DocumentEvent) {
    match event {
        DocumentEvent::ContentChanged => on_content_changed(ctx),
        DocumentEvent::CellsInserted {
            index,
            count,
            origin,
        } => on_cells_inserted(ctx, index, count, origin),
        DocumentEvent::CellsRemoved { .. } => on_cells_removed(ctx),
    }
}

fn on_content_changed(ctx: &Arc<DocumentContext>) {
    if !ctx.engine.enabled.is_enabled() {
        return;
    }

    let mut state = ctx.lock();
    if state.closed || state.watch == WatchState::Processing {
        return;
    }

    if state.baseline.is_none() {
        state.watch = WatchState::Capturing;
        state.baseline = Some(state.snapshot.clone());
    }

    if let Some(timer) = state.timer.take() {
        timer.abort();
    }
    state.generation = state.generation.wrapping_add(1);
    state.watch = WatchState::Debouncing;

    let generation = state.generation;
    let debounce = ctx.engine.config.debounce();
    let task_ctx = Arc::clone(ctx);
    state.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(debounce).await;
        run_cycle(&task_ctx, generation).await;
    }));
}

/// One `Processing` pass. Entered when the debounce timer of `generation` fires.
async fn run_cycle(ctx: &Arc<DocumentContext>, generation: u64) {
    let baseline = {
        let mut state = ctx.lock();
        if state.closed
            || state.generation != generation
            || state.watch == WatchState::Processing
        {
            return;
        }
        state.watch = WatchState::Processing;
        state.baseline.clone().unwrap_or_else(|| state.snapshot.clone())
    };

    let result = process(ctx, &baseline).await;

    let mut state = ctx.lock();
    if state.closed {
        return;
    }
    match result {
        Ok(fresh) => {
            state.snapshot = fresh;
            state.baseline = None;
            ctx.sync_observers(&mut state);
        }
        Err(e) => {
            error!("[autorun-watch] Change cycle failed for {}: {}", ctx.doc.id(), e);
            // Start the next cycle from what the document holds now rather
            // than re-diffing against the discarded baseline.
            state.baseline = None;
            refresh_snapshot(ctx, &mut state.snapshot);
        }
    }
    state.watch = WatchState::Idle;
    state.timer = None;
}

/// Settle, diff against `baseline`, run every changed cell in ascending
/// order one at a time, and return the snapshot to use as the next reference.
async fn process(ctx: &DocumentContext, baseline: &Snapshot) -> Result<Snapshot, DocumentError> {
    tokio::time::sleep(ctx.engine.config.settle()).await;

    let current = Snapshot::capture(ctx.doc.as_ref())?;
    let changed = classify(baseline, &current);

    if !changed.is_empty() {
        info!(
            "[autorun-watch] {} changed cell{} in {}: {:?}",
            changed.len(),
            if changed.len() == 1 { "" } else { "s" },
            ctx.doc.id(),
            changed
        );
    }

    for index in changed {
        if !ctx.engine.enabled.is_enabled() {
            debug!("[autorun-watch] Auto-run disabled mid-cycle, stopping");
            break;
        }
        if ctx.doc.cell_at(index).is_none() {
            debug!("[autorun-watch] Cell {} vanished before dispatch", index);
            continue;
        }
        ctx.engine.dispatcher.dispatch(ctx.doc.as_ref(), index).await;
    }

    Snapshot::capture(ctx.doc.as_ref())
}

fn on_cells_inserted(ctx: &Arc<DocumentContext>, index: usize, count: usize, origin: Origin) {
    let mut state = ctx.lock();
    if state.closed {
        return;
    }
    state.pending.retain(|task| !task.is_finished());
    if !refresh_snapshot(ctx, &mut state.snapshot) {
        // Without a current snapshot the inserted ids are unknown; the next
        // change cycle attaches their observers.
        return;
    }

    let run = origin.is_remote() && ctx.engine.enabled.is_enabled();
    let delay = if run {
        ctx.engine.config.insert_settle()
    } else {
        ctx.engine.config.materialize()
    };

    // Positions shift if the document changes again before the delay ends,
    // so the inserted cells are carried by id.
    let inserted: Vec<String> = state
        .snapshot
        .cells()
        .iter()
        .skip(index)
        .take(count)
        .filter(|cell| cell.kind.is_code())
        .map(|cell| cell.id.clone())
        .collect();
    if inserted.is_empty() {
        return;
    }

    let task_ctx = Arc::clone(ctx);
    state.pending.push(tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        for cell_id in inserted {
            let position = match task_ctx.doc.position_of(&cell_id) {
                Some(position) => position,
                None => {
                    debug!(
                        "[autorun-watch] Inserted cell {} gone before settle",
                        cell_id
                    );
                    continue;
                }
            };
            task_ctx.observe_cell(&cell_id);
            if run {
                task_ctx
                    .engine
                    .dispatcher
                    .dispatch(task_ctx.doc.as_ref(), position)
                    .await;
            }
        }
    }));
}

fn on_cells_removed(ctx: &Arc<DocumentContext>) {
    let mut state = ctx.lock();
    if state.closed {
        return;
    }
    refresh_snapshot(ctx, &mut state.snapshot);
    ctx.sync_observers(&mut state);
}

/// Replace `snapshot` with a fresh capture. Returns `false` (and keeps the old
/// one) if the document could not be read.
fn refresh_snapshot(ctx: &DocumentContext, snapshot: &mut Snapshot) -> bool {
    match Snapshot::capture(ctx.doc.as_ref()) {
        Ok(fresh) => {
            *snapshot = fresh;
            true
        }
        Err(e) => {
            warn!(
                "[autorun-watch] Could not refresh snapshot for {}: {}",
                ctx.doc.id(),
                e
            );
            false
        }
    }
}
