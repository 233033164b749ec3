//! Lifecycle coordinator: one context per open notebook.
//!
//! ## Context lifecycle
//!
//! 1. Host reports a notebook open → wait for it to materialize, capture the
//!    initial snapshot, start the document watcher, attach an observer to
//!    every code cell.
//! 2. While open, the watcher and observers own all automatic execution.
//! 3. Host reports the notebook closed → every subscription, timer and
//!    pending insertion task for it is aborted and the context is dropped.
//!    Notifications that arrive afterwards reach nobody.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use log::{info, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::config::{AutorunConfig, EnabledFlag, ToggleCommand};
use crate::dispatch::{Dispatcher, ExecutionRecord};
use crate::document::{DocumentError, NotebookDocument, NotebookTracker, TrackerEvent};
use crate::observer::{self, Subscription};
use crate::snapshot::Snapshot;
use crate::watcher::{self, WatchState};

/// Pieces every component reads: the enabled flag, the dispatcher and timings.
#[derive(Debug, Clone)]
pub(crate) struct Engine {
    pub enabled: EnabledFlag,
    pub dispatcher: Dispatcher,
    pub config: AutorunConfig,
}

/// Mutable per-document state. Only the coordinator and the document
/// watcher write it; the lock is never held across an `.await`.
pub(crate) struct ContextState {
    /// Reference snapshot, refreshed after every OOB cycle and structural change.
    pub snapshot: Snapshot,
    /// Snapshot from before the current burst of changes, while debouncing.
    pub baseline: Option<Snapshot>,
    pub watch: WatchState,
    /// Bumped whenever the debounce timer is re-armed; a timer that wakes up
    /// with an older generation does nothing.
    pub generation: u64,
    /// Debounce timer, which becomes the processing task when it fires.
    pub timer: Option<JoinHandle<()>>,
    /// Document-level subscription.
    pub watcher: Option<Subscription>,
    /// One realtime observer per code cell, keyed by cell id.
    pub observers: HashMap<String, Subscription>,
    /// Settle tasks for freshly inserted cells.
    pub pending: Vec<JoinHandle<()>>,
    pub closed: bool,
}

pub(crate) struct DocumentContext {
    pub doc: Arc<dyn NotebookDocument>,
    pub engine: Engine,
    state: StdMutex<ContextState>,
}

impl DocumentContext {
    fn new(doc: Arc<dyn NotebookDocument>, engine: Engine, snapshot: Snapshot) -> Self {
        Self {
            doc,
            engine,
            state: StdMutex::new(ContextState {
                snapshot,
                baseline: None,
                watch: WatchState::Idle,
                generation: 0,
                timer: None,
                watcher: None,
                observers: HashMap::new(),
                pending: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bring the observer set in line with the reference snapshot: attach to
    /// code cells without a running observer, release observers of cells that
    /// are gone or are no longer code.
    ///
    /// An observer whose feed closed (its cell was deleted) is dead even if a
    /// cell with the same id has since come back, so it is replaced.
    pub fn sync_observers(&self, state: &mut ContextState) {
        if state.closed {
            return;
        }
        let snapshot = state.snapshot.clone();
        let live: HashSet<&str> = snapshot.code_cell_ids().collect();

        state
            .observers
            .retain(|id, sub| live.contains(id.as_str()) && sub.is_active());

        for cell_id in snapshot.code_cell_ids() {
            if state.observers.contains_key(cell_id) {
                continue;
            }
            if let Some(sub) =
                observer::attach(self.doc.clone(), cell_id.to_string(), self.engine.clone())
            {
                state.observers.insert(cell_id.to_string(), sub);
            }
        }
    }

    /// Attach an observer to one cell unless it already has a running one.
    pub fn observe_cell(&self, cell_id: &str) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if state
            .observers
            .get(cell_id)
            .is_some_and(Subscription::is_active)
        {
            return;
        }
        if let Some(sub) =
            observer::attach(self.doc.clone(), cell_id.to_string(), self.engine.clone())
        {
            state.observers.insert(cell_id.to_string(), sub);
        }
    }

    /// Release everything held for this document. Returns the number of
    /// subscriptions released (cell observers plus the document watcher).
    fn close(&self) -> usize {
        let mut state = self.lock();
        if state.closed {
            return 0;
        }
        state.closed = true;

        let released = state.observers.len() + usize::from(state.watcher.is_some());
        state.observers.clear();
        state.watcher = None;

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        for task in state.pending.drain(..) {
            task.abort();
        }
        state.baseline = None;
        state.snapshot = Snapshot::default();
        state.watch = WatchState::Idle;
        released
    }
}

/// Watches open notebooks and re-runs cells that collaborators or
/// out-of-band writes change.
pub struct Autorun {
    engine: Engine,
    documents: StdMutex<HashMap<String, Arc<DocumentContext>>>,
}

impl Default for Autorun {
    fn default() -> Self {
        Self::new(AutorunConfig::default())
    }
}

impl Autorun {
    pub fn new(config: AutorunConfig) -> Self {
        Self::with_flag(config, EnabledFlag::default())
    }

    /// Use an enabled flag the host already shares with other components.
    pub fn with_flag(config: AutorunConfig, enabled: EnabledFlag) -> Self {
        let dispatcher = Dispatcher::new(ExecutionRecord::new(), config.cooldown());
        Self {
            engine: Engine {
                enabled,
                dispatcher,
                config,
            },
            documents: StdMutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> &EnabledFlag {
        &self.engine.enabled
    }

    pub fn config(&self) -> &AutorunConfig {
        &self.engine.config
    }

    pub fn execution_record(&self) -> &ExecutionRecord {
        self.engine.dispatcher.record()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.engine.dispatcher
    }

    /// The `autorun:toggle` command bound to this instance's flag.
    pub fn toggle_command(&self) -> ToggleCommand {
        ToggleCommand::new(self.engine.enabled.clone())
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<String, Arc<DocumentContext>>> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Start observing a notebook.
    ///
    /// Waits for the document to materialize, then captures the initial
    /// snapshot, starts the document watcher and attaches an observer to every
    /// code cell. Opening an id that is already open replaces the old context.
    pub async fn open(&self, doc: Arc<dyn NotebookDocument>) -> Result<(), DocumentError> {
        doc.ready().await;

        let snapshot = Snapshot::capture(doc.as_ref())?;
        let notebook_id = doc.id().to_string();
        let ctx = Arc::new(DocumentContext::new(doc, self.engine.clone(), snapshot));

        let observed = {
            let mut state = ctx.lock();
            state.watcher = Some(watcher::spawn(&ctx));
            ctx.sync_observers(&mut state);
            state.observers.len()
        };

        let previous = self.documents().insert(notebook_id.clone(), ctx);
        if let Some(previous) = previous {
            warn!(
                "[autorun] {} was already open, replacing its observers",
                notebook_id
            );
            previous.close();
        }

        info!(
            "[autorun] Observing {} ({} code cell{})",
            notebook_id,
            observed,
            if observed == 1 { "" } else { "s" }
        );
        Ok(())
    }

    /// Stop observing a notebook. Returns the number of subscriptions released,
    /// or zero if the notebook was not open.
    pub fn close(&self, notebook_id: &str) -> usize {
        let ctx = self.documents().remove(notebook_id);
        match ctx {
            Some(ctx) => {
                let released = ctx.close();
                info!(
                    "[autorun] Closed {} ({} subscriptions released)",
                    notebook_id, released
                );
                released
            }
            None => 0,
        }
    }

    /// Stop observing every notebook.
    pub fn close_all(&self) {
        let contexts: Vec<_> = self.documents().drain().collect();
        for (notebook_id, ctx) in contexts {
            let released = ctx.close();
            info!(
                "[autorun] Closed {} ({} subscriptions released)",
                notebook_id, released
            );
        }
    }

    /// Follow a host tracker: open what is already open, then react to
    /// open/close notifications until the tracker goes away.
    pub async fn run(&self, tracker: &dyn NotebookTracker) {
        let mut events = tracker.subscribe();

        for doc in tracker.documents() {
            self.open_logged(doc).await;
        }

        loop {
            match events.recv().await {
                Ok(TrackerEvent::Opened(doc)) => self.open_logged(doc).await,
                Ok(TrackerEvent::Closed(notebook_id)) => {
                    self.close(&notebook_id);
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("[autorun] Missed {} tracker events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }

        info!("[autorun] Tracker closed, releasing all notebooks");
        self.close_all();
    }

    async fn open_logged(&self, doc: Arc<dyn NotebookDocument>) {
        let notebook_id = doc.id().to_string();
        if let Err(e) = self.open(doc).await {
            warn!("[autorun] Failed to observe {}: {}", notebook_id, e);
        }
    }

    /// Ids of the notebooks currently observed.
    pub fn open_documents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Active subscriptions for a notebook: one per code cell plus the
    /// document watcher.
    pub fn subscription_count(&self, notebook_id: &str) -> Option<usize> {
        let ctx = self.documents().get(notebook_id).cloned()?;
        let state = ctx.lock();
        Some(state.observers.len() + usize::from(state.watcher.is_some()))
    }

    /// Where the document watcher for a notebook currently is.
    pub fn watch_state(&self, notebook_id: &str) -> Option<WatchState> {
        let ctx = self.documents().get(notebook_id).cloned()?;
        let state = ctx.lock();
        Some(state.watch)
    }
}

impl Drop for Autorun {
    fn drop(&mut self) {
        self.close_all();
    }
}
