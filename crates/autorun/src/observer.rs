//! Realtime edit observer: one per code cell.
//!
//! With a collaborative feed, only remote-origin text changes trigger a run.
//! With a coarse feed the origin is unknown, so "remote" is approximated as
//! "not the cell the local user is editing". That approximation can miss a
//! peer's edit to the locally active cell and can fire on a local programmatic
//! edit to some other cell; it is kept as-is.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;

use crate::coordinator::Engine;
use crate::document::{CellChange, NotebookDocument, SourceFeed, TextChange};

/// One detach action. Releasing (or dropping) it stops the task behind it.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Stop receiving notifications.
    pub fn release(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Subscribe to the cell's change notifications. `None` if the document no
/// longer has the cell.
pub(crate) fn attach(
    doc: Arc<dyn NotebookDocument>,
    cell_id: String,
    engine: Engine,
) -> Option<Subscription> {
    let task = match doc.subscribe_source(&cell_id)? {
        SourceFeed::Collaborative(rx) => {
            tokio::spawn(watch_collaborative(doc, cell_id, rx, engine))
        }
        SourceFeed::Coarse(rx) => {
            debug!(
                "[autorun-observer] No collaborative text for {}, using coarse feed",
                cell_id
            );
            tokio::spawn(watch_coarse(doc, cell_id, rx, engine))
        }
    };
    Some(Subscription::new(task))
}

async fn watch_collaborative(
    doc: Arc<dyn NotebookDocument>,
    cell_id: String,
    mut rx: Receiver<TextChange>,
    engine: Engine,
) {
    loop {
        let change = match rx.recv().await {
            Ok(change) => change,
            Err(RecvError::Lagged(n)) => {
                warn!("[autorun-observer] {} missed {} text changes", cell_id, n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if !engine.enabled.is_enabled() || !change.origin.is_remote() {
            continue;
        }
        if let Some(index) = doc.position_of(&cell_id) {
            engine.dispatcher.dispatch(doc.as_ref(), index).await;
        }
    }
}

async fn watch_coarse(
    doc: Arc<dyn NotebookDocument>,
    cell_id: String,
    mut rx: Receiver<CellChange>,
    engine: Engine,
) {
    loop {
        let change = match rx.recv().await {
            Ok(change) => change,
            Err(RecvError::Lagged(n)) => {
                warn!("[autorun-observer] {} missed {} cell changes", cell_id, n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        if change.source_delta == 0 || !engine.enabled.is_enabled() {
            continue;
        }
        let index = match doc.position_of(&cell_id) {
            Some(index) => index,
            None => continue,
        };
        if doc.active_cell() == Some(index) {
            continue;
        }
        if doc.cell_at(index).is_some_and(|c| c.kind.is_code()) {
            engine.dispatcher.dispatch(doc.as_ref(), index).await;
        }
    }
}
