//! Automerge-backed notebook that autorun can observe.
//!
//! Holds one replica of the notebook document and turns every mutation into
//! the notifications [`NotebookDocument`] promises. Edits made through this
//! replica are published as [`Origin::Local`]. Changes pulled in from a peer
//! (sync message or merge) are diffed cell by cell and published as
//! [`Origin::Remote`]. [`AutomergeNotebook::reload_cells`] replaces the cell
//! list wholesale, as when the file on disk is rewritten; it publishes no
//! per-cell text changes, so only the document watcher sees it.
//!
//! `ContentChanged` is always published before structural events so the
//! watcher captures its baseline before an insertion refreshes the reference
//! snapshot.
//!
//! ## Document schema
//!
//! ```text
//! ROOT/
//!   notebook_id: Str
//!   cells/                        ← List of Map
//!     [i]/
//!       id: Str                   ← cell UUID
//!       cell_type: Str            ← "code" | "markdown" | "raw"
//!       source: Text              ← Automerge Text CRDT
//!       execution_count: Str      ← JSON-encoded i32 or "null"
//!       outputs/                  ← List of Str
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use automerge::sync;
use automerge::sync::SyncDoc;
use automerge::transaction::Transactable;
use automerge::{AutoCommit, ObjId, ObjType, ReadDoc};
use jupyter_protocol::ExecuteRequest;
use log::{debug, info};
use tokio::sync::broadcast;

use crate::document::{
    CellKind, DocumentError, DocumentEvent, ExecutionError, NotebookDocument, Origin, SourceFeed,
    TextChange,
};
use crate::snapshot::CellSnapshot;

/// Upper bound on message exchanges in [`AutomergeNotebook::sync_with`].
const MAX_SYNC_ROUNDS: usize = 10;

/// Where execute requests go. Implemented by whatever owns the kernel.
#[async_trait]
pub trait KernelChannel: Send + Sync {
    async fn execute(&self, cell_id: &str, request: ExecuteRequest) -> Result<(), ExecutionError>;
}

/// One replica of a collaborative notebook.
pub struct AutomergeNotebook {
    notebook_id: String,
    doc: StdMutex<AutoCommit>,
    events_tx: broadcast::Sender<DocumentEvent>,
    text_txs: StdMutex<HashMap<String, broadcast::Sender<TextChange>>>,
    kernel: StdMutex<Option<Arc<dyn KernelChannel>>>,
    active_cell: StdMutex<Option<usize>>,
    scrolled_to: StdMutex<Option<usize>>,
}

impl AutomergeNotebook {
    /// Create a new empty notebook with the given id.
    pub fn new(notebook_id: &str) -> Self {
        let mut doc = AutoCommit::new();
        let _ = doc.put(automerge::ROOT, "notebook_id", notebook_id);
        let _ = doc.put_object(automerge::ROOT, "cells", ObjType::List);
        Self::from_doc(notebook_id, doc)
    }

    /// A replica with no content yet, to be filled by syncing with a peer.
    pub fn empty_replica(notebook_id: &str) -> Self {
        Self::from_doc(notebook_id, AutoCommit::new())
    }

    /// Load a replica from saved bytes.
    pub fn load(notebook_id: &str, data: &[u8]) -> Result<Self, DocumentError> {
        let doc = AutoCommit::load(data)?;
        Ok(Self::from_doc(notebook_id, doc))
    }

    fn from_doc(notebook_id: &str, doc: AutoCommit) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            notebook_id: notebook_id.to_string(),
            doc: StdMutex::new(doc),
            events_tx,
            text_txs: StdMutex::new(HashMap::new()),
            kernel: StdMutex::new(None),
            active_cell: StdMutex::new(None),
            scrolled_to: StdMutex::new(None),
        }
    }

    fn doc(&self) -> MutexGuard<'_, AutoCommit> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serialize the replica to bytes.
    pub fn save(&self) -> Vec<u8> {
        self.doc().save()
    }

    // ── Kernel ──────────────────────────────────────────────────────

    pub fn attach_kernel(&self, kernel: Arc<dyn KernelChannel>) {
        *self.kernel.lock().unwrap_or_else(PoisonError::into_inner) = Some(kernel);
    }

    pub fn detach_kernel(&self) {
        *self.kernel.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Last cell the view was asked to scroll to.
    pub fn scrolled_to(&self) -> Option<usize> {
        *self.scrolled_to.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Local edits ─────────────────────────────────────────────────

    /// Insert a new empty cell at `index` (clamped to the list length).
    pub fn add_cell(&self, index: usize, cell_id: &str, kind: CellKind) -> Result<(), DocumentError> {
        let index = {
            let mut doc = self.doc();
            insert_cell(&mut doc, &self.notebook_id, index, cell_id, kind)?
        };
        self.publish(DocumentEvent::ContentChanged);
        self.publish(DocumentEvent::CellsInserted {
            index,
            count: 1,
            origin: Origin::Local,
        });
        Ok(())
    }

    /// Delete a cell by id.
    pub fn delete_cell(&self, cell_id: &str) -> Result<(), DocumentError> {
        let index = {
            let mut doc = self.doc();
            let cells_id = cells_list_id(&doc).ok_or_else(|| self.missing_cells())?;
            match find_cell_index(&doc, &cells_id, cell_id) {
                Some(idx) => {
                    doc.delete(&cells_id, idx)?;
                    idx
                }
                None => return Err(DocumentError::CellNotFound(cell_id.to_string())),
            }
        };
        self.forget_text_feed(cell_id);
        self.publish(DocumentEvent::ContentChanged);
        self.publish(DocumentEvent::CellsRemoved { index, count: 1 });
        Ok(())
    }

    /// Replace a cell's source text.
    ///
    /// Uses `update_text`, which diffs internally and produces minimal CRDT
    /// operations so concurrent edits merge at character level.
    pub fn update_source(&self, cell_id: &str, source: &str) -> Result<(), DocumentError> {
        {
            let mut doc = self.doc();
            let text_id = cell_field(&doc, cell_id, "source", ObjType::Text)
                .ok_or_else(|| DocumentError::CellNotFound(cell_id.to_string()))?;
            doc.update_text(&text_id, source)?;
        }
        self.publish_text(cell_id, Origin::Local);
        self.publish(DocumentEvent::ContentChanged);
        Ok(())
    }

    /// Append one JSON-encoded output to a cell.
    pub fn append_output(&self, cell_id: &str, output: &str) -> Result<(), DocumentError> {
        {
            let mut doc = self.doc();
            let outputs_id = cell_field(&doc, cell_id, "outputs", ObjType::List)
                .ok_or_else(|| DocumentError::CellNotFound(cell_id.to_string()))?;
            let len = doc.length(&outputs_id);
            doc.insert(&outputs_id, len, output)?;
        }
        self.publish(DocumentEvent::ContentChanged);
        Ok(())
    }

    /// Set the execution count for a cell. Pass "null" or a number string like "5".
    pub fn set_execution_count(&self, cell_id: &str, count: &str) -> Result<(), DocumentError> {
        {
            let mut doc = self.doc();
            let cells_id = cells_list_id(&doc).ok_or_else(|| self.missing_cells())?;
            let cell_obj = find_cell_index(&doc, &cells_id, cell_id)
                .and_then(|idx| cell_at_index(&doc, &cells_id, idx))
                .ok_or_else(|| DocumentError::CellNotFound(cell_id.to_string()))?;
            doc.put(&cell_obj, "execution_count", count)?;
        }
        self.publish(DocumentEvent::ContentChanged);
        Ok(())
    }

    /// Replace the whole cell list, as when the notebook file is rewritten
    /// underneath the open document.
    ///
    /// Cells keep their identity when the id survives; everything else is
    /// deleted and re-created. No per-cell text notifications are published.
    pub fn reload_cells(&self, cells: &[CellSnapshot]) -> Result<(), DocumentError> {
        let (before, after) = {
            let mut doc = self.doc();
            let before = read_cells(&doc);
            let cells_id = cells_list_id(&doc).ok_or_else(|| self.missing_cells())?;

            let wanted: HashSet<&str> = cells.iter().map(|c| c.id.as_str()).collect();
            for idx in (0..doc.length(&cells_id)).rev() {
                let keep = cell_at_index(&doc, &cells_id, idx)
                    .and_then(|obj| read_str(&doc, &obj, "id"))
                    .is_some_and(|id| wanted.contains(id.as_str()));
                if !keep {
                    doc.delete(&cells_id, idx)?;
                }
            }

            for (target, cell) in cells.iter().enumerate() {
                match find_cell_index(&doc, &cells_id, &cell.id) {
                    Some(idx) if idx == target => {}
                    Some(idx) => {
                        doc.delete(&cells_id, idx)?;
                        insert_cell(&mut doc, &self.notebook_id, target, &cell.id, cell.kind)?;
                    }
                    None => {
                        insert_cell(&mut doc, &self.notebook_id, target, &cell.id, cell.kind)?;
                    }
                }
                if let Some(obj) = cell_at_index(&doc, &cells_id, target) {
                    if read_str(&doc, &obj, "cell_type").as_deref() != Some(cell.kind.as_str()) {
                        doc.put(&obj, "cell_type", cell.kind.as_str())?;
                    }
                    if let Some(text_id) = typed_child(&doc, &obj, "source", ObjType::Text) {
                        doc.update_text(&text_id, &cell.source)?;
                    }
                }
            }
            (before, read_cells(&doc))
        };

        info!(
            "[notebook-doc] Reloaded {} ({} → {} cells)",
            self.notebook_id,
            before.len(),
            after.len()
        );
        self.publish_diff(&before, &after, Origin::Local, false);
        Ok(())
    }

    // ── Sync protocol ───────────────────────────────────────────────

    /// Generate a sync message to send to a peer.
    pub fn generate_sync_message(&self, peer_state: &mut sync::State) -> Option<sync::Message> {
        self.doc().sync().generate_sync_message(peer_state)
    }

    /// Apply a sync message from a peer and publish what it changed.
    pub fn receive_sync_message(
        &self,
        peer_state: &mut sync::State,
        message: sync::Message,
    ) -> Result<(), DocumentError> {
        let (before, after) = {
            let mut doc = self.doc();
            let before = read_cells(&doc);
            doc.sync().receive_sync_message(peer_state, message)?;
            (before, read_cells(&doc))
        };
        self.publish_diff(&before, &after, Origin::Remote, true);
        Ok(())
    }

    /// Merge all changes from a peer's saved bytes.
    pub fn merge_bytes(&self, data: &[u8]) -> Result<(), DocumentError> {
        let mut other = AutoCommit::load(data)?;
        let (before, after) = {
            let mut doc = self.doc();
            let before = read_cells(&doc);
            doc.merge(&mut other)?;
            (before, read_cells(&doc))
        };
        self.publish_diff(&before, &after, Origin::Remote, true);
        Ok(())
    }

    /// Run the sync protocol against another in-process replica until
    /// neither side has anything left to send. Both replicas publish what
    /// they received as remote changes.
    pub fn sync_with(&self, peer: &AutomergeNotebook) -> Result<(), DocumentError> {
        let mut our_state = sync::State::new();
        let mut peer_state = sync::State::new();
        for _ in 0..MAX_SYNC_ROUNDS {
            let ours = self.generate_sync_message(&mut our_state);
            let theirs = peer.generate_sync_message(&mut peer_state);
            if ours.is_none() && theirs.is_none() {
                return Ok(());
            }
            if let Some(message) = ours {
                peer.receive_sync_message(&mut peer_state, message)?;
            }
            if let Some(message) = theirs {
                self.receive_sync_message(&mut our_state, message)?;
            }
        }
        debug!(
            "[notebook-doc] {} still had changes after {} sync rounds",
            self.notebook_id, MAX_SYNC_ROUNDS
        );
        Ok(())
    }

    // ── Notifications ───────────────────────────────────────────────

    fn publish(&self, event: DocumentEvent) {
        // No receivers is fine: nobody is observing this notebook yet.
        let _ = self.events_tx.send(event);
    }

    fn publish_text(&self, cell_id: &str, origin: Origin) {
        let txs = self.text_txs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = txs.get(cell_id) {
            let _ = tx.send(TextChange { origin });
        }
    }

    fn forget_text_feed(&self, cell_id: &str) {
        self.text_txs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cell_id);
    }

    /// Publish the notifications for a change from `before` to `after`:
    /// content first, then per-cell text changes (when `per_cell`), then
    /// removals and insertions.
    fn publish_diff(
        &self,
        before: &[CellSnapshot],
        after: &[CellSnapshot],
        origin: Origin,
        per_cell: bool,
    ) {
        if before == after {
            return;
        }
        self.publish(DocumentEvent::ContentChanged);

        let old_sources: HashMap<&str, &str> = before
            .iter()
            .map(|c| (c.id.as_str(), c.source.as_str()))
            .collect();
        let new_ids: HashSet<&str> = after.iter().map(|c| c.id.as_str()).collect();

        if per_cell {
            for cell in after {
                if old_sources
                    .get(cell.id.as_str())
                    .is_some_and(|old| *old != cell.source)
                {
                    self.publish_text(&cell.id, origin);
                }
            }
        }

        // Removals are reported from the back so earlier indices stay valid.
        for (index, cell) in before.iter().enumerate().rev() {
            if !new_ids.contains(cell.id.as_str()) {
                self.forget_text_feed(&cell.id);
                self.publish(DocumentEvent::CellsRemoved { index, count: 1 });
            }
        }

        for (index, count) in insertion_runs(after, &old_sources) {
            debug!(
                "[notebook-doc] {} cell(s) inserted at {} in {}",
                count, index, self.notebook_id
            );
            self.publish(DocumentEvent::CellsInserted {
                index,
                count,
                origin,
            });
        }
    }

    fn missing_cells(&self) -> DocumentError {
        DocumentError::MissingCells(self.notebook_id.clone())
    }
}

#[async_trait]
impl NotebookDocument for AutomergeNotebook {
    fn id(&self) -> &str {
        &self.notebook_id
    }

    fn cells(&self) -> Result<Vec<CellSnapshot>, DocumentError> {
        Ok(read_cells(&self.doc()))
    }

    fn cell_at(&self, index: usize) -> Option<CellSnapshot> {
        let doc = self.doc();
        let cells_id = cells_list_id(&doc)?;
        let obj = cell_at_index(&doc, &cells_id, index)?;
        read_cell(&doc, &obj)
    }

    fn position_of(&self, cell_id: &str) -> Option<usize> {
        let doc = self.doc();
        let cells_id = cells_list_id(&doc)?;
        find_cell_index(&doc, &cells_id, cell_id)
    }

    fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.events_tx.subscribe()
    }

    fn subscribe_source(&self, cell_id: &str) -> Option<SourceFeed> {
        self.position_of(cell_id)?;
        let mut txs = self.text_txs.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = txs
            .entry(cell_id.to_string())
            .or_insert_with(|| broadcast::channel(64).0);
        Some(SourceFeed::Collaborative(tx.subscribe()))
    }

    fn has_kernel(&self) -> bool {
        self.kernel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    async fn execute_cell(&self, index: usize) -> Result<(), ExecutionError> {
        let kernel = self
            .kernel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ExecutionError::NoKernel)?;
        let cell = self
            .cell_at(index)
            .ok_or(ExecutionError::CellNotFound(index))?;
        kernel
            .execute(&cell.id, ExecuteRequest::new(cell.source))
            .await
    }

    fn active_cell(&self) -> Option<usize> {
        *self.active_cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_active_cell(&self, index: Option<usize>) {
        *self.active_cell.lock().unwrap_or_else(PoisonError::into_inner) = index;
    }

    fn scroll_to_cell(&self, index: usize) {
        *self.scrolled_to.lock().unwrap_or_else(PoisonError::into_inner) = Some(index);
    }
}

/// Maximal runs of consecutive cells in `after` whose ids are not in `old`.
fn insertion_runs(after: &[CellSnapshot], old: &HashMap<&str, &str>) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for (index, cell) in after.iter().enumerate() {
        if old.contains_key(cell.id.as_str()) {
            continue;
        }
        if let Some((start, count)) = runs.last_mut() {
            if *start + *count == index {
                *count += 1;
                continue;
            }
        }
        runs.push((index, 1));
    }
    runs
}

// ── Free helpers ─────────────────────────────────────────────────────

fn insert_cell(
    doc: &mut AutoCommit,
    notebook_id: &str,
    index: usize,
    cell_id: &str,
    kind: CellKind,
) -> Result<usize, DocumentError> {
    let cells_id =
        cells_list_id(doc).ok_or_else(|| DocumentError::MissingCells(notebook_id.to_string()))?;

    let index = index.min(doc.length(&cells_id));
    let cell_map = doc.insert_object(&cells_id, index, ObjType::Map)?;
    doc.put(&cell_map, "id", cell_id)?;
    doc.put(&cell_map, "cell_type", kind.as_str())?;
    doc.put_object(&cell_map, "source", ObjType::Text)?;
    doc.put(&cell_map, "execution_count", "null")?;
    doc.put_object(&cell_map, "outputs", ObjType::List)?;
    Ok(index)
}

fn cells_list_id(doc: &AutoCommit) -> Option<ObjId> {
    typed_child(doc, &automerge::ROOT, "cells", ObjType::List)
}

fn cell_at_index(doc: &AutoCommit, cells_id: &ObjId, index: usize) -> Option<ObjId> {
    doc.get(cells_id, index)
        .ok()
        .flatten()
        .and_then(|(value, id)| match value {
            automerge::Value::Object(ObjType::Map) => Some(id),
            _ => None,
        })
}

fn find_cell_index(doc: &AutoCommit, cells_id: &ObjId, cell_id: &str) -> Option<usize> {
    (0..doc.length(cells_id)).find(|&i| {
        cell_at_index(doc, cells_id, i)
            .and_then(|obj| read_str(doc, &obj, "id"))
            .as_deref()
            == Some(cell_id)
    })
}

/// Object id of a typed field (`source` text, `outputs` list) on a cell.
fn cell_field(doc: &AutoCommit, cell_id: &str, key: &str, kind: ObjType) -> Option<ObjId> {
    let cells_id = cells_list_id(doc)?;
    let idx = find_cell_index(doc, &cells_id, cell_id)?;
    let cell_obj = cell_at_index(doc, &cells_id, idx)?;
    typed_child(doc, &cell_obj, key, kind)
}

fn typed_child(doc: &AutoCommit, parent: &ObjId, key: &str, kind: ObjType) -> Option<ObjId> {
    doc.get(parent, key)
        .ok()
        .flatten()
        .and_then(|(value, id)| match value {
            automerge::Value::Object(found) if found == kind => Some(id),
            _ => None,
        })
}

fn read_cells(doc: &AutoCommit) -> Vec<CellSnapshot> {
    let cells_id = match cells_list_id(doc) {
        Some(id) => id,
        None => return vec![],
    };
    (0..doc.length(&cells_id))
        .filter_map(|i| {
            let obj = cell_at_index(doc, &cells_id, i)?;
            read_cell(doc, &obj)
        })
        .collect()
}

fn read_cell(doc: &AutoCommit, cell_obj: &ObjId) -> Option<CellSnapshot> {
    let id = read_str(doc, cell_obj, "id")?;
    let kind = read_str(doc, cell_obj, "cell_type")
        .map(|t| CellKind::from(t.as_str()))
        .unwrap_or(CellKind::Raw);
    let source = typed_child(doc, cell_obj, "source", ObjType::Text)
        .and_then(|text_id| doc.text(&text_id).ok())
        .unwrap_or_default();
    Some(CellSnapshot { id, kind, source })
}

/// Read a scalar string from any Automerge object by key.
fn read_str<O: AsRef<ObjId>, P: Into<automerge::Prop>>(
    doc: &AutoCommit,
    obj: O,
    prop: P,
) -> Option<String> {
    doc.get(obj, prop)
        .ok()
        .flatten()
        .and_then(|(value, _)| match value {
            automerge::Value::Scalar(s) => match s.as_ref() {
                automerge::ScalarValue::Str(s) => Some(s.to_string()),
                _ => None,
            },
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingKernel;
    use tokio::sync::broadcast::error::TryRecvError;

    fn drain(rx: &mut broadcast::Receiver<DocumentEvent>) -> Vec<DocumentEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    #[test]
    fn test_add_update_and_read_cells() {
        let nb = AutomergeNotebook::new("nb1");
        nb.add_cell(0, "first", CellKind::Code).unwrap();
        nb.add_cell(1, "second", CellKind::Markdown).unwrap();
        nb.add_cell(1, "middle", CellKind::Code).unwrap();
        nb.update_source("middle", "print('hi')").unwrap();

        let cells = nb.cells().unwrap();
        let ids: Vec<&str> = cells.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "middle", "second"]);
        assert_eq!(cells[1].source, "print('hi')");
        assert_eq!(cells[2].kind, CellKind::Markdown);
        assert_eq!(nb.position_of("second"), Some(2));
        assert_eq!(nb.cell_at(1).map(|c| c.id), Some("middle".to_string()));
        assert!(nb.cell_at(3).is_none());
    }

    #[test]
    fn test_local_edits_publish_local_notifications() {
        let nb = AutomergeNotebook::new("nb1");
        let mut events = nb.subscribe();
        nb.add_cell(0, "c1", CellKind::Code).unwrap();

        let mut text = match nb.subscribe_source("c1") {
            Some(SourceFeed::Collaborative(rx)) => rx,
            other => panic!("expected collaborative feed, got {:?}", other),
        };
        nb.update_source("c1", "x = 1").unwrap();

        assert_eq!(
            text.try_recv().unwrap(),
            TextChange {
                origin: Origin::Local
            }
        );
        assert_eq!(
            drain(&mut events),
            vec![
                DocumentEvent::ContentChanged,
                DocumentEvent::CellsInserted {
                    index: 0,
                    count: 1,
                    origin: Origin::Local
                },
                DocumentEvent::ContentChanged,
            ]
        );
    }

    #[test]
    fn test_subscribe_source_for_missing_cell() {
        let nb = AutomergeNotebook::new("nb1");
        assert!(nb.subscribe_source("nope").is_none());
    }

    #[test]
    fn test_remote_edit_publishes_remote_text_change() {
        let a = AutomergeNotebook::new("nb");
        a.add_cell(0, "c1", CellKind::Code).unwrap();
        a.update_source("c1", "x=1").unwrap();
        a.add_cell(1, "c2", CellKind::Code).unwrap();
        a.update_source("c2", "y=2").unwrap();
        let b = AutomergeNotebook::empty_replica("nb");
        a.sync_with(&b).unwrap();

        let mut events = a.subscribe();
        let mut c1_text = match a.subscribe_source("c1") {
            Some(SourceFeed::Collaborative(rx)) => rx,
            _ => panic!("expected collaborative feed"),
        };
        let mut c2_text = match a.subscribe_source("c2") {
            Some(SourceFeed::Collaborative(rx)) => rx,
            _ => panic!("expected collaborative feed"),
        };

        b.update_source("c2", "y=3").unwrap();
        a.sync_with(&b).unwrap();

        assert_eq!(a.cell_at(1).unwrap().source, "y=3");
        assert_eq!(
            c2_text.try_recv().unwrap(),
            TextChange {
                origin: Origin::Remote
            }
        );
        assert!(c1_text.try_recv().is_err());
        assert_eq!(drain(&mut events), vec![DocumentEvent::ContentChanged]);
    }

    #[test]
    fn test_remote_insert_and_delete_publish_structural_events() {
        let a = AutomergeNotebook::new("nb");
        a.add_cell(0, "c1", CellKind::Code).unwrap();
        a.add_cell(1, "c2", CellKind::Code).unwrap();
        let b = AutomergeNotebook::empty_replica("nb");
        a.sync_with(&b).unwrap();

        let mut events = a.subscribe();
        b.delete_cell("c1").unwrap();
        b.add_cell(1, "n1", CellKind::Code).unwrap();
        b.add_cell(2, "n2", CellKind::Markdown).unwrap();
        a.sync_with(&b).unwrap();

        let ids: Vec<String> = a.cells().unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec!["c2", "n1", "n2"]);

        let events = drain(&mut events);
        assert_eq!(events.first(), Some(&DocumentEvent::ContentChanged));
        assert!(events.contains(&DocumentEvent::CellsRemoved { index: 0, count: 1 }));
        assert!(events.contains(&DocumentEvent::CellsInserted {
            index: 1,
            count: 2,
            origin: Origin::Remote
        }));
    }

    #[test]
    fn test_reload_cells_preserves_ids_and_reports_structure() {
        let nb = AutomergeNotebook::new("nb");
        nb.add_cell(0, "a", CellKind::Code).unwrap();
        nb.update_source("a", "x=1").unwrap();
        nb.add_cell(1, "b", CellKind::Code).unwrap();
        nb.update_source("b", "y=2").unwrap();
        nb.add_cell(2, "gone", CellKind::Markdown).unwrap();

        let mut b_text = match nb.subscribe_source("b") {
            Some(SourceFeed::Collaborative(rx)) => rx,
            _ => panic!("expected collaborative feed"),
        };
        let mut events = nb.subscribe();

        nb.reload_cells(&[
            CellSnapshot::code("new", "z=3"),
            CellSnapshot::code("b", "y=20"),
            CellSnapshot::code("a", "x=1"),
        ])
        .unwrap();

        let cells = nb.cells().unwrap();
        assert_eq!(
            cells,
            vec![
                CellSnapshot::code("new", "z=3"),
                CellSnapshot::code("b", "y=20"),
                CellSnapshot::code("a", "x=1"),
            ]
        );
        // Reloads are not attributed to a collaborator.
        assert!(b_text.try_recv().is_err());

        let events = drain(&mut events);
        assert_eq!(events.first(), Some(&DocumentEvent::ContentChanged));
        assert!(events.contains(&DocumentEvent::CellsRemoved { index: 2, count: 1 }));
        assert!(events.contains(&DocumentEvent::CellsInserted {
            index: 0,
            count: 1,
            origin: Origin::Local
        }));
    }

    #[test]
    fn test_outputs_and_execution_count_do_not_touch_source() {
        let nb = AutomergeNotebook::new("nb");
        nb.add_cell(0, "c1", CellKind::Code).unwrap();
        nb.update_source("c1", "1 + 1").unwrap();
        let before = nb.cells().unwrap();

        nb.append_output("c1", r#"{"output_type":"execute_result"}"#)
            .unwrap();
        nb.set_execution_count("c1", "1").unwrap();
        assert!(matches!(
            nb.set_execution_count("missing", "1"),
            Err(DocumentError::CellNotFound(id)) if id == "missing"
        ));

        assert_eq!(nb.cells().unwrap(), before);
    }

    #[test]
    fn test_save_load_and_merge_bytes() {
        let a = AutomergeNotebook::new("nb");
        a.add_cell(0, "c1", CellKind::Code).unwrap();
        a.update_source("c1", "x = 42").unwrap();

        let b = AutomergeNotebook::load("nb", &a.save()).unwrap();
        assert_eq!(b.cells().unwrap(), a.cells().unwrap());

        b.update_source("c1", "x = 43").unwrap();
        let mut events = a.subscribe();
        a.merge_bytes(&b.save()).unwrap();
        assert_eq!(a.cell_at(0).unwrap().source, "x = 43");
        assert_eq!(drain(&mut events), vec![DocumentEvent::ContentChanged]);
    }

    #[test]
    fn test_delete_cell() {
        let nb = AutomergeNotebook::new("nb");
        nb.add_cell(0, "c1", CellKind::Code).unwrap();
        nb.delete_cell("c1").unwrap();
        assert!(matches!(
            nb.delete_cell("c1"),
            Err(DocumentError::CellNotFound(_))
        ));
        assert!(matches!(
            nb.update_source("c1", "x"),
            Err(DocumentError::CellNotFound(_))
        ));
        assert!(nb.cells().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_cell_sends_source_to_kernel() {
        let nb = AutomergeNotebook::new("nb");
        nb.add_cell(0, "c1", CellKind::Code).unwrap();
        nb.update_source("c1", "print(1)").unwrap();

        assert!(matches!(
            nb.execute_cell(0).await,
            Err(ExecutionError::NoKernel)
        ));

        let kernel = RecordingKernel::new();
        nb.attach_kernel(kernel.clone());
        assert!(nb.has_kernel());
        nb.execute_cell(0).await.unwrap();
        assert_eq!(kernel.executed(), vec!["c1"]);
        assert_eq!(kernel.sources(), vec!["print(1)"]);

        assert!(matches!(
            nb.execute_cell(5).await,
            Err(ExecutionError::CellNotFound(5))
        ));

        nb.detach_kernel();
        assert!(!nb.has_kernel());
    }
}
