//! Interfaces the autorun engine consumes from the host notebook model.
//!
//! The engine never owns a notebook. The host hands it an
//! `Arc<dyn NotebookDocument>` for as long as the notebook is open and the
//! engine reads cells, listens to change notifications and asks the document
//! to run a cell. Every notification source is a `tokio::sync::broadcast`
//! channel, the same shape `NotebookRoom::changed_tx` uses in the daemon.
//!
//! Two granularities of per-cell notification exist:
//!
//! - [`SourceFeed::Collaborative`]: fine-grained text changes tagged with the
//!   [`Origin`] of the transaction that produced them.
//! - [`SourceFeed::Coarse`]: a plain "this cell changed" signal for documents
//!   whose text primitive does not expose transaction origin. Origin cannot be
//!   determined on this path.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::snapshot::CellSnapshot;

/// Cell type. Only code cells are ever executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    Markdown,
    Raw,
}

impl CellKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CellKind::Code => "code",
            CellKind::Markdown => "markdown",
            CellKind::Raw => "raw",
        }
    }

    pub fn is_code(&self) -> bool {
        matches!(self, CellKind::Code)
    }
}

impl From<&str> for CellKind {
    /// Unknown cell types are treated as raw so they are never executed.
    fn from(value: &str) -> Self {
        match value {
            "code" => CellKind::Code,
            "markdown" => CellKind::Markdown,
            _ => CellKind::Raw,
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the transaction behind a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Made by this replica (the local user, a local tool, a file reload).
    Local,
    /// Applied from a collaborating peer.
    Remote,
}

impl Origin {
    pub fn is_remote(&self) -> bool {
        matches!(self, Origin::Remote)
    }
}

/// Document-level change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentEvent {
    /// Something in the document changed (sources, outputs, metadata, order).
    ContentChanged,
    /// `count` cells were inserted starting at `index`.
    CellsInserted {
        index: usize,
        count: usize,
        origin: Origin,
    },
    /// `count` cells were removed starting at `index` (positions before removal).
    CellsRemoved { index: usize, count: usize },
}

/// Fine-grained edit to one cell's source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChange {
    pub origin: Origin,
}

/// Coarse per-cell change notification. Carries no origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellChange {
    /// Number of source delta operations in the change. Zero when only
    /// outputs or metadata changed.
    pub source_delta: usize,
}

/// Per-cell change notifications, at the best granularity the document has.
#[derive(Debug)]
pub enum SourceFeed {
    Collaborative(broadcast::Receiver<TextChange>),
    Coarse(broadcast::Receiver<CellChange>),
}

/// Error reading or mutating a notebook document.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Automerge error: {0}")]
    Automerge(#[from] automerge::AutomergeError),

    #[error("Cells list missing from document {0}")]
    MissingCells(String),

    #[error("Cell not found: {0}")]
    CellNotFound(String),
}

/// Error returned by the execution backend.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("No kernel attached")]
    NoKernel,

    #[error("No cell at index {0}")]
    CellNotFound(usize),

    #[error("Kernel rejected execution: {0}")]
    Rejected(String),
}

/// One open notebook as seen by the autorun engine.
#[async_trait]
pub trait NotebookDocument: Send + Sync + 'static {
    /// Stable identity of this open notebook.
    fn id(&self) -> &str;

    /// Resolves once the document is fully materialized.
    async fn ready(&self) {}

    /// All cells, in document order.
    fn cells(&self) -> Result<Vec<CellSnapshot>, DocumentError>;

    /// The cell currently at `index`, if any.
    fn cell_at(&self, index: usize) -> Option<CellSnapshot> {
        self.cells().ok()?.into_iter().nth(index)
    }

    /// Current position of the cell with the given id.
    fn position_of(&self, cell_id: &str) -> Option<usize> {
        self.cells().ok()?.iter().position(|c| c.id == cell_id)
    }

    /// Document-level change notifications.
    fn subscribe(&self) -> broadcast::Receiver<DocumentEvent>;

    /// Per-cell change notifications. `None` if the cell does not exist.
    fn subscribe_source(&self, cell_id: &str) -> Option<SourceFeed>;

    /// Whether an execution backend (kernel) is attached right now.
    fn has_kernel(&self) -> bool;

    /// Run the cell at `index` through the execution backend.
    async fn execute_cell(&self, index: usize) -> Result<(), ExecutionError>;

    /// Position of the locally active (focused) cell.
    fn active_cell(&self) -> Option<usize>;

    fn set_active_cell(&self, index: Option<usize>);

    /// Ask the view to bring the cell at `index` into view.
    fn scroll_to_cell(&self, index: usize);
}

/// Open/close notifications from the host's notebook tracker.
#[derive(Clone)]
pub enum TrackerEvent {
    Opened(Arc<dyn NotebookDocument>),
    Closed(String),
}

impl fmt::Debug for TrackerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackerEvent::Opened(doc) => f.debug_tuple("Opened").field(&doc.id()).finish(),
            TrackerEvent::Closed(id) => f.debug_tuple("Closed").field(id).finish(),
        }
    }
}

/// Discovery of the notebooks the host currently has open.
pub trait NotebookTracker: Send + Sync {
    /// Notebooks that are already open.
    fn documents(&self) -> Vec<Arc<dyn NotebookDocument>>;

    /// Future open/close notifications.
    fn subscribe(&self) -> broadcast::Receiver<TrackerEvent>;
}
