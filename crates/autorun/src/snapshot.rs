//! Point-in-time captures of a notebook's cells and the diff between two of them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::document::{CellKind, DocumentError, NotebookDocument};

/// One cell as it was at capture time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellSnapshot {
    pub id: String,
    pub kind: CellKind,
    pub source: String,
}

impl CellSnapshot {
    pub fn new(id: impl Into<String>, kind: CellKind, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            source: source.into(),
        }
    }

    pub fn code(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self::new(id, CellKind::Code, source)
    }
}

/// Ordered, immutable capture of every cell in a document.
///
/// Cloning is cheap: the cell list is shared. A new change cycle always
/// captures a fresh snapshot instead of editing an old one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    cells: Arc<[CellSnapshot]>,
}

impl Snapshot {
    /// Read every cell of `doc` in document order.
    pub fn capture(doc: &dyn NotebookDocument) -> Result<Self, DocumentError> {
        Ok(Self::from_cells(doc.cells()?))
    }

    pub fn from_cells(cells: Vec<CellSnapshot>) -> Self {
        Self {
            cells: cells.into(),
        }
    }

    pub fn cells(&self) -> &[CellSnapshot] {
        &self.cells
    }

    pub fn get(&self, index: usize) -> Option<&CellSnapshot> {
        self.cells.get(index)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Ids of the code cells, in order.
    pub fn code_cell_ids(&self) -> impl Iterator<Item = &str> {
        self.cells
            .iter()
            .filter(|c| c.kind.is_code())
            .map(|c| c.id.as_str())
    }
}

/// Positions in `new` whose code cell needs to run, ascending.
///
/// A cell whose id existed in `old` is changed iff its source differs from
/// the old source for that id. A cell with an unknown id is changed unless
/// some old cell had byte-identical source, so duplicated or re-created cells
/// with untouched content are not re-run. Matching by id always wins over
/// matching by content.
pub fn classify(old: &Snapshot, new: &Snapshot) -> Vec<usize> {
    let old_by_id: HashMap<&str, &CellSnapshot> =
        old.cells.iter().map(|c| (c.id.as_str(), c)).collect();
    let old_sources: HashSet<&str> = old.cells.iter().map(|c| c.source.as_str()).collect();

    new.cells
        .iter()
        .enumerate()
        .filter(|(_, cell)| cell.kind.is_code())
        .filter(|(_, cell)| match old_by_id.get(cell.id.as_str()) {
            Some(previous) => previous.source != cell.source,
            None => !old_sources.contains(cell.source.as_str()),
        })
        .map(|(index, _)| index)
        .collect()
}
