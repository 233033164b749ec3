//! autorun - Re-runs notebook cells when someone else changes them.
//!
//! Two detection paths feed one dispatcher:
//!
//! - A realtime observer per code cell runs the cell when a collaborating peer
//!   edits its source.
//! - A document watcher per notebook debounces whole-document changes that no
//!   observer attributes to a peer (file reloads, bulk edits), diffs a snapshot
//!   from before the burst against one from after it, and runs every changed
//!   code cell in order.
//!
//! The dispatcher enforces a per-cell cooldown so the same edit reaching it
//! from several paths runs once. A shared [`EnabledFlag`] switches everything
//! off without tearing subscriptions down.

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod document;
pub mod notebook_doc;
pub mod observer;
pub mod snapshot;
pub mod watcher;

#[cfg(test)]
mod test_support;

pub use config::{AutorunConfig, EnabledFlag, ToggleCommand};
pub use coordinator::Autorun;
pub use dispatch::{DispatchOutcome, Dispatcher, ExecutionRecord};
pub use document::{
    CellChange, CellKind, DocumentError, DocumentEvent, ExecutionError, NotebookDocument,
    NotebookTracker, Origin, SourceFeed, TextChange, TrackerEvent,
};
pub use notebook_doc::{AutomergeNotebook, KernelChannel};
pub use observer::Subscription;
pub use snapshot::{classify, CellSnapshot, Snapshot};
pub use watcher::WatchState;
