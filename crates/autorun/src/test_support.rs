//! Shared fixtures for unit tests.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use jupyter_protocol::ExecuteRequest;

use crate::document::ExecutionError;
use crate::notebook_doc::KernelChannel;

/// Kernel that records every request and fails for chosen cell ids.
#[derive(Default)]
pub struct RecordingKernel {
    executed: StdMutex<Vec<(String, String)>>,
    failing: HashSet<String>,
}

impl RecordingKernel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(cell_ids: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            executed: StdMutex::new(Vec::new()),
            failing: cell_ids.iter().map(|id| id.to_string()).collect(),
        })
    }

    /// Cell ids in request order, including failed ones.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn sources(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|(_, code)| code.clone())
            .collect()
    }
}

#[async_trait]
impl KernelChannel for RecordingKernel {
    async fn execute(&self, cell_id: &str, request: ExecuteRequest) -> Result<(), ExecutionError> {
        self.executed
            .lock()
            .unwrap()
            .push((cell_id.to_string(), request.code.clone()));
        if self.failing.contains(cell_id) {
            return Err(ExecutionError::Rejected(format!("{} raised", cell_id)));
        }
        Ok(())
    }
}
