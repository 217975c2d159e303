//! Shared application state for the API server.

use std::path::PathBuf;
use std::sync::Arc;

use engine::workflow::WorkflowEngine;
use tokio::sync::broadcast;

/// Store-level changes seen by the file watcher, broadcast on `/events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// `run.json` appeared for a new run.
    RunCreated { run_id: String },
    /// `events.jsonl` grew.
    RunUpdated { run_id: String },
}

impl ChangeEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunCreated { run_id } | Self::RunUpdated { run_id } => run_id,
        }
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Directory holding `config.toml` and `runs/`.
    pub data_dir: PathBuf,
    pub engine: Arc<WorkflowEngine>,
    /// Broadcast sender for store changes, including runs from other processes.
    pub change_tx: Arc<broadcast::Sender<ChangeEvent>>,
}

impl AppState {
    pub fn new(data_dir: PathBuf, engine: Arc<WorkflowEngine>) -> Self {
        let (change_tx, _) = broadcast::channel(256);
        Self {
            data_dir,
            engine,
            change_tx: Arc::new(change_tx),
        }
    }

    /// Path to `runs/`, one directory per run.
    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}
