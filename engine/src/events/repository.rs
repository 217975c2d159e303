//! Event repository port.
//!
//! Appending is a Unit of Work: begin a transaction for a run, look at the
//! tail, stage an event, link it after the tail, commit. Dropping a
//! transaction without committing discards everything staged in it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::core::event::{Event, EventPayload};
use crate::core::types::WorkflowRun;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("run already exists: {0}")]
    RunExists(String),
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("invalid run id {0:?}")]
    InvalidRunId(String),
    #[error("event {event_id} is not part of run {run_id}")]
    UnknownEvent { run_id: String, event_id: String },
    #[error("event id {0} is already in use")]
    DuplicateEvent(String),
    #[error("event {0} was not staged in this transaction")]
    NotStaged(String),
    #[error("event timestamp {new} precedes chain tail {tail}")]
    OutOfOrder {
        tail: DateTime<Utc>,
        new: DateTime<Utc>,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// An event before it is linked into a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub payload: EventPayload,
}

pub trait EventTransaction {
    fn run_id(&self) -> &str;

    /// Current tail, including events appended earlier in this transaction.
    fn tail(&self) -> Option<&Event>;

    /// Most recent lifecycle event, including this transaction's appends.
    fn last_lifecycle(&self) -> Option<&Event>;

    fn contains(&self, event_id: &str) -> bool;

    /// Stage an event. It is not part of the chain until linked.
    fn create_event(&mut self, event: NewEvent) -> Result<(), RepoError>;

    /// Link a staged event after the tail and assign its `seq`.
    ///
    /// `parent_id` defaults to the tail; when given it must already be in
    /// the run. Timestamps must not go backwards along the chain.
    fn append_to_chain_end(
        &mut self,
        event_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Event, RepoError>;

    /// Make the appended events durable. `observer` sees each committed
    /// event while the transaction still holds the append lock.
    fn commit_with(
        self: Box<Self>,
        observer: &mut dyn FnMut(&Event),
    ) -> Result<Vec<Event>, RepoError>;

    fn commit(self: Box<Self>) -> Result<Vec<Event>, RepoError> {
        self.commit_with(&mut |_| {})
    }
}

pub trait EventRepository: Send + Sync {
    fn create_run(&self, run: &WorkflowRun) -> Result<(), RepoError>;

    fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, RepoError>;

    /// All runs, oldest first.
    fn list_runs(&self) -> Result<Vec<WorkflowRun>, RepoError>;

    /// Begin an append transaction. Appends are serialized until it ends.
    fn begin<'a>(&'a self, run_id: &str) -> Result<Box<dyn EventTransaction + 'a>, RepoError>;

    /// The run's full chain in `seq` order.
    fn get_chain(&self, run_id: &str) -> Result<Vec<Event>, RepoError>;

    fn get_latest_lifecycle_event(&self, run_id: &str) -> Result<Option<Event>, RepoError>;

    /// Latest lifecycle event for each run that has one. Unknown runs are skipped.
    fn latest_lifecycle_events(
        &self,
        run_ids: &[String],
    ) -> Result<HashMap<String, Event>, RepoError> {
        let mut out = HashMap::new();
        for run_id in run_ids {
            match self.get_latest_lifecycle_event(run_id) {
                Ok(Some(event)) => {
                    out.insert(run_id.clone(), event);
                }
                Ok(None) | Err(RepoError::UnknownRun(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}

/// Run ids double as directory names; keep them boring.
pub fn validate_run_id(run_id: &str) -> Result<(), RepoError> {
    let ok = !run_id.is_empty()
        && run_id.len() <= 128
        && !run_id.starts_with('.')
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(RepoError::InvalidRunId(run_id.to_string()))
    }
}
