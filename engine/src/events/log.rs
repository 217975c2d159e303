//! The workflow event log: lifecycle and ordering rules over the repository.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, instrument};
use uuid::Uuid;

use crate::core::event::{Event, EventPayload};
use crate::core::state::{TransitionError, WorkflowState, check_transition};
use crate::core::types::{IssueRef, WorkflowRun};
use crate::events::repository::{EventRepository, NewEvent, RepoError};

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("unknown run: {0}")]
    UnknownRun(String),
    #[error("run {run_id}: {source}")]
    Transition {
        run_id: String,
        #[source]
        source: TransitionError,
    },
    #[error("run {run_id} already ended in {state}; refusing {kind} event")]
    RunEnded {
        run_id: String,
        state: WorkflowState,
        kind: &'static str,
    },
    #[error("parent event {event_id} is not part of run {run_id}")]
    UnknownParent { run_id: String, event_id: String },
    #[error("ordering violation in run {run_id}: {message}")]
    Ordering { run_id: String, message: String },
    #[error("event store failure for run {run_id}: {source}")]
    Storage {
        run_id: String,
        #[source]
        source: RepoError,
    },
}

impl LogError {
    fn from_repo(run_id: &str, err: RepoError) -> Self {
        match err {
            RepoError::UnknownRun(id) => LogError::UnknownRun(id),
            RepoError::UnknownEvent { run_id, event_id } => {
                LogError::UnknownParent { run_id, event_id }
            }
            err @ RepoError::OutOfOrder { .. } => LogError::Ordering {
                run_id: run_id.to_string(),
                message: err.to_string(),
            },
            source => LogError::Storage {
                run_id: run_id.to_string(),
                source,
            },
        }
    }
}

/// Time source for `created_at`.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One run linked to an issue, with its derived state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run: WorkflowRun,
    pub state: WorkflowState,
    /// When the state last changed, if it ever did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct EventLog {
    repo: Arc<dyn EventRepository>,
    clock: Box<dyn Clock>,
}

impl EventLog {
    pub fn new(repo: Arc<dyn EventRepository>) -> Self {
        Self::with_clock(repo, Box::new(SystemClock))
    }

    pub fn with_clock(repo: Arc<dyn EventRepository>, clock: Box<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn repository(&self) -> &Arc<dyn EventRepository> {
        &self.repo
    }

    pub fn create_run(&self, run: &WorkflowRun) -> Result<(), LogError> {
        self.repo
            .create_run(run)
            .map_err(|err| LogError::from_repo(&run.id, err))
    }

    pub fn append(
        &self,
        run_id: &str,
        payload: EventPayload,
        parent_id: Option<&str>,
    ) -> Result<Event, LogError> {
        let mut events = self.append_batch(run_id, vec![payload], parent_id, &mut |_| {})?;
        events
            .pop()
            .ok_or_else(|| LogError::UnknownRun(run_id.to_string()))
    }

    /// Append `payloads` atomically, in order.
    ///
    /// Either all of them land or none do. `on_commit` sees every committed
    /// event before the append lock is released. `parent_id` applies to the
    /// first payload; the rest link to their predecessor.
    #[instrument(skip_all, fields(run_id = %run_id, count = payloads.len()))]
    pub fn append_batch(
        &self,
        run_id: &str,
        payloads: Vec<EventPayload>,
        parent_id: Option<&str>,
        on_commit: &mut dyn FnMut(&Event),
    ) -> Result<Vec<Event>, LogError> {
        let result = self.append_batch_inner(run_id, payloads, parent_id, on_commit);
        if let Err(err) = &result {
            error!(run_id, %err, "event append rejected");
        }
        result
    }

    fn append_batch_inner(
        &self,
        run_id: &str,
        payloads: Vec<EventPayload>,
        parent_id: Option<&str>,
        on_commit: &mut dyn FnMut(&Event),
    ) -> Result<Vec<Event>, LogError> {
        let repo_err = |err: RepoError| LogError::from_repo(run_id, err);
        let mut tx = self.repo.begin(run_id).map_err(repo_err)?;

        for (idx, payload) in payloads.into_iter().enumerate() {
            let current = tx
                .last_lifecycle()
                .and_then(|event| event.payload.lifecycle_state())
                .unwrap_or_default();
            match payload.lifecycle_state() {
                Some(next) => {
                    check_transition(current, next).map_err(|source| LogError::Transition {
                        run_id: run_id.to_string(),
                        source,
                    })?;
                }
                None if current.is_terminal() => {
                    return Err(LogError::RunEnded {
                        run_id: run_id.to_string(),
                        state: current,
                        kind: payload.kind(),
                    });
                }
                None => {}
            }

            // Never stamp earlier than the tail, whatever the wall clock says.
            let now = self.clock.now();
            let created_at = match tx.tail() {
                Some(tail) if tail.created_at > now => tail.created_at,
                _ => now,
            };
            let id = Uuid::now_v7().to_string();
            tx.create_event(NewEvent {
                id: id.clone(),
                created_at,
                payload,
            })
            .map_err(repo_err)?;
            let parent = if idx == 0 { parent_id } else { None };
            tx.append_to_chain_end(&id, parent).map_err(repo_err)?;
        }

        tx.commit_with(on_commit).map_err(repo_err)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, LogError> {
        self.repo
            .get_run(run_id)
            .map_err(|err| LogError::from_repo(run_id, err))
    }

    pub fn list_runs(&self) -> Result<Vec<WorkflowRun>, LogError> {
        self.repo
            .list_runs()
            .map_err(|err| LogError::from_repo("*", err))
    }

    pub fn get_chain(&self, run_id: &str) -> Result<Vec<Event>, LogError> {
        self.repo
            .get_chain(run_id)
            .map_err(|err| LogError::from_repo(run_id, err))
    }

    pub fn get_latest_lifecycle_event(&self, run_id: &str) -> Result<Option<Event>, LogError> {
        self.repo
            .get_latest_lifecycle_event(run_id)
            .map_err(|err| LogError::from_repo(run_id, err))
    }

    pub fn state(&self, run_id: &str) -> Result<WorkflowState, LogError> {
        Ok(self
            .get_latest_lifecycle_event(run_id)?
            .and_then(|event| event.payload.lifecycle_state())
            .unwrap_or_default())
    }

    /// Runs linked to each issue with their derived states, newest first.
    ///
    /// Every requested issue gets an entry, empty when no run targets it.
    pub fn latest_states_for_issues(
        &self,
        issues: &[IssueRef],
    ) -> Result<BTreeMap<IssueRef, Vec<RunState>>, LogError> {
        let mut by_issue: BTreeMap<IssueRef, Vec<WorkflowRun>> =
            issues.iter().map(|issue| (issue.clone(), Vec::new())).collect();
        for run in self.list_runs()? {
            if let Some(runs) = run
                .target
                .issue
                .as_ref()
                .and_then(|issue| by_issue.get_mut(issue))
            {
                runs.push(run);
            }
        }

        let run_ids: Vec<String> = by_issue
            .values()
            .flatten()
            .map(|run| run.id.clone())
            .collect();
        let latest: HashMap<String, Event> = self
            .repo
            .latest_lifecycle_events(&run_ids)
            .map_err(|err| LogError::from_repo("*", err))?;

        Ok(by_issue
            .into_iter()
            .map(|(issue, runs)| {
                let mut states: Vec<RunState> = runs
                    .into_iter()
                    .map(|run| {
                        let event = latest.get(&run.id);
                        RunState {
                            state: event
                                .and_then(|e| e.payload.lifecycle_state())
                                .unwrap_or_default(),
                            updated_at: event.map(|e| e.created_at),
                            run,
                        }
                    })
                    .collect();
                states.sort_by(|a, b| {
                    b.run
                        .created_at
                        .cmp(&a.run.created_at)
                        .then_with(|| b.run.id.cmp(&a.run.id))
                });
                (issue, states)
            })
            .collect())
    }
}
