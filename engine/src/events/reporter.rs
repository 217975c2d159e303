//! What workflows talk to when something happens in a run.
//!
//! Every report is appended to the event log and published on the run's
//! bus channel inside the same append transaction, so subscribers see
//! events in chain order.

use std::sync::Arc;

use tracing::{debug, error};

use crate::core::event::{Event, EventPayload, StatusLevel};
use crate::core::state::WorkflowState;
use crate::events::bus::EventBus;
use crate::events::log::{EventLog, LogError};

#[derive(Clone)]
pub struct WorkflowReporter {
    run_id: String,
    scope: Vec<String>,
    log: Arc<EventLog>,
    bus: Arc<EventBus>,
}

impl WorkflowReporter {
    pub fn new(run_id: impl Into<String>, log: Arc<EventLog>, bus: Arc<EventBus>) -> Self {
        Self {
            run_id: run_id.into(),
            scope: Vec::new(),
            log,
            bus,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// A reporter for the same run whose messages read `scope: message`.
    /// Scopes nest.
    pub fn child(&self, scope: &str) -> Self {
        let mut child = self.clone();
        child.scope.push(scope.to_string());
        child
    }

    fn scoped(&self, message: &str) -> String {
        if self.scope.is_empty() {
            message.to_string()
        } else {
            format!("{}: {message}", self.scope.join(": "))
        }
    }

    fn append(&self, payloads: Vec<EventPayload>) -> Result<Vec<Event>, LogError> {
        let bus = &self.bus;
        self.log
            .append_batch(&self.run_id, payloads, None, &mut |event| bus.publish(event))
    }

    /// Append a conversation event as-is.
    pub fn emit(&self, payload: EventPayload) -> Result<Event, LogError> {
        let mut events = self.append(vec![payload])?;
        events
            .pop()
            .ok_or_else(|| LogError::UnknownRun(self.run_id.clone()))
    }

    fn status_payload(&self, level: StatusLevel, message: &str) -> EventPayload {
        EventPayload::Status {
            level,
            content: self.scoped(message),
        }
    }

    fn lifecycle(state: WorkflowState, content: Option<String>) -> EventPayload {
        EventPayload::WorkflowState { state, content }
    }

    /// Open the live channel and mark the run `running`.
    ///
    /// A run that cannot be started reports nothing further, so its channel
    /// is closed again on failure.
    pub fn start(&self, message: Option<&str>) -> Result<(), LogError> {
        self.bus.open(&self.run_id);
        let mut payloads = vec![Self::lifecycle(WorkflowState::Running, None)];
        if let Some(message) = message {
            payloads.push(self.status_payload(StatusLevel::Status, message));
        }
        if let Err(err) = self.append(payloads) {
            self.bus.close(&self.run_id);
            return Err(err);
        }
        Ok(())
    }

    pub fn status(&self, message: &str) -> Result<Event, LogError> {
        self.emit(self.status_payload(StatusLevel::Status, message))
    }

    pub fn info(&self, message: &str) -> Result<Event, LogError> {
        self.emit(self.status_payload(StatusLevel::Info, message))
    }

    pub fn warn(&self, message: &str) -> Result<Event, LogError> {
        self.emit(self.status_payload(StatusLevel::Warn, message))
    }

    pub fn complete(&self, message: Option<&str>) -> Result<(), LogError> {
        let mut payloads = Vec::new();
        if let Some(message) = message {
            payloads.push(self.status_payload(StatusLevel::Status, message));
        }
        payloads.push(Self::lifecycle(WorkflowState::Completed, None));
        self.finish(payloads)
    }

    /// Record a failure: an `error` event, then the `error` lifecycle event
    /// carrying the same message.
    pub fn error(&self, message: &str) -> Result<(), LogError> {
        let message = self.scoped(message);
        error!(run_id = %self.run_id, %message, "run failed");
        self.finish(vec![
            EventPayload::Error {
                content: message.clone(),
            },
            Self::lifecycle(WorkflowState::Error, Some(message)),
        ])
    }

    /// Record that the run outlived its deadline.
    pub fn timed_out(&self, message: &str) -> Result<(), LogError> {
        self.finish(vec![Self::lifecycle(
            WorkflowState::TimedOut,
            Some(self.scoped(message)),
        )])
    }

    /// Append the final events and close the live channel. The channel is
    /// closed even when the append fails; subscribers fall back to the log.
    fn finish(&self, payloads: Vec<EventPayload>) -> Result<(), LogError> {
        let result = self.append(payloads).map(|_| ());
        self.bus.close(&self.run_id);
        debug!(run_id = %self.run_id, ok = result.is_ok(), "run finished");
        result
    }
}
