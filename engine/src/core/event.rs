//! Workflow event model.
//!
//! Events are immutable once appended. Each carries its per-run `seq`; the
//! chain order is the `seq` order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::state::WorkflowState;

/// Severity of a non-lifecycle status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusLevel {
    Status,
    Info,
    Warn,
}

/// What happened. Serialized with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventPayload {
    WorkflowState {
        state: WorkflowState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    Status {
        level: StatusLevel,
        content: String,
    },
    SystemPrompt {
        content: String,
    },
    UserMessage {
        content: String,
    },
    LlmResponse {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Reasoning {
        content: String,
    },
    ToolCall {
        tool_name: String,
        tool_call_id: String,
        arguments_json: String,
    },
    ToolCallResult {
        tool_name: String,
        tool_call_id: String,
        content: String,
        is_error: bool,
    },
    Error {
        content: String,
    },
}

impl EventPayload {
    /// The lifecycle state this payload transitions to, if it is a lifecycle event.
    pub fn lifecycle_state(&self) -> Option<WorkflowState> {
        match self {
            EventPayload::WorkflowState { state, .. } => Some(*state),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::WorkflowState { .. } => "workflowState",
            EventPayload::Status { .. } => "status",
            EventPayload::SystemPrompt { .. } => "systemPrompt",
            EventPayload::UserMessage { .. } => "userMessage",
            EventPayload::LlmResponse { .. } => "llmResponse",
            EventPayload::Reasoning { .. } => "reasoning",
            EventPayload::ToolCall { .. } => "toolCall",
            EventPayload::ToolCallResult { .. } => "toolCallResult",
            EventPayload::Error { .. } => "error",
        }
    }
}

/// One durable entry in a run's event chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub run_id: String,
    /// Position in the run's chain, starting at 0.
    pub seq: u64,
    /// Predecessor, or the logical parent when one was supplied on append.
    /// `None` only for the first event of a run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn is_lifecycle(&self) -> bool {
        self.payload.lifecycle_state().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_flattens_payload_with_type_tag() {
        let event = Event {
            id: "e1".to_string(),
            run_id: "r1".to_string(),
            seq: 3,
            parent_id: Some("e0".to_string()),
            created_at: DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
                .expect("timestamp")
                .with_timezone(&Utc),
            payload: EventPayload::ToolCallResult {
                tool_name: "read_file".to_string(),
                tool_call_id: "call_1".to_string(),
                content: "not found".to_string(),
                is_error: true,
            },
        };

        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "toolCallResult");
        assert_eq!(value["toolCallId"], "call_1");
        assert_eq!(value["isError"], true);
        assert_eq!(value["runId"], "r1");

        let back: Event = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn lifecycle_state_is_only_reported_for_workflow_state_events() {
        let lifecycle = EventPayload::WorkflowState {
            state: WorkflowState::Running,
            content: None,
        };
        let status = EventPayload::Status {
            level: StatusLevel::Info,
            content: "cloning".to_string(),
        };
        assert_eq!(lifecycle.lifecycle_state(), Some(WorkflowState::Running));
        assert_eq!(status.lifecycle_state(), None);
    }
}
