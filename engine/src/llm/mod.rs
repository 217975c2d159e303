//! LLM completion port.
//!
//! The agent loop only sees [`CompletionPort`]. Provider failures are mapped
//! onto a fixed set of [`LlmErrorCode`]s so retry decisions do not depend on
//! any one provider's error format.

pub mod openai;
pub mod retry;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tools::{ToolCall, ToolDefinition};

pub use openai::OpenAiCompatible;
pub use retry::{RetryPolicy, Retrying};

/// One conversation message after the system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Message {
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        tool_name: String,
        content: String,
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    /// Overrides the adapter's default model.
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmErrorCode {
    RateLimited,
    Unauthorized,
    InvalidRequest,
    Timeout,
    ServiceUnavailable,
    Unknown,
}

impl LlmErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmErrorCode::RateLimited => "rate_limited",
            LlmErrorCode::Unauthorized => "unauthorized",
            LlmErrorCode::InvalidRequest => "invalid_request",
            LlmErrorCode::Timeout => "timeout",
            LlmErrorCode::ServiceUnavailable => "service_unavailable",
            LlmErrorCode::Unknown => "unknown",
        }
    }

    /// Only transient capacity problems are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmErrorCode::RateLimited | LlmErrorCode::ServiceUnavailable
        )
    }
}

impl fmt::Display for LlmErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("llm {code}: {message}")]
pub struct LlmError {
    pub code: LlmErrorCode,
    pub message: String,
}

impl LlmError {
    pub fn new(code: LlmErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

pub trait CompletionPort: Send + Sync {
    fn create_completion(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}
