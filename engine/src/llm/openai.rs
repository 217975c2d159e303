//! OpenAI-compatible chat-completions adapter.
//!
//! Speaks the `/chat/completions` wire format shared by OpenAI and most
//! self-hosted gateways. Uses a blocking client; the agent loop already runs
//! on its own thread.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::config::LlmConfig;
use crate::llm::{
    Completion, CompletionPort, CompletionRequest, LlmError, LlmErrorCode, Message, Usage,
};
use crate::tools::ToolCall;

pub struct OpenAiCompatible {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
}

impl OpenAiCompatible {
    /// Build from config. The API key is read from `config.api_key_env`; a
    /// missing key is allowed for gateways that need none.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "no API key set; sending unauthenticated requests");
        }
        Self::new(
            &config.base_url,
            &config.model,
            api_key,
            config.max_tokens,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn new(
        base_url: &str,
        model: &str,
        api_key: Option<String>,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            max_tokens,
        })
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool<'a>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Serialize)]
struct ChatTool<'a> {
    #[serde(rename = "type")]
    tool_type: &'static str,
    function: ChatFunction<'a>,
}

#[derive(Debug, Serialize)]
struct ChatFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    /// Some gateways send `null` rather than omitting the field.
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

fn to_wire_messages(request: &CompletionRequest) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        out.push(ChatMessage {
            role: "system",
            content: Some(system.clone()),
            tool_call_id: None,
            tool_calls: Vec::new(),
        });
    }
    for message in &request.messages {
        out.push(match message {
            Message::User { content } => ChatMessage {
                role: "user",
                content: Some(content.clone()),
                tool_call_id: None,
                tool_calls: Vec::new(),
            },
            Message::Assistant {
                content,
                tool_calls,
            } => ChatMessage {
                role: "assistant",
                content: (!content.is_empty()).then(|| content.clone()),
                tool_call_id: None,
                tool_calls: tool_calls
                    .iter()
                    .map(|call| WireToolCall {
                        id: call.id.clone(),
                        call_type: function_type(),
                        function: WireFunctionCall {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            },
            Message::Tool {
                tool_call_id,
                content,
                ..
            } => ChatMessage {
                role: "tool",
                content: Some(content.clone()),
                tool_call_id: Some(tool_call_id.clone()),
                tool_calls: Vec::new(),
            },
        });
    }
    out
}

/// Map an HTTP status onto the port's error codes.
pub fn code_for_status(status: StatusCode) -> LlmErrorCode {
    match status.as_u16() {
        401 | 403 => LlmErrorCode::Unauthorized,
        429 => LlmErrorCode::RateLimited,
        400 | 404 | 413 | 422 => LlmErrorCode::InvalidRequest,
        408 => LlmErrorCode::Timeout,
        500 | 502 | 503 | 504 | 529 => LlmErrorCode::ServiceUnavailable,
        _ => LlmErrorCode::Unknown,
    }
}

fn transport_error(err: reqwest::Error) -> LlmError {
    let code = if err.is_timeout() {
        LlmErrorCode::Timeout
    } else if err.is_connect() {
        LlmErrorCode::ServiceUnavailable
    } else {
        LlmErrorCode::Unknown
    };
    LlmError::new(code, err.to_string())
}

impl CompletionPort for OpenAiCompatible {
    #[instrument(skip_all, fields(messages = request.messages.len(), tools = request.tools.len()))]
    fn create_completion(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = ChatRequest {
            model,
            messages: to_wire_messages(request),
            max_tokens: Some(request.max_tokens.unwrap_or(self.max_tokens)),
            tools: request
                .tools
                .iter()
                .map(|tool| ChatTool {
                    tool_type: "function",
                    function: ChatFunction {
                        name: &tool.name,
                        description: &tool.description,
                        parameters: &tool.parameters,
                    },
                })
                .collect(),
        };

        let mut http = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }
        let response = http.send().map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| body.error.message)
                .unwrap_or(text);
            let code = code_for_status(status);
            warn!(status = status.as_u16(), code = %code, "completion request failed");
            return Err(LlmError::new(code, format!("HTTP {status}: {message}")));
        }

        let parsed: ChatResponse = response.json().map_err(|e| {
            LlmError::new(LlmErrorCode::Unknown, format!("invalid response body: {e}"))
        })?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            LlmError::new(LlmErrorCode::Unknown, "response contained no choices")
        })?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect::<Vec<_>>();
        debug!(tool_calls = tool_calls.len(), "completion received");

        Ok(Completion {
            content: choice.message.content.unwrap_or_default(),
            reasoning: choice.message.reasoning_content.filter(|r| !r.is_empty()),
            tool_calls,
            usage: parsed.usage.map(|u| Usage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            model: parsed.model.unwrap_or_else(|| model.to_string()),
        })
    }
}
