//! Tools the agent can call, and the registry that dispatches them.
//!
//! A tool is a name, a description, a JSON Schema for its arguments, and a
//! handler that acts on the run's [`Environment`]. The registry validates
//! arguments against the schema before any handler runs.

pub mod command;
pub mod fs;
pub mod pull_request;
pub mod registry;
pub mod search;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{RunConfig, WorkflowType};
use crate::environment::{EnvError, Environment};
use crate::io::config::ToolsConfig;

pub use registry::{RegistryError, ToolRegistry};

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments exactly as the model produced them.
    pub arguments: String,
}

/// Outcome of one tool call, always fed back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    pub content: String,
    pub is_error: bool,
}

/// Schema-level description of a tool, as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl ToolOutput {
    pub fn into_content(self) -> String {
        match self {
            ToolOutput::Text(text) => text,
            ToolOutput::Json(value) => {
                serde_json::to_string(&value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Env(#[from] EnvError),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    Failed(String),
}

pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema (draft 2020-12) for the arguments object.
    fn parameters(&self) -> Value;
    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError>;
}

/// Built-in tools for a workflow type.
///
/// Review runs only get tools that leave the workspace untouched.
pub fn builtin_tools(
    workflow_type: WorkflowType,
    run_config: &RunConfig,
    config: &ToolsConfig,
) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(fs::ReadFile),
        Arc::new(fs::ListFiles),
        Arc::new(search::SearchCode),
        Arc::new(command::ExecuteCommand),
        Arc::new(command::RunTypecheck::new(config.typecheck_command.clone())),
    ];
    if workflow_type == WorkflowType::ReviewPr {
        return tools;
    }
    tools.push(Arc::new(fs::WriteFile));
    tools.push(Arc::new(fs::DeleteFile));
    if workflow_type == WorkflowType::AutoResolveIssue && run_config.post_to_code_host {
        tools.push(Arc::new(pull_request::CreatePullRequest::new(
            config.gh_binary.clone(),
        )));
    }
    tools
}

pub(crate) fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments(format!("missing string field '{key}'")))
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn optional_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}

/// Single-quote `s` for POSIX `sh`.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(tools: &[Arc<dyn Tool>]) -> Vec<String> {
        let mut names: Vec<String> = tools.iter().map(|t| t.name().to_string()).collect();
        names.sort();
        names
    }

    #[test]
    fn review_runs_get_read_only_tools() {
        let tools = builtin_tools(
            WorkflowType::ReviewPr,
            &RunConfig {
                post_to_code_host: true,
            },
            &ToolsConfig::default(),
        );
        let names = names(&tools);
        assert!(!names.contains(&"write_file".to_string()));
        assert!(!names.contains(&"delete_file".to_string()));
        assert!(!names.contains(&"create_pull_request".to_string()));
        assert!(names.contains(&"read_file".to_string()));
    }

    #[test]
    fn pull_requests_require_auto_resolve_and_posting_enabled() {
        let posting = RunConfig {
            post_to_code_host: true,
        };
        let resolve = names(&builtin_tools(
            WorkflowType::ResolveIssue,
            &posting,
            &ToolsConfig::default(),
        ));
        assert!(!resolve.contains(&"create_pull_request".to_string()));

        let auto_quiet = names(&builtin_tools(
            WorkflowType::AutoResolveIssue,
            &RunConfig::default(),
            &ToolsConfig::default(),
        ));
        assert!(!auto_quiet.contains(&"create_pull_request".to_string()));

        let auto = names(&builtin_tools(
            WorkflowType::AutoResolveIssue,
            &posting,
            &ToolsConfig::default(),
        ));
        assert!(auto.contains(&"create_pull_request".to_string()));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
