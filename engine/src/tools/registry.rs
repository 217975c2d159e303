//! Static tool registry for one run.
//!
//! The registry owns the run's environment. Dispatch never fails past this
//! boundary: unknown tools, malformed arguments, schema violations, and
//! handler errors all come back as error results for the model to read.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use jsonschema::{Draft, Validator};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::environment::Environment;
use crate::tools::{Tool, ToolCall, ToolDefinition, ToolResult};

static TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,64}$").expect("tool name regex is valid"));

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid tool name {0:?} (expected [a-zA-Z0-9_-]{{1,64}})")]
    InvalidName(String),
    #[error("tool already registered: {0}")]
    Duplicate(String),
    #[error("tool {name} has an invalid parameter schema: {message}")]
    InvalidSchema { name: String, message: String },
}

struct Registered {
    tool: Arc<dyn Tool>,
    validator: Validator,
}

pub struct ToolRegistry {
    env: Box<dyn Environment>,
    tools: BTreeMap<String, Registered>,
    output_limit_bytes: usize,
}

impl ToolRegistry {
    pub fn new(env: Box<dyn Environment>, output_limit_bytes: usize) -> Self {
        Self {
            env,
            tools: BTreeMap::new(),
            output_limit_bytes,
        }
    }

    pub fn with_tools(
        env: Box<dyn Environment>,
        output_limit_bytes: usize,
        tools: impl IntoIterator<Item = Arc<dyn Tool>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new(env, output_limit_bytes);
        for tool in tools {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let name = tool.name().to_string();
        if !TOOL_NAME_RE.is_match(&name) {
            return Err(RegistryError::InvalidName(name));
        }
        if self.tools.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        let schema = tool.parameters();
        if schema.get("type").and_then(Value::as_str) != Some("object") {
            return Err(RegistryError::InvalidSchema {
                name,
                message: "top-level type must be \"object\"".to_string(),
            });
        }
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|e| RegistryError::InvalidSchema {
                name: name.clone(),
                message: e.to_string(),
            })?;
        debug!(tool = %name, "tool registered");
        self.tools.insert(name, Registered { tool, validator });
        Ok(())
    }

    pub fn environment(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Definitions advertised to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|r| ToolDefinition {
                name: r.tool.name().to_string(),
                description: r.tool.description().to_string(),
                parameters: r.tool.parameters(),
            })
            .collect()
    }

    /// Parse and schema-check a call's arguments without running it.
    pub fn validate(&self, call: &ToolCall) -> Result<Value, String> {
        let registered = self
            .tools
            .get(&call.name)
            .ok_or_else(|| unknown_tool_message(&call.name, self.names()))?;
        parse_and_validate(&call.name, &call.arguments, &registered.validator)
    }

    /// Run one tool call. Always returns a result; failures set `is_error`.
    #[instrument(skip_all, fields(tool = %call.name, call_id = %call.id))]
    pub fn dispatch(&self, call: &ToolCall) -> ToolResult {
        let outcome = self.run(call);
        let (content, is_error) = match outcome {
            Ok(content) => (content, false),
            Err(message) => {
                warn!(error = %message, "tool call failed");
                (message, true)
            }
        };
        ToolResult {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: truncate(content, self.output_limit_bytes),
            is_error,
        }
    }

    fn run(&self, call: &ToolCall) -> Result<String, String> {
        let registered = self
            .tools
            .get(&call.name)
            .ok_or_else(|| unknown_tool_message(&call.name, self.names()))?;
        let args = parse_and_validate(&call.name, &call.arguments, &registered.validator)?;
        debug!("invoking tool handler");
        registered
            .tool
            .call(self.env.as_ref(), &args)
            .map(|output| output.into_content())
            .map_err(|e| format!("Error: {e}"))
    }
}

fn unknown_tool_message(name: &str, known: Vec<&str>) -> String {
    format!(
        "Error: unknown tool '{name}'. Available tools: {}",
        known.join(", ")
    )
}

fn parse_and_validate(name: &str, raw: &str, validator: &Validator) -> Result<Value, String> {
    let args: Value = if raw.trim().is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_str(raw)
            .map_err(|e| format!("Error: arguments for {name} are not valid JSON: {e}"))?
    };
    let messages: Vec<String> = validator
        .iter_errors(&args)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(format!(
            "Error: invalid arguments for {name}: {}",
            messages.join("; ")
        ));
    }
    Ok(args)
}

/// Cut `content` to at most `limit` bytes on a char boundary, with a notice.
pub(crate) fn truncate(content: String, limit: usize) -> String {
    if content.len() <= limit {
        return content;
    }
    let mut end = limit;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    let dropped = content.len() - end;
    let mut out = content[..end].to_string();
    out.push_str(&format!("\n[output truncated {dropped} bytes]"));
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::test_support::host_env;
    use crate::tools::{ToolError, ToolOutput};

    struct Echo {
        calls: AtomicUsize,
    }

    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the message back."
        }
        fn parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "message": { "type": "string" } },
                "required": ["message"],
                "additionalProperties": false
            })
        }
        fn call(&self, _env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::Text(
                args["message"].as_str().unwrap_or_default().to_string(),
            ))
        }
    }

    struct Named(&'static str, Value);

    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test"
        }
        fn parameters(&self) -> Value {
            self.1.clone()
        }
        fn call(&self, _env: &dyn Environment, _args: &Value) -> Result<ToolOutput, ToolError> {
            Err(ToolError::Failed("always fails".to_string()))
        }
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call_1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn registry_with_echo() -> (tempfile::TempDir, Arc<Echo>, ToolRegistry) {
        let (temp, env) = host_env();
        let echo = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let registry =
            ToolRegistry::with_tools(Box::new(env), 1_000, [echo.clone() as Arc<dyn Tool>])
                .expect("registry");
        (temp, echo, registry)
    }

    #[test]
    fn valid_call_reaches_the_handler() {
        let (_temp, echo, registry) = registry_with_echo();
        let result = registry.dispatch(&call("echo", r#"{"message":"hi"}"#));
        assert!(!result.is_error);
        assert_eq!(result.content, "hi");
        assert_eq!(result.tool_call_id, "call_1");
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn schema_violation_never_invokes_the_handler() {
        let (_temp, echo, registry) = registry_with_echo();
        let result = registry.dispatch(&call("echo", r#"{"message": 5}"#));
        assert!(result.is_error);
        assert!(result.content.contains("invalid arguments for echo"), "{}", result.content);

        let result = registry.dispatch(&call("echo", r#"{"message":"hi","extra":1}"#));
        assert!(result.is_error);
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn malformed_json_and_unknown_tools_are_error_results() {
        let (_temp, echo, registry) = registry_with_echo();
        let result = registry.dispatch(&call("echo", "{not json"));
        assert!(result.is_error);
        assert!(result.content.contains("not valid JSON"));

        let result = registry.dispatch(&call("nope", "{}"));
        assert!(result.is_error);
        assert!(result.content.contains("unknown tool 'nope'"));
        assert!(result.content.contains("echo"));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_errors_become_error_results() {
        let (_temp, env) = host_env();
        let tool = Arc::new(Named("fails", json!({"type": "object"})));
        let registry =
            ToolRegistry::with_tools(Box::new(env), 1_000, [tool as Arc<dyn Tool>]).expect("registry");
        let result = registry.dispatch(&call("fails", ""));
        assert!(result.is_error);
        assert_eq!(result.content, "Error: always fails");
    }

    #[test]
    fn registration_rejects_bad_names_duplicates_and_schemas() {
        let (_temp, env) = host_env();
        let mut registry = ToolRegistry::new(Box::new(env), 1_000);

        let err = registry
            .register(Arc::new(Named("has space", json!({"type": "object"}))))
            .expect_err("bad name");
        assert!(matches!(err, RegistryError::InvalidName(_)));

        registry
            .register(Arc::new(Named("ok", json!({"type": "object"}))))
            .expect("register");
        let err = registry
            .register(Arc::new(Named("ok", json!({"type": "object"}))))
            .expect_err("duplicate");
        assert!(matches!(err, RegistryError::Duplicate(_)));

        let err = registry
            .register(Arc::new(Named(
                "broken",
                json!({"type": "object", "properties": {"a": {"type": 12}}}),
            )))
            .expect_err("bad schema");
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));

        let err = registry
            .register(Arc::new(Named("scalar", json!({"type": "string"}))))
            .expect_err("not an object schema");
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
    }

    #[test]
    fn long_results_are_truncated_on_char_boundaries() {
        let out = truncate("héllo world".to_string(), 2);
        assert!(out.starts_with('h'));
        assert!(out.contains("[output truncated"));
        assert_eq!(truncate("short".to_string(), 10), "short");
    }
}
