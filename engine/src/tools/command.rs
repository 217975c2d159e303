//! Command tools: arbitrary shell commands and the project type-check.

use serde_json::{Value, json};

use crate::environment::Environment;
use crate::tools::{Tool, ToolError, ToolOutput, optional_str, required_str};

pub struct ExecuteCommand;

impl Tool for ExecuteCommand {
    fn name(&self) -> &str {
        "execute_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace. Returns stdout, stderr, exitCode and timedOut; \
         a nonzero exit code is reported, not raised."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "minLength": 1 },
                "cwd": { "type": "string", "description": "Workspace-relative working directory" }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
        let command = required_str(args, "command")?;
        let out = env.exec(command, optional_str(args, "cwd"))?;
        let value = serde_json::to_value(&out).map_err(|e| ToolError::Failed(e.to_string()))?;
        Ok(ToolOutput::Json(value))
    }
}

/// Runs the configured type-check command and reports whether it passed.
pub struct RunTypecheck {
    command: String,
}

impl RunTypecheck {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

impl Tool for RunTypecheck {
    fn name(&self) -> &str {
        "run_typecheck"
    }

    fn description(&self) -> &str {
        "Run the project's type checker and report diagnostics."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "cwd": { "type": "string", "description": "Workspace-relative working directory" }
            },
            "additionalProperties": false
        })
    }

    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
        let out = env.exec(&self.command, optional_str(args, "cwd"))?;
        Ok(ToolOutput::Json(json!({
            "passed": out.success(),
            "exitCode": out.exit_code,
            "timedOut": out.timed_out,
            "stdout": out.stdout,
            "stderr": out.stderr,
        })))
    }
}
