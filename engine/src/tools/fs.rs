//! File tools: read, write, delete, list.

use serde_json::{Value, json};

use crate::core::path::relative_dir_path;
use crate::environment::Environment;
use crate::tools::{Tool, ToolError, ToolOutput, optional_str, optional_u64, required_str, shell_quote};

const DEFAULT_LIST_DEPTH: u64 = 3;
const MAX_LIST_ENTRIES: usize = 500;

pub struct ReadFile;

impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace. Paths are relative to the workspace root."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
        let path = required_str(args, "path")?;
        Ok(ToolOutput::Text(env.read_file(path)?))
    }
}

pub struct WriteFile;

impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file in the workspace with the given content. Parent directories are created."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" },
                "content": { "type": "string", "description": "Full new file content" }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        })
    }

    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
        let path = required_str(args, "path")?;
        let content = required_str(args, "content")?;
        env.write_file(path, content)?;
        Ok(ToolOutput::Text(format!(
            "Wrote {} bytes to {path}",
            content.len()
        )))
    }
}

pub struct DeleteFile;

impl Tool for DeleteFile {
    fn name(&self) -> &str {
        "delete_file"
    }

    fn description(&self) -> &str {
        "Delete a single file from the workspace. Directories cannot be deleted."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Workspace-relative file path" }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
        let path = required_str(args, "path")?;
        env.delete_file(path)?;
        Ok(ToolOutput::Text(format!("Deleted {path}")))
    }
}

pub struct ListFiles;

impl Tool for ListFiles {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files under a workspace directory, skipping .git and node_modules."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Directory to list; defaults to the workspace root" },
                "max_depth": { "type": "integer", "minimum": 1, "maximum": 20 }
            },
            "additionalProperties": false
        })
    }

    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
        let dir = relative_dir_path(optional_str(args, "path").unwrap_or("."))
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        let depth = optional_u64(args, "max_depth").unwrap_or(DEFAULT_LIST_DEPTH);
        let target = if dir.is_empty() {
            ".".to_string()
        } else {
            shell_quote(&dir)
        };
        let command = format!(
            "find {target} -maxdepth {depth} \\( -name .git -o -name node_modules \\) -prune -o -type f -print | sed 's|^\\./||' | LC_ALL=C sort | head -n {}",
            MAX_LIST_ENTRIES + 1
        );
        let out = env.exec(&command, None)?;
        if !out.stderr.trim().is_empty() && out.stdout.trim().is_empty() {
            return Err(ToolError::Failed(format!(
                "list_files failed: {}",
                out.stderr.trim()
            )));
        }
        let mut files: Vec<&str> = out.stdout.lines().filter(|l| !l.is_empty()).collect();
        let truncated = files.len() > MAX_LIST_ENTRIES;
        files.truncate(MAX_LIST_ENTRIES);
        let shown = if dir.is_empty() { "." } else { dir.as_str() };
        Ok(ToolOutput::Json(json!({
            "path": shown,
            "files": files,
            "truncated": truncated,
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::environment::EnvError;
    use crate::test_support::host_env;

    #[test]
    fn read_write_delete_round_trip_through_tools() {
        let (_temp, env) = host_env();
        WriteFile
            .call(&env, &json!({"path": "a/b.txt", "content": "hello"}))
            .expect("write");
        let text = ReadFile
            .call(&env, &json!({"path": "a/b.txt"}))
            .expect("read")
            .into_content();
        assert_eq!(text, "hello");
        DeleteFile
            .call(&env, &json!({"path": "a/b.txt"}))
            .expect("delete");
        let err = ReadFile
            .call(&env, &json!({"path": "a/b.txt"}))
            .err()
            .expect("gone");
        assert!(matches!(err, ToolError::Env(EnvError::NotFound { .. })));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn list_files_skips_git_and_node_modules() {
        let (temp, env) = host_env();
        for path in ["src/main.ts", "README.md", ".git/HEAD", "node_modules/x/index.js"] {
            let full = temp.path().join(path);
            fs::create_dir_all(full.parent().expect("parent")).expect("mkdir");
            fs::write(full, "x").expect("write");
        }
        let value = match ListFiles.call(&env, &json!({})).expect("list") {
            ToolOutput::Json(value) => value,
            ToolOutput::Text(text) => panic!("expected json, got {text}"),
        };
        assert_eq!(value["files"], json!(["README.md", "src/main.ts"]));
        assert_eq!(value["truncated"], false);

        let value = match ListFiles.call(&env, &json!({"path": "src"})).expect("list") {
            ToolOutput::Json(value) => value,
            ToolOutput::Text(text) => panic!("expected json, got {text}"),
        };
        assert_eq!(value["files"], json!(["src/main.ts"]));
    }

    #[test]
    fn list_files_rejects_traversal() {
        let (_temp, env) = host_env();
        let err = ListFiles
            .call(&env, &json!({"path": "../"}))
            .err()
            .expect("rejected");
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
