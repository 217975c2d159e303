//! Container port and lifecycle management.
//!
//! [`ContainerPort`] is the narrow interface to a container runtime. The
//! engine ships [`docker::DockerCli`], which drives any Docker-compatible CLI.
//! [`manager::ContainerManager`] layers naming rules, reuse policy, and
//! idempotent teardown on top of a port.

pub mod docker;
pub mod manager;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::types::ExecOutput;

pub use manager::{ContainerManager, ReusePolicy, StartOutcome};

/// Label marking containers created by this engine.
pub const LABEL_MANAGED: &str = "engine.managed";
/// Label carrying the workflow run id.
pub const LABEL_RUN_ID: &str = "engine.run-id";
pub const LABEL_REPO_OWNER: &str = "engine.repo.owner";
pub const LABEL_REPO_NAME: &str = "engine.repo.name";
pub const LABEL_REPO_BRANCH: &str = "engine.repo.branch";

/// Exit code a container script uses to report a missing path.
pub(crate) const EXIT_NOT_FOUND: i32 = 44;
/// Exit code a container script uses to report a directory where a file was expected.
pub(crate) const EXIT_IS_DIRECTORY: i32 = 45;

/// Name for the sandbox container of a workflow run.
pub fn run_container_name(run_id: &str) -> String {
    let sanitized: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("engine-{sanitized}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Everything needed to create and start a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    /// Entrypoint arguments. Empty keeps the container alive with `sleep infinity`.
    #[serde(default)]
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            workdir: None,
            command: Vec::new(),
        }
    }

    pub fn effective_command(&self) -> Vec<String> {
        if self.command.is_empty() {
            vec!["sleep".to_string(), "infinity".to_string()]
        } else {
            self.command.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Created,
    Running,
    Stopped,
    Removed,
    NotFound,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Removed => "removed",
            ContainerStatus::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub name: String,
    pub status: ContainerStatus,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container name already in use: {name}")]
    NameConflict { name: String },
    #[error("container {name} is not running (status: {status})")]
    NotRunning {
        name: String,
        status: ContainerStatus,
    },
    #[error("container not found: {name}")]
    NotFound { name: String },
    #[error("invalid container name: {name:?}")]
    InvalidName { name: String },
    #[error("container runtime failed during {op}: {message}")]
    Runtime { op: &'static str, message: String },
}

/// Narrow interface to a container runtime. Stateless per call.
pub trait ContainerPort: Send + Sync {
    /// Create and start a container. A taken name is [`ContainerError::NameConflict`].
    fn start(&self, spec: &ContainerSpec) -> Result<(), ContainerError>;

    /// Run `argv` inside the container and wait for both output streams and the exit code.
    fn exec(
        &self,
        name: &str,
        argv: &[String],
        workdir: Option<&str>,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, ContainerError>;

    /// Like [`exec`](Self::exec) without stdin, but keeps all of stdout.
    /// File reads go through here so contents are never cut short.
    fn exec_capture(
        &self,
        name: &str,
        argv: &[String],
        workdir: Option<&str>,
    ) -> Result<ExecOutput, ContainerError>;

    /// Stop a container. A missing container is [`ContainerError::NotFound`].
    fn stop(&self, name: &str) -> Result<(), ContainerError>;

    /// Remove a stopped container. A missing container is [`ContainerError::NotFound`].
    fn remove(&self, name: &str) -> Result<(), ContainerError>;

    /// Current status; [`ContainerStatus::NotFound`] when the runtime has no such container.
    fn status(&self, name: &str) -> Result<ContainerStatus, ContainerError>;

    /// All containers (any status) carrying every given label.
    fn list_by_labels(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerInfo>, ContainerError>;

    /// Stream `contents` into `rel_path` (relative to `workdir`) through stdin.
    ///
    /// Exit code [`EXIT_IS_DIRECTORY`] means the target is a directory.
    fn write_file(
        &self,
        name: &str,
        workdir: &str,
        rel_path: &str,
        contents: &[u8],
        make_dirs: bool,
    ) -> Result<ExecOutput, ContainerError> {
        let mkdir = if make_dirs {
            r#"mkdir -p -- "$(dirname -- "$1")" && "#
        } else {
            ""
        };
        let script = format!(r#"if [ -d "$1" ]; then exit {EXIT_IS_DIRECTORY}; fi; {mkdir}cat > "$1""#);
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script,
            "sh".to_string(),
            rel_path.to_string(),
        ];
        self.exec(name, &argv, Some(workdir), Some(contents))
    }

    /// Print `rel_path` (relative to `workdir`) in full on stdout.
    ///
    /// Exit codes [`EXIT_NOT_FOUND`] and [`EXIT_IS_DIRECTORY`] report a missing
    /// path or a directory.
    fn read_file(
        &self,
        name: &str,
        workdir: &str,
        rel_path: &str,
    ) -> Result<ExecOutput, ContainerError> {
        let script = format!(
            r#"if [ -d "$1" ]; then exit {EXIT_IS_DIRECTORY}; fi; if [ ! -e "$1" ]; then exit {EXIT_NOT_FOUND}; fi; cat -- "$1""#
        );
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script,
            "sh".to_string(),
            rel_path.to_string(),
        ];
        self.exec_capture(name, &argv, Some(workdir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_container_name_replaces_unsafe_characters() {
        assert_eq!(run_container_name("run/1 x"), "engine-run-1-x");
        assert_eq!(
            run_container_name("0190a1b2-c3d4"),
            "engine-0190a1b2-c3d4"
        );
    }

    #[test]
    fn empty_command_keeps_container_alive() {
        let spec = ContainerSpec::new("alpine:3", "engine-x");
        assert_eq!(spec.effective_command(), vec!["sleep", "infinity"]);
    }
}
