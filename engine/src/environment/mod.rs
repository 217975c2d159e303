//! Where tools act: the host filesystem or a managed container.
//!
//! Both implementations validate every relative path before touching
//! anything, and report the same error kinds for the same situations.

pub mod container;
pub mod host;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::container::{ContainerError, ContainerManager};
use crate::core::path::PathError;
use crate::core::types::ExecOutput;

pub use container::ContainerEnvironment;
pub use host::HostEnvironment;

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),
    #[error("file not found: {path}")]
    NotFound { path: String },
    #[error("path is a directory: {path}")]
    IsADirectory { path: String },
    #[error("refusing to delete directory: {path}")]
    RefusedDirectory { path: String },
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("command failed to start: {0}")]
    Spawn(String),
}

impl EnvError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        EnvError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Filesystem and command access scoped to one workspace.
pub trait Environment: Send + Sync {
    /// Short human-readable description, e.g. `host:/tmp/ws`.
    fn describe(&self) -> String;

    fn read_file(&self, path: &str) -> Result<String, EnvError>;

    /// Create or overwrite a file, creating parent directories as needed.
    fn write_file(&self, path: &str, contents: &str) -> Result<(), EnvError>;

    /// Delete a file. Directories are refused.
    fn delete_file(&self, path: &str) -> Result<(), EnvError>;

    /// Run a shell command. A nonzero exit code is returned, not raised.
    fn exec(&self, command: &str, cwd: Option<&str>) -> Result<ExecOutput, EnvError>;
}

/// How to build a run's environment. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EnvironmentSpec {
    Host { root: PathBuf },
    Container { name: String, mount_path: String },
}

/// Limits applied to host command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl EnvironmentSpec {
    pub fn build(
        &self,
        containers: &Arc<ContainerManager>,
        limits: ExecLimits,
    ) -> Result<Box<dyn Environment>, EnvError> {
        match self {
            EnvironmentSpec::Host { root } => Ok(Box::new(HostEnvironment::new(root, limits)?)),
            EnvironmentSpec::Container { name, mount_path } => Ok(Box::new(
                ContainerEnvironment::new(containers.clone(), name.clone(), mount_path.clone()),
            )),
        }
    }
}
