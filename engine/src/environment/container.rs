//! Environment over a running container's mounted workspace.
//!
//! File operations are small shell scripts run with the mount as working
//! directory; paths are passed as positional arguments, never interpolated.

use std::sync::Arc;

use tracing::instrument;

use crate::container::{ContainerManager, EXIT_IS_DIRECTORY, EXIT_NOT_FOUND};
use crate::core::path::{relative_dir_path, relative_file_path};
use crate::core::types::ExecOutput;
use crate::environment::{EnvError, Environment};

fn delete_script() -> String {
    format!(
        r#"if [ -d "$1" ]; then exit {EXIT_IS_DIRECTORY}; fi; if [ ! -e "$1" ] && [ ! -L "$1" ]; then exit {EXIT_NOT_FOUND}; fi; rm -f -- "$1""#
    )
}

pub struct ContainerEnvironment {
    containers: Arc<ContainerManager>,
    name: String,
    mount_path: String,
}

impl ContainerEnvironment {
    pub fn new(containers: Arc<ContainerManager>, name: String, mount_path: String) -> Self {
        let mount_path = mount_path.trim_end_matches('/').to_string();
        Self {
            containers,
            name,
            mount_path,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn run_script(&self, script: &str, rel: &str) -> Result<ExecOutput, EnvError> {
        let argv = vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            rel.to_string(),
        ];
        Ok(self
            .containers
            .exec(&self.name, &argv, Some(&self.mount_path))?)
    }

    fn workdir(&self, rel: &str) -> String {
        if rel.is_empty() {
            self.mount_path.clone()
        } else {
            format!("{}/{rel}", self.mount_path)
        }
    }
}

/// Turn a script's exit status into the shared error vocabulary.
fn check_script(out: &ExecOutput, rel: &str, op: &str, directory_error: fn(String) -> EnvError) -> Result<(), EnvError> {
    match out.exit_code {
        0 if !out.timed_out => Ok(()),
        EXIT_NOT_FOUND => Err(EnvError::NotFound {
            path: rel.to_string(),
        }),
        EXIT_IS_DIRECTORY => Err(directory_error(rel.to_string())),
        code => Err(EnvError::io(
            format!("{op} {rel} failed with exit code {code}: {}", out.stderr.trim()),
            std::io::Error::other(out.stderr.trim().to_string()),
        )),
    }
}

fn is_a_directory(path: String) -> EnvError {
    EnvError::IsADirectory { path }
}

fn refused_directory(path: String) -> EnvError {
    EnvError::RefusedDirectory { path }
}

impl Environment for ContainerEnvironment {
    fn describe(&self) -> String {
        format!("container:{}:{}", self.name, self.mount_path)
    }

    fn read_file(&self, path: &str) -> Result<String, EnvError> {
        let rel = relative_file_path(path)?;
        let out = self.containers.read_file(&self.name, &self.mount_path, &rel)?;
        check_script(&out, &rel, "read", is_a_directory)?;
        Ok(out.stdout)
    }

    #[instrument(skip_all, fields(container = %self.name, path = %path, bytes = contents.len()))]
    fn write_file(&self, path: &str, contents: &str) -> Result<(), EnvError> {
        let rel = relative_file_path(path)?;
        let out = self.containers.write_file(
            &self.name,
            &self.mount_path,
            &rel,
            contents.as_bytes(),
            true,
        )?;
        check_script(&out, &rel, "write", is_a_directory)
    }

    #[instrument(skip_all, fields(container = %self.name, path = %path))]
    fn delete_file(&self, path: &str) -> Result<(), EnvError> {
        let rel = relative_file_path(path)?;
        let out = self.run_script(&delete_script(), &rel)?;
        check_script(&out, &rel, "delete", refused_directory)
    }

    #[instrument(skip_all, fields(container = %self.name, cwd = ?cwd))]
    fn exec(&self, command: &str, cwd: Option<&str>) -> Result<ExecOutput, EnvError> {
        let rel = match cwd {
            Some(cwd) => relative_dir_path(cwd)?,
            None => String::new(),
        };
        let argv = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        Ok(self
            .containers
            .exec(&self.name, &argv, Some(&self.workdir(&rel)))?)
    }
}
