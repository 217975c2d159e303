//! Container port backed by a Docker-compatible CLI.
//!
//! Works with `docker` and `podman`. Each port call is one subprocess; the
//! runtime's own daemon holds all container state.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::container::{
    ContainerError, ContainerInfo, ContainerPort, ContainerSpec, ContainerStatus,
};
use crate::core::types::ExecOutput;
use crate::io::config::{ContainerConfig, ExecConfig};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Lifecycle calls produce little output; cap what we keep of it.
const LIFECYCLE_OUTPUT_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DockerCli {
    runtime: String,
    stop_timeout_secs: u64,
    lifecycle_timeout: Duration,
    exec_timeout: Duration,
    output_limit_bytes: usize,
}

impl DockerCli {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self::from_config(&ContainerConfig::default(), &ExecConfig::default()).with_runtime(runtime)
    }

    pub fn from_config(container: &ContainerConfig, exec: &ExecConfig) -> Self {
        Self {
            runtime: container.runtime.clone(),
            stop_timeout_secs: container.stop_timeout_secs,
            lifecycle_timeout: Duration::from_secs(container.lifecycle_timeout_secs),
            exec_timeout: Duration::from_secs(exec.command_timeout_secs),
            output_limit_bytes: exec.output_limit_bytes,
        }
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = runtime.into();
        self
    }

    fn run(
        &self,
        op: &'static str,
        args: &[String],
        stdin: Option<&[u8]>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Result<CommandOutput, ContainerError> {
        let mut cmd = Command::new(&self.runtime);
        cmd.args(args);
        debug!(runtime = %self.runtime, op, "invoking container runtime");
        run_command_with_timeout(cmd, stdin, timeout, output_limit_bytes).map_err(|e| {
            ContainerError::Runtime {
                op,
                message: format!("{e:#}"),
            }
        })
    }

    fn exec_limited(
        &self,
        name: &str,
        argv: &[String],
        workdir: Option<&str>,
        stdin: Option<&[u8]>,
        output_limit_bytes: usize,
    ) -> Result<ExecOutput, ContainerError> {
        let mut args = vec!["exec".to_string()];
        if stdin.is_some() {
            args.push("-i".to_string());
        }
        if let Some(workdir) = workdir {
            args.push("-w".to_string());
            args.push(workdir.to_string());
        }
        args.push(name.to_string());
        args.extend(argv.iter().cloned());

        let out = self.run("exec", &args, stdin, self.exec_timeout, output_limit_bytes)?;
        if !out.status.success() && !out.timed_out && is_runtime_rejection(&out) {
            return Err(classify_failure("exec", name, &out));
        }
        Ok(out.into_exec_output("exec"))
    }

    fn run_lifecycle(&self, op: &'static str, args: &[String]) -> Result<CommandOutput, ContainerError> {
        let out = self.run(op, args, None, self.lifecycle_timeout, LIFECYCLE_OUTPUT_LIMIT)?;
        if out.timed_out {
            return Err(ContainerError::Runtime {
                op,
                message: format!("timed out after {:?}", self.lifecycle_timeout),
            });
        }
        Ok(out)
    }
}

/// Map a runtime failure onto the port's error vocabulary.
fn classify_failure(op: &'static str, name: &str, out: &CommandOutput) -> ContainerError {
    let stderr = out.stderr_lossy();
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("no such container") || lower.contains("no such object") {
        ContainerError::NotFound {
            name: name.to_string(),
        }
    } else if lower.contains("already in use") {
        ContainerError::NameConflict {
            name: name.to_string(),
        }
    } else if lower.contains("is not running")
        || lower.contains("can only create exec sessions on running containers")
    {
        ContainerError::NotRunning {
            name: name.to_string(),
            status: ContainerStatus::Stopped,
        }
    } else {
        ContainerError::Runtime {
            op,
            message: format!(
                "exit {:?}: {}",
                out.status.code(),
                stderr.trim()
            ),
        }
    }
}

/// True when a failed `exec` was rejected by the runtime rather than by the command.
fn is_runtime_rejection(out: &CommandOutput) -> bool {
    let stderr = out.stderr_lossy();
    stderr.starts_with("Error") && {
        let lower = stderr.to_ascii_lowercase();
        lower.contains("no such container")
            || lower.contains("is not running")
            || lower.contains("can only create exec sessions on running containers")
    }
}

fn parse_status(raw: &str) -> ContainerStatus {
    match raw.trim() {
        "created" => ContainerStatus::Created,
        "running" | "restarting" => ContainerStatus::Running,
        _ => ContainerStatus::Stopped,
    }
}

impl ContainerPort for DockerCli {
    #[instrument(skip_all, fields(name = %spec.name, image = %spec.image))]
    fn start(&self, spec: &ContainerSpec) -> Result<(), ContainerError> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
        ];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &spec.mounts {
            args.push("-v".to_string());
            let mut volume = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push(volume);
        }
        if let Some(workdir) = &spec.workdir {
            args.push("-w".to_string());
            args.push(workdir.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.effective_command());

        let out = self.run_lifecycle("start", &args)?;
        if !out.status.success() {
            let err = classify_failure("start", &spec.name, &out);
            warn!(err = %err, "container start failed");
            return Err(err);
        }
        debug!(id = %out.stdout_lossy().trim(), "container started");
        Ok(())
    }

    #[instrument(skip_all, fields(name = %name, argc = argv.len(), stdin = stdin.is_some()))]
    fn exec(
        &self,
        name: &str,
        argv: &[String],
        workdir: Option<&str>,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, ContainerError> {
        self.exec_limited(name, argv, workdir, stdin, self.output_limit_bytes)
    }

    #[instrument(skip_all, fields(name = %name, argc = argv.len()))]
    fn exec_capture(
        &self,
        name: &str,
        argv: &[String],
        workdir: Option<&str>,
    ) -> Result<ExecOutput, ContainerError> {
        self.exec_limited(name, argv, workdir, None, usize::MAX)
    }

    #[instrument(skip_all, fields(name = %name))]
    fn stop(&self, name: &str) -> Result<(), ContainerError> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            self.stop_timeout_secs.to_string(),
            name.to_string(),
        ];
        let out = self.run_lifecycle("stop", &args)?;
        if !out.status.success() {
            return Err(classify_failure("stop", name, &out));
        }
        Ok(())
    }

    #[instrument(skip_all, fields(name = %name))]
    fn remove(&self, name: &str) -> Result<(), ContainerError> {
        let args = vec!["rm".to_string(), name.to_string()];
        let out = self.run_lifecycle("remove", &args)?;
        if !out.status.success() {
            return Err(classify_failure("remove", name, &out));
        }
        Ok(())
    }

    fn status(&self, name: &str) -> Result<ContainerStatus, ContainerError> {
        let args = vec![
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            name.to_string(),
        ];
        let out = self.run_lifecycle("status", &args)?;
        if !out.status.success() {
            return match classify_failure("status", name, &out) {
                ContainerError::NotFound { .. } => Ok(ContainerStatus::NotFound),
                other => Err(other),
            };
        }
        Ok(parse_status(&out.stdout_lossy()))
    }

    fn list_by_labels(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerInfo>, ContainerError> {
        let mut args = vec!["ps".to_string(), "-a".to_string()];
        for (key, value) in labels {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }
        args.push("--format".to_string());
        args.push("{{.Names}}\t{{.State}}".to_string());

        let out = self.run_lifecycle("list", &args)?;
        if !out.status.success() {
            return Err(classify_failure("list", "", &out));
        }
        let containers = out
            .stdout_lossy()
            .lines()
            .filter_map(|line| {
                let (name, state) = line.split_once('\t')?;
                Some(ContainerInfo {
                    name: name.trim().to_string(),
                    status: parse_status(state),
                    labels: labels.clone(),
                })
            })
            .collect();
        Ok(containers)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// Install a fake runtime script that prints `stderr` and exits with `code`.
    fn fake_runtime(dir: &std::path::Path, stdout: &str, stderr: &str, code: i32) -> String {
        let path = dir.join("fake-docker");
        let script = format!(
            "#!/bin/sh\nprintf '%s' '{stdout}'\nprintf '%s' '{stderr}' >&2\nexit {code}\n"
        );
        fs::write(&path, script).expect("write script");
        let mut perms = fs::metadata(&path).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path.display().to_string()
    }

    #[test]
    fn status_maps_missing_container_to_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = fake_runtime(
            temp.path(),
            "",
            "Error: No such object: engine-x",
            1,
        );
        let cli = DockerCli::new(runtime);
        assert_eq!(cli.status("engine-x").expect("status"), ContainerStatus::NotFound);
    }

    #[test]
    fn status_parses_runtime_states() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = fake_runtime(temp.path(), "exited\n", "", 0);
        let cli = DockerCli::new(runtime);
        assert_eq!(cli.status("engine-x").expect("status"), ContainerStatus::Stopped);
        assert_eq!(parse_status("running"), ContainerStatus::Running);
        assert_eq!(parse_status("created"), ContainerStatus::Created);
    }

    #[test]
    fn start_reports_name_conflicts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = fake_runtime(
            temp.path(),
            "",
            "docker: Error response from daemon: Conflict. The container name \"/engine-x\" is already in use",
            125,
        );
        let cli = DockerCli::new(runtime);
        let err = cli
            .start(&ContainerSpec::new("alpine:3", "engine-x"))
            .expect_err("conflict");
        assert!(matches!(err, ContainerError::NameConflict { .. }), "{err}");
    }

    #[test]
    fn exec_keeps_nonzero_command_exit_as_data() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = fake_runtime(temp.path(), "partial", "boom", 1);
        let cli = DockerCli::new(runtime);
        let out = cli
            .exec("engine-x", &["false".to_string()], None, None)
            .expect("exec");
        assert_eq!(out.exit_code, 1);
        assert_eq!(out.stdout, "partial");
        assert_eq!(out.stderr, "boom");
    }

    #[test]
    fn list_by_labels_parses_name_and_state_columns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runtime = fake_runtime(temp.path(), "engine-a\trunning\nengine-b\texited\n", "", 0);
        let cli = DockerCli::new(runtime);
        let mut labels = BTreeMap::new();
        labels.insert("engine.repo.owner".to_string(), "acme".to_string());
        let found = cli.list_by_labels(&labels).expect("list");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "engine-a");
        assert_eq!(found[0].status, ContainerStatus::Running);
        assert_eq!(found[1].status, ContainerStatus::Stopped);
    }
}
