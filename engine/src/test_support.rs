//! Test-only fixtures: scratch environments, a fake container runtime, a
//! scripted completion port, and event log wiring.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::container::{ContainerError, ContainerInfo, ContainerPort, ContainerSpec, ContainerStatus};
use crate::core::types::{ExecOutput, Initiator, RunConfig, RunTarget, WorkflowRun, WorkflowType};
use crate::environment::{Environment, ExecLimits, HostEnvironment};
use crate::events::{EventBus, EventLog, InMemoryEventRepository, WorkflowReporter};
use crate::io::process::run_command_with_timeout;
use crate::llm::{Completion, CompletionPort, CompletionRequest, LlmError};
use crate::tools::{Tool, ToolCall, ToolError, ToolOutput};

pub fn exec_limits() -> ExecLimits {
    ExecLimits {
        timeout: Duration::from_secs(30),
        output_limit_bytes: 64 * 1024,
    }
}

/// A host environment rooted in a fresh temp dir. Keep the `TempDir` alive.
pub fn host_env() -> (TempDir, HostEnvironment) {
    let temp = tempfile::tempdir().expect("create tempdir");
    let env = HostEnvironment::new(temp.path(), exec_limits()).expect("host environment");
    (temp, env)
}

/// A deterministic run record with no target.
pub fn sample_run(id: &str) -> WorkflowRun {
    WorkflowRun {
        id: id.to_string(),
        workflow_type: WorkflowType::ResolveIssue,
        created_at: Utc
            .with_ymd_and_hms(2026, 1, 2, 3, 4, 5)
            .single()
            .expect("valid timestamp"),
        initiator: Initiator::System,
        target: RunTarget::default(),
        config: RunConfig::default(),
    }
}

pub fn memory_log() -> Arc<EventLog> {
    Arc::new(EventLog::new(Arc::new(InMemoryEventRepository::new())))
}

/// An in-memory log with `run_id` created, a bus, and a reporter for the run.
pub fn reporter_fixture(run_id: &str) -> (Arc<EventLog>, Arc<EventBus>, WorkflowReporter) {
    let log = memory_log();
    log.create_run(&sample_run(run_id)).expect("create run");
    let bus = Arc::new(EventBus::new(64));
    let reporter = WorkflowReporter::new(run_id, log.clone(), bus.clone());
    (log, bus, reporter)
}

/// Completion port that replays a fixed script and records every request.
#[derive(Default)]
pub struct ScriptedCompletion {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedCompletion {
    pub fn new(script: impl IntoIterator<Item = Result<Completion, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }
}

impl CompletionPort for ScriptedCompletion {
    fn create_completion(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .expect("scripted completion exhausted")
    }
}

/// A final answer with no tool calls.
pub fn answer(content: &str) -> Result<Completion, LlmError> {
    Ok(Completion {
        content: content.to_string(),
        reasoning: None,
        tool_calls: Vec::new(),
        usage: None,
        model: "scripted".to_string(),
    })
}

/// A turn that only requests tool calls, given as `(id, name, arguments)`.
pub fn tool_turn(calls: &[(&str, &str, Value)]) -> Result<Completion, LlmError> {
    Ok(Completion {
        content: String::new(),
        reasoning: None,
        tool_calls: calls
            .iter()
            .map(|(id, name, args)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                arguments: args.to_string(),
            })
            .collect(),
        usage: None,
        model: "scripted".to_string(),
    })
}

/// Tool that sleeps, then echoes its name. Used to provoke out-of-order completion.
pub struct SleepTool {
    pub name: String,
    pub delay: Duration,
}

impl Tool for SleepTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Sleep, then report which tool finished."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}, "additionalProperties": false})
    }

    fn call(&self, _env: &dyn Environment, _args: &Value) -> Result<ToolOutput, ToolError> {
        thread::sleep(self.delay);
        Ok(ToolOutput::Text(format!("{} done", self.name)))
    }
}

struct FakeContainer {
    status: ContainerStatus,
    labels: BTreeMap<String, String>,
    root: TempDir,
}

impl FakeContainer {
    /// Map an absolute container path onto the backing temp dir.
    fn host_path(&self, container_path: &str) -> PathBuf {
        self.root.path().join(container_path.trim_start_matches('/'))
    }
}

/// In-process container runtime: each container is a temp dir, and exec runs
/// the argv on the host with the mapped working directory.
#[derive(Default)]
pub struct FakeContainerRuntime {
    containers: Mutex<HashMap<String, FakeContainer>>,
    starts: AtomicUsize,
    execs: AtomicUsize,
}

impl FakeContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn force_status(&self, name: &str, status: ContainerStatus) {
        if let Some(container) = self.containers.lock().expect("containers lock").get_mut(name) {
            container.status = status;
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .lock()
            .expect("containers lock")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Host directory backing `container_path` inside `name`.
    pub fn host_path(&self, name: &str, container_path: &str) -> Option<PathBuf> {
        self.containers
            .lock()
            .expect("containers lock")
            .get(name)
            .map(|container| container.host_path(container_path))
    }
}

fn link_mount(source: &Path, target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::os::unix::fs::symlink(source, target)
}

impl FakeContainerRuntime {
    fn exec_limited(
        &self,
        name: &str,
        argv: &[String],
        workdir: Option<&str>,
        stdin: Option<&[u8]>,
        output_limit_bytes: usize,
    ) -> Result<ExecOutput, ContainerError> {
        let cwd = {
            let containers = self.containers.lock().expect("containers lock");
            let container = containers.get(name).ok_or_else(|| ContainerError::NotFound {
                name: name.to_string(),
            })?;
            if container.status != ContainerStatus::Running {
                return Err(ContainerError::NotRunning {
                    name: name.to_string(),
                    status: container.status,
                });
            }
            container.host_path(workdir.unwrap_or("/"))
        };
        self.execs.fetch_add(1, Ordering::SeqCst);

        let (program, args) = argv.split_first().ok_or_else(|| ContainerError::Runtime {
            op: "exec",
            message: "empty argv".to_string(),
        })?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&cwd);
        let output = run_command_with_timeout(cmd, stdin, exec_limits().timeout, output_limit_bytes)
            .map_err(|err| ContainerError::Runtime {
                op: "exec",
                message: format!("{err:#}"),
            })?;
        Ok(output.into_exec_output("exec"))
    }
}

impl ContainerPort for FakeContainerRuntime {
    fn start(&self, spec: &ContainerSpec) -> Result<(), ContainerError> {
        let mut containers = self.containers.lock().expect("containers lock");
        if containers.contains_key(&spec.name) {
            return Err(ContainerError::NameConflict {
                name: spec.name.clone(),
            });
        }
        let container = FakeContainer {
            status: ContainerStatus::Running,
            labels: spec.labels.clone(),
            root: tempfile::tempdir().expect("container tempdir"),
        };
        for mount in &spec.mounts {
            link_mount(&mount.source, &container.host_path(&mount.target))
                .expect("link fake mount");
        }
        if let Some(workdir) = &spec.workdir {
            std::fs::create_dir_all(container.host_path(workdir)).expect("create workdir");
        }
        containers.insert(spec.name.clone(), container);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn exec(
        &self,
        name: &str,
        argv: &[String],
        workdir: Option<&str>,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, ContainerError> {
        self.exec_limited(name, argv, workdir, stdin, exec_limits().output_limit_bytes)
    }

    fn exec_capture(
        &self,
        name: &str,
        argv: &[String],
        workdir: Option<&str>,
    ) -> Result<ExecOutput, ContainerError> {
        self.exec_limited(name, argv, workdir, None, usize::MAX)
    }

    fn stop(&self, name: &str) -> Result<(), ContainerError> {
        let mut containers = self.containers.lock().expect("containers lock");
        let container = containers.get_mut(name).ok_or_else(|| ContainerError::NotFound {
            name: name.to_string(),
        })?;
        container.status = ContainerStatus::Stopped;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), ContainerError> {
        let mut containers = self.containers.lock().expect("containers lock");
        match containers.get(name) {
            None => Err(ContainerError::NotFound {
                name: name.to_string(),
            }),
            Some(container) if container.status == ContainerStatus::Running => {
                Err(ContainerError::Runtime {
                    op: "remove",
                    message: format!("cannot remove running container {name}"),
                })
            }
            Some(_) => {
                containers.remove(name);
                Ok(())
            }
        }
    }

    fn status(&self, name: &str) -> Result<ContainerStatus, ContainerError> {
        Ok(self
            .containers
            .lock()
            .expect("containers lock")
            .get(name)
            .map_or(ContainerStatus::NotFound, |container| container.status))
    }

    fn list_by_labels(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerInfo>, ContainerError> {
        let containers = self.containers.lock().expect("containers lock");
        let mut found: Vec<ContainerInfo> = containers
            .iter()
            .filter(|(_, container)| {
                labels
                    .iter()
                    .all(|(key, value)| container.labels.get(key) == Some(value))
            })
            .map(|(name, container)| ContainerInfo {
                name: name.clone(),
                status: container.status,
                labels: container.labels.clone(),
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }
}
