//! One workflow run, end to end.
//!
//! Create the run record, mark it running, prepare the workspace, build the
//! environment and tool registry, render prompts, run the agent, tear the
//! container down, and record how it ended.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::agent::{Agent, AgentConfig};
use crate::container::manager::run_labels;
use crate::container::{
    ContainerManager, ContainerSpec, Mount, ReusePolicy, StartOutcome, run_container_name,
};
use crate::core::state::WorkflowState;
use crate::core::types::{Initiator, RepoRef, RunConfig, RunTarget, WorkflowRun, WorkflowType};
use crate::environment::{EnvironmentSpec, ExecLimits};
use crate::events::{EventBus, EventLog, WorkflowReporter};
use crate::io::config::EngineConfig;
use crate::llm::{CompletionPort, RetryPolicy, Retrying};
use crate::prompt::{PromptEngine, PromptInput};
use crate::tools::{ToolRegistry, builtin_tools};

/// Where a run's tools act.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Workspace {
    /// Directly on a host directory.
    Host { root: PathBuf },
    /// In a fresh container. `source` is bind-mounted at the configured mount
    /// path; without it the target repository is cloned inside the container.
    Container {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },
}

fn system_initiator() -> Initiator {
    Initiator::System
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequest {
    /// Generated (UUIDv7) when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub workflow_type: WorkflowType,
    #[serde(default = "system_initiator")]
    pub initiator: Initiator,
    #[serde(default)]
    pub target: RunTarget,
    #[serde(default)]
    pub config: RunConfig,
    /// Task text handed to the agent, e.g. an issue body.
    #[serde(default)]
    pub instructions: String,
    pub workspace: Workspace,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: String,
    pub state: WorkflowState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct WorkflowEngine {
    config: EngineConfig,
    log: Arc<EventLog>,
    bus: Arc<EventBus>,
    llm: Arc<dyn CompletionPort>,
    containers: Arc<ContainerManager>,
    prompts: PromptEngine,
}

impl WorkflowEngine {
    /// `llm` is wrapped in the configured retry policy.
    pub fn new(
        config: EngineConfig,
        log: Arc<EventLog>,
        bus: Arc<EventBus>,
        llm: Arc<dyn CompletionPort>,
        containers: Arc<ContainerManager>,
    ) -> Result<Self> {
        config.validate()?;
        let llm: Arc<dyn CompletionPort> =
            Arc::new(Retrying::new(llm, RetryPolicy::from_config(&config.retry)));
        Ok(Self {
            config,
            log,
            bus,
            llm,
            containers,
            prompts: PromptEngine::new()?,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn reporter(&self, run_id: &str) -> WorkflowReporter {
        WorkflowReporter::new(run_id, self.log.clone(), self.bus.clone())
    }

    /// Record a new run in `pending` state.
    pub fn create_run(&self, request: &WorkflowRequest) -> Result<WorkflowRun> {
        let run = WorkflowRun {
            id: request
                .run_id
                .clone()
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            workflow_type: request.workflow_type,
            created_at: Utc::now(),
            initiator: request.initiator.clone(),
            target: request.target.clone(),
            config: request.config.clone(),
        };
        self.log
            .create_run(&run)
            .with_context(|| format!("failed to create run {}", run.id))?;
        info!(run_id = %run.id, workflow = %run.workflow_type, "run created");
        Ok(run)
    }

    /// Create and execute a run on the calling thread.
    pub fn run(&self, request: &WorkflowRequest) -> Result<RunOutcome> {
        let run = self.create_run(request)?;
        Ok(self.execute(&run, request))
    }

    /// Like [`run`](Self::run), but gives up waiting after `timeout`.
    ///
    /// On expiry the run is recorded as `timedOut` and this returns at once.
    /// The worker is not cancelled; its next report is rejected because the
    /// run has ended, and it then tears its container down.
    pub fn run_with_deadline(
        self: &Arc<Self>,
        request: WorkflowRequest,
        timeout: Duration,
    ) -> Result<RunOutcome> {
        let run = self.create_run(&request)?;
        Ok(self.execute_with_deadline(run, request, timeout))
    }

    /// Create a run and execute it in the background under the configured deadline.
    ///
    /// The run's live channel is open on return, so a subscriber attached
    /// right away sees every event from `running` onwards.
    pub fn spawn(self: &Arc<Self>, request: WorkflowRequest) -> Result<WorkflowRun> {
        let run = self.create_run(&request)?;
        self.bus.open(&run.id);
        let engine = Arc::clone(self);
        let background = run.clone();
        let timeout = self.config.run_timeout();
        let spawned = thread::Builder::new()
            .name(format!("watchdog-{}", run.id))
            .spawn(move || {
                engine.execute_with_deadline(background, request, timeout);
            });
        if let Err(err) = spawned {
            self.bus.close(&run.id);
            return Err(err).context("failed to spawn run watchdog");
        }
        Ok(run)
    }

    fn execute_with_deadline(
        self: &Arc<Self>,
        run: WorkflowRun,
        request: WorkflowRequest,
        timeout: Duration,
    ) -> RunOutcome {
        let run_id = run.id.clone();
        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("run-{run_id}"))
            .spawn(move || {
                let outcome = engine.execute(&run, &request);
                // The watchdog may have stopped listening.
                let _ = tx.send(outcome);
            });
        if let Err(err) = spawned {
            let message = format!("failed to spawn run worker: {err}");
            return self.fail(&self.reporter(&run_id), &run_id, message);
        }

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                let message = format!("run exceeded its deadline of {}s", timeout.as_secs());
                warn!(run_id = %run_id, timeout_secs = timeout.as_secs(), "run timed out");
                if let Err(err) = self.reporter(&run_id).timed_out(&message) {
                    warn!(run_id = %run_id, %err, "run ended before the watchdog fired");
                }
                self.outcome(&run_id, None, Some(message))
            }
            Err(RecvTimeoutError::Disconnected) => self.fail(
                &self.reporter(&run_id),
                &run_id,
                "run worker panicked".to_string(),
            ),
        }
    }

    /// Execute an already created run to its end. Never panics on run failure;
    /// the outcome carries the derived final state.
    #[instrument(skip_all, fields(run_id = %run.id, workflow = %run.workflow_type))]
    pub fn execute(&self, run: &WorkflowRun, request: &WorkflowRequest) -> RunOutcome {
        let reporter = self.reporter(&run.id);
        if let Err(err) = reporter.start(Some(&format!("Starting {} run", run.workflow_type))) {
            return self.outcome(&run.id, None, Some(err.to_string()));
        }

        let setup = reporter.child("container-setup");
        let mut container = None;
        let env_spec = match self.prepare_workspace(run, request, &setup, &mut container) {
            Ok(spec) => spec,
            Err(err) => {
                self.teardown(container.as_deref(), &reporter);
                return self.fail(&setup, &run.id, format!("{err:#}"));
            }
        };

        let result = self.run_agent(run, request, &env_spec, &reporter);
        self.teardown(container.as_deref(), &reporter);

        match result {
            Ok(answer) => {
                if let Err(err) = reporter.complete(Some(&answer)) {
                    return self.outcome(&run.id, Some(answer), Some(err.to_string()));
                }
                self.outcome(&run.id, Some(answer), None)
            }
            Err(err) => self.fail(&reporter, &run.id, format!("{err:#}")),
        }
    }

    fn prepare_workspace(
        &self,
        run: &WorkflowRun,
        request: &WorkflowRequest,
        setup: &WorkflowReporter,
        container: &mut Option<String>,
    ) -> Result<EnvironmentSpec> {
        let (source, image) = match &request.workspace {
            Workspace::Host { root } => {
                setup.info(&format!("using host directory {}", root.display()))?;
                return Ok(EnvironmentSpec::Host { root: root.clone() });
            }
            Workspace::Container { source, image } => (source, image),
        };

        let settings = &self.config.container;
        let name = run_container_name(&run.id);
        let image = image.clone().unwrap_or_else(|| settings.image.clone());
        let mut spec = ContainerSpec::new(&image, &name);
        spec.workdir = Some(settings.mount_path.clone());
        spec.labels = run_labels(&run.id, run.target.repository.as_ref());
        if let Some(source) = source {
            let source = source
                .canonicalize()
                .with_context(|| format!("workspace source {} is not accessible", source.display()))?;
            spec.mounts.push(Mount {
                source,
                target: settings.mount_path.clone(),
                read_only: false,
            });
        }

        setup.status(&format!("starting container {name} from {image}"))?;
        let policy = if settings.reuse_existing {
            ReusePolicy::Reuse
        } else {
            ReusePolicy::Fail
        };
        let outcome = self
            .containers
            .start(&spec, policy)
            .with_context(|| format!("failed to start container {name}"))?;
        *container = Some(name.clone());
        let verb = match outcome {
            StartOutcome::Created => "created",
            StartOutcome::Reused => "reused",
            StartOutcome::Recreated => "recreated",
        };
        setup.info(&format!("container {name} {verb}"))?;

        if source.is_none() {
            match &run.target.repository {
                Some(repo) => self.clone_repository(&name, repo, setup)?,
                None => {
                    setup.warn("no source directory or repository; workspace starts empty")?;
                }
            }
        }

        Ok(EnvironmentSpec::Container {
            name,
            mount_path: settings.mount_path.clone(),
        })
    }

    fn clone_repository(
        &self,
        name: &str,
        repo: &RepoRef,
        setup: &WorkflowReporter,
    ) -> Result<()> {
        let url = format!(
            "{}/{}/{}.git",
            self.config.container.clone_url_base.trim_end_matches('/'),
            repo.owner,
            repo.name
        );
        setup.status(&format!("cloning {url}"))?;
        let mut argv = vec!["git".to_string(), "clone".to_string(), "--depth=1".to_string()];
        if let Some(branch) = &repo.branch {
            argv.push("--branch".to_string());
            argv.push(branch.clone());
        }
        argv.push("--".to_string());
        argv.push(url.clone());
        argv.push(".".to_string());

        let out = self
            .containers
            .exec(name, &argv, Some(&self.config.container.mount_path))
            .with_context(|| format!("failed to clone {url}"))?;
        if !out.success() {
            return Err(anyhow!(
                "git clone {url} failed with exit code {}: {}",
                out.exit_code,
                out.stderr.trim()
            ));
        }
        Ok(())
    }

    fn run_agent(
        &self,
        run: &WorkflowRun,
        request: &WorkflowRequest,
        env_spec: &EnvironmentSpec,
        reporter: &WorkflowReporter,
    ) -> Result<String> {
        let limits = ExecLimits {
            timeout: self.config.command_timeout(),
            output_limit_bytes: self.config.exec.output_limit_bytes,
        };
        let env = env_spec
            .build(&self.containers, limits)
            .context("failed to build environment")?;
        let environment = env.describe();
        let tools = ToolRegistry::with_tools(
            env,
            self.config.exec.output_limit_bytes,
            builtin_tools(run.workflow_type, &run.config, &self.config.tools),
        )
        .context("failed to register tools")?;
        let definitions = tools.definitions();
        let prompts = self.prompts.render(&PromptInput {
            run,
            instructions: &request.instructions,
            environment: &environment,
            tools: &definitions,
        })?;

        let agent = Agent::new(
            self.llm.as_ref(),
            &tools,
            reporter,
            AgentConfig {
                max_turns: self.config.max_turns,
                model: None,
                max_tokens: Some(self.config.llm.max_tokens),
            },
        );
        let outcome = agent.run(&prompts.system, &prompts.user)?;
        reporter.info(&format!(
            "agent finished after {} turns and {} tool calls",
            outcome.turns, outcome.tool_calls
        ))?;
        Ok(outcome.final_answer)
    }

    fn teardown(&self, container: Option<&str>, reporter: &WorkflowReporter) {
        let Some(name) = container else {
            return;
        };
        let teardown = reporter.child("teardown");
        // Report failures here are already logged by the event log.
        if self.config.container.keep_container {
            let _ = teardown.info(&format!("keeping container {name}"));
            return;
        }
        match self.containers.remove(name) {
            Ok(()) => {
                let _ = teardown.info(&format!("removed container {name}"));
            }
            Err(err) => {
                warn!(container = name, %err, "container teardown failed");
                let _ = teardown.warn(&format!("failed to remove container {name}: {err}"));
            }
        }
    }

    fn fail(&self, reporter: &WorkflowReporter, run_id: &str, message: String) -> RunOutcome {
        if let Err(err) = reporter.error(&message) {
            warn!(run_id, %err, "could not record run failure");
        }
        self.outcome(run_id, None, Some(message))
    }

    fn outcome(
        &self,
        run_id: &str,
        final_answer: Option<String>,
        error: Option<String>,
    ) -> RunOutcome {
        let state = self.log.state(run_id).unwrap_or_else(|err| {
            warn!(run_id, %err, "could not derive run state");
            WorkflowState::Error
        });
        RunOutcome {
            run_id: run_id.to_string(),
            state,
            final_answer,
            error,
        }
    }
}
