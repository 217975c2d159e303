//! Agent execution engine CLI.
//!
//! Runs workflows against a host directory or a container, and inspects the
//! durable event log under the data directory (`.engine/` by default).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use engine::container::{ContainerManager, run_container_name};
use engine::container::docker::DockerCli;
use engine::core::state::WorkflowState;
use engine::core::types::{Initiator, IssueRef, RepoRef, RunConfig, RunTarget, WorkflowType};
use engine::events::{EventBus, EventLog, JsonlEventRepository};
use engine::exit_codes;
use engine::io::config::{EngineConfig, config_path, load_config};
use engine::llm::OpenAiCompatible;
use engine::workflow::{WorkflowEngine, WorkflowRequest, Workspace};

#[derive(Parser)]
#[command(
    name = "engine",
    version,
    about = "Run LLM agent workflows and inspect their event logs"
)]
struct Cli {
    /// Directory holding `config.toml` and the run store.
    #[arg(long, global = true, default_value = ".engine")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute one workflow run and wait for it to end.
    Run(RunArgs),
    /// Print a run's event chain as JSON lines.
    Events {
        run_id: String,
    },
    /// Print a run's derived state; the exit code reflects it.
    State {
        run_id: String,
    },
    /// List runs with their states, optionally only those linked to issues.
    Runs {
        /// Issue reference `owner/repo#number`; repeatable.
        #[arg(long = "issue")]
        issues: Vec<IssueRef>,
    },
    /// Stop and remove every engine container labelled with a branch.
    Cleanup {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: String,
        #[arg(long)]
        branch: String,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    workflow: WorkflowType,

    /// Run id; a UUIDv7 is generated when omitted.
    #[arg(long)]
    run_id: Option<String>,

    /// Work directly in this host directory.
    #[arg(long, conflicts_with_all = ["container", "source", "image"])]
    host_root: Option<PathBuf>,

    /// Work inside a fresh container.
    #[arg(long)]
    container: bool,

    /// Host directory mounted into the container as the workspace.
    #[arg(long, requires = "container")]
    source: Option<PathBuf>,

    /// Container image (defaults to `container.image` from config).
    #[arg(long, requires = "container")]
    image: Option<String>,

    /// Issue the run resolves, `owner/repo#number`.
    #[arg(long)]
    issue: Option<IssueRef>,

    /// Repository the run works on, `owner/name`.
    #[arg(long)]
    repo: Option<String>,

    #[arg(long, requires = "repo")]
    branch: Option<String>,

    /// Task text for the agent.
    #[arg(long, conflicts_with = "instructions_file")]
    instructions: Option<String>,

    /// Read the task text from a file.
    #[arg(long)]
    instructions_file: Option<PathBuf>,

    /// Allow pushing branches and opening pull requests.
    #[arg(long)]
    post_to_code_host: bool,

    /// Code host login of whoever asked for the run.
    #[arg(long)]
    user: Option<String>,

    /// Overrides `run_timeout_secs` from config.
    #[arg(long)]
    timeout_secs: Option<u64>,
}

fn main() {
    engine::logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = load_config(&config_path(&cli.data_dir))?;
    match cli.command {
        Command::Run(args) => cmd_run(&cli.data_dir, config, args),
        Command::Events { run_id } => cmd_events(&cli.data_dir, &run_id),
        Command::State { run_id } => cmd_state(&cli.data_dir, &run_id),
        Command::Runs { issues } => cmd_runs(&cli.data_dir, &issues),
        Command::Cleanup {
            owner,
            repo,
            branch,
        } => cmd_cleanup(&config, &owner, &repo, &branch),
    }
}

fn open_log(data_dir: &Path) -> Result<Arc<EventLog>> {
    let repo = JsonlEventRepository::open(data_dir)
        .with_context(|| format!("open run store in {}", data_dir.display()))?;
    Ok(Arc::new(EventLog::new(Arc::new(repo))))
}

fn docker(config: &EngineConfig) -> Arc<ContainerManager> {
    Arc::new(ContainerManager::new(Arc::new(DockerCli::from_config(
        &config.container,
        &config.exec,
    ))))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serialize json")?
    );
    Ok(())
}

fn parse_repo(raw: &str, branch: Option<String>) -> Result<RepoRef> {
    match raw.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(RepoRef {
                owner: owner.to_string(),
                name: name.to_string(),
                branch,
            })
        }
        _ => bail!("invalid repository '{raw}' (expected owner/name)"),
    }
}

fn build_request(args: RunArgs) -> Result<WorkflowRequest> {
    let workspace = match (args.host_root, args.container) {
        (Some(root), false) => Workspace::Host { root },
        (None, true) => Workspace::Container {
            source: args.source,
            image: args.image,
        },
        _ => bail!("choose exactly one of --host-root or --container"),
    };
    let instructions = match (args.instructions, args.instructions_file) {
        (Some(text), _) => text,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("read instructions {}", path.display()))?,
        (None, None) => String::new(),
    };
    let repository = args
        .repo
        .as_deref()
        .map(|raw| parse_repo(raw, args.branch.clone()))
        .transpose()?;
    let initiator = match args.user {
        Some(login) => Initiator::User { login },
        None => Initiator::System,
    };
    Ok(WorkflowRequest {
        run_id: args.run_id,
        workflow_type: args.workflow,
        initiator,
        target: RunTarget {
            issue: args.issue,
            repository,
        },
        config: RunConfig {
            post_to_code_host: args.post_to_code_host,
        },
        instructions,
        workspace,
    })
}

fn cmd_run(data_dir: &Path, config: EngineConfig, args: RunArgs) -> Result<i32> {
    let timeout = args
        .timeout_secs
        .map_or_else(|| config.run_timeout(), Duration::from_secs);
    let request = build_request(args)?;
    let in_container = matches!(request.workspace, Workspace::Container { .. });
    let keep_container = config.container.keep_container;
    let log = open_log(data_dir)?;
    let llm = Arc::new(OpenAiCompatible::from_config(&config.llm)?);
    let containers = docker(&config);
    let bus = Arc::new(EventBus::new(config.bus_capacity));
    let engine = Arc::new(WorkflowEngine::new(
        config,
        log,
        bus,
        llm,
        containers.clone(),
    )?);

    let outcome = engine.run_with_deadline(request, timeout)?;
    // The abandoned worker dies with this process, so its container would leak.
    if outcome.state == WorkflowState::TimedOut && in_container && !keep_container {
        let name = run_container_name(&outcome.run_id);
        if let Err(err) = containers.remove(&name) {
            eprintln!("failed to remove container {name}: {err}");
        }
    }
    print_json(&outcome)?;
    Ok(exit_codes::for_state(outcome.state))
}

fn cmd_events(data_dir: &Path, run_id: &str) -> Result<i32> {
    let log = open_log(data_dir)?;
    for event in log.get_chain(run_id)? {
        println!("{}", serde_json::to_string(&event).context("serialize event")?);
    }
    Ok(exit_codes::OK)
}

fn cmd_state(data_dir: &Path, run_id: &str) -> Result<i32> {
    let log = open_log(data_dir)?;
    let state = log.state(run_id)?;
    println!("{state}");
    Ok(exit_codes::for_state(state))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary {
    id: String,
    workflow_type: WorkflowType,
    state: WorkflowState,
    created_at: DateTime<Utc>,
}

fn cmd_runs(data_dir: &Path, issues: &[IssueRef]) -> Result<i32> {
    let log = open_log(data_dir)?;
    if issues.is_empty() {
        let mut summaries = Vec::new();
        for run in log.list_runs()? {
            summaries.push(RunSummary {
                state: log.state(&run.id)?,
                id: run.id,
                workflow_type: run.workflow_type,
                created_at: run.created_at,
            });
        }
        print_json(&summaries)?;
    } else {
        let states: BTreeMap<String, _> = log
            .latest_states_for_issues(issues)?
            .into_iter()
            .map(|(issue, runs)| (issue.to_string(), runs))
            .collect();
        print_json(&states)?;
    }
    Ok(exit_codes::OK)
}

fn cmd_cleanup(config: &EngineConfig, owner: &str, repo: &str, branch: &str) -> Result<i32> {
    let removed = docker(config).cleanup_for_branch(owner, repo, branch)?;
    for name in &removed {
        println!("{name}");
    }
    eprintln!("removed {} container(s)", removed.len());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_host_root() {
        let cli = Cli::parse_from([
            "engine",
            "run",
            "--workflow",
            "review-pr",
            "--host-root",
            ".",
            "--issue",
            "acme/widgets#3",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let request = build_request(args).expect("request");
        assert_eq!(request.workflow_type, WorkflowType::ReviewPr);
        assert_eq!(
            request.workspace,
            Workspace::Host {
                root: PathBuf::from(".")
            }
        );
        assert_eq!(
            request.target.issue.map(|i| i.to_string()).as_deref(),
            Some("acme/widgets#3")
        );
    }

    #[test]
    fn run_requires_a_workspace() {
        let cli = Cli::parse_from(["engine", "run", "--workflow", "resolve-issue"]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert!(build_request(args).is_err());
    }

    #[test]
    fn host_root_conflicts_with_container() {
        let parsed = Cli::try_parse_from([
            "engine",
            "run",
            "--workflow",
            "resolve-issue",
            "--host-root",
            ".",
            "--container",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_runs_with_repeated_issues() {
        let cli = Cli::parse_from([
            "engine",
            "--data-dir",
            "/tmp/d",
            "runs",
            "--issue",
            "a/b#1",
            "--issue",
            "a/b#2",
        ]);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/d"));
        assert!(matches!(cli.command, Command::Runs { ref issues } if issues.len() == 2));
    }

    #[test]
    fn repo_requires_owner_and_name() {
        assert!(parse_repo("acme", None).is_err());
        let repo = parse_repo("acme/widgets", Some("main".to_string())).expect("repo");
        assert_eq!(repo.name, "widgets");
        assert_eq!(repo.branch.as_deref(), Some("main"));
    }
}
