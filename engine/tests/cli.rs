//! CLI tests for the `engine` binary.
//!
//! Seeds a JSONL run store through the library, then spawns the binary and
//! checks exit codes and output.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Output};
use std::sync::Arc;
use std::thread;

use engine::core::event::Event;
use engine::core::state::WorkflowState;
use engine::events::{EventBus, EventLog, JsonlEventRepository, WorkflowReporter};
use engine::exit_codes;
use engine::io::config::{EngineConfig, config_path, write_config};
use engine::test_support::sample_run;
use serde_json::{Value, json};

fn seeded_log(data_dir: &Path) -> Arc<EventLog> {
    let repo = JsonlEventRepository::open(data_dir).expect("open store");
    Arc::new(EventLog::new(Arc::new(repo)))
}

/// Create `run_id` and drive it to `state`.
fn seed_run(log: &Arc<EventLog>, run_id: &str, issue: Option<&str>, state: WorkflowState) {
    let mut run = sample_run(run_id);
    run.target.issue = issue.map(|raw| raw.parse().expect("issue"));
    log.create_run(&run).expect("create run");
    let reporter = WorkflowReporter::new(run_id, log.clone(), Arc::new(EventBus::new(8)));
    match state {
        WorkflowState::Pending => {}
        WorkflowState::Running => reporter.start(None).expect("start"),
        WorkflowState::Completed => {
            reporter.start(None).expect("start");
            reporter.complete(Some("done")).expect("complete");
        }
        WorkflowState::Error => {
            reporter.start(None).expect("start");
            reporter.error("boom").expect("error");
        }
        WorkflowState::TimedOut => {
            reporter.start(None).expect("start");
            reporter.timed_out("deadline").expect("timed out");
        }
    }
}

fn engine(data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_engine"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .env("RUST_LOG", "off")
        .output()
        .expect("run engine")
}

#[test]
fn state_exit_code_reflects_derived_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = seeded_log(temp.path());
    let cases = [
        ("pending", WorkflowState::Pending, exit_codes::IN_PROGRESS),
        ("running", WorkflowState::Running, exit_codes::IN_PROGRESS),
        ("completed", WorkflowState::Completed, exit_codes::OK),
        ("failed", WorkflowState::Error, exit_codes::RUN_ERROR),
        ("late", WorkflowState::TimedOut, exit_codes::TIMED_OUT),
    ];
    for (run_id, state, _) in &cases {
        seed_run(&log, run_id, None, *state);
    }
    drop(log);

    for (run_id, state, code) in cases {
        let output = engine(temp.path(), &["state", run_id]);
        assert_eq!(output.status.code(), Some(code), "run {run_id}");
        assert_eq!(
            String::from_utf8_lossy(&output.stdout).trim(),
            state.to_string()
        );
    }
}

#[test]
fn unknown_run_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = engine(temp.path(), &["state", "nope"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown run"));
}

#[test]
fn invalid_config_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::write(config_path(temp.path()), "max_turns = 0\n").expect("write config");
    let output = engine(temp.path(), &["runs"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn events_prints_the_chain_as_json_lines() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = seeded_log(temp.path());
    seed_run(&log, "r1", None, WorkflowState::Error);
    let expected = log.get_chain("r1").expect("chain");
    drop(log);

    let output = engine(temp.path(), &["events", "r1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let printed: Vec<Event> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("event line"))
        .collect();
    assert_eq!(printed, expected);
}

#[test]
fn runs_groups_states_by_issue() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = seeded_log(temp.path());
    seed_run(&log, "a", Some("acme/widgets#1"), WorkflowState::Error);
    seed_run(&log, "b", Some("acme/widgets#1"), WorkflowState::Completed);
    seed_run(&log, "c", None, WorkflowState::Running);
    drop(log);

    let output = engine(
        temp.path(),
        &["runs", "--issue", "acme/widgets#1", "--issue", "acme/widgets#2"],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let states: Value = serde_json::from_slice(&output.stdout).expect("json");
    let first = states["acme/widgets#1"].as_array().expect("runs for #1");
    assert_eq!(first.len(), 2);
    assert!(
        first
            .iter()
            .any(|entry| entry["run"]["id"] == "a" && entry["state"] == "error")
    );
    assert!(
        first
            .iter()
            .any(|entry| entry["run"]["id"] == "b" && entry["state"] == "completed")
    );
    assert_eq!(states["acme/widgets#2"], json!([]));

    let output = engine(temp.path(), &["runs"]);
    let all: Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(all.as_array().map(Vec::len), Some(3));
}

#[test]
fn malformed_issue_is_rejected_by_the_parser() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = engine(temp.path(), &["runs", "--issue", "acme-widgets-1"]);
    assert_ne!(output.status.code(), Some(exit_codes::OK));
}

/// Answer one chat completion request with `body`.
fn serve_completion(body: Value) -> (String, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).expect("read");
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(idx) = text.find("\r\n\r\n") {
                let content_length = text[..idx]
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if raw.len() >= idx + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let body = body.to_string();
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).expect("write");
    });
    (format!("http://{addr}/v1"), handle)
}

#[test]
fn run_on_host_completes_and_is_recorded() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = tempfile::tempdir().expect("workspace");
    let (base_url, server) = serve_completion(json!({
        "model": "stub",
        "choices": [{"message": {"content": "Nothing to change."}}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 3}
    }));
    let mut config = EngineConfig::default();
    config.llm.base_url = base_url;
    config.retry.max_retries = 0;
    write_config(&config_path(temp.path()), &config).expect("write config");

    let root = workspace.path().to_string_lossy().to_string();
    let output = engine(
        temp.path(),
        &[
            "run",
            "--workflow",
            "resolve-issue",
            "--run-id",
            "cli-run",
            "--host-root",
            &root,
            "--instructions",
            "Check the README.",
        ],
    );
    server.join().expect("stub server");
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let outcome: Value = serde_json::from_slice(&output.stdout).expect("outcome json");
    assert_eq!(outcome["runId"], "cli-run");
    assert_eq!(outcome["state"], "completed");
    assert_eq!(outcome["finalAnswer"], "Nothing to change.");

    let state = engine(temp.path(), &["state", "cli-run"]);
    assert_eq!(state.status.code(), Some(exit_codes::OK));
}
