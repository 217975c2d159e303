//! Open a pull request from the workspace's current changes.
//!
//! Everything runs through the environment, so inside a container the
//! sandbox's own git credentials and `gh` session are used.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};
use tracing::info;

use crate::core::types::ExecOutput;
use crate::environment::Environment;
use crate::tools::{Tool, ToolError, ToolOutput, optional_str, required_str, shell_quote};

static BRANCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]{0,199}$").expect("branch regex is valid"));

pub struct CreatePullRequest {
    gh_binary: String,
}

impl CreatePullRequest {
    pub fn new(gh_binary: String) -> Self {
        Self { gh_binary }
    }
}

fn step(env: &dyn Environment, label: &str, command: &str) -> Result<ExecOutput, ToolError> {
    let out = env.exec(command, None)?;
    if !out.success() {
        let detail = if out.stderr.trim().is_empty() {
            out.stdout.trim()
        } else {
            out.stderr.trim()
        };
        return Err(ToolError::Failed(format!(
            "{label} failed (exit {}): {detail}",
            out.exit_code
        )));
    }
    Ok(out)
}

impl Tool for CreatePullRequest {
    fn name(&self) -> &str {
        "create_pull_request"
    }

    fn description(&self) -> &str {
        "Commit all workspace changes to a new branch, push it, and open a pull request."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "branch": { "type": "string", "minLength": 1 },
                "title": { "type": "string", "minLength": 1 },
                "body": { "type": "string" },
                "base": { "type": "string" },
                "commit_message": { "type": "string" }
            },
            "required": ["branch", "title", "body"],
            "additionalProperties": false
        })
    }

    fn call(&self, env: &dyn Environment, args: &Value) -> Result<ToolOutput, ToolError> {
        let branch = required_str(args, "branch")?;
        let title = required_str(args, "title")?;
        let body = required_str(args, "body")?;
        let base = optional_str(args, "base");
        let message = optional_str(args, "commit_message").unwrap_or(title);
        for name in std::iter::once(branch).chain(base) {
            if !BRANCH_RE.is_match(name) || name.contains("..") {
                return Err(ToolError::InvalidArguments(format!(
                    "invalid branch name {name:?}"
                )));
            }
        }

        let branch_q = shell_quote(branch);
        step(env, "git checkout", &format!("git checkout -B {branch_q}"))?;
        step(env, "git add", "git add -A")?;
        let staged = env.exec("git diff --cached --quiet", None)?;
        if staged.exit_code == 0 {
            return Err(ToolError::Failed(
                "nothing to commit; make changes before opening a pull request".to_string(),
            ));
        }
        step(
            env,
            "git commit",
            &format!("git commit -m {}", shell_quote(message)),
        )?;
        step(
            env,
            "git push",
            &format!("git push --force-with-lease -u origin {branch_q}"),
        )?;

        let mut create = format!(
            "{} pr create --head {branch_q} --title {} --body {}",
            shell_quote(&self.gh_binary),
            shell_quote(title),
            shell_quote(body)
        );
        if let Some(base) = base {
            create.push_str(&format!(" --base {}", shell_quote(base)));
        }
        let out = step(env, "gh pr create", &create)?;
        let url = out
            .stdout
            .lines()
            .rev()
            .find(|line| line.starts_with("http"))
            .unwrap_or_else(|| out.stdout.trim())
            .to_string();
        info!(branch, url = %url, "pull request opened");
        Ok(ToolOutput::Json(json!({ "branch": branch, "url": url })))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::process::Command;
    use std::time::Duration;

    use super::*;
    use crate::environment::{ExecLimits, HostEnvironment};

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("spawn git");
        assert!(status.success(), "git {args:?} failed");
    }

    /// Workspace cloned from a bare remote, plus a fake `gh` that echoes a URL.
    fn setup() -> (tempfile::TempDir, HostEnvironment, String) {
        let temp = tempfile::tempdir().expect("tempdir");
        let remote = temp.path().join("remote.git");
        let ws = temp.path().join("ws");
        fs::create_dir_all(&remote).expect("mkdir");
        fs::create_dir_all(&ws).expect("mkdir");
        git(&remote, &["init", "--bare", "-q"]);
        git(&ws, &["init", "-q", "-b", "main"]);
        git(&ws, &["config", "user.email", "engine@example.com"]);
        git(&ws, &["config", "user.name", "engine"]);
        fs::write(ws.join("README.md"), "hello\n").expect("write");
        git(&ws, &["add", "-A"]);
        git(&ws, &["commit", "-q", "-m", "init"]);
        git(
            &ws,
            &["remote", "add", "origin", &remote.display().to_string()],
        );

        let gh = temp.path().join("fake-gh");
        fs::write(
            &gh,
            "#!/bin/sh\necho 'Creating pull request'\necho 'https://example.test/acme/widgets/pull/7'\n",
        )
        .expect("write gh");
        let mut perms = fs::metadata(&gh).expect("meta").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&gh, perms).expect("chmod");

        let env = HostEnvironment::new(
            &ws,
            ExecLimits {
                timeout: Duration::from_secs(30),
                output_limit_bytes: 10_000,
            },
        )
        .expect("env");
        (temp, env, gh.display().to_string())
    }

    #[test]
    fn commits_pushes_and_reports_the_pr_url() {
        let (temp, env, gh) = setup();
        env.write_file("src/fix.ts", "export const fixed = true;\n")
            .expect("write");

        let output = CreatePullRequest::new(gh)
            .call(
                &env,
                &json!({"branch": "fix/issue-7", "title": "Fix #7", "body": "Closes #7"}),
            )
            .expect("create pr");
        let value = match output {
            ToolOutput::Json(value) => value,
            ToolOutput::Text(text) => panic!("expected json, got {text}"),
        };
        assert_eq!(value["url"], "https://example.test/acme/widgets/pull/7");

        let remote_branches = Command::new("git")
            .args(["branch", "--list", "fix/issue-7"])
            .current_dir(temp.path().join("remote.git"))
            .output()
            .expect("git branch");
        assert!(String::from_utf8_lossy(&remote_branches.stdout).contains("fix/issue-7"));
    }

    #[test]
    fn refuses_when_there_is_nothing_to_commit() {
        let (_temp, env, gh) = setup();
        let err = CreatePullRequest::new(gh)
            .call(
                &env,
                &json!({"branch": "fix/empty", "title": "Nothing", "body": ""}),
            )
            .err()
            .expect("nothing to commit");
        assert!(err.to_string().contains("nothing to commit"));
    }

    #[test]
    fn rejects_suspicious_branch_names() {
        let (_temp, env, gh) = setup();
        for branch in ["-x", "a..b", "a b"] {
            let err = CreatePullRequest::new(gh.clone())
                .call(&env, &json!({"branch": branch, "title": "t", "body": ""}))
                .err()
                .expect("invalid");
            assert!(matches!(err, ToolError::InvalidArguments(_)), "{branch}");
        }
    }
}
