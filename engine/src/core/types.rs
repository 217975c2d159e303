//! Workflow run records and the small value types shared across modules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of workflow a run executes. Selects prompts and the tool set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowType {
    ResolveIssue,
    ReviewPr,
    AutoResolveIssue,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::ResolveIssue => "resolve-issue",
            WorkflowType::ReviewPr => "review-pr",
            WorkflowType::AutoResolveIssue => "auto-resolve-issue",
        }
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown workflow type '{0}' (expected resolve-issue, review-pr, auto-resolve-issue)")]
pub struct ParseWorkflowTypeError(String);

impl FromStr for WorkflowType {
    type Err = ParseWorkflowTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resolve-issue" => Ok(WorkflowType::ResolveIssue),
            "review-pr" => Ok(WorkflowType::ReviewPr),
            "auto-resolve-issue" => Ok(WorkflowType::AutoResolveIssue),
            other => Err(ParseWorkflowTypeError(other.to_string())),
        }
    }
}

/// Who asked for the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Initiator {
    System,
    User { login: String },
}

/// An issue on the code host, e.g. `acme/widgets#42`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueRef {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid issue reference '{0}' (expected owner/repo#number)")]
pub struct ParseIssueRefError(String);

impl FromStr for IssueRef {
    type Err = ParseIssueRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseIssueRefError(s.to_string());
        let (slug, number) = s.split_once('#').ok_or_else(err)?;
        let (owner, repo) = slug.split_once('/').ok_or_else(err)?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(err());
        }
        let number = number.parse::<u64>().map_err(|_| err())?;
        Ok(IssueRef {
            owner: owner.to_string(),
            repo: repo.to_string(),
            number,
        })
    }
}

/// Repository (and optionally the branch) a run works against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue: Option<IssueRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepoRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    /// Allow the run to push branches and open pull requests.
    #[serde(default)]
    pub post_to_code_host: bool,
}

/// Immutable record of one workflow run. State is derived from its events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_type: WorkflowType,
    pub created_at: DateTime<Utc>,
    pub initiator: Initiator,
    #[serde(default)]
    pub target: RunTarget,
    #[serde(default)]
    pub config: RunConfig,
}

/// Outcome of one command executed in an environment.
///
/// A nonzero `exit_code` is data, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}
