//! Prompt rendering for workflow runs.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{WorkflowRun, WorkflowType};
use crate::tools::ToolDefinition;

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const RESOLVE_ISSUE_TEMPLATE: &str = include_str!("prompts/resolve_issue.md");
const REVIEW_PR_TEMPLATE: &str = include_str!("prompts/review_pr.md");
const AUTO_RESOLVE_ISSUE_TEMPLATE: &str = include_str!("prompts/auto_resolve_issue.md");

/// Everything a prompt may refer to.
pub struct PromptInput<'a> {
    pub run: &'a WorkflowRun,
    /// Task text from the caller, e.g. the issue body.
    pub instructions: &'a str,
    /// Human-readable description of where the tools act.
    pub environment: &'a str,
    pub tools: &'a [ToolDefinition],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompts {
    pub system: String,
    pub user: String,
}

#[derive(Serialize)]
struct ToolContext<'a> {
    name: &'a str,
    description: &'a str,
}

pub struct PromptEngine {
    env: Environment<'static>,
}

fn user_template(workflow_type: WorkflowType) -> &'static str {
    match workflow_type {
        WorkflowType::ResolveIssue => "resolve_issue",
        WorkflowType::ReviewPr => "review_pr",
        WorkflowType::AutoResolveIssue => "auto_resolve_issue",
    }
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("system", SYSTEM_TEMPLATE),
            ("resolve_issue", RESOLVE_ISSUE_TEMPLATE),
            ("review_pr", REVIEW_PR_TEMPLATE),
            ("auto_resolve_issue", AUTO_RESOLVE_ISSUE_TEMPLATE),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("invalid prompt template {name}"))?;
        }
        Ok(Self { env })
    }

    pub fn render(&self, input: &PromptInput<'_>) -> Result<RenderedPrompts> {
        let run = input.run;
        let tools: Vec<ToolContext<'_>> = input
            .tools
            .iter()
            .map(|tool| ToolContext {
                name: &tool.name,
                description: &tool.description,
            })
            .collect();
        let issue = run.target.issue.as_ref().map(ToString::to_string);
        let instructions = input.instructions.trim();

        let system = self
            .env
            .get_template("system")?
            .render(context! {
                environment => input.environment,
                workflow_type => run.workflow_type.as_str(),
                repository => run.target.repository.as_ref(),
                tools => tools,
                read_only => run.workflow_type == WorkflowType::ReviewPr,
            })
            .context("render system prompt")?;

        let name = user_template(run.workflow_type);
        let user = self
            .env
            .get_template(name)?
            .render(context! {
                issue => issue,
                repository => run.target.repository.as_ref(),
                instructions => (!instructions.is_empty()).then_some(instructions),
                post_to_code_host => run.config.post_to_code_host,
            })
            .with_context(|| format!("render {name} prompt"))?;

        Ok(RenderedPrompts {
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        })
    }
}
