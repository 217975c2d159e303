//! Engine configuration stored under `<data_dir>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// Missing fields default to values suitable for a local single-host setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum LLM turns per agent run.
    pub max_turns: u32,

    /// Wall-clock budget for one workflow run, enforced by the watchdog.
    pub run_timeout_secs: u64,

    /// Buffered events per live subscriber before it starts lagging.
    pub bus_capacity: usize,

    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub exec: ExecConfig,
    pub container: ContainerConfig,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API (without `/chat/completions`).
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecConfig {
    /// Per-command timeout for tool executions.
    pub command_timeout_secs: u64,
    /// Truncate stdout/stderr (and tool results) beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Docker-compatible CLI (`docker` or `podman`).
    pub runtime: String,
    pub image: String,
    /// Where the workspace is mounted inside the container.
    pub mount_path: String,
    pub stop_timeout_secs: u64,
    /// Timeout for runtime calls other than exec (run, stop, rm, inspect).
    pub lifecycle_timeout_secs: u64,
    /// Reuse a container that already carries the run's name.
    pub reuse_existing: bool,
    /// Leave the container behind when a run ends.
    pub keep_container: bool,
    /// Repositories without a host checkout are cloned from `<base>/<owner>/<name>.git`.
    pub clone_url_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolsConfig {
    /// Shell command run by the `run_typecheck` tool.
    pub typecheck_command: String,
    /// GitHub CLI used by `create_pull_request`.
    pub gh_binary: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 4096,
            request_timeout_secs: 120,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 5 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "node:22-bookworm".to_string(),
            mount_path: "/workspace".to_string(),
            stop_timeout_secs: 10,
            lifecycle_timeout_secs: 120,
            reuse_existing: false,
            keep_container: false,
            clone_url_base: "https://github.com".to_string(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            typecheck_command: "npx tsc --noEmit".to_string(),
            gh_binary: "gh".to_string(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 40,
            run_timeout_secs: 30 * 60,
            bus_capacity: 256,
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            exec: ExecConfig::default(),
            container: ContainerConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_turns == 0 {
            return Err(anyhow!("max_turns must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.bus_capacity == 0 {
            return Err(anyhow!("bus_capacity must be > 0"));
        }
        if self.llm.base_url.trim().is_empty() || self.llm.model.trim().is_empty() {
            return Err(anyhow!("llm.base_url and llm.model must be non-empty"));
        }
        if self.llm.request_timeout_secs == 0 {
            return Err(anyhow!("llm.request_timeout_secs must be > 0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(anyhow!(
                "retry.initial_backoff_ms must be <= retry.max_backoff_ms"
            ));
        }
        if self.exec.command_timeout_secs == 0 {
            return Err(anyhow!("exec.command_timeout_secs must be > 0"));
        }
        if self.exec.output_limit_bytes == 0 {
            return Err(anyhow!("exec.output_limit_bytes must be > 0"));
        }
        if self.container.runtime.trim().is_empty() || self.container.image.trim().is_empty() {
            return Err(anyhow!("container.runtime and container.image must be non-empty"));
        }
        if !self.container.mount_path.starts_with('/') {
            return Err(anyhow!("container.mount_path must be absolute"));
        }
        if self.container.lifecycle_timeout_secs == 0 {
            return Err(anyhow!("container.lifecycle_timeout_secs must be > 0"));
        }
        if self.container.clone_url_base.trim().is_empty() {
            return Err(anyhow!("container.clone_url_base must be non-empty"));
        }
        if self.tools.typecheck_command.trim().is_empty() {
            return Err(anyhow!("tools.typecheck_command must be non-empty"));
        }
        if self.tools.gh_binary.trim().is_empty() {
            return Err(anyhow!("tools.gh_binary must be non-empty"));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.exec.command_timeout_secs)
    }
}

/// Default config location for a data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` next to `path` and rename it into place.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.container.runtime = "podman".to_string();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_turns = 7\n[llm]\nmodel = \"local\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_turns, 7);
        assert_eq!(cfg.llm.model, "local");
        assert_eq!(cfg.llm.base_url, LlmConfig::default().base_url);
        assert_eq!(cfg.exec, ExecConfig::default());
    }

    #[test]
    fn zero_turns_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_turns = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("max_turns"));
    }
}
