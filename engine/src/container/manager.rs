//! Container Lifecycle Manager.
//!
//! Owns naming rules, the reuse policy on name collisions, and idempotent
//! teardown. All runtime access goes through a shared [`ContainerPort`].

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::container::{
    ContainerError, ContainerInfo, ContainerPort, ContainerSpec, ContainerStatus, LABEL_MANAGED,
    LABEL_REPO_BRANCH, LABEL_REPO_NAME, LABEL_REPO_OWNER, LABEL_RUN_ID,
};
use crate::core::types::{ExecOutput, RepoRef};

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$").expect("container name regex is valid")
});

/// What to do when the requested name is already taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReusePolicy {
    /// Fail with [`ContainerError::NameConflict`].
    #[default]
    Fail,
    /// Keep a running container; recreate one that is stopped.
    Reuse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Created,
    Reused,
    Recreated,
}

pub fn validate_name(name: &str) -> Result<(), ContainerError> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(ContainerError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Labels for a run's sandbox. Repository labels drive branch cleanup.
pub fn run_labels(run_id: &str, repo: Option<&RepoRef>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
    labels.insert(LABEL_RUN_ID.to_string(), run_id.to_string());
    if let Some(repo) = repo {
        labels.insert(LABEL_REPO_OWNER.to_string(), repo.owner.clone());
        labels.insert(LABEL_REPO_NAME.to_string(), repo.name.clone());
        if let Some(branch) = &repo.branch {
            labels.insert(LABEL_REPO_BRANCH.to_string(), branch.clone());
        }
    }
    labels
}

pub struct ContainerManager {
    port: Arc<dyn ContainerPort>,
    /// Names this manager removed, so `status` can report `removed` instead of `not_found`.
    removed: Mutex<HashSet<String>>,
}

impl ContainerManager {
    pub fn new(port: Arc<dyn ContainerPort>) -> Self {
        Self {
            port,
            removed: Mutex::new(HashSet::new()),
        }
    }

    #[instrument(skip_all, fields(name = %spec.name, ?policy))]
    pub fn start(
        &self,
        spec: &ContainerSpec,
        policy: ReusePolicy,
    ) -> Result<StartOutcome, ContainerError> {
        validate_name(&spec.name)?;
        let current = self.port.status(&spec.name)?;
        let outcome = match (current, policy) {
            (ContainerStatus::NotFound | ContainerStatus::Removed, _) => {
                self.port.start(spec)?;
                StartOutcome::Created
            }
            (ContainerStatus::Running, ReusePolicy::Reuse) => StartOutcome::Reused,
            (ContainerStatus::Created | ContainerStatus::Stopped, ReusePolicy::Reuse) => {
                self.remove(&spec.name)?;
                self.port.start(spec)?;
                StartOutcome::Recreated
            }
            (_, ReusePolicy::Fail) => {
                warn!(status = %current, "container name already taken");
                return Err(ContainerError::NameConflict {
                    name: spec.name.clone(),
                });
            }
        };
        self.forget_removed(&spec.name);
        info!(?outcome, "container ready");
        Ok(outcome)
    }

    /// Run `argv` in a running container. Fails fast when it is not running.
    pub fn exec(
        &self,
        name: &str,
        argv: &[String],
        cwd: Option<&str>,
    ) -> Result<ExecOutput, ContainerError> {
        self.ensure_running(name)?;
        self.port.exec(name, argv, cwd, None)
    }

    pub fn read_file(
        &self,
        name: &str,
        workdir: &str,
        rel_path: &str,
    ) -> Result<ExecOutput, ContainerError> {
        self.ensure_running(name)?;
        self.port.read_file(name, workdir, rel_path)
    }

    pub fn write_file(
        &self,
        name: &str,
        workdir: &str,
        rel_path: &str,
        contents: &[u8],
        make_dirs: bool,
    ) -> Result<ExecOutput, ContainerError> {
        self.ensure_running(name)?;
        self.port
            .write_file(name, workdir, rel_path, contents, make_dirs)
    }

    /// Stop a container. Already stopped or missing containers are a no-op.
    #[instrument(skip_all, fields(name = %name))]
    pub fn stop(&self, name: &str) -> Result<(), ContainerError> {
        validate_name(name)?;
        match self.port.stop(name) {
            Ok(()) => Ok(()),
            Err(ContainerError::NotFound { .. } | ContainerError::NotRunning { .. }) => {
                debug!("stop: container already gone or stopped");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Stop then remove. Repeated calls converge on `removed` without error.
    #[instrument(skip_all, fields(name = %name))]
    pub fn remove(&self, name: &str) -> Result<(), ContainerError> {
        self.stop(name)?;
        match self.port.remove(name) {
            Ok(()) => debug!("container removed"),
            Err(ContainerError::NotFound { .. }) => debug!("remove: container already gone"),
            Err(err) => return Err(err),
        }
        self.removed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
        Ok(())
    }

    pub fn status(&self, name: &str) -> Result<ContainerStatus, ContainerError> {
        validate_name(name)?;
        let status = self.port.status(name)?;
        if status == ContainerStatus::NotFound && self.was_removed(name) {
            return Ok(ContainerStatus::Removed);
        }
        Ok(status)
    }

    pub fn list_by_labels(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerInfo>, ContainerError> {
        self.port.list_by_labels(labels)
    }

    /// Stop and remove every engine container labelled with this branch.
    ///
    /// Every match is attempted; failures are reported together afterwards.
    #[instrument(skip_all, fields(owner = %owner, repo = %repo, branch = %branch))]
    pub fn cleanup_for_branch(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Vec<String>, ContainerError> {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_REPO_OWNER.to_string(), owner.to_string());
        labels.insert(LABEL_REPO_NAME.to_string(), repo.to_string());
        labels.insert(LABEL_REPO_BRANCH.to_string(), branch.to_string());

        let matches = self.port.list_by_labels(&labels)?;
        let mut removed = Vec::new();
        let mut failures = Vec::new();
        for container in matches {
            match self.remove(&container.name) {
                Ok(()) => removed.push(container.name),
                Err(err) => {
                    warn!(name = %container.name, err = %err, "cleanup failed");
                    failures.push(format!("{}: {err}", container.name));
                }
            }
        }
        info!(removed = removed.len(), failed = failures.len(), "branch cleanup finished");
        if !failures.is_empty() {
            return Err(ContainerError::Runtime {
                op: "cleanup",
                message: failures.join("; "),
            });
        }
        Ok(removed)
    }

    fn ensure_running(&self, name: &str) -> Result<(), ContainerError> {
        let status = self.status(name)?;
        if status != ContainerStatus::Running {
            return Err(ContainerError::NotRunning {
                name: name.to_string(),
                status,
            });
        }
        Ok(())
    }

    fn was_removed(&self, name: &str) -> bool {
        self.removed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(name)
    }

    fn forget_removed(&self, name: &str) {
        self.removed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeContainerRuntime;

    fn manager() -> (Arc<FakeContainerRuntime>, ContainerManager) {
        let runtime = Arc::new(FakeContainerRuntime::new());
        let manager = ContainerManager::new(runtime.clone());
        (runtime, manager)
    }

    #[test]
    fn stop_and_remove_twice_converge_on_removed() {
        let (_runtime, manager) = manager();
        let spec = ContainerSpec::new("alpine:3", "engine-a");
        manager.start(&spec, ReusePolicy::Fail).expect("start");
        assert_eq!(manager.status("engine-a").expect("status"), ContainerStatus::Running);

        manager.stop("engine-a").expect("stop");
        manager.stop("engine-a").expect("stop again");
        manager.remove("engine-a").expect("remove");
        manager.remove("engine-a").expect("remove again");

        assert_eq!(manager.status("engine-a").expect("status"), ContainerStatus::Removed);
        assert_eq!(manager.status("engine-b").expect("status"), ContainerStatus::NotFound);
    }

    #[test]
    fn name_collision_fails_without_reuse_policy() {
        let (_runtime, manager) = manager();
        let spec = ContainerSpec::new("alpine:3", "engine-a");
        manager.start(&spec, ReusePolicy::Fail).expect("start");
        let err = manager.start(&spec, ReusePolicy::Fail).expect_err("conflict");
        assert!(matches!(err, ContainerError::NameConflict { .. }));
    }

    #[test]
    fn reuse_policy_keeps_running_and_recreates_stopped() {
        let (runtime, manager) = manager();
        let spec = ContainerSpec::new("alpine:3", "engine-a");
        assert_eq!(
            manager.start(&spec, ReusePolicy::Reuse).expect("start"),
            StartOutcome::Created
        );
        assert_eq!(
            manager.start(&spec, ReusePolicy::Reuse).expect("reuse"),
            StartOutcome::Reused
        );
        manager.stop("engine-a").expect("stop");
        assert_eq!(
            manager.start(&spec, ReusePolicy::Reuse).expect("recreate"),
            StartOutcome::Recreated
        );
        assert_eq!(runtime.start_count(), 2);
        assert_eq!(manager.status("engine-a").expect("status"), ContainerStatus::Running);
    }

    #[test]
    fn exec_on_stopped_container_fails_fast() {
        let (runtime, manager) = manager();
        manager
            .start(&ContainerSpec::new("alpine:3", "engine-a"), ReusePolicy::Fail)
            .expect("start");
        manager.stop("engine-a").expect("stop");

        let err = manager
            .exec("engine-a", &["true".to_string()], None)
            .expect_err("not running");
        assert!(matches!(
            err,
            ContainerError::NotRunning {
                status: ContainerStatus::Stopped,
                ..
            }
        ));
        assert_eq!(runtime.exec_count(), 0);
    }

    #[test]
    fn exec_collects_both_streams_and_exit_code() {
        let (_runtime, manager) = manager();
        manager
            .start(&ContainerSpec::new("alpine:3", "engine-a"), ReusePolicy::Fail)
            .expect("start");
        let argv: Vec<String> = ["sh", "-c", "echo out; echo err >&2; exit 7"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let out = manager.exec("engine-a", &argv, None).expect("exec");
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.exit_code, 7);
    }

    #[test]
    fn invalid_names_are_rejected_before_reaching_the_runtime() {
        let (runtime, manager) = manager();
        let err = manager
            .start(&ContainerSpec::new("alpine:3", "../evil"), ReusePolicy::Fail)
            .expect_err("invalid");
        assert!(matches!(err, ContainerError::InvalidName { .. }));
        assert_eq!(runtime.start_count(), 0);
    }

    #[test]
    fn cleanup_for_branch_removes_only_matching_containers() {
        let (_runtime, manager) = manager();
        let repo = RepoRef {
            owner: "acme".to_string(),
            name: "widgets".to_string(),
            branch: Some("fix-42".to_string()),
        };
        let other = RepoRef {
            branch: Some("main".to_string()),
            ..repo.clone()
        };

        let mut a = ContainerSpec::new("alpine:3", "engine-a");
        a.labels = run_labels("a", Some(&repo));
        let mut b = ContainerSpec::new("alpine:3", "engine-b");
        b.labels = run_labels("b", Some(&repo));
        let mut c = ContainerSpec::new("alpine:3", "engine-c");
        c.labels = run_labels("c", Some(&other));
        for spec in [&a, &b, &c] {
            manager.start(spec, ReusePolicy::Fail).expect("start");
        }

        let mut removed = manager
            .cleanup_for_branch("acme", "widgets", "fix-42")
            .expect("cleanup");
        removed.sort();
        assert_eq!(removed, vec!["engine-a", "engine-b"]);
        assert_eq!(manager.status("engine-a").expect("status"), ContainerStatus::Removed);
        assert_eq!(manager.status("engine-c").expect("status"), ContainerStatus::Running);
    }
}
