//! Container lifecycle and environment behavior against a real runtime.
//!
//! # Running
//!
//! ```bash
//! cargo test --test investigation -- --ignored
//! ENGINE_CONTAINER_RUNTIME=podman cargo test --test investigation -- --ignored
//! ```

use std::sync::Arc;

use engine::container::docker::DockerCli;
use engine::container::manager::{ReusePolicy, StartOutcome, run_labels};
use engine::container::{ContainerManager, ContainerSpec, ContainerStatus, Mount};
use engine::core::types::RepoRef;
use engine::environment::{ContainerEnvironment, EnvError, Environment};

const IMAGE: &str = "alpine:3.20";
const MOUNT: &str = "/workspace";

fn manager() -> Arc<ContainerManager> {
    let runtime =
        std::env::var("ENGINE_CONTAINER_RUNTIME").unwrap_or_else(|_| "docker".to_string());
    Arc::new(ContainerManager::new(Arc::new(DockerCli::new(runtime))))
}

/// Removes the container even when an assertion fails.
struct Cleanup<'a> {
    manager: &'a ContainerManager,
    name: String,
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        let _ = self.manager.remove(&self.name);
    }
}

fn unique_name(prefix: &str) -> String {
    format!("engine-inv-{prefix}-{}", std::process::id())
}

#[test]
#[ignore]
fn runtime_available() {
    let name = unique_name("exec");
    let status = manager().status(&name).expect("status");
    assert_eq!(status, ContainerStatus::NotFound);
}

#[test]
#[ignore]
fn lifecycle_start_reuse_remove() {
    let manager = manager();
    let name = unique_name("life");
    let _cleanup = Cleanup {
        manager: &manager,
        name: name.clone(),
    };
    let spec = ContainerSpec::new(IMAGE, name.clone());

    assert_eq!(
        manager.start(&spec, ReusePolicy::Fail).expect("start"),
        StartOutcome::Created
    );
    assert_eq!(manager.status(&name).expect("status"), ContainerStatus::Running);
    assert_eq!(
        manager.start(&spec, ReusePolicy::Reuse).expect("reuse"),
        StartOutcome::Reused
    );
    assert!(manager.start(&spec, ReusePolicy::Fail).is_err());

    manager.stop(&name).expect("stop");
    assert_eq!(
        manager.start(&spec, ReusePolicy::Reuse).expect("recreate"),
        StartOutcome::Recreated
    );

    manager.remove(&name).expect("remove");
    manager.remove(&name).expect("second remove is a no-op");
    assert_eq!(manager.status(&name).expect("status"), ContainerStatus::Removed);
}

#[test]
#[ignore]
fn environment_round_trips_files_and_separates_streams() {
    let source = tempfile::tempdir().expect("source");
    std::fs::write(source.path().join("seed.txt"), "from host\n").expect("seed");
    let manager = manager();
    let name = unique_name("env");
    let _cleanup = Cleanup {
        manager: &manager,
        name: name.clone(),
    };
    let mut spec = ContainerSpec::new(IMAGE, name.clone());
    spec.mounts.push(Mount {
        source: source.path().to_path_buf(),
        target: MOUNT.to_string(),
        read_only: false,
    });
    spec.workdir = Some(MOUNT.to_string());
    manager.start(&spec, ReusePolicy::Fail).expect("start");

    let env = ContainerEnvironment::new(manager.clone(), name.clone(), MOUNT.to_string());
    assert_eq!(env.read_file("seed.txt").expect("read"), "from host\n");

    env.write_file("nested/dir/new.txt", "it's \"quoted\"\n")
        .expect("write");
    assert_eq!(
        env.read_file("nested/dir/new.txt").expect("read back"),
        "it's \"quoted\"\n"
    );

    assert!(matches!(
        env.read_file("missing.txt"),
        Err(EnvError::NotFound { .. })
    ));
    assert!(matches!(
        env.read_file("nested"),
        Err(EnvError::IsADirectory { .. })
    ));
    assert!(matches!(
        env.delete_file("nested"),
        Err(EnvError::RefusedDirectory { .. })
    ));

    let out = env
        .exec("echo out; echo err >&2; exit 3", None)
        .expect("exec");
    assert_eq!(out.stdout.trim(), "out");
    assert_eq!(out.stderr.trim(), "err");
    assert_eq!(out.exit_code, 3);
}

#[test]
#[ignore]
fn cleanup_for_branch_removes_only_matching_containers() {
    let manager = manager();
    let repo = RepoRef {
        owner: "engine-inv".to_string(),
        name: format!("repo-{}", std::process::id()),
        branch: Some("fix-1".to_string()),
    };
    let mut names = Vec::new();
    let mut cleanups = Vec::new();
    for (suffix, branch) in [("a", "fix-1"), ("b", "fix-1"), ("c", "other")] {
        let name = unique_name(&format!("branch-{suffix}"));
        let repo = RepoRef {
            branch: Some(branch.to_string()),
            ..repo.clone()
        };
        let mut spec = ContainerSpec::new(IMAGE, name.clone());
        spec.labels = run_labels(&name, Some(&repo));
        manager.start(&spec, ReusePolicy::Fail).expect("start");
        names.push(name.clone());
        cleanups.push(Cleanup {
            manager: &manager,
            name,
        });
    }

    let mut removed = manager
        .cleanup_for_branch(&repo.owner, &repo.name, "fix-1")
        .expect("cleanup");
    removed.sort();
    assert_eq!(removed, vec![names[0].clone(), names[1].clone()]);
    assert_eq!(
        manager.status(&names[2]).expect("status"),
        ContainerStatus::Running
    );
}
