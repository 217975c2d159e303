//! Environment over a directory on the host.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use tracing::{debug, instrument};

use crate::core::path::{PathError, relative_dir_path, relative_file_path};
use crate::core::types::ExecOutput;
use crate::environment::{EnvError, Environment, ExecLimits};
use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct HostEnvironment {
    root: PathBuf,
    limits: ExecLimits,
}

impl HostEnvironment {
    /// `root` must be an existing directory; it is canonicalized once here.
    pub fn new(root: &Path, limits: ExecLimits) -> Result<Self, EnvError> {
        let root = root
            .canonicalize()
            .map_err(|e| EnvError::io(format!("resolve root {}", root.display()), e))?;
        if !root.is_dir() {
            return Err(EnvError::io(
                format!("root {} is not a directory", root.display()),
                std::io::Error::from(std::io::ErrorKind::NotADirectory),
            ));
        }
        Ok(Self { root, limits })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve_file(&self, path: &str) -> Result<(String, PathBuf), EnvError> {
        let rel = relative_file_path(path)?;
        let full = self.root.join(&rel);
        self.ensure_inside(&full, path)?;
        Ok((rel, full))
    }

    /// Reject paths that escape the root through a symlink.
    fn ensure_inside(&self, full: &Path, original: &str) -> Result<(), EnvError> {
        self.ensure_inside_within(full, original, 0)
    }

    fn ensure_inside_within(
        &self,
        full: &Path,
        original: &str,
        hops: u32,
    ) -> Result<(), EnvError> {
        let escape = || EnvError::InvalidPath(PathError::Traversal(original.to_string()));
        let mut cursor = full.to_path_buf();
        loop {
            match fs::symlink_metadata(&cursor) {
                Ok(meta) if meta.file_type().is_symlink() && !cursor.exists() => {
                    // Writing through a dangling link creates its target.
                    if hops >= MAX_LINK_HOPS {
                        return Err(escape());
                    }
                    let target = fs::read_link(&cursor)
                        .map_err(|e| EnvError::io(format!("read link {}", cursor.display()), e))?;
                    let parent = cursor.parent().unwrap_or(&self.root);
                    let base = parent
                        .canonicalize()
                        .map_err(|e| EnvError::io(format!("resolve {}", parent.display()), e))?;
                    return self.ensure_inside_within(
                        &normalize(&base.join(target)),
                        original,
                        hops + 1,
                    );
                }
                Ok(_) => break,
                Err(_) => {
                    if !cursor.pop() {
                        return Ok(());
                    }
                }
            }
        }
        let resolved = cursor
            .canonicalize()
            .map_err(|e| EnvError::io(format!("resolve {}", cursor.display()), e))?;
        if resolved.starts_with(&self.root) {
            Ok(())
        } else {
            Err(escape())
        }
    }
}

const MAX_LINK_HOPS: u32 = 40;

/// Lexically fold `.` and `..` so popping components never climbs back up.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl Environment for HostEnvironment {
    fn describe(&self) -> String {
        format!("host:{}", self.root.display())
    }

    fn read_file(&self, path: &str) -> Result<String, EnvError> {
        let (rel, full) = self.resolve_file(path)?;
        if full.is_dir() {
            return Err(EnvError::IsADirectory { path: rel });
        }
        if !full.exists() {
            return Err(EnvError::NotFound { path: rel });
        }
        let bytes = fs::read(&full).map_err(|e| EnvError::io(format!("read {rel}"), e))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    #[instrument(skip_all, fields(path = %path, bytes = contents.len()))]
    fn write_file(&self, path: &str, contents: &str) -> Result<(), EnvError> {
        let (rel, full) = self.resolve_file(path)?;
        if full.is_dir() {
            return Err(EnvError::IsADirectory { path: rel });
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EnvError::io(format!("create parent of {rel}"), e))?;
        }
        fs::write(&full, contents).map_err(|e| EnvError::io(format!("write {rel}"), e))?;
        debug!("file written");
        Ok(())
    }

    #[instrument(skip_all, fields(path = %path))]
    fn delete_file(&self, path: &str) -> Result<(), EnvError> {
        let (rel, full) = self.resolve_file(path)?;
        if full.is_dir() {
            return Err(EnvError::RefusedDirectory { path: rel });
        }
        if !full.exists() {
            return Err(EnvError::NotFound { path: rel });
        }
        fs::remove_file(&full).map_err(|e| EnvError::io(format!("delete {rel}"), e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(cwd = ?cwd))]
    fn exec(&self, command: &str, cwd: Option<&str>) -> Result<ExecOutput, EnvError> {
        let dir = match cwd {
            Some(cwd) => {
                let rel = relative_dir_path(cwd)?;
                let dir = self.root.join(&rel);
                self.ensure_inside(&dir, cwd)?;
                if !dir.is_dir() {
                    return Err(EnvError::NotFound { path: rel });
                }
                dir
            }
            None => self.root.clone(),
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&dir);
        let out = run_command_with_timeout(
            cmd,
            None,
            self.limits.timeout,
            self.limits.output_limit_bytes,
        )
        .map_err(|e| EnvError::Spawn(format!("{e:#}")))?;
        Ok(out.into_exec_output("command"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn env(root: &Path) -> HostEnvironment {
        HostEnvironment::new(
            root,
            ExecLimits {
                timeout: Duration::from_secs(10),
                output_limit_bytes: 10_000,
            },
        )
        .expect("host env")
    }

    #[test]
    fn write_creates_parents_and_read_returns_contents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let env = env(temp.path());
        env.write_file("src/deep/a.txt", "hello").expect("write");
        assert_eq!(env.read_file("src/deep/a.txt").expect("read"), "hello");
    }

    #[test]
    fn traversal_is_rejected_without_touching_the_filesystem() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("ws");
        fs::create_dir(&root).expect("mkdir");
        let env = env(&root);

        for path in ["../../etc/passwd", "a/../../b", "../escape.txt"] {
            let err = env.write_file(path, "x").expect_err("rejected");
            assert!(matches!(err, EnvError::InvalidPath(_)), "{path}: {err}");
        }
        assert!(!temp.path().join("escape.txt").exists());
        assert!(!temp.path().join("b").exists());
    }

    #[test]
    fn symlink_escape_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("ws");
        let outside = temp.path().join("outside");
        fs::create_dir(&root).expect("mkdir");
        fs::create_dir(&outside).expect("mkdir");
        std::os::unix::fs::symlink(&outside, root.join("link")).expect("symlink");
        let env = env(&root);

        let err = env.write_file("link/pwned.txt", "x").expect_err("rejected");
        assert!(matches!(err, EnvError::InvalidPath(_)));
        assert!(!outside.join("pwned.txt").exists());
    }

    #[test]
    fn dangling_symlink_pointing_outside_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("ws");
        let outside = temp.path().join("outside");
        fs::create_dir(&root).expect("mkdir");
        fs::create_dir(&outside).expect("mkdir");
        std::os::unix::fs::symlink(outside.join("planted.txt"), root.join("link.txt"))
            .expect("symlink");
        std::os::unix::fs::symlink("../outside/new", root.join("dir")).expect("symlink");
        let env = env(&root);

        let err = env.write_file("link.txt", "x").expect_err("rejected");
        assert!(matches!(err, EnvError::InvalidPath(_)), "{err}");
        assert!(!outside.join("planted.txt").exists());

        let err = env.write_file("dir/a.txt", "x").expect_err("rejected");
        assert!(matches!(err, EnvError::InvalidPath(_)), "{err}");
        assert!(!outside.join("new").exists());
    }

    #[test]
    fn dangling_symlink_inside_the_root_is_followed() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink("new.txt", temp.path().join("alias.txt")).expect("symlink");
        let env = env(temp.path());

        env.write_file("alias.txt", "through").expect("write");
        assert_eq!(env.read_file("new.txt").expect("read"), "through");
    }

    #[test]
    fn missing_files_and_directories_are_distinguished() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("dir")).expect("mkdir");
        let env = env(temp.path());

        assert!(matches!(
            env.read_file("missing.txt"),
            Err(EnvError::NotFound { .. })
        ));
        assert!(matches!(
            env.read_file("dir"),
            Err(EnvError::IsADirectory { .. })
        ));
        assert!(matches!(
            env.delete_file("dir"),
            Err(EnvError::RefusedDirectory { .. })
        ));
        assert!(matches!(
            env.delete_file("missing.txt"),
            Err(EnvError::NotFound { .. })
        ));
        assert!(temp.path().join("dir").is_dir());
    }

    #[test]
    fn exec_reports_nonzero_exit_without_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("sub")).expect("mkdir");
        let env = env(temp.path());

        let out = env.exec("exit 1", None).expect("exec");
        assert_eq!(out.exit_code, 1);

        let out = env.exec("pwd", Some("sub")).expect("exec");
        assert!(out.stdout.trim_end().ends_with("/sub"), "{}", out.stdout);
    }
}
