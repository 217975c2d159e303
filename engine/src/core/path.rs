//! Relative path validation for environment operations.
//!
//! Every path a tool hands to an environment is checked here before it is
//! joined to the host root or the container mount. A rejected path never
//! reaches the filesystem.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("path escapes the workspace: {0}")]
    Traversal(String),
    #[error("path has an empty or '.' segment: {0}")]
    InvalidSegment(String),
    #[error("path contains a control character or backslash: {0:?}")]
    InvalidCharacter(String),
}

/// Validate a workspace-relative file path and return it normalized
/// (single `/` separators, no trailing slash).
pub fn relative_file_path(path: &str) -> Result<String, PathError> {
    let segments = segments(path)?;
    if segments.is_empty() {
        return Err(PathError::Empty);
    }
    Ok(segments.join("/"))
}

/// Like [`relative_file_path`], but `"."` and `""` name the workspace root
/// and normalize to `""`.
pub fn relative_dir_path(path: &str) -> Result<String, PathError> {
    let trimmed = path.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == "./" {
        return Ok(String::new());
    }
    Ok(segments(trimmed)?.join("/"))
}

fn segments(path: &str) -> Result<Vec<&str>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.chars().any(|c| c.is_control() || c == '\\') {
        return Err(PathError::InvalidCharacter(path.to_string()));
    }
    if path.starts_with('/') || path.starts_with('~') {
        return Err(PathError::Absolute(path.to_string()));
    }
    let body = path.strip_suffix('/').unwrap_or(path);
    let mut out = Vec::new();
    for segment in body.split('/') {
        match segment {
            ".." => return Err(PathError::Traversal(path.to_string())),
            "" | "." => return Err(PathError::InvalidSegment(path.to_string())),
            s => out.push(s),
        }
    }
    Ok(out)
}
