//! Path normalization and symlink-safe file-path validation.
//!
//! `hub_agent_id`s and agent-supplied file paths both end up as path
//! segments on disk, so every path crossing a trust boundary goes
//! through these two functions.

use std::path::{Component, Path, PathBuf};

use hub_domain::error::{Error, Result};

/// Maximum accepted request path length.
pub const MAX_PATH_LEN: usize = 512;

/// Normalize a relative path: both separator styles collapse to `/`,
/// repeated separators collapse, `.` segments are stripped, and the
/// result has no leading or trailing separator.
///
/// Rejects NUL bytes and any `..` segment. Idempotent.
pub fn normalize_path(path: &str) -> Result<String> {
    if path.contains('\0') {
        return Err(Error::Storage("path contains NUL byte".into()));
    }
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::Storage(format!(
                    "path contains '..' segment: {path:?}"
                )))
            }
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

/// Validate a requested path against a root directory.
///
/// The requested path is normalized and joined onto the root; the
/// longest existing ancestor is resolved through symlink realpath and
/// the result must stay inside the (realpathed) root. Parents that do
/// not exist yet are allowed, so the validator works for writes into
/// fresh subdirectories.
pub fn validate_file_path(requested: &str, root: &Path) -> Result<PathBuf> {
    if requested.len() > MAX_PATH_LEN {
        return Err(Error::Storage(format!(
            "path longer than {MAX_PATH_LEN} characters"
        )));
    }
    let relative = normalize_path(requested)?;

    let canonical_root = root
        .canonicalize()
        .map_err(|e| Error::Storage(format!("cannot resolve root '{}': {e}", root.display())))?;

    let candidate = canonical_root.join(&relative);
    let resolved = resolve_longest_prefix(&candidate)?;

    // Component-wise containment; a prefix match like `/tmp/abcevil`
    // against root `/tmp/abc` does not pass.
    if resolved != canonical_root && !resolved.starts_with(&canonical_root) {
        return Err(Error::Storage(format!(
            "path escapes the root: {requested:?}"
        )));
    }
    Ok(candidate)
}

/// Canonicalize the longest existing ancestor of `path` and re-append
/// the remaining (not yet existing) components.
fn resolve_longest_prefix(path: &Path) -> Result<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_owned());
                existing = parent.to_path_buf();
            }
            _ => return Err(Error::Storage(format!("unresolvable path: {path:?}"))),
        }
    }
    let mut resolved = existing
        .canonicalize()
        .map_err(|e| Error::Storage(format!("cannot resolve '{}': {e}", existing.display())))?;
    for name in tail.iter().rev() {
        // `..` never appears here: normalize_path already rejected it.
        debug_assert!(Path::new(name)
            .components()
            .all(|c| !matches!(c, Component::ParentDir)));
        resolved.push(name);
    }
    Ok(resolved)
}
