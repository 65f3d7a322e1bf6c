//! The per-agent files sandbox.
//!
//! Every operation takes the agent's files root and pushes each
//! requested path through [`validate_file_path`]. `list_files` and
//! `frontmatter` accept a glob over root-relative paths; the matcher
//! supports `*` and `?` within a segment and `**` across segments.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::fs;

use hub_domain::error::{Error, Result};

use crate::path::validate_file_path;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FilesRequest {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    DeleteFile {
        path: String,
    },
    Mkdir {
        path: String,
    },
    ListDir {
        #[serde(default)]
        path: Option<String>,
    },
    ListFiles {
        #[serde(default)]
        glob: Option<String>,
    },
    Frontmatter {
        #[serde(default)]
        glob: Option<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn execute_files(req: FilesRequest, files_root: &Path) -> Result<Value> {
    fs::create_dir_all(files_root).await?;
    match req {
        FilesRequest::ReadFile { path } => {
            let target = validate_file_path(&path, files_root)?;
            let content = fs::read_to_string(&target)
                .await
                .map_err(|e| Error::Storage(format!("read {path:?}: {e}")))?;
            Ok(json!({ "path": path, "content": content }))
        }
        FilesRequest::WriteFile { path, content } => {
            let target = validate_file_path(&path, files_root)?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&target, content.as_bytes()).await?;
            Ok(json!({ "path": path, "bytes": content.len() }))
        }
        FilesRequest::DeleteFile { path } => {
            let target = validate_file_path(&path, files_root)?;
            fs::remove_file(&target)
                .await
                .map_err(|e| Error::Storage(format!("delete {path:?}: {e}")))?;
            Ok(json!({ "path": path, "deleted": true }))
        }
        FilesRequest::Mkdir { path } => {
            let target = validate_file_path(&path, files_root)?;
            fs::create_dir_all(&target).await?;
            Ok(json!({ "path": path, "created": true }))
        }
        FilesRequest::ListDir { path } => {
            let rel = path.unwrap_or_default();
            let target = validate_file_path(&rel, files_root)?;
            let mut entries = Vec::new();
            let mut dir = fs::read_dir(&target)
                .await
                .map_err(|e| Error::Storage(format!("list {rel:?}: {e}")))?;
            while let Ok(Some(entry)) = dir.next_entry().await {
                let meta = entry.metadata().await.ok();
                entries.push(json!({
                    "name": entry.file_name().to_string_lossy(),
                    "is_dir": meta.as_ref().map(|m| m.is_dir()).unwrap_or(false),
                    "size": meta.as_ref().map(|m| m.len()).unwrap_or(0),
                }));
            }
            entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
            Ok(json!({ "path": rel, "entries": entries }))
        }
        FilesRequest::ListFiles { glob } => {
            let files = matching_files(files_root, glob.as_deref()).await?;
            Ok(json!({ "files": files }))
        }
        FilesRequest::Frontmatter { glob } => {
            let files = matching_files(files_root, glob.as_deref()).await?;
            let mut out = Vec::new();
            for rel in files {
                let target = files_root.join(&rel);
                let Ok(content) = fs::read_to_string(&target).await else {
                    continue;
                };
                if let Some(fm) = parse_frontmatter(&content) {
                    out.push(json!({ "path": rel, "frontmatter": fm }));
                }
            }
            Ok(json!({ "files": out }))
        }
    }
}

/// Root-relative paths of every file matching `glob` (all files when
/// `None`), sorted.
async fn matching_files(files_root: &Path, glob: Option<&str>) -> Result<Vec<String>> {
    let mut stack = vec![files_root.to_path_buf()];
    let mut files = Vec::new();
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(files_root) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if glob.map(|g| glob_match(g, &rel)).unwrap_or(true) {
                    files.push(rel);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Glob matching
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Match a `/`-separated glob against a relative path. `*` and `?`
/// match within one segment, `**` matches zero or more segments.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let segs: Vec<&str> = path.split('/').collect();
    match_segments(&pat, &segs)
}

fn match_segments(pat: &[&str], segs: &[&str]) -> bool {
    match (pat.first(), segs.first()) {
        (None, None) => true,
        (Some(&"**"), _) => {
            // `**` absorbs zero or more segments.
            match_segments(&pat[1..], segs)
                || (!segs.is_empty() && match_segments(pat, &segs[1..]))
        }
        (Some(p), Some(s)) => segment_match(p, s) && match_segments(&pat[1..], &segs[1..]),
        _ => false,
    }
}

fn segment_match(pattern: &str, segment: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = segment.chars().collect();
    match_chars(&p, &s)
}

fn match_chars(p: &[char], s: &[char]) -> bool {
    match (p.first(), s.first()) {
        (None, None) => true,
        (Some('*'), _) => match_chars(&p[1..], s) || (!s.is_empty() && match_chars(p, &s[1..])),
        (Some('?'), Some(_)) => match_chars(&p[1..], &s[1..]),
        (Some(pc), Some(sc)) => pc == sc && match_chars(&p[1..], &s[1..]),
        _ => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Frontmatter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read a `---` fenced frontmatter block and parse `key: value` lines.
/// No nested YAML; values are plain strings with surrounding quotes
/// stripped. Returns `None` when the file has no frontmatter.
pub fn parse_frontmatter(content: &str) -> Option<Value> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n'))?;
    let end = rest.find("\n---")?;
    let block = &rest[..end];

    let mut map = serde_json::Map::new();
    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            map.insert(key.trim().to_string(), Value::String(value.to_string()));
        }
    }
    Some(Value::Object(map))
}

/// Body text following the frontmatter block (the whole content when
/// there is none).
pub fn frontmatter_body(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("---") else {
        return content;
    };
    let Some(rest) = rest.strip_prefix("\r\n").or_else(|| rest.strip_prefix('\n')) else {
        return content;
    };
    match rest.find("\n---") {
        Some(end) => {
            let after = &rest[end + 4..];
            after.trim_start_matches('\r').trim_start_matches('\n')
        }
        None => content,
    }
}
