//! Pack/unpack between an agent's on-disk workspace and the session's
//! serialized file list.
//!
//! Files with a known binary extension are carried as base64; everything
//! else is UTF-8 (lossy on read, so a stray invalid byte cannot poison a
//! snapshot).

use std::fs;
use std::path::Path;

use base64::Engine;

use hub_domain::error::Result;
use hub_domain::session::{FileEncoding, FileEntry};
use hub_tools::path::validate_file_path;

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "ico", "bmp", "pdf", "zip", "gz", "tar", "bin", "wasm",
    "mp3", "mp4", "wav", "ogg", "webm", "woff", "woff2", "ttf", "otf",
];

fn is_binary_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| BINARY_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Serialize every file under `files_root` into the session file list,
/// paths relative to the root. A missing root yields an empty list.
pub fn pack_files(files_root: &Path) -> Result<Vec<FileEntry>> {
    let mut out = Vec::new();
    if !files_root.is_dir() {
        return Ok(out);
    }
    collect(files_root, files_root, &mut out)?;
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

fn collect(root: &Path, dir: &Path, out: &mut Vec<FileEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(root, &path, out)?;
            continue;
        }
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        let bytes = fs::read(&path)?;
        let (content, encoding) = if is_binary_path(&path) {
            (
                base64::engine::general_purpose::STANDARD.encode(&bytes),
                FileEncoding::Base64,
            )
        } else {
            (
                String::from_utf8_lossy(&bytes).into_owned(),
                FileEncoding::Utf8,
            )
        };
        out.push(FileEntry {
            path: rel,
            content,
            encoding,
        });
    }
    Ok(())
}

/// Materialize a serialized file list under `files_root`. Every entry
/// path is validated against the root before any write; entries that
/// fail validation or decoding are skipped with a warning.
pub fn unpack_files(entries: &[FileEntry], files_root: &Path) -> Result<usize> {
    fs::create_dir_all(files_root)?;
    let mut written = 0;
    for entry in entries {
        let target = match validate_file_path(&entry.path, files_root) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(path = %entry.path, error = %e, "skipping unsafe file entry");
                continue;
            }
        };
        let bytes = match entry.encoding {
            FileEncoding::Utf8 => entry.content.clone().into_bytes(),
            FileEncoding::Base64 => {
                match base64::engine::general_purpose::STANDARD.decode(&entry.content) {
                    Ok(b) => b,
                    Err(e) => {
                        tracing::warn!(path = %entry.path, error = %e, "bad base64, skipping");
                        continue;
                    }
                }
            }
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, bytes)?;
        written += 1;
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrips_text_and_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("files");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("notes.md"), "# hello").unwrap();
        fs::write(root.join("sub/img.png"), [0x89, 0x50, 0x4e, 0x47]).unwrap();

        let entries = pack_files(&root).unwrap();
        assert_eq!(entries.len(), 2);
        let md = entries.iter().find(|e| e.path == "notes.md").unwrap();
        assert_eq!(md.encoding, FileEncoding::Utf8);
        let png = entries.iter().find(|e| e.path == "sub/img.png").unwrap();
        assert_eq!(png.encoding, FileEncoding::Base64);

        let out = tmp.path().join("restored");
        let written = unpack_files(&entries, &out).unwrap();
        assert_eq!(written, 2);
        assert_eq!(fs::read_to_string(out.join("notes.md")).unwrap(), "# hello");
        assert_eq!(
            fs::read(out.join("sub/img.png")).unwrap(),
            vec![0x89, 0x50, 0x4e, 0x47]
        );
    }

    #[test]
    fn unpack_skips_traversal_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("files");
        let entries = vec![
            FileEntry {
                path: "../escape.txt".into(),
                content: "nope".into(),
                encoding: FileEncoding::Utf8,
            },
            FileEntry {
                path: "ok.txt".into(),
                content: "yes".into(),
                encoding: FileEncoding::Utf8,
            },
        ];
        let written = unpack_files(&entries, &root).unwrap();
        assert_eq!(written, 1);
        assert!(!tmp.path().join("escape.txt").exists());
        assert!(root.join("ok.txt").exists());
    }

    #[test]
    fn missing_root_packs_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let entries = pack_files(&tmp.path().join("nope")).unwrap();
        assert!(entries.is_empty());
    }
}
