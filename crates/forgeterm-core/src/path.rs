//! Remote paths are always POSIX, whatever the local platform.

use std::path::{Path, PathBuf};

/// Converts Windows separators and squeezes duplicate slashes.
pub fn normalize_remote(path: &str) -> String {
    let replaced = path.replace('\\', "/");
    let mut out = String::with_capacity(replaced.len());
    let mut prev_slash = false;
    for ch in replaced.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    out
}

pub fn join_remote(dir: &str, name: &str) -> String {
    let dir = normalize_remote(dir);
    let name = name.trim_start_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Lexical parent: `/a/b` -> `/a`, `/a` -> `/`, `/` -> `/`, `a` -> `.`.
pub fn parent_remote(path: &str) -> String {
    let path = normalize_remote(path);
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => ".".to_string(),
    }
}

pub fn file_name_remote(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// `local_root` joined with each component of the `/`-separated `relative`.
pub fn local_path_for(local_root: &Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .fold(local_root.to_path_buf(), |acc, part| acc.join(part))
}
