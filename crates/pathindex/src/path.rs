//! Path normalization and comparison utilities.
//!
//! Stored paths are plain strings with `/` separators and no trailing
//! separator (except for a bare root such as `/` or `C:/`).

use std::path::Path;

/// Normalizes a path for comparison (forward slashes, no trailing slash).
pub fn normalize_path_for_compare(raw: &str) -> String {
    let mut normalized = raw.replace('\\', "/");

    while normalized.ends_with('/') {
        if normalized == "/" || looks_like_windows_drive_root(normalized.as_str()) {
            break;
        }
        normalized.pop();
    }

    if normalized.is_empty() {
        "/".to_string()
    } else {
        normalized
    }
}

/// Normalizes a filesystem path into the stored string form.
pub fn path_to_key(path: &Path) -> String {
    normalize_path_for_compare(path.to_string_lossy().as_ref())
}

fn looks_like_windows_drive_root(path: &str) -> bool {
    path.len() == 3
        && path.as_bytes()[1] == b':'
        && path.as_bytes()[2] == b'/'
        && path.as_bytes()[0].is_ascii_alphabetic()
}

/// Splits a normalized path into its non-empty segments.
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Number of segments below the filesystem root.
pub fn path_depth(path: &str) -> u32 {
    path_segments(path).count() as u32
}

/// Returns the base name of a normalized path.
pub fn base_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(split) if split + 1 < path.len() => &path[split + 1..],
        _ => path,
    }
}

/// Returns the parent of a normalized path, or an empty string for a root.
pub fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => "/".to_string(),
        Some(split) if split + 1 < path.len() => {
            let parent = &path[..split];
            if looks_like_windows_drive_root(&format!("{parent}/")) {
                format!("{parent}/")
            } else {
                parent.to_string()
            }
        }
        _ => String::new(),
    }
}

/// Checks if `candidate` equals `ancestor` or lies somewhere below it.
pub fn is_same_or_descendant(candidate: &str, ancestor: &str) -> bool {
    if candidate == ancestor {
        return true;
    }
    is_descendant_path(candidate, ancestor)
}

/// Checks if a candidate path is a strict descendant of the parent path.
pub fn is_descendant_path(candidate: &str, parent: &str) -> bool {
    if candidate == parent {
        return false;
    }
    if parent.ends_with('/') {
        return candidate.starts_with(parent);
    }
    candidate.len() > parent.len()
        && candidate.starts_with(parent)
        && candidate.as_bytes()[parent.len()] == b'/'
}

/// Re-bases `path` from the `from` prefix onto the `to` prefix.
pub fn rebase_path(path: &str, from: &str, to: &str) -> Option<String> {
    if path == from {
        return Some(to.to_string());
    }
    if !is_descendant_path(path, from) {
        return None;
    }
    let rest = path[from.len()..].trim_start_matches('/');
    if to.ends_with('/') {
        Some(format!("{to}{rest}"))
    } else {
        Some(format!("{to}/{rest}"))
    }
}

/// Extracts the lower-cased extension from a filename.
pub fn extension_of_name(name: &str) -> Option<String> {
    let split = name.rfind('.')?;
    if split == 0 || split + 1 >= name.len() {
        return None;
    }
    Some(name[split + 1..].to_ascii_lowercase())
}
