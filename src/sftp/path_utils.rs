//! Remote path utilities for SFTP operations
//!
//! Remote SFTP paths always use `/` as separator (per SFTP protocol), even
//! when the local host is Windows, so nothing here touches `std::path`.

use super::error::SftpError;

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Join remote SFTP path components using `/` separator.
pub fn join_remote_path(base: &str, component: &str) -> String {
    if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Normalize a remote path lexically.
///
/// Collapses repeated separators, drops `.` segments and folds `..` into the
/// preceding segment. A leading `/` is kept (once). Empty input becomes `.`.
pub fn normalize_remote_path(path: &str) -> String {
    let absolute = is_absolute_remote_path(path);
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => match segments.last() {
                Some(&last) if last != ".." => {
                    segments.pop();
                }
                _ if absolute => {}
                _ => segments.push(".."),
            },
            other => segments.push(other),
        }
    }

    let joined = segments.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Resolve the remote path of a single-file operation.
///
/// The payload-supplied name (legacy `{filename, data}` shape) wins over the
/// configured file name. The joined path has exactly one leading `/` removed,
/// so `("/uploads", "/a.txt")` resolves to `uploads/a.txt`.
pub fn resolve_file_path(
    workdir: Option<&str>,
    filename: Option<&str>,
    payload_name: Option<&str>,
) -> Result<String, SftpError> {
    let name = payload_name
        .filter(|n| !n.trim().is_empty())
        .or_else(|| filename.filter(|n| !n.trim().is_empty()))
        .ok_or_else(|| SftpError::Resolution("no file name given".to_string()))?;

    let base = workdir.filter(|w| !w.trim().is_empty()).unwrap_or(".");
    let joined = normalize_remote_path(&join_remote_path(base, name));
    let relative = joined.strip_prefix('/').unwrap_or(&joined);

    if relative.is_empty() || relative == "." {
        return Err(SftpError::Resolution(format!(
            "file name '{}' does not resolve to a file",
            name
        )));
    }
    Ok(relative.to_string())
}

/// Resolve a working directory (default `.`).
pub fn resolve_dir_path(workdir: Option<&str>) -> String {
    normalize_remote_path(workdir.filter(|w| !w.trim().is_empty()).unwrap_or("."))
}

/// Split a payload-supplied path into its directory and base name.
pub fn split_payload_path(path: &str) -> (String, String) {
    let normalized = normalize_remote_path(path);
    match normalized.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((dir, name)) => (dir.to_string(), name.to_string()),
        None => (".".to_string(), normalized),
    }
}

/// Parent directory of a remote path, if it has one.
pub fn parent_dir(path: &str) -> Option<String> {
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((dir, _)) => Some(dir.to_string()),
        None => None,
    }
}
