use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

lazy_static! {
    static ref REPO_PATH_REGEX: Regex =
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*/[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap();
}

/// Validates an `owner/name` repository argument before any network call.
pub fn valid_repo_path(path: &str) -> bool {
    REPO_PATH_REGEX.is_match(path)
}

/// Renders a path with forward slashes. The source-control tool requires
/// forward-slashed key paths inside `GIT_SSH_COMMAND` even on Windows.
pub fn slash(path: &Path) -> String {
    let raw = path.to_string_lossy();
    if cfg!(windows) {
        raw.replace('\\', "/")
    } else {
        raw.into_owned()
    }
}

/// Expands glob patterns relative to `root`. Patterns without a match (or
/// that fail to compile) are kept verbatim so the child process can report
/// them; matches come back root-relative with forward slashes.
pub fn expand_globs(patterns: &[String], root: &Path) -> Vec<String> {
    if patterns.is_empty() {
        return Vec::new();
    }

    let mut expanded = Vec::new();
    for pattern in patterns {
        let absolute = root.join(pattern);
        let candidates = match glob::glob(&absolute.to_string_lossy()) {
            Ok(paths) => paths.flatten().collect::<Vec<PathBuf>>(),
            Err(e) => {
                warn!("Invalid glob pattern {}: {}", pattern, e);
                Vec::new()
            }
        };

        if candidates.is_empty() {
            expanded.push(pattern.clone());
            continue;
        }

        for path in candidates {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            expanded.push(slash(relative));
        }
    }
    expanded
}
