//! Per-call filesystem layout and bookkeeping ("detritus") paths.
//!
//! Every call owns a call root in the execution filesystem plus a set of
//! well-known bookkeeping files tracked by string keys. Paths are opaque
//! strings so cloud URIs pass through unchanged.

use std::collections::HashMap;

use thiserror::Error;

/// Detritus key naming the call root itself. Cache-hit copying derives the
/// source root from this entry and fails without it.
pub const CALL_ROOT_PATH_KEY: &str = "callRootPath";
pub const STDOUT_KEY: &str = "stdout";
pub const STDERR_KEY: &str = "stderr";
pub const SCRIPT_KEY: &str = "script";
pub const RETURN_CODE_KEY: &str = "returnCode";

/// Detritus keys every backend is expected to track.
pub const STANDARD_DETRITUS_KEYS: [&str; 5] = [
    CALL_ROOT_PATH_KEY,
    STDOUT_KEY,
    STDERR_KEY,
    SCRIPT_KEY,
    RETURN_CODE_KEY,
];

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path {path:?} is not under root {root:?}")]
    NotUnderRoot { path: String, root: String },
}

/// File layout for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub call_root: String,
    pub detritus: HashMap<String, String>,
}

impl JobPaths {
    /// Standard layout rooted at `call_root`.
    pub fn new(call_root: impl Into<String>) -> Self {
        let call_root = call_root.into();
        let mut detritus = HashMap::new();
        detritus.insert(CALL_ROOT_PATH_KEY.to_string(), call_root.clone());
        for key in [STDOUT_KEY, STDERR_KEY, SCRIPT_KEY] {
            detritus.insert(key.to_string(), join(&call_root, key));
        }
        detritus.insert(RETURN_CODE_KEY.to_string(), join(&call_root, "rc"));
        Self { call_root, detritus }
    }

    pub fn detritus_path(&self, key: &str) -> Option<&str> {
        self.detritus.get(key).map(String::as_str)
    }
}

/// Join a root and a relative path with exactly one separator.
pub fn join(root: &str, relative: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), relative.trim_start_matches('/'))
}

/// Re-root `path` from `source_root` onto `dest_root`, preserving the
/// source-relative portion.
pub fn reroot(path: &str, source_root: &str, dest_root: &str) -> Result<String, PathError> {
    let root = source_root.trim_end_matches('/');
    let relative = match path.strip_prefix(root) {
        Some("") => Some(""),
        Some(rest) if rest.starts_with('/') => Some(rest.trim_start_matches('/')),
        _ => None,
    }
    .ok_or_else(|| PathError::NotUnderRoot {
        path: path.to_string(),
        root: source_root.to_string(),
    })?;
    if relative.is_empty() {
        Ok(dest_root.trim_end_matches('/').to_string())
    } else {
        Ok(join(dest_root, relative))
    }
}
