//! Path helpers for the `/`-separated node hierarchy.

use crate::error::{CoordError, CoordResult};

/// The root node. Always exists.
pub const ROOT: &str = "/";

/// Check that `path` is absolute, has no trailing slash and no empty segment.
pub fn validate(path: &str) -> CoordResult<()> {
    if path == ROOT {
        return Ok(());
    }
    let valid = path.starts_with('/')
        && !path.ends_with('/')
        && path[1..].split('/').all(|seg| !seg.is_empty());
    if valid {
        Ok(())
    } else {
        Err(CoordError::InvalidPath(path.to_string()))
    }
}

/// Parent of `path`. The parent of a top-level node (and of the root) is `/`.
pub fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => ROOT,
        Some(idx) => &path[..idx],
    }
}

/// Last segment of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Append a child name to `base`.
pub fn join(base: &str, child: &str) -> String {
    if base == ROOT {
        format!("/{child}")
    } else {
        format!("{base}/{child}")
    }
}

/// Prefix shared by every direct child key of `path`.
pub(crate) fn child_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{path}/")
    }
}
