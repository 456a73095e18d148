use crate::{RegistryError, Result};

/// Check that `path` is absolute, has no empty segments and no trailing slash.
pub fn validate_path(path: &str) -> Result<()> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && path[1..]
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != ".."));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidPath {
            path: path.to_string(),
        })
    }
}

pub fn child_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Parent of `path`; `None` for the root.
pub(crate) fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

pub(crate) fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
