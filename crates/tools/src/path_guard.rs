//! Path confinement for the file tools.
//!
//! Relative paths resolve against the workspace root. Resolved paths must
//! stay inside the root (when one is configured) and outside the forbidden
//! prefixes. `..` components are rejected outright.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("Path '{path}' is outside the workspace")]
    OutsideWorkspace { path: String },

    #[error("Path '{path}' matches forbidden pattern '{pattern}'")]
    Forbidden { path: String, pattern: String },

    #[error("Path traversal detected in '{path}'")]
    Traversal { path: String },

    #[error("Failed to resolve path '{path}': {reason}")]
    Unresolvable { path: String, reason: String },
}

fn default_forbidden() -> Vec<String> {
    ["~/.ssh", "~/.gnupg", "~/.aws", "/etc/shadow", "/etc/sudoers"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone)]
pub struct PathGuard {
    root: Option<PathBuf>,
    forbidden: Vec<String>,
}

impl Default for PathGuard {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PathGuard {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self {
            root,
            forbidden: default_forbidden(),
        }
    }

    pub fn with_forbidden(mut self, forbidden: Vec<String>) -> Self {
        self.forbidden = forbidden;
        self
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Resolve a user-supplied path to the canonical path the tool may touch.
    /// The file itself need not exist yet.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathError> {
        let input = Path::new(path);
        if input.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(PathError::Traversal { path: path.into() });
        }

        let joined = match &self.root {
            Some(root) if input.is_relative() => root.join(input),
            _ => input.to_path_buf(),
        };
        let canonical = canonicalize_lenient(&joined).map_err(|e| PathError::Unresolvable {
            path: path.into(),
            reason: e.to_string(),
        })?;

        for pattern in &self.forbidden {
            let expanded = PathBuf::from(expand_tilde(pattern));
            if canonical.starts_with(&expanded) {
                return Err(PathError::Forbidden {
                    path: path.into(),
                    pattern: pattern.clone(),
                });
            }
        }

        if let Some(root) = &self.root {
            let root = root.canonicalize().unwrap_or_else(|_| root.clone());
            if !canonical.starts_with(&root) {
                return Err(PathError::OutsideWorkspace { path: path.into() });
            }
        }

        Ok(canonical)
    }
}

/// Canonicalize the deepest existing ancestor and re-append the rest, so
/// symlinks are resolved even for files about to be created.
fn canonicalize_lenient(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if existing.exists() {
            let mut resolved = existing.canonicalize()?;
            resolved.extend(rest.iter().rev());
            return Ok(resolved);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(path.to_path_buf()),
        }
    }
}

fn expand_tilde(path: &str) -> String {
    let home = if cfg!(target_os = "windows") {
        std::env::var("USERPROFILE")
    } else {
        std::env::var("HOME")
    };
    match home {
        Ok(home) if path == "~" || path.starts_with("~/") => path.replacen('~', &home, 1),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traversal_is_rejected() {
        let guard = PathGuard::default();
        assert!(matches!(
            guard.resolve("../../../etc/passwd"),
            Err(PathError::Traversal { .. })
        ));
        assert!(matches!(
            guard.resolve("/home/user/../../etc/passwd"),
            Err(PathError::Traversal { .. })
        ));
    }

    #[test]
    fn relative_paths_resolve_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let guard = PathGuard::new(Some(dir.path().to_path_buf()));

        let resolved = guard.resolve("notes/todo.md").unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(resolved, root.join("notes").join("todo.md"));
    }

    #[test]
    fn absolute_paths_outside_root_are_rejected() {
        let workspace = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let guard = PathGuard::new(Some(workspace.path().to_path_buf()));

        let outside = elsewhere.path().join("secret.txt");
        assert!(matches!(
            guard.resolve(outside.to_str().unwrap()),
            Err(PathError::OutsideWorkspace { .. })
        ));
    }

    #[test]
    fn forbidden_prefixes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().canonicalize().unwrap().join("private");
        let guard = PathGuard::default().with_forbidden(vec![blocked.to_string_lossy().into_owned()]);

        let target = blocked.join("key.pem");
        assert!(matches!(
            guard.resolve(target.to_str().unwrap()),
            Err(PathError::Forbidden { .. })
        ));
        assert!(guard.resolve(dir.path().join("public.txt").to_str().unwrap()).is_ok());
    }
}
