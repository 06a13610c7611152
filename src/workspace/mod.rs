//! Project workspace file operations.
//!
//! Every project owns a data directory; `FileOperations` is bound to one such
//! directory and refuses to touch anything outside it. Paths are always given
//! relative to the data directory. They are normalised lexically (so `..`
//! cannot climb above the root) and then checked against the canonical root,
//! so symlinks pointing outside the workspace are rejected too.

pub mod diff;

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::WorkspaceError;

type Result<T> = std::result::Result<T, WorkspaceError>;

/// Data directory for a project: `<data_root>/user_<uid>/project_<pid>`.
pub fn project_dir(data_root: &Path, user_id: i64, project_id: i64) -> PathBuf {
    data_root
        .join(format!("user_{}", user_id))
        .join(format!("project_{}", project_id))
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

/// File operations scoped to one project data directory.
#[derive(Debug, Clone)]
pub struct FileOperations {
    root: PathBuf,
}

impl FileOperations {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the data directory if it doesn't exist yet.
    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| WorkspaceError::io(&self.root.to_string_lossy(), e))
    }

    /// Remove the whole data directory. Missing directories are fine.
    pub fn remove_root(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(WorkspaceError::io(&self.root.to_string_lossy(), e)),
        }
    }

    /// Resolve a relative path to an absolute one inside the root.
    fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let normalized = normalize(rel).ok_or_else(|| WorkspaceError::InvalidPath {
            path: rel.to_string(),
        })?;
        let full = self.root.join(&normalized);
        self.check_real_path(rel, &full)?;
        Ok(full)
    }

    /// Like `resolve`, but the root itself is not an acceptable target.
    fn resolve_entry(&self, rel: &str) -> Result<PathBuf> {
        let full = self.resolve(rel)?;
        if full == self.root {
            return Err(WorkspaceError::InvalidPath {
                path: rel.to_string(),
            });
        }
        Ok(full)
    }

    /// Canonicalize the deepest existing ancestor of `full` and make sure it
    /// still lives under the canonical root.
    fn check_real_path(&self, rel: &str, full: &Path) -> Result<()> {
        let root = self
            .root
            .canonicalize()
            .map_err(|e| WorkspaceError::io(&self.root.to_string_lossy(), e))?;

        let mut probe = full;
        loop {
            if probe.symlink_metadata().is_ok() {
                let real = match probe.canonicalize() {
                    Ok(real) => real,
                    // Dangling symlink: judge it by where it points.
                    Err(_) => {
                        return Err(WorkspaceError::InvalidPath {
                            path: rel.to_string(),
                        });
                    }
                };
                if real.starts_with(&root) {
                    return Ok(());
                }
                return Err(WorkspaceError::InvalidPath {
                    path: rel.to_string(),
                });
            }
            match probe.parent() {
                Some(parent) => probe = parent,
                None => {
                    return Err(WorkspaceError::InvalidPath {
                        path: rel.to_string(),
                    });
                }
            }
        }
    }

    pub fn exists(&self, rel: &str) -> Result<bool> {
        Ok(self.resolve(rel)?.exists())
    }

    /// Create a new file. Parent directories are created as needed.
    pub fn create_file(&self, rel: &str, content: &str) -> Result<String> {
        info!(path = rel, "Creating file");
        let full = self.resolve_entry(rel)?;
        if full.exists() {
            return Err(WorkspaceError::AlreadyExists {
                path: rel.to_string(),
            });
        }
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(rel, e))?;
        }
        std::fs::write(&full, content).map_err(|e| WorkspaceError::io(rel, e))?;
        Ok(format!("File {} created successfully.", rel))
    }

    /// Overwrite an existing file.
    pub fn update_file(&self, rel: &str, content: &str) -> Result<String> {
        info!(path = rel, "Updating file");
        let full = self.resolve_entry(rel)?;
        if !full.exists() {
            return Err(WorkspaceError::NotFound {
                path: rel.to_string(),
            });
        }
        if full.is_dir() {
            return Err(WorkspaceError::IsDirectory {
                path: rel.to_string(),
            });
        }
        std::fs::write(&full, content).map_err(|e| WorkspaceError::io(rel, e))?;
        Ok(format!("File {} updated successfully.", rel))
    }

    /// Update the file if it exists, create it otherwise.
    pub fn write_file(&self, rel: &str, content: &str) -> Result<String> {
        if self.resolve_entry(rel)?.is_file() {
            self.update_file(rel, content)
        } else {
            self.create_file(rel, content)
        }
    }

    pub fn read_file(&self, rel: &str) -> Result<String> {
        debug!(path = rel, "Reading file");
        let full = self.resolve_entry(rel)?;
        if !full.exists() {
            return Err(WorkspaceError::NotFound {
                path: rel.to_string(),
            });
        }
        if full.is_dir() {
            return Err(WorkspaceError::IsDirectory {
                path: rel.to_string(),
            });
        }
        std::fs::read_to_string(&full).map_err(|e| WorkspaceError::io(rel, e))
    }

    /// Delete a file, or a directory and everything below it.
    pub fn delete_file(&self, rel: &str) -> Result<String> {
        info!(path = rel, "Deleting file or directory");
        let full = self.resolve_entry(rel)?;
        let meta = full.symlink_metadata().map_err(|_| WorkspaceError::NotFound {
            path: rel.to_string(),
        })?;
        if meta.is_dir() {
            std::fs::remove_dir_all(&full).map_err(|e| WorkspaceError::io(rel, e))?;
            Ok(format!("Directory {} deleted successfully.", rel))
        } else {
            std::fs::remove_file(&full).map_err(|e| WorkspaceError::io(rel, e))?;
            Ok(format!("File {} deleted successfully.", rel))
        }
    }

    pub fn create_directory(&self, rel: &str) -> Result<String> {
        let full = self.resolve_entry(rel)?;
        if full.exists() {
            return Err(WorkspaceError::AlreadyExists {
                path: rel.to_string(),
            });
        }
        std::fs::create_dir_all(&full).map_err(|e| WorkspaceError::io(rel, e))?;
        Ok(format!("Directory {} created successfully.", rel))
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<String> {
        info!(from, to, "Renaming");
        let src = self.resolve_entry(from)?;
        let dst = self.resolve_entry(to)?;
        if !src.exists() {
            return Err(WorkspaceError::NotFound {
                path: from.to_string(),
            });
        }
        if dst.exists() {
            return Err(WorkspaceError::AlreadyExists {
                path: to.to_string(),
            });
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(to, e))?;
        }
        std::fs::rename(&src, &dst).map_err(|e| WorkspaceError::io(from, e))?;
        Ok(format!("{} renamed to {} successfully.", from, to))
    }

    /// List a directory. Hidden entries are skipped; directories come first,
    /// then files, each sorted case-insensitively.
    pub fn list_files(&self, rel: &str) -> Result<Vec<FileEntry>> {
        debug!(path = rel, "Listing directory");
        let full = self.resolve(rel)?;
        if !full.exists() {
            return Err(WorkspaceError::NotFound {
                path: rel.to_string(),
            });
        }
        if !full.is_dir() {
            return Err(WorkspaceError::NotADirectory {
                path: rel.to_string(),
            });
        }

        let prefix = normalize(rel).unwrap_or_default();
        let reader = std::fs::read_dir(&full).map_err(|e| WorkspaceError::io(rel, e))?;
        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|e| WorkspaceError::io(rel, e))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let is_dir = entry.path().is_dir();
            let path = prefix.join(&name).to_string_lossy().replace('\\', "/");
            entries.push(FileEntry { name, path, is_dir });
        }
        entries.sort_by(|a, b| {
            b.is_dir
                .cmp(&a.is_dir)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(entries)
    }

    /// Unified diff between two versions of a file. Touches nothing on disk.
    pub fn generate_diff(&self, original: &str, new: &str, file_path: Option<&str>) -> String {
        diff::unified(original, new, file_path.unwrap_or("file"))
    }

    /// Apply a unified diff to an existing file. The file is left untouched
    /// if any hunk fails to match.
    pub fn apply_patch(&self, rel: &str, patch: &str) -> Result<String> {
        info!(path = rel, "Applying patch");
        let original = self.read_file(rel)?;
        let patched = diff::apply(&original, patch).map_err(|e| match e {
            diff::PatchError::Parse(msg) => WorkspaceError::InvalidPatch(msg),
            diff::PatchError::Mismatch(reason) => WorkspaceError::PatchMismatch {
                path: rel.to_string(),
                reason,
            },
        })?;
        let full = self.resolve_entry(rel)?;
        std::fs::write(&full, patched).map_err(|e| WorkspaceError::io(rel, e))?;
        Ok(format!("Patch applied to {} successfully.", rel))
    }
}

/// Lexically normalise a relative path. Returns `None` for absolute paths and
/// for `..` components that would leave the root.
fn normalize(rel: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}
