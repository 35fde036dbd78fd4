use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::domain::{PathEscapeError, SandboxError};

/// The directory every tool operation is confined to.
///
/// Created once at startup from a canonicalized directory and never mutated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxRoot {
    root: PathBuf,
}

impl SandboxRoot {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let path = path.as_ref();
        let root = fs::canonicalize(path).map_err(|error| SandboxError::InvalidRoot {
            path: path.to_path_buf(),
            reason: error.to_string(),
        })?;
        if !root.is_dir() {
            return Err(SandboxError::InvalidRoot {
                path: path.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` to a real location inside the root.
    ///
    /// Existing components are canonicalized one at a time so that `..`
    /// applies to the physical parent and symlinks are followed before the
    /// containment check. Components past the deepest existing ancestor are
    /// appended as-is.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, PathEscapeError> {
        if requested.contains('\0') {
            return Err(PathEscapeError::new(requested, "path contains a NUL byte"));
        }

        let input = Path::new(requested);
        let mut current = if input.is_absolute() {
            PathBuf::new()
        } else {
            self.root.clone()
        };
        let mut missing: Vec<&std::ffi::OsStr> = Vec::new();

        for component in input.components() {
            match component {
                Component::Prefix(prefix) => current = PathBuf::from(prefix.as_os_str()),
                Component::RootDir => current.push(Component::RootDir.as_os_str()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if missing.pop().is_none() {
                        current.pop();
                    }
                }
                Component::Normal(name) => {
                    if !missing.is_empty() {
                        missing.push(name);
                        continue;
                    }
                    let candidate = current.join(name);
                    match fs::symlink_metadata(&candidate) {
                        Ok(metadata) => {
                            current = fs::canonicalize(&candidate).map_err(|error| {
                                if metadata.file_type().is_symlink() {
                                    PathEscapeError::new(requested, "dangling symbolic link")
                                } else {
                                    PathEscapeError::new(requested, error.to_string())
                                }
                            })?;
                        }
                        Err(error) if error.kind() == ErrorKind::NotFound => missing.push(name),
                        Err(error) => {
                            return Err(PathEscapeError::new(requested, error.to_string()));
                        }
                    }
                }
            }
        }

        for name in missing {
            current.push(name);
        }

        if current.starts_with(&self.root) {
            Ok(current)
        } else {
            Err(PathEscapeError::new(
                requested,
                format!("resolves to '{}'", current.display()),
            ))
        }
    }

    /// Render a resolved path relative to the root, `.` for the root itself.
    pub fn relative(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => path.display().to_string(),
        }
    }

    pub fn is_root(&self, path: &Path) -> bool {
        path == self.root
    }
}
