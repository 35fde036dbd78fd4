use std::fs;
use std::io::{ErrorKind, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use super::matcher::ContextMatcher;
use super::{FileChange, Hunk, Patch};
use crate::domain::{ApplyResult, SandboxError};
use crate::sandbox::SandboxRoot;

/// Applies parsed patches inside a sandbox root, one file at a time.
///
/// A failing change is reported and the remaining changes are still
/// attempted; there is no cross-file rollback.
#[derive(Clone, Debug)]
pub struct PatchApplier {
    root: SandboxRoot,
}

impl PatchApplier {
    pub fn new(root: SandboxRoot) -> Self {
        Self { root }
    }

    pub fn apply(&self, patch: &Patch) -> Vec<ApplyResult> {
        patch
            .changes
            .iter()
            .map(|change| {
                let path = change.path().to_string();
                let result = match self.apply_change(change) {
                    Ok(Outcome::Applied(detail)) => ApplyResult::Applied { path, detail },
                    Ok(Outcome::Unchanged(reason)) => ApplyResult::Skipped { path, reason },
                    Err(error) => ApplyResult::Failed { path, error },
                };
                match &result {
                    ApplyResult::Failed { path, error } => {
                        log::warn!("patch change for '{path}' failed: {error}")
                    }
                    other => log::info!("patch change {other}"),
                }
                result
            })
            .collect()
    }

    fn apply_change(&self, change: &FileChange) -> Result<Outcome, SandboxError> {
        let target = self.root.resolve(change.path())?;
        match change {
            FileChange::AddFile { path, content } => add_file(path, &target, content),
            FileChange::DeleteFile { path } => {
                if self.root.is_root(&target) {
                    return Err(SandboxError::InvalidArgument(
                        "refusing to delete the sandbox root".to_string(),
                    ));
                }
                remove_path(path, &target)?;
                Ok(Outcome::Applied(String::new()))
            }
            FileChange::UpdateFile { path, hunks } => update_file(path, &target, hunks),
        }
    }
}

enum Outcome {
    Applied(String),
    Unchanged(String),
}

fn add_file(path: &str, target: &Path, content: &str) -> Result<Outcome, SandboxError> {
    if fs::symlink_metadata(target).is_ok() {
        return Err(SandboxError::FileConflict {
            path: path.to_string(),
        });
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .map_err(|source| SandboxError::io("create directory", parent, source))?;
    }

    let tmp = write_temp(target, content.as_bytes())?;
    tmp.persist_noclobber(target).map_err(|error| {
        if error.error.kind() == ErrorKind::AlreadyExists {
            SandboxError::FileConflict {
                path: path.to_string(),
            }
        } else {
            SandboxError::io("write", target, error.error)
        }
    })?;
    Ok(Outcome::Applied(String::new()))
}

/// Remove a file, or a directory with all of its descendants.
pub(crate) fn remove_path(path: &str, target: &Path) -> Result<(), SandboxError> {
    let metadata = match fs::symlink_metadata(target) {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(SandboxError::NotFound {
                path: path.to_string(),
            });
        }
        Err(source) => return Err(SandboxError::io("inspect", target, source)),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(target).map_err(|source| SandboxError::io("delete", target, source))
    } else {
        fs::remove_file(target).map_err(|source| SandboxError::io("delete", target, source))
    }
}

fn update_file(path: &str, target: &Path, hunks: &[Hunk]) -> Result<Outcome, SandboxError> {
    let original = match fs::read_to_string(target) {
        Ok(original) => original,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(SandboxError::NotFound {
                path: path.to_string(),
            });
        }
        Err(source) => return Err(SandboxError::io("read", target, source)),
    };
    if !target.is_file() {
        return Err(SandboxError::InvalidArgument(format!(
            "'{path}' is not a regular file"
        )));
    }

    let updated = apply_hunks(path, &original, hunks)?;
    if updated == original {
        return Ok(Outcome::Unchanged("content unchanged".to_string()));
    }

    let permissions = fs::metadata(target)
        .map_err(|source| SandboxError::io("inspect", target, source))?
        .permissions();
    let tmp = write_temp(target, updated.as_bytes())?;
    fs::set_permissions(tmp.path(), permissions)
        .map_err(|source| SandboxError::io("set permissions on", tmp.path(), source))?;
    tmp.persist(target)
        .map_err(|error| SandboxError::io("replace", target, error.error))?;

    Ok(Outcome::Applied(diff_stat(&original, &updated)))
}

/// Run every hunk against an in-memory copy of `original`.
///
/// Each hunk searches the buffer left by the previous one; the first hunk
/// that cannot be located fails the whole file.
fn apply_hunks(path: &str, original: &str, hunks: &[Hunk]) -> Result<String, SandboxError> {
    let line_ending = if original.contains("\r\n") { "\r\n" } else { "\n" };
    // An empty file gets the same terminated last line as an added one.
    let had_trailing_newline = original.is_empty() || original.ends_with('\n');
    let mut lines: Vec<String> = original
        .split(line_ending)
        .map(str::to_string)
        .collect();
    if lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }

    let mut cursor = 0usize;
    for (index, hunk) in hunks.iter().enumerate() {
        let matcher = ContextMatcher::new(&lines);
        let mut search_from = cursor;
        let hint_line = hunk
            .hint
            .as_deref()
            .and_then(|hint| matcher.seek_hint(hint, cursor));
        if let Some(line) = hint_line {
            search_from = line;
        }

        if hunk.is_pure_insertion() {
            let at = hint_line.map_or(lines.len(), |line| line + 1);
            cursor = at + hunk.added.len();
            lines.splice(at..at, hunk.added.iter().cloned());
            continue;
        }

        let old = hunk.old_lines();
        let Some(start) = matcher.seek(&old, search_from) else {
            return Err(SandboxError::HunkMismatch {
                path: path.to_string(),
                hunk: index + 1,
                snippet: old.join("\n"),
            });
        };

        // Keep the file's own context lines, whitespace and all.
        let before_end = start + hunk.context_before.len();
        let after_start = before_end + hunk.removed.len();
        let mut replacement: Vec<String> = lines[start..before_end].to_vec();
        replacement.extend(hunk.added.iter().cloned());
        replacement.extend(lines[after_start..start + old.len()].iter().cloned());

        cursor = before_end + hunk.added.len();
        lines.splice(start..start + old.len(), replacement);
    }

    let mut updated = lines.join(line_ending);
    if had_trailing_newline && !lines.is_empty() {
        updated.push_str(line_ending);
    }
    Ok(updated)
}

pub(crate) fn write_temp(target: &Path, bytes: &[u8]) -> Result<NamedTempFile, SandboxError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|source| SandboxError::io("create temporary file in", parent, source))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|source| SandboxError::io("write", tmp.path().to_path_buf(), source))?;
    Ok(tmp)
}

fn diff_stat(original: &str, updated: &str) -> String {
    let patch = diffy::create_patch(original, updated);
    let (mut inserted, mut deleted) = (0usize, 0usize);
    for hunk in patch.hunks() {
        for line in hunk.lines() {
            match line {
                diffy::Line::Insert(_) => inserted += 1,
                diffy::Line::Delete(_) => deleted += 1,
                diffy::Line::Context(_) => {}
            }
        }
    }
    format!("+{inserted} -{deleted}")
}
