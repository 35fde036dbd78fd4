//! Patch text parsing and application.
//!
//! A patch is a sequence of file sections between `*** Begin Patch` and
//! `*** End Patch`. [`parse`] turns the text into a [`Patch`] without touching
//! the filesystem; [`PatchApplier`] applies it inside a [`SandboxRoot`].
//!
//! [`SandboxRoot`]: crate::sandbox::SandboxRoot

mod applier;
mod matcher;
mod parser;

pub use applier::PatchApplier;
pub(crate) use applier::{remove_path, write_temp};
pub use parser::parse;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Patch {
    pub changes: Vec<FileChange>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileChange {
    AddFile { path: String, content: String },
    DeleteFile { path: String },
    UpdateFile { path: String, hunks: Vec<Hunk> },
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            FileChange::AddFile { path, .. }
            | FileChange::DeleteFile { path }
            | FileChange::UpdateFile { path, .. } => path,
        }
    }
}

/// A localized edit anchored by unchanged lines on either side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Hunk {
    pub hint: Option<String>,
    pub context_before: Vec<String>,
    pub removed: Vec<String>,
    pub added: Vec<String>,
    pub context_after: Vec<String>,
}

impl Hunk {
    /// Lines the hunk expects to find in the current content.
    pub fn old_lines(&self) -> Vec<String> {
        let mut lines = self.context_before.clone();
        lines.extend(self.removed.iter().cloned());
        lines.extend(self.context_after.iter().cloned());
        lines
    }

    pub fn is_pure_insertion(&self) -> bool {
        self.context_before.is_empty() && self.removed.is_empty() && self.context_after.is_empty()
    }
}
