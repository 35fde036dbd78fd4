//! Plain file operations confined to the sandbox root.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use glob::{MatchOptions, Pattern};
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::Config;
use crate::domain::SandboxError;
use crate::patch::{remove_path, write_temp};
use crate::sandbox::SandboxRoot;

const DIR_PREFIX: &str = "[DIR] ";
const GLOB_CHARS: &[char] = &['*', '?', '['];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileToolSettings {
    pub max_file_bytes: u64,
    pub max_results: usize,
}

impl FileToolSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_bytes: config.fetch.max_file_bytes(),
            max_results: config.search.max_results(),
        }
    }
}

impl Default for FileToolSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub path: String,
    pub bytes: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub title: String,
    pub is_dir: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub text: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct FileTools {
    root: SandboxRoot,
    settings: FileToolSettings,
}

impl FileTools {
    pub fn new(root: SandboxRoot, settings: FileToolSettings) -> Self {
        Self { root, settings }
    }

    /// Create or overwrite a file, creating parent directories as needed.
    pub fn write_file(&self, path: &str, content: &str) -> Result<WriteReport, SandboxError> {
        require(path, "file path")?;
        let target = self.root.resolve(path)?;
        if target.is_dir() {
            return Err(SandboxError::InvalidArgument(format!(
                "'{path}' is a directory"
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| SandboxError::io("create directory", parent, source))?;
        }

        let tmp = write_temp(&target, content.as_bytes())?;
        if let Ok(metadata) = fs::metadata(&target) {
            fs::set_permissions(tmp.path(), metadata.permissions())
                .map_err(|source| SandboxError::io("set permissions on", tmp.path(), source))?;
        }
        tmp.persist(&target)
            .map_err(|error| SandboxError::io("write", &target, error.error))?;

        log::info!("wrote {} bytes to {path}", content.len());
        Ok(WriteReport {
            path: self.root.relative(&target),
            bytes: content.len(),
        })
    }

    pub fn create_directory(&self, path: &str) -> Result<String, SandboxError> {
        require(path, "directory path")?;
        let target = self.root.resolve(path)?;
        if target.exists() && !target.is_dir() {
            return Err(SandboxError::FileConflict {
                path: path.to_string(),
            });
        }
        fs::create_dir_all(&target)
            .map_err(|source| SandboxError::io("create directory", &target, source))?;
        Ok(self.root.relative(&target))
    }

    pub fn delete_file(&self, path: &str) -> Result<EntryKind, SandboxError> {
        require(path, "path")?;
        let target = self.root.resolve(path)?;
        if self.root.is_root(&target) {
            return Err(SandboxError::InvalidArgument(
                "refusing to delete the sandbox root".to_string(),
            ));
        }
        let kind = match fs::symlink_metadata(&target) {
            Ok(metadata) if metadata.is_dir() => EntryKind::Directory,
            _ => EntryKind::File,
        };
        remove_path(path, &target)?;
        log::info!("deleted {path}");
        Ok(kind)
    }

    /// Find entries by glob pattern or case-insensitive substring.
    ///
    /// An empty query lists the top level of the root.
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>, SandboxError> {
        let query = query.trim();
        if query.is_empty() {
            let hits = list_dir(self.root.path())?
                .into_iter()
                .take(self.settings.max_results)
                .map(|(name, is_dir)| SearchHit {
                    title: title(&name, is_dir),
                    id: name,
                    is_dir,
                })
                .collect();
            return Ok(hits);
        }

        let matcher = SearchMatcher::new(query)?;
        let walker = WalkDir::new(self.root.path())
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        let mut hits = Vec::new();
        for entry in walker.into_iter().filter_map(Result::ok) {
            if hits.len() >= self.settings.max_results {
                break;
            }
            let id = self.root.relative(entry.path());
            if !matcher.matches(&id) {
                continue;
            }
            let is_dir = if entry.path_is_symlink() {
                // Links are reported but never descended; dangling or escaping ones are hidden.
                match fs::canonicalize(entry.path()) {
                    Ok(real) if real.starts_with(self.root.path()) => real.is_dir(),
                    _ => continue,
                }
            } else {
                entry.file_type().is_dir()
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            hits.push(SearchHit {
                title: title(&name, is_dir),
                id,
                is_dir,
            });
        }
        Ok(hits)
    }

    /// Read a file as text, or describe a directory's contents.
    pub fn fetch(&self, id: &str) -> Result<Document, SandboxError> {
        require(id, "file id")?;
        let target = self.root.resolve(id)?;
        let metadata = match fs::metadata(&target) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(SandboxError::NotFound {
                    path: id.to_string(),
                });
            }
            Err(source) => return Err(SandboxError::io("inspect", &target, source)),
        };
        let title = target
            .file_name()
            .map_or_else(String::new, |name| name.to_string_lossy().into_owned());

        if metadata.is_dir() {
            let entries: Vec<String> = list_dir(&target)?
                .into_iter()
                .map(|(name, is_dir)| self::title(&name, is_dir))
                .collect();
            return Ok(Document {
                id: id.to_string(),
                title,
                text: format!("Directory: {id}\n\nContents:\n{}", entries.join("\n")),
                kind: EntryKind::Directory,
                size: None,
            });
        }

        let size = metadata.len();
        if size > self.settings.max_file_bytes {
            return Err(SandboxError::InvalidArgument(format!(
                "'{id}' is too large ({size} bytes, limit {})",
                self.settings.max_file_bytes
            )));
        }
        let bytes = fs::read(&target).map_err(|source| SandboxError::io("read", &target, source))?;
        let text = String::from_utf8(bytes).unwrap_or_else(|_| {
            let ext = target
                .extension()
                .map_or_else(|| "unknown".to_string(), |ext| format!(".{}", ext.to_string_lossy()));
            format!("[Binary file: {ext}]")
        });

        Ok(Document {
            id: id.to_string(),
            title,
            text,
            kind: EntryKind::File,
            size: Some(size),
        })
    }
}

enum SearchMatcher {
    Glob(Pattern),
    Substring(String),
}

impl SearchMatcher {
    fn new(query: &str) -> Result<Self, SandboxError> {
        if !query.contains(GLOB_CHARS) {
            return Ok(Self::Substring(query.to_lowercase()));
        }
        Pattern::new(query).map(Self::Glob).map_err(|error| {
            SandboxError::InvalidArgument(format!("invalid search pattern '{query}': {error}"))
        })
    }

    /// `id` is the root-relative path with `/` separators.
    fn matches(&self, id: &str) -> bool {
        match self {
            Self::Glob(pattern) => pattern.matches_with(
                id,
                MatchOptions {
                    require_literal_separator: true,
                    ..MatchOptions::new()
                },
            ),
            Self::Substring(needle) => id.to_lowercase().contains(needle.as_str()),
        }
    }
}

fn require(value: &str, what: &str) -> Result<(), SandboxError> {
    if value.trim().is_empty() {
        return Err(SandboxError::InvalidArgument(format!("{what} is required")));
    }
    Ok(())
}

fn title(name: &str, is_dir: bool) -> String {
    if is_dir {
        format!("{DIR_PREFIX}{name}")
    } else {
        name.to_string()
    }
}

/// Directory entries, directories first, then by case-insensitive name.
fn list_dir(dir: &Path) -> Result<Vec<(String, bool)>, SandboxError> {
    let entries = fs::read_dir(dir).map_err(|source| SandboxError::io("list", dir, source))?;
    let mut items: Vec<(String, bool)> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let is_dir = entry.path().is_dir();
            (entry.file_name().to_string_lossy().into_owned(), is_dir)
        })
        .collect();
    items.sort_by_key(|(name, is_dir)| (!is_dir, name.to_lowercase()));
    Ok(items)
}
