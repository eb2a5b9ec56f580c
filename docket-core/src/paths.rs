use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Suffixes uploaders and scanners commonly use while a file is still being
/// written.
pub const DEFAULT_TRANSIENT_SUFFIXES: &[&str] = &[".tmp"];

/// Decides which paths the ingestion engine looks at.
#[derive(Clone, Debug)]
pub struct PathPolicy {
    transient_suffixes: Vec<String>,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSIENT_SUFFIXES.iter().map(|s| s.to_string()))
    }
}

impl PathPolicy {
    pub fn new<I, S>(suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transient_suffixes = suffixes
            .into_iter()
            .map(Into::into)
            .filter(|suffix| !suffix.is_empty())
            .map(|suffix| suffix.to_ascii_lowercase())
            .collect();
        Self { transient_suffixes }
    }

    pub fn transient_suffixes(&self) -> &[String] {
        &self.transient_suffixes
    }

    /// Files carrying a transient suffix are never hashed, logged or
    /// extracted.
    pub fn is_transient(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|name| name.to_str())
        else {
            return false;
        };
        let name = name.to_ascii_lowercase();
        self.transient_suffixes
            .iter()
            .any(|suffix| name.ends_with(suffix.as_str()))
    }
}

pub fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Key under which a path is recorded in the hash store. Keys compare
/// byte for byte, so `A.pdf` and `a.pdf` are different files.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `path` with `.` and `..` folded away, provided it stays below `root`.
/// Purely lexical, so it also answers for paths that were just deleted.
pub fn resolve_within(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(parts.into_iter().fold(root.to_path_buf(), |resolved, part| {
        resolved.join(part)
    }))
}
