//! Append-only change log.
//!
//! One line per observed transition:
//!
//! ```text
//! 2026-03-02T09:14:05.120Z | MovedFrom | /in/scan001.pdf | /in/EAN-900112345.pdf | 9f86d0…
//! 2026-03-02T09:14:05.120Z | MovedTo | /in/EAN-900112345.pdf | /in/scan001.pdf | 9f86d0…
//! 2026-03-02T09:14:05.131Z | Created | /in/EAN-900112345.pdf | 9f86d0…
//! 2026-03-02T09:15:40.002Z | Deleted | /in/stray.txt | - | untracked
//! ```
//!
//! Path fields escape backslash, `|`, newline and carriage return with a
//! backslash, so a file name can neither split a field nor start a line.
//!
//! Lines are written with a single `write_all` on a file opened in append
//! mode and synced before returning, so concurrent readers only ever see
//! whole lines.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

use crate::error::{DocketError, Result};
use crate::hasher::Digest;

const FIELD_SEPARATOR: &str = " | ";
const NO_DIGEST: &str = "-";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    MovedFrom,
    MovedTo,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "Created",
            ChangeKind::Modified => "Modified",
            ChangeKind::Deleted => "Deleted",
            ChangeKind::MovedFrom => "MovedFrom",
            ChangeKind::MovedTo => "MovedTo",
        }
    }

    pub fn is_move(&self) -> bool {
        matches!(self, ChangeKind::MovedFrom | ChangeKind::MovedTo)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Created" => Ok(ChangeKind::Created),
            "Modified" => Ok(ChangeKind::Modified),
            "Deleted" => Ok(ChangeKind::Deleted),
            "MovedFrom" => Ok(ChangeKind::MovedFrom),
            "MovedTo" => Ok(ChangeKind::MovedTo),
            other => Err(format!("unknown change kind '{other}'")),
        }
    }
}

/// Annotation attached to an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeTag {
    /// PDF arrived but no page carried a decodable barcode.
    NoBarcode,
    /// Content identical to the stored fingerprint.
    Unchanged,
    /// Content differs from the stored fingerprint; holds the old digest.
    ContentChanged { previous: Digest },
    /// Path had no stored fingerprint.
    Untracked,
}

impl fmt::Display for ChangeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeTag::NoBarcode => f.write_str("no-barcode"),
            ChangeTag::Unchanged => f.write_str("unchanged"),
            ChangeTag::ContentChanged { previous } => {
                write!(f, "content-changed:{previous}")
            }
            ChangeTag::Untracked => f.write_str("untracked"),
        }
    }
}

impl FromStr for ChangeTag {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "no-barcode" => Ok(ChangeTag::NoBarcode),
            "unchanged" => Ok(ChangeTag::Unchanged),
            "untracked" => Ok(ChangeTag::Untracked),
            other => other
                .strip_prefix("content-changed:")
                .and_then(Digest::from_hex)
                .map(|previous| ChangeTag::ContentChanged { previous })
                .ok_or_else(|| format!("unknown change tag '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// Destination for `MovedFrom`, origin for `MovedTo`, unset otherwise.
    pub counterpart: Option<PathBuf>,
    pub digest: Option<Digest>,
    pub tag: Option<ChangeTag>,
}

impl ChangeLogEntry {
    fn new(kind: ChangeKind, path: &Path, digest: Option<Digest>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            path: path.to_path_buf(),
            counterpart: None,
            digest,
            tag: None,
        }
    }

    pub fn created(path: &Path, digest: Digest) -> Self {
        Self::new(ChangeKind::Created, path, Some(digest))
    }

    pub fn modified(path: &Path, digest: Digest) -> Self {
        Self::new(ChangeKind::Modified, path, Some(digest))
    }

    pub fn deleted(path: &Path, digest: Option<Digest>) -> Self {
        Self::new(ChangeKind::Deleted, path, digest)
    }

    /// The `MovedFrom` / `MovedTo` pair describing one move, sharing a
    /// timestamp.
    pub fn moved_pair(from: &Path, to: &Path, digest: Digest) -> [Self; 2] {
        let timestamp = Utc::now();
        [
            Self {
                timestamp,
                kind: ChangeKind::MovedFrom,
                path: from.to_path_buf(),
                counterpart: Some(to.to_path_buf()),
                digest: Some(digest),
                tag: None,
            },
            Self {
                timestamp,
                kind: ChangeKind::MovedTo,
                path: to.to_path_buf(),
                counterpart: Some(from.to_path_buf()),
                digest: Some(digest),
                tag: None,
            },
        ]
    }

    pub fn with_tag(mut self, tag: ChangeTag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn to_line(&self) -> String {
        let mut fields = vec![
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.kind.to_string(),
            escape_path(&self.path),
        ];
        if let Some(counterpart) = &self.counterpart {
            fields.push(escape_path(counterpart));
        }
        fields.push(
            self.digest
                .map(|digest| digest.to_hex())
                .unwrap_or_else(|| NO_DIGEST.to_string()),
        );
        if let Some(tag) = &self.tag {
            fields.push(tag.to_string());
        }
        fields.join(FIELD_SEPARATOR)
    }

    pub fn parse_line(line: &str) -> std::result::Result<Self, String> {
        let fields: Vec<&str> = line.trim_end().split(FIELD_SEPARATOR).collect();
        if fields.len() < 4 {
            return Err(format!("expected at least 4 fields, got {}", fields.len()));
        }

        let timestamp = DateTime::parse_from_rfc3339(fields[0])
            .map_err(|err| format!("bad timestamp '{}': {err}", fields[0]))?
            .with_timezone(&Utc);
        let kind: ChangeKind = fields[1].parse()?;
        let path = unescape_path(fields[2])?;

        let mut rest = fields[3..].iter();
        let counterpart = if kind.is_move() {
            let counterpart = rest
                .next()
                .ok_or_else(|| "move entry without counterpart".to_string())?;
            Some(unescape_path(counterpart)?)
        } else {
            None
        };

        let digest = match rest.next() {
            Some(&NO_DIGEST) => None,
            Some(raw) => Some(
                Digest::from_hex(raw).ok_or_else(|| format!("bad digest '{raw}'"))?,
            ),
            None => return Err("missing digest field".to_string()),
        };
        let tag = rest.next().map(|raw| raw.parse()).transpose()?;

        if rest.next().is_some() {
            return Err("trailing fields".to_string());
        }

        Ok(Self {
            timestamp,
            kind,
            path,
            counterpart,
            digest,
            tag,
        })
    }
}

fn escape_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '|' => out.push_str("\\|"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_path(field: &str) -> std::result::Result<PathBuf, String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('|') => out.push('|'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => return Err(format!("bad escape '\\{other}' in path")),
            None => return Err("dangling escape in path".to_string()),
        }
    }
    Ok(PathBuf::from(out))
}

impl fmt::Display for ChangeLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Append-only writer over the change log file.
#[derive(Debug)]
pub struct ChangeLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl ChangeLog {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let to_log_err = |source| DocketError::LogWrite {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(to_log_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(to_log_err)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ChangeLogEntry) -> Result<()> {
        self.append_all(std::slice::from_ref(entry))
    }

    /// Append several entries as one write.
    pub fn append_all(&self, entries: &[ChangeLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buffer = String::new();
        for entry in entries {
            buffer.push_str(&entry.to_line());
            buffer.push('\n');
        }

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(buffer.as_bytes())
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data())
            .map_err(|source| DocketError::LogWrite {
                path: self.path.clone(),
                source,
            })
    }

    /// Parse every line of the log at `path`. Malformed lines are skipped
    /// with a warning; a missing file reads as empty.
    pub fn read_entries(path: &Path) -> Result<Vec<ChangeLogEntry>> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let mut entries = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match ChangeLogEntry::parse_line(line) {
                Ok(entry) => entries.push(entry),
                Err(reason) => warn!(
                    path = %path.display(),
                    line = number + 1,
                    %reason,
                    "skipping malformed change log line"
                ),
            }
        }
        Ok(entries)
    }

    /// The last `limit` entries of the log at `path`, oldest first.
    pub fn tail(path: &Path, limit: usize) -> Result<Vec<ChangeLogEntry>> {
        let mut entries = Self::read_entries(path)?;
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
        Ok(entries)
    }
}
