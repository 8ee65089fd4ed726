use serde::Serialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// The edit primitive: byte-span replacement with verification.
///
/// Annotations are point insertions (`byte_start == byte_end`); general
/// replacements are accepted so the set can reject overlapping ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "Edit does nothing until inserted into an EditSet"]
pub struct Edit {
    /// Path to the file to edit
    pub file: PathBuf,
    /// Starting byte offset (inclusive)
    pub byte_start: usize,
    /// Ending byte offset (exclusive)
    pub byte_end: usize,
    /// New text to insert at [byte_start, byte_end)
    pub new_text: String,
    /// Verification of what we expect to find before applying
    pub expected_before: EditVerification,
}

/// Verification strategy for edit safety.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditVerification {
    /// Exact text match required
    ExactMatch(String),
    /// xxh3 hash of expected text (faster for large spans)
    Hash(u64),
}

impl EditVerification {
    /// Check if the provided text matches the verification criteria.
    pub fn matches(&self, text: &str) -> bool {
        match self {
            EditVerification::ExactMatch(expected) => text == expected,
            EditVerification::Hash(expected_hash) => xxh3_64(text.as_bytes()) == *expected_hash,
        }
    }

    /// Create verification from text, using hash for text over 1KB.
    pub fn from_text(text: &str) -> Self {
        if text.len() > 1024 {
            EditVerification::Hash(xxh3_64(text.as_bytes()))
        } else {
            EditVerification::ExactMatch(text.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum EditError {
    #[error("Before-text verification failed at {file}:{byte_start}")]
    BeforeTextMismatch {
        file: PathBuf,
        byte_start: usize,
        byte_end: usize,
        expected: String,
        found: String,
    },

    #[error("Invalid byte range: [{byte_start}, {byte_end}) in file of length {file_len}")]
    InvalidByteRange {
        byte_start: usize,
        byte_end: usize,
        file_len: usize,
    },

    #[error(
        "Conflicting edits in {file}: [{new_start}, {new_end}) overlaps [{existing_start}, {existing_end})"
    )]
    Conflict {
        file: PathBuf,
        existing_start: usize,
        existing_end: usize,
        new_start: usize,
        new_end: usize,
    },

    #[error("Content of {file} does not match the version the edits were computed against")]
    StaleContent { file: PathBuf },

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("UTF-8 validation error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Invalid edit would create malformed UTF-8")]
    InvalidUtf8Edit,
}

impl Edit {
    /// Create a new edit with automatic verification generation.
    pub fn new(
        file: impl Into<PathBuf>,
        byte_start: usize,
        byte_end: usize,
        new_text: impl Into<String>,
        expected_before: impl Into<String>,
    ) -> Self {
        let expected = expected_before.into();
        Self {
            file: file.into(),
            byte_start,
            byte_end,
            new_text: new_text.into(),
            expected_before: EditVerification::from_text(&expected),
        }
    }

    /// Insert `text` at `offset` without removing anything.
    pub fn insertion(file: impl Into<PathBuf>, offset: usize, text: impl Into<String>) -> Self {
        Self::new(file, offset, offset, text, "")
    }

    pub fn is_insertion(&self) -> bool {
        self.byte_start == self.byte_end
    }

    pub fn removed_len(&self) -> usize {
        self.byte_end - self.byte_start
    }

    /// Validate the edit against the file contents the set was built for.
    ///
    /// Returns the current text at [byte_start, byte_end) if validation succeeds.
    fn validate<'a>(&self, content: &'a [u8]) -> Result<&'a [u8], EditError> {
        if self.byte_start > self.byte_end || self.byte_end > content.len() {
            return Err(EditError::InvalidByteRange {
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                file_len: content.len(),
            });
        }

        let current_bytes = &content[self.byte_start..self.byte_end];
        let current_text = std::str::from_utf8(current_bytes)?;

        if !self.expected_before.matches(current_text) {
            return Err(EditError::BeforeTextMismatch {
                file: self.file.clone(),
                byte_start: self.byte_start,
                byte_end: self.byte_end,
                expected: format!("{:?}", self.expected_before),
                found: current_text.to_string(),
            });
        }

        Ok(current_bytes)
    }

    /// Sort key within one file: start offset, insertions before a
    /// replacement starting at the same offset.
    fn order_key(&self) -> (usize, bool) {
        (self.byte_start, !self.is_insertion())
    }

    fn overlaps(&self, other: &Edit) -> bool {
        match (self.is_insertion(), other.is_insertion()) {
            (true, true) => false,
            (true, false) => other.byte_start < self.byte_start && self.byte_start < other.byte_end,
            (false, true) => self.byte_start < other.byte_start && other.byte_start < self.byte_end,
            (false, false) => {
                self.byte_start < other.byte_end && other.byte_start < self.byte_end
            }
        }
    }
}

/// Length and fingerprint of the file contents edits were computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileVersion {
    pub len: usize,
    pub hash: u64,
}

impl FileVersion {
    pub fn of(content: &[u8]) -> Self {
        Self {
            len: content.len(),
            hash: xxh3_64(content),
        }
    }
}

/// What happened to an edit handed to [`EditSet::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An identical edit was already present.
    Duplicate,
}

/// Serializable view of one edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditRecord {
    pub file: String,
    pub offset: usize,
    pub length: usize,
    pub text: String,
}

/// A file's original bytes with every edit for that file applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenBuffer {
    pub file: PathBuf,
    pub bytes: Vec<u8>,
}

impl RewrittenBuffer {
    /// The buffer as text, with invalid UTF-8 replaced for display.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Result of saving a rewritten file in place.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "EditResult reports what was written"]
pub struct EditResult {
    pub file: PathBuf,
    pub edits_applied: usize,
    /// Net size change; negative when replacements shrank the file.
    pub byte_delta: isize,
}

#[derive(Debug, Clone, Default)]
struct FileEdits {
    version: Option<FileVersion>,
    /// Sorted by `Edit::order_key`, arrival order among equal keys.
    edits: Vec<Edit>,
}

/// Ordered, conflict-checked collection of edits across files.
#[derive(Debug, Clone, Default)]
pub struct EditSet {
    files: BTreeMap<PathBuf, FileEdits>,
}

impl EditSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the contents that offsets for `file` refer to.
    ///
    /// Tracking the same file twice is fine as long as the content is the same.
    pub fn track_file(
        &mut self,
        file: impl Into<PathBuf>,
        content: impl AsRef<[u8]>,
    ) -> Result<(), EditError> {
        let file = file.into();
        let version = FileVersion::of(content.as_ref());
        let entry = self.files.entry(file.clone()).or_default();
        match entry.version {
            Some(existing) if existing != version => Err(EditError::StaleContent { file }),
            _ => {
                entry.version = Some(version);
                Ok(())
            }
        }
    }

    pub fn version(&self, file: &Path) -> Option<FileVersion> {
        self.files.get(file).and_then(|entry| entry.version)
    }

    /// Add one edit, keeping per-file order stable.
    pub fn insert(&mut self, edit: Edit) -> Result<InsertOutcome, EditError> {
        let entry = self.files.entry(edit.file.clone()).or_default();

        let file_len = entry.version.map_or(usize::MAX, |v| v.len);
        if edit.byte_start > edit.byte_end || edit.byte_end > file_len {
            return Err(EditError::InvalidByteRange {
                byte_start: edit.byte_start,
                byte_end: edit.byte_end,
                file_len,
            });
        }

        if entry.edits.contains(&edit) {
            return Ok(InsertOutcome::Duplicate);
        }

        if let Some(existing) = entry.edits.iter().find(|e| e.overlaps(&edit)) {
            return Err(EditError::Conflict {
                file: edit.file.clone(),
                existing_start: existing.byte_start,
                existing_end: existing.byte_end,
                new_start: edit.byte_start,
                new_end: edit.byte_end,
            });
        }

        let key = edit.order_key();
        let idx = entry.edits.partition_point(|e| e.order_key() <= key);
        entry.edits.insert(idx, edit);
        Ok(InsertOutcome::Inserted)
    }

    pub fn len(&self) -> usize {
        self.files.values().map(|entry| entry.edits.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Files that received at least one edit, in path order.
    pub fn files(&self) -> impl Iterator<Item = &Path> {
        self.files
            .iter()
            .filter(|(_, entry)| !entry.edits.is_empty())
            .map(|(path, _)| path.as_path())
    }

    pub fn edits_for(&self, file: &Path) -> &[Edit] {
        self.files
            .get(file)
            .map(|entry| entry.edits.as_slice())
            .unwrap_or(&[])
    }

    /// All edits in (file, offset, arrival) order.
    pub fn iter(&self) -> impl Iterator<Item = &Edit> {
        self.files.values().flat_map(|entry| entry.edits.iter())
    }

    pub fn records(&self) -> Vec<EditRecord> {
        self.iter()
            .map(|edit| EditRecord {
                file: edit.file.display().to_string(),
                offset: edit.byte_start,
                length: edit.removed_len(),
                text: edit.new_text.clone(),
            })
            .collect()
    }

    /// One `<file>:<offset>:<removed-length>:"<text>"` line per edit.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for edit in self.iter() {
            let _ = writeln!(
                out,
                "{}:{}:{}:\"{}\"",
                edit.file.display(),
                edit.byte_start,
                edit.removed_len(),
                escape_text(&edit.new_text)
            );
        }
        out
    }

    /// Apply the edits for `file` to its original bytes.
    ///
    /// Edits are applied in ascending offset order against a growing buffer,
    /// so each one is shifted by the net length change of everything before it.
    /// Content need not be UTF-8; an edit may only break a file that was.
    pub fn apply(
        &self,
        file: &Path,
        content: impl AsRef<[u8]>,
    ) -> Result<RewrittenBuffer, EditError> {
        let original = content.as_ref();
        let Some(entry) = self.files.get(file) else {
            return Ok(RewrittenBuffer {
                file: file.to_path_buf(),
                bytes: original.to_vec(),
            });
        };

        if let Some(version) = entry.version {
            if version != FileVersion::of(original) {
                return Err(EditError::StaleContent {
                    file: file.to_path_buf(),
                });
            }
        }

        for edit in &entry.edits {
            edit.validate(original)?;
        }

        let added: usize = entry.edits.iter().map(|e| e.new_text.len()).sum();
        let mut buffer = Vec::with_capacity(original.len() + added);
        buffer.extend_from_slice(original);

        let mut shift: isize = 0;
        for edit in &entry.edits {
            let start = edit
                .byte_start
                .checked_add_signed(shift)
                .ok_or(EditError::InvalidByteRange {
                    byte_start: edit.byte_start,
                    byte_end: edit.byte_end,
                    file_len: original.len(),
                })?;
            let end = start + edit.removed_len();
            buffer.splice(start..end, edit.new_text.bytes());
            shift += edit.new_text.len() as isize - edit.removed_len() as isize;
        }

        if std::str::from_utf8(original).is_ok() && std::str::from_utf8(&buffer).is_err() {
            return Err(EditError::InvalidUtf8Edit);
        }
        Ok(RewrittenBuffer {
            file: file.to_path_buf(),
            bytes: buffer,
        })
    }

    /// Rewrite every edited file on disk.
    ///
    /// Each file is re-read and checked against its tracked version first.
    pub fn save_all(&self) -> Result<Vec<EditResult>, EditError> {
        let mut results = Vec::new();
        for file in self.files() {
            let content = fs::read(file)?;
            let rewritten = self.apply(file, &content)?;
            atomic_write(file, &rewritten.bytes)?;

            // Update mtime to invalidate incremental builds
            let now = filetime::FileTime::now();
            filetime::set_file_mtime(file, now)?;

            let edits = self.edits_for(file);
            results.push(EditResult {
                file: file.to_path_buf(),
                edits_applied: edits.len(),
                byte_delta: rewritten.bytes.len() as isize - content.len() as isize,
            });
        }
        Ok(results)
    }
}

fn escape_text(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Atomic file write: tempfile + fsync + rename.
///
/// Either the full write succeeds or nothing changes.
fn atomic_write(path: &Path, content: &[u8]) -> Result<(), EditError> {
    // Same directory keeps the rename on one filesystem
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        Some(_) => Path::new("."),
        None => {
            return Err(EditError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Path has no parent directory",
            )))
        }
    };

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
