//! Source files, macro expansions and location classification.
//!
//! Every location handed out by the front end is a [`SourceLocation`]. A
//! location is either written directly in a file or points into the expanded
//! text of a macro invocation. Two resolutions matter:
//!
//! - the *expansion* location: where the text logically appears (the
//!   outermost macro call site), used to decide main-file membership;
//! - the *spelling* location: where the characters were literally typed,
//!   which may be a header holding the macro definition.

use std::borrow::Cow;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Index of a file registered in a [`SourceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub(crate) u32);

/// Index of a macro expansion registered in a [`SourceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpansionId(pub(crate) u32);

/// A byte offset inside a physical file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileLoc {
    pub file: FileId,
    pub offset: usize,
}

impl FileLoc {
    pub fn new(file: FileId, offset: usize) -> Self {
        Self { file, offset }
    }
}

/// An opaque, file-resolvable position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SourceLocation {
    /// No textual origin.
    #[default]
    Invalid,
    /// Text copied verbatim from a file.
    File(FileLoc),
    /// Text produced by a macro expansion, `offset` bytes into its expanded text.
    Macro { expansion: ExpansionId, offset: usize },
}

impl SourceLocation {
    pub fn is_valid(&self) -> bool {
        !matches!(self, SourceLocation::Invalid)
    }

    pub fn is_macro(&self) -> bool {
        matches!(self, SourceLocation::Macro { .. })
    }
}

/// A loaded source file.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub path: PathBuf,
    pub text: Arc<str>,
    /// Location of the `#include` that pulled this file in.
    pub included_from: Option<FileLoc>,
    line_starts: Vec<usize>,
}

impl SourceFile {
    fn new(path: PathBuf, text: Arc<str>, included_from: Option<FileLoc>) -> Self {
        let line_starts = std::iter::once(0)
            .chain(text.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            path,
            text,
            included_from,
            line_starts,
        }
    }

    /// 1-based line and column for a byte offset.
    pub fn line_column(&self, offset: usize) -> (usize, usize) {
        let line = self.line_starts.partition_point(|&start| start <= offset);
        let line_start = self.line_starts[line.saturating_sub(1)];
        (line.max(1), offset.saturating_sub(line_start) + 1)
    }
}

/// Text of one macro invocation after substitution, with where each token
/// was spelled.
#[derive(Debug, Clone)]
pub struct MacroExpansion {
    pub name: String,
    /// Start of the outermost invocation (the macro name token).
    pub call_site: FileLoc,
    pub text: String,
    spellings: Vec<SpellingSpan>,
}

/// A range of expanded text and where it was typed, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpellingSpan {
    pub range: Range<usize>,
    pub spelling: Option<FileLoc>,
}

impl MacroExpansion {
    pub fn new(
        name: impl Into<String>,
        call_site: FileLoc,
        text: String,
        spellings: Vec<SpellingSpan>,
    ) -> Self {
        Self {
            name: name.into(),
            call_site,
            text,
            spellings,
        }
    }

    fn spelling_at(&self, offset: usize) -> Option<FileLoc> {
        let span = self
            .spellings
            .iter()
            .find(|span| span.range.contains(&offset))?;
        let base = span.spelling?;
        Some(FileLoc::new(base.file, base.offset + (offset - span.range.start)))
    }
}

/// Presumed (user-visible) position of a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresumedLoc<'a> {
    pub file: &'a Path,
    pub line: usize,
    pub column: usize,
}

/// Owns every file and expansion seen while building one translation unit.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    files: Vec<SourceFile>,
    expansions: Vec<MacroExpansion>,
    main_file: Option<FileId>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file. The first file added becomes the main file.
    pub fn add_file(
        &mut self,
        path: impl Into<PathBuf>,
        text: Arc<str>,
        included_from: Option<FileLoc>,
    ) -> FileId {
        let id = FileId(self.files.len() as u32);
        self.files
            .push(SourceFile::new(path.into(), text, included_from));
        if self.main_file.is_none() {
            self.main_file = Some(id);
        }
        id
    }

    pub fn add_expansion(&mut self, expansion: MacroExpansion) -> ExpansionId {
        let id = ExpansionId(self.expansions.len() as u32);
        self.expansions.push(expansion);
        id
    }

    pub fn main_file(&self) -> Option<FileId> {
        self.main_file
    }

    pub fn file(&self, id: FileId) -> Option<&SourceFile> {
        self.files.get(id.0 as usize)
    }

    pub fn file_path(&self, id: FileId) -> Option<&Path> {
        self.file(id).map(|f| f.path.as_path())
    }

    pub fn expansion(&self, id: ExpansionId) -> Option<&MacroExpansion> {
        self.expansions.get(id.0 as usize)
    }

    pub fn files(&self) -> impl Iterator<Item = (FileId, &SourceFile)> {
        self.files
            .iter()
            .enumerate()
            .map(|(i, f)| (FileId(i as u32), f))
    }

    /// Resolve to the user-visible position. `None` if the location has no
    /// file behind it.
    pub fn expansion_loc(&self, loc: SourceLocation) -> Option<FileLoc> {
        let resolved = match loc {
            SourceLocation::Invalid => return None,
            SourceLocation::File(file_loc) => file_loc,
            SourceLocation::Macro { expansion, .. } => self.expansion(expansion)?.call_site,
        };
        self.file(resolved.file)?;
        Some(resolved)
    }

    /// Resolve to where the text was typed. `None` for invalid locations and
    /// for macro tokens produced by stringizing, pasting or command-line
    /// definitions.
    pub fn spelling_loc(&self, loc: SourceLocation) -> Option<FileLoc> {
        let resolved = match loc {
            SourceLocation::Invalid => return None,
            SourceLocation::File(file_loc) => file_loc,
            SourceLocation::Macro { expansion, offset } => {
                self.expansion(expansion)?.spelling_at(offset)?
            }
        };
        self.file(resolved.file)?;
        Some(resolved)
    }

    /// True iff the expansion location lies in the main file.
    pub fn is_in_main_file(&self, loc: SourceLocation) -> bool {
        match (self.expansion_loc(loc), self.main_file) {
            (Some(resolved), Some(main)) => resolved.file == main,
            _ => false,
        }
    }

    /// True iff the spelling location lies in the main file.
    pub fn is_written_in_main_file(&self, loc: SourceLocation) -> bool {
        match (self.spelling_loc(loc), self.main_file) {
            (Some(resolved), Some(main)) => resolved.file == main,
            _ => false,
        }
    }

    /// Presumed locations are always for expansion points.
    pub fn presumed_loc(&self, loc: SourceLocation) -> Option<PresumedLoc<'_>> {
        let resolved = self.expansion_loc(loc)?;
        let file = self.file(resolved.file)?;
        let (line, column) = file.line_column(resolved.offset);
        Some(PresumedLoc {
            file: &file.path,
            line,
            column,
        })
    }
}

/// Decode raw file bytes for the front end.
///
/// Every byte that is not part of a valid UTF-8 sequence becomes a single
/// `?`, so byte offsets into the decoded text are offsets into the file.
pub fn decode_source(bytes: &[u8]) -> Cow<'_, str> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Cow::Borrowed(text);
    }

    let mut text = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
        text.extend(std::iter::repeat('?').take(chunk.invalid().len()));
    }
    Cow::Owned(text)
}
