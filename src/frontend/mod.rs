//! C and C++ front end: preprocessing, parsing and lowering into the
//! declaration model in [`crate::ast`].
//!
//! A translation unit is preprocessed into a single buffer, parsed with the
//! tree-sitter C++ grammar and lowered into a [`TranslationUnit`] whose
//! locations point back through the preprocessor's piece table. Any syntax
//! error in the buffer fails the whole translation unit.

pub mod compile_db;
pub mod errors;
pub mod lower;
pub mod parser;
pub mod preprocess;

pub use compile_db::{
    CompilationDatabase, CompilationDatabaseError, CompileCommand, CompileOptions, MacroOp,
};
pub use errors::{FrontendError, PreprocessErrorKind};
pub use parser::{CppParser, ErrorNode, ParsedSource};
pub use preprocess::{preprocess, Preprocessed};

use crate::ast::TranslationUnit;
use crate::pool::with_parser;
use crate::source::{SourceLocation, SourceMap};
use std::path::Path;
use std::sync::Arc;

/// Build the translation unit for `command.file`, whose current contents
/// are `text`.
pub fn parse_translation_unit(
    command: &CompileCommand,
    text: Arc<str>,
) -> Result<TranslationUnit, FrontendError> {
    parse_source(&command.file, text, &command.options())
}

/// Preprocess, parse and lower one main file.
pub fn parse_source(
    path: &Path,
    text: Arc<str>,
    options: &CompileOptions,
) -> Result<TranslationUnit, FrontendError> {
    let (source_map, buffer) = preprocess(path, text, options)?;

    with_parser(|parser| {
        let parsed = parser.parse_with_source(&buffer.text)?;
        if parsed.has_errors() {
            return Err(syntax_error(path, &parsed, &buffer, &source_map));
        }
        Ok(lower::lower(&parsed, &buffer, source_map))
    })?
}

fn syntax_error(
    path: &Path,
    parsed: &ParsedSource<'_>,
    buffer: &Preprocessed,
    source_map: &SourceMap,
) -> FrontendError {
    let errors = parsed.error_nodes();
    let first = errors.first().map_or(0, |e| e.byte_start);

    // MISSING nodes at the very end sit one past the last mapped byte
    let location = match buffer.location_at(first) {
        SourceLocation::Invalid => buffer.location_at(first.saturating_sub(1)),
        found => found,
    };

    match source_map.presumed_loc(location) {
        Some(presumed) => FrontendError::Syntax {
            file: presumed.file.to_path_buf(),
            line: presumed.line,
            column: presumed.column,
            count: errors.len(),
        },
        None => FrontendError::Syntax {
            file: path.to_path_buf(),
            line: 0,
            column: 0,
            count: errors.len(),
        },
    }
}
