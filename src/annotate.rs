//! The annotation callback.

use crate::ast::{FieldDecl, RecordDecl};
use crate::edit::{Edit, EditError, EditSet, InsertOutcome};
use crate::matcher::{field_decl, record_decl, DeclMatcher, MatchCallback, MatchFinder, MatchResult};
use crate::source::{SourceLocation, SourceMap};
use tracing::{debug, info, trace};

/// Capture name for matched records.
pub const RECORD_BINDING: &str = "recorddecl";
/// Capture name for matched fields.
pub const FIELD_BINDING: &str = "fielddecl";

const RECORD_LABEL: &str = "CXXRecordDecl";
const FIELD_LABEL: &str = "FieldDecl";

/// Comment inserted before a declaration.
pub fn annotation(label: &str, qualified_name: &str) -> String {
    format!("/* this is the {label} {qualified_name} */")
}

/// The record matcher: every record, or only records with a field.
pub fn record_matcher(require_at_least_one_field: bool) -> DeclMatcher {
    let matcher = if require_at_least_one_field {
        record_decl().has_descendant(field_decl())
    } else {
        record_decl()
    };
    matcher.bind(RECORD_BINDING)
}

pub fn field_matcher() -> DeclMatcher {
    field_decl().bind(FIELD_BINDING)
}

/// Inserts a comment before every record and field declared in the main
/// file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclHandler;

impl DeclHandler {
    /// Register this handler for records and fields on `finder`.
    pub fn register<'c>(&'c self, finder: &mut MatchFinder<'c>, require_at_least_one_field: bool) {
        finder.add_matcher(record_matcher(require_at_least_one_field), self);
        finder.add_matcher(field_matcher(), self);
    }

    fn annotate(
        &self,
        source_map: &SourceMap,
        edits: &mut EditSet,
        location: SourceLocation,
        begin: SourceLocation,
        text: String,
    ) -> Result<(), EditError> {
        if !source_map.is_in_main_file(location) {
            return Ok(());
        }
        let (Some(at), Some(main)) = (source_map.expansion_loc(begin), source_map.main_file()) else {
            return Ok(());
        };
        // a declaration named in the main file can still begin in a header
        if at.file != main {
            return Ok(());
        }
        let Some(path) = source_map.file_path(at.file) else {
            return Ok(());
        };

        if edits.insert(Edit::insertion(path, at.offset, text))? == InsertOutcome::Duplicate {
            trace!(file = %path.display(), offset = at.offset, "duplicate annotation skipped");
        }
        Ok(())
    }
}

impl MatchCallback for DeclHandler {
    fn run(&self, result: &MatchResult<'_>, edits: &mut EditSet) -> Result<(), EditError> {
        let source_map = result.source_map;

        if let Some(record) = result.nodes.get_node_as::<RecordDecl>(RECORD_BINDING) {
            info!("Found a decl: {}", record.qualified_name());
            self.annotate(
                source_map,
                edits,
                record.location(),
                record.begin_loc(),
                annotation(RECORD_LABEL, record.qualified_name()),
            )?;
        }

        if let Some(field) = result.nodes.get_node_as::<FieldDecl>(FIELD_BINDING) {
            let location = field.location();
            match source_map.presumed_loc(location) {
                Some(presumed) => debug!(
                    field = field.qualified_name(),
                    in_main_file = source_map.is_in_main_file(location),
                    written_in_main_file = source_map.is_written_in_main_file(location),
                    file = %presumed.file.display(),
                    line = presumed.line,
                    column = presumed.column,
                    "field"
                ),
                None => debug!(field = field.qualified_name(), "field without a valid location"),
            }
            self.annotate(
                source_map,
                edits,
                location,
                field.begin_loc(),
                annotation(FIELD_LABEL, field.qualified_name()),
            )?;
        }

        Ok(())
    }
}
