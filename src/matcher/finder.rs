use crate::ast::TranslationUnit;
use crate::edit::{EditError, EditSet};
use crate::matcher::{BoundNodes, DeclMatcher};
use crate::source::SourceMap;

/// One successful match handed to a [`MatchCallback`].
#[derive(Debug, Clone)]
pub struct MatchResult<'a> {
    pub nodes: BoundNodes<'a>,
    pub source_map: &'a SourceMap,
}

/// Reacts to matches by recording edits.
///
/// Callbacks hold no per-run state; everything they produce goes into the
/// [`EditSet`] lent to them.
pub trait MatchCallback {
    fn run(&self, result: &MatchResult<'_>, edits: &mut EditSet) -> Result<(), EditError>;
}

/// Drives registered matchers over a translation unit.
///
/// Nodes are visited in pre-order; for each node the matchers fire in the
/// order they were added, so a node matching several of them is reported
/// once per matcher.
#[derive(Default)]
pub struct MatchFinder<'c> {
    matchers: Vec<(DeclMatcher, &'c dyn MatchCallback)>,
}

impl<'c> MatchFinder<'c> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_matcher(&mut self, matcher: DeclMatcher, callback: &'c dyn MatchCallback) {
        self.matchers.push((matcher, callback));
    }

    pub fn len(&self) -> usize {
        self.matchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Run every matcher over `unit`. Returns the number of matches.
    pub fn match_ast(&self, unit: &TranslationUnit, edits: &mut EditSet) -> Result<usize, EditError> {
        let source_map = unit.source_map();
        let mut count = 0;
        for node in unit.decls() {
            for (matcher, callback) in &self.matchers {
                let Some(nodes) = matcher.matches(node) else {
                    continue;
                };
                count += 1;
                callback.run(&MatchResult { nodes, source_map }, edits)?;
            }
        }
        tracing::debug!(matches = count, nodes = unit.len() - 1, "matching finished");
        Ok(count)
    }
}
