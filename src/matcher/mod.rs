//! Declarative matchers over the declaration model.
//!
//! Matchers are plain values built from small combinators and evaluated
//! against one node at a time. A successful match yields the nodes captured
//! by [`DeclMatcher::bind`] under their names.
//!
//! ```
//! use decl_annotate::matcher::{field_decl, record_decl};
//!
//! // records that contain at least one field, captured as "record"
//! let matcher = record_decl().has_descendant(field_decl()).bind("record");
//! # let _ = matcher;
//! ```

pub mod finder;

pub use finder::{MatchCallback, MatchFinder, MatchResult};

use crate::ast::{FromNode, NodeKind, NodeRef, TranslationUnit};
use std::collections::HashMap;

/// Node kinds a matcher can select on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Record,
    Field,
    Namespace,
}

impl DeclKind {
    fn accepts(self, kind: NodeKind) -> bool {
        matches!(
            (self, kind),
            (DeclKind::Record, NodeKind::Record { .. })
                | (DeclKind::Field, NodeKind::Field)
                | (DeclKind::Namespace, NodeKind::Namespace)
        )
    }
}

/// A composable predicate over declaration nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclMatcher {
    Kind(DeclKind),
    AllOf(Vec<DeclMatcher>),
    AnyOf(Vec<DeclMatcher>),
    Unless(Box<DeclMatcher>),
    HasDescendant(Box<DeclMatcher>),
    /// Simple name, or qualified name when it contains `::`.
    HasName(String),
    Bind(String, Box<DeclMatcher>),
}

pub fn record_decl() -> DeclMatcher {
    DeclMatcher::Kind(DeclKind::Record)
}

pub fn field_decl() -> DeclMatcher {
    DeclMatcher::Kind(DeclKind::Field)
}

pub fn namespace_decl() -> DeclMatcher {
    DeclMatcher::Kind(DeclKind::Namespace)
}

pub fn has_name(name: impl Into<String>) -> DeclMatcher {
    DeclMatcher::HasName(name.into())
}

pub fn has_descendant(inner: DeclMatcher) -> DeclMatcher {
    DeclMatcher::HasDescendant(Box::new(inner))
}

pub fn all_of(matchers: impl IntoIterator<Item = DeclMatcher>) -> DeclMatcher {
    DeclMatcher::AllOf(matchers.into_iter().collect())
}

pub fn any_of(matchers: impl IntoIterator<Item = DeclMatcher>) -> DeclMatcher {
    DeclMatcher::AnyOf(matchers.into_iter().collect())
}

pub fn unless(inner: DeclMatcher) -> DeclMatcher {
    DeclMatcher::Unless(Box::new(inner))
}

impl DeclMatcher {
    /// Capture the node matched by `self` under `name`.
    pub fn bind(self, name: impl Into<String>) -> DeclMatcher {
        DeclMatcher::Bind(name.into(), Box::new(self))
    }

    /// Conjunction with `other`, flattening nested `AllOf`s.
    pub fn and(self, other: DeclMatcher) -> DeclMatcher {
        match self {
            DeclMatcher::AllOf(mut matchers) => {
                matchers.push(other);
                DeclMatcher::AllOf(matchers)
            }
            first => DeclMatcher::AllOf(vec![first, other]),
        }
    }

    pub fn has_descendant(self, inner: DeclMatcher) -> DeclMatcher {
        self.and(has_descendant(inner))
    }

    pub fn has_name(self, name: impl Into<String>) -> DeclMatcher {
        self.and(has_name(name))
    }

    /// Evaluate against `node`, returning the captures on success.
    pub fn matches<'a>(&self, node: NodeRef<'a>) -> Option<BoundNodes<'a>> {
        let mut bound = BoundNodes::default();
        self.matches_into(node, &mut bound).then_some(bound)
    }

    /// Every node of `unit` that matches, in pre-order.
    pub fn find_all<'a>(&self, unit: &'a TranslationUnit) -> Vec<BoundNodes<'a>> {
        unit.decls().filter_map(|node| self.matches(node)).collect()
    }

    fn matches_into<'a>(&self, node: NodeRef<'a>, bound: &mut BoundNodes<'a>) -> bool {
        match self {
            DeclMatcher::Kind(kind) => kind.accepts(node.kind()),
            DeclMatcher::AllOf(matchers) => {
                let mut scratch = bound.clone();
                let all = matchers.iter().all(|m| m.matches_into(node, &mut scratch));
                if all {
                    *bound = scratch;
                }
                all
            }
            DeclMatcher::AnyOf(matchers) => matchers.iter().any(|m| {
                let mut scratch = bound.clone();
                let found = m.matches_into(node, &mut scratch);
                if found {
                    *bound = scratch;
                }
                found
            }),
            DeclMatcher::Unless(inner) => inner.matches(node).is_none(),
            DeclMatcher::HasDescendant(inner) => node.descendants().any(|descendant| {
                let mut scratch = bound.clone();
                let found = inner.matches_into(descendant, &mut scratch);
                if found {
                    *bound = scratch;
                }
                found
            }),
            DeclMatcher::HasName(name) => name_matches(node, name),
            DeclMatcher::Bind(name, inner) => {
                let found = inner.matches_into(node, bound);
                if found {
                    bound.nodes.insert(name.clone(), node);
                }
                found
            }
        }
    }
}

fn name_matches(node: NodeRef<'_>, name: &str) -> bool {
    if name.contains("::") {
        node.qualified_name() == name.trim_start_matches("::")
    } else {
        node.name() == Some(name)
    }
}

/// Nodes captured by one successful match.
#[derive(Debug, Clone, Default)]
pub struct BoundNodes<'a> {
    nodes: HashMap<String, NodeRef<'a>>,
}

impl<'a> BoundNodes<'a> {
    pub fn get(&self, name: &str) -> Option<NodeRef<'a>> {
        self.nodes.get(name).copied()
    }

    /// The capture `name` as a typed view; `None` if unbound or of another
    /// kind.
    pub fn get_node_as<T: FromNode<'a>>(&self, name: &str) -> Option<T> {
        self.get(name).and_then(T::from_node)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
