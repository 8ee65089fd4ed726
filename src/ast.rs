//! Closed syntax model produced by the front end.
//!
//! Nodes live in a per-translation-unit arena and are only reachable through
//! [`NodeRef`] handles borrowed from the [`TranslationUnit`]. Typed views
//! ([`RecordDecl`], [`FieldDecl`], [`NamespaceDecl`]) are obtained with
//! [`FromNode`], which fails for nodes of another kind.

use crate::source::{SourceLocation, SourceMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

/// Keyword a record was introduced with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagKind {
    Struct,
    Class,
    Union,
}

impl TagKind {
    pub fn from_node_kind(kind: &str) -> Option<Self> {
        match kind {
            "struct_specifier" => Some(TagKind::Struct),
            "class_specifier" => Some(TagKind::Class),
            "union_specifier" => Some(TagKind::Union),
            _ => None,
        }
    }

    pub fn keyword(self) -> &'static str {
        match self {
            TagKind::Struct => "struct",
            TagKind::Class => "class",
            TagKind::Union => "union",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    TranslationUnit,
    Namespace,
    Record { tag: TagKind, is_definition: bool },
    Field,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    /// Simple name; `None` for anonymous namespaces and records.
    pub name: Option<String>,
    pub qualified_name: String,
    /// Where the declaration is named (name token, or tag keyword if anonymous).
    pub location: SourceLocation,
    /// First token of the declaration.
    pub begin: SourceLocation,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl Node {
    pub fn new(
        kind: NodeKind,
        name: Option<String>,
        qualified_name: impl Into<String>,
        location: SourceLocation,
        begin: SourceLocation,
    ) -> Self {
        Self {
            kind,
            name,
            qualified_name: qualified_name.into(),
            location,
            begin,
            parent: None,
            children: Vec::new(),
        }
    }
}

/// One parsed translation unit: its source map and declaration tree.
#[derive(Debug, Clone)]
pub struct TranslationUnit {
    source_map: SourceMap,
    nodes: Vec<Node>,
}

impl TranslationUnit {
    /// Create an empty unit whose root is the translation unit node.
    pub fn new(source_map: SourceMap) -> Self {
        let root = Node::new(
            NodeKind::TranslationUnit,
            None,
            "",
            SourceLocation::Invalid,
            SourceLocation::Invalid,
        );
        Self {
            source_map,
            nodes: vec![root],
        }
    }

    pub fn root_id(&self) -> NodeId {
        NodeId(0)
    }

    pub fn root(&self) -> NodeRef<'_> {
        self.node(self.root_id())
    }

    pub fn node(&self, id: NodeId) -> NodeRef<'_> {
        NodeRef { tu: self, id }
    }

    pub fn source_map(&self) -> &SourceMap {
        &self.source_map
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Append `node` as the last child of `parent`.
    pub fn push_child(&mut self, parent: NodeId, mut node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Every node except the root, in document (pre-order) order.
    pub fn decls(&self) -> Descendants<'_> {
        self.root().descendants()
    }
}

/// Borrowed handle to a node in a [`TranslationUnit`].
#[derive(Clone, Copy)]
pub struct NodeRef<'a> {
    tu: &'a TranslationUnit,
    id: NodeId,
}

impl<'a> NodeRef<'a> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn data(&self) -> &'a Node {
        &self.tu.nodes[self.id.0]
    }

    pub fn kind(&self) -> NodeKind {
        self.data().kind
    }

    pub fn name(&self) -> Option<&'a str> {
        self.data().name.as_deref()
    }

    pub fn qualified_name(&self) -> &'a str {
        &self.data().qualified_name
    }

    pub fn location(&self) -> SourceLocation {
        self.data().location
    }

    pub fn begin_loc(&self) -> SourceLocation {
        self.data().begin
    }

    pub fn parent(&self) -> Option<NodeRef<'a>> {
        self.data().parent.map(|id| self.tu.node(id))
    }

    pub fn children(&self) -> impl Iterator<Item = NodeRef<'a>> + 'a {
        let tu = self.tu;
        self.data().children.iter().map(move |&id| tu.node(id))
    }

    /// Strict descendants in pre-order.
    pub fn descendants(&self) -> Descendants<'a> {
        let mut stack: Vec<NodeId> = self.data().children.clone();
        stack.reverse();
        Descendants { tu: self.tu, stack }
    }

    pub fn translation_unit(&self) -> &'a TranslationUnit {
        self.tu
    }
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("qualified_name", &self.qualified_name())
            .finish()
    }
}

impl PartialEq for NodeRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.tu, other.tu) && self.id == other.id
    }
}

pub struct Descendants<'a> {
    tu: &'a TranslationUnit,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        let node = self.tu.node(id);
        self.stack
            .extend(node.data().children.iter().rev().copied());
        Some(node)
    }
}

/// Typed view over a [`NodeRef`].
pub trait FromNode<'a>: Sized {
    fn from_node(node: NodeRef<'a>) -> Option<Self>;
}

impl<'a> FromNode<'a> for NodeRef<'a> {
    fn from_node(node: NodeRef<'a>) -> Option<Self> {
        Some(node)
    }
}

macro_rules! decl_view {
    ($(#[$doc:meta])* $name:ident, $pattern:pat) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct $name<'a>(NodeRef<'a>);

        impl<'a> $name<'a> {
            pub fn node(&self) -> NodeRef<'a> {
                self.0
            }

            pub fn name(&self) -> Option<&'a str> {
                self.0.name()
            }

            pub fn qualified_name(&self) -> &'a str {
                self.0.qualified_name()
            }

            pub fn location(&self) -> SourceLocation {
                self.0.location()
            }

            pub fn begin_loc(&self) -> SourceLocation {
                self.0.begin_loc()
            }
        }

        impl<'a> FromNode<'a> for $name<'a> {
            fn from_node(node: NodeRef<'a>) -> Option<Self> {
                matches!(node.kind(), $pattern).then_some($name(node))
            }
        }
    };
}

decl_view!(
    /// A struct, class or union declaration.
    RecordDecl,
    NodeKind::Record { .. }
);
decl_view!(
    /// A non-static data member.
    FieldDecl,
    NodeKind::Field
);
decl_view!(NamespaceDecl, NodeKind::Namespace);

impl<'a> RecordDecl<'a> {
    pub fn tag_kind(&self) -> TagKind {
        match self.0.kind() {
            NodeKind::Record { tag, .. } => tag,
            _ => unreachable!("RecordDecl always wraps a record node"),
        }
    }

    pub fn is_definition(&self) -> bool {
        matches!(
            self.0.kind(),
            NodeKind::Record {
                is_definition: true,
                ..
            }
        )
    }

    /// Fields declared directly in this record.
    pub fn fields(&self) -> impl Iterator<Item = FieldDecl<'a>> + 'a {
        self.0.children().filter_map(FieldDecl::from_node)
    }
}

impl<'a> FieldDecl<'a> {
    /// The record this field belongs to.
    pub fn parent_record(&self) -> Option<RecordDecl<'a>> {
        self.0.parent().and_then(RecordDecl::from_node)
    }
}
