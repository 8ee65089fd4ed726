//! Lowering of the tree-sitter tree into the declaration model.

use crate::ast::{Node, NodeId, NodeKind, TagKind, TranslationUnit};
use crate::frontend::parser::ParsedSource;
use crate::frontend::preprocess::Preprocessed;
use crate::source::{SourceLocation, SourceMap};
use tree_sitter::Node as TsNode;

/// Build a [`TranslationUnit`] from a parse of `buffer.text`.
///
/// Records (struct, class and union, definitions and forward
/// declarations), their non-static data members and namespaces become
/// nodes. Everything else is walked through for nested declarations.
pub fn lower(parsed: &ParsedSource<'_>, buffer: &Preprocessed, source_map: SourceMap) -> TranslationUnit {
    let mut lowering = Lowering {
        parsed,
        buffer,
        unit: TranslationUnit::new(source_map),
        scope: Vec::new(),
    };
    let root = lowering.unit.root_id();
    lowering.visit_children(parsed.root_node(), root);
    lowering.unit
}

struct Lowering<'p, 's> {
    parsed: &'p ParsedSource<'s>,
    buffer: &'p Preprocessed,
    unit: TranslationUnit,
    /// Enclosing named scopes, outermost first.
    scope: Vec<String>,
}

impl Lowering<'_, '_> {
    fn loc(&self, node: TsNode<'_>) -> SourceLocation {
        self.buffer.location_at(node.start_byte())
    }

    fn text(&self, node: TsNode<'_>) -> String {
        self.parsed
            .node_text(node)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn qualify(&self, name: &str) -> String {
        if self.scope.is_empty() {
            name.to_string()
        } else {
            format!("{}::{}", self.scope.join("::"), name)
        }
    }

    fn visit_children(&mut self, node: TsNode<'_>, parent: NodeId) {
        let mut cursor = node.walk();
        let children: Vec<_> = node.named_children(&mut cursor).collect();
        for child in children {
            self.visit(child, parent);
        }
    }

    fn visit(&mut self, node: TsNode<'_>, parent: NodeId) {
        match node.kind() {
            "namespace_definition" => self.visit_namespace(node, parent),
            "function_definition" => self.visit_function(node, parent),
            kind if TagKind::from_node_kind(kind).is_some() => self.visit_record(node, parent),
            "field_declaration" if self.is_record(parent) => self.visit_field_declaration(node, parent),
            _ => self.visit_children(node, parent),
        }
    }

    fn is_record(&self, id: NodeId) -> bool {
        matches!(self.unit.node(id).kind(), NodeKind::Record { .. })
    }

    fn visit_namespace(&mut self, node: TsNode<'_>, parent: NodeId) {
        let name_node = node.child_by_field_name("name");
        // `namespace a::b` keeps its written name as one scope
        let name = name_node.map(|n| self.text(n).replace(' ', ""));
        let display = name
            .clone()
            .unwrap_or_else(|| "(anonymous namespace)".to_string());

        let decl = Node::new(
            NodeKind::Namespace,
            name,
            self.qualify(&display),
            self.loc(name_node.unwrap_or(node)),
            self.loc(node),
        );
        let id = self.unit.push_child(parent, decl);

        if let Some(body) = node.child_by_field_name("body") {
            self.scope.push(display);
            self.visit_children(body, id);
            self.scope.pop();
        }
    }

    /// Declarations inside a function body are scoped by the function's
    /// name and parameter types, as in `f(int)::Local`.
    fn visit_function(&mut self, node: TsNode<'_>, parent: NodeId) {
        let scope = node
            .child_by_field_name("declarator")
            .and_then(function_declarator)
            .and_then(|declarator| self.function_scope(declarator));
        let body = node.child_by_field_name("body");

        let mut cursor = node.walk();
        let children: Vec<_> = node.named_children(&mut cursor).collect();
        for child in children {
            match (&scope, body) {
                (Some(scope), Some(body)) if child.id() == body.id() => {
                    self.scope.push(scope.clone());
                    self.visit(child, parent);
                    self.scope.pop();
                }
                _ => self.visit(child, parent),
            }
        }
    }

    fn function_scope(&self, declarator: TsNode<'_>) -> Option<String> {
        let name = self
            .text(declarator.child_by_field_name("declarator")?)
            .replace(" ::", "::")
            .replace(":: ", "::");

        let mut params = Vec::new();
        if let Some(list) = declarator.child_by_field_name("parameters") {
            let mut cursor = list.walk();
            for param in list.named_children(&mut cursor) {
                match param.kind() {
                    "variadic_parameter" => params.push("...".to_string()),
                    "comment" => {}
                    _ => params.extend(self.parameter_type(param)),
                }
            }
        }
        // `f(void)` declares no parameters
        if params.len() == 1 && params[0] == "void" {
            params.clear();
        }

        Some(format!("{name}({})", params.join(", ")))
    }

    /// A parameter's type without its name: `const char *s` gives
    /// `const char *`. Arrays decay to pointers.
    fn parameter_type(&self, param: TsNode<'_>) -> Option<String> {
        let ty = param.child_by_field_name("type")?;
        let mut cursor = param.walk();
        let mut parts: Vec<String> = param
            .children(&mut cursor)
            .filter(|child| child.kind() == "type_qualifier")
            .map(|child| self.text(child))
            .collect();
        parts.push(self.text(ty));
        let base = parts.join(" ");

        let mut suffix = String::new();
        let mut current = param.child_by_field_name("declarator");
        while let Some(node) = current {
            match node.kind() {
                "pointer_declarator" | "abstract_pointer_declarator" | "array_declarator"
                | "abstract_array_declarator" => suffix.push('*'),
                "reference_declarator" | "abstract_reference_declarator" => {
                    suffix.push_str(node.child(0).map_or("&", |token| token.kind()));
                }
                "function_declarator"
                | "abstract_function_declarator"
                | "parenthesized_declarator"
                | "abstract_parenthesized_declarator" => {
                    // function pointers keep their written form
                    return Some(self.text(param));
                }
                _ => break,
            }
            current = node
                .child_by_field_name("declarator")
                .or_else(|| first_declarator_child(node));
        }

        Some(if suffix.is_empty() {
            base
        } else {
            format!("{base} {suffix}")
        })
    }

    fn visit_record(&mut self, node: TsNode<'_>, parent: NodeId) {
        let Some(tag) = TagKind::from_node_kind(node.kind()) else {
            return;
        };
        let body = node.child_by_field_name("body");
        if body.is_none() && !is_forward_declaration(node) {
            // elaborated type specifier such as `struct Foo *p`
            return;
        }

        let name_node = node.child_by_field_name("name");
        let name = name_node.map(|n| self.text(n));
        let display = name.clone().unwrap_or_else(|| format!("(anonymous {tag})"));

        let decl = Node::new(
            NodeKind::Record {
                tag,
                is_definition: body.is_some(),
            },
            name,
            self.qualify(&display),
            self.loc(name_node.unwrap_or(node)),
            self.loc(node),
        );
        let id = self.unit.push_child(parent, decl);

        if let Some(body) = body {
            self.scope.push(display);
            self.visit_children(body, id);
            self.scope.pop();
        }
    }

    /// One declaration statement inside a record body may declare several
    /// fields (`int x, y;`); they share the statement's begin location.
    fn visit_field_declaration(&mut self, node: TsNode<'_>, record: NodeId) {
        // records defined in the member's type precede the member itself
        if let Some(ty) = node.child_by_field_name("type") {
            self.visit(ty, record);
        }
        if is_static(node) {
            return;
        }

        let begin = self.loc(node);
        let mut cursor = node.walk();
        let declarators: Vec<_> = node.children_by_field_name("declarator", &mut cursor).collect();
        for declarator in declarators {
            let Some(name_node) = field_name(declarator) else {
                continue;
            };
            let name = self.text(name_node);
            let decl = Node::new(
                NodeKind::Field,
                Some(name.clone()),
                self.qualify(&name),
                self.loc(name_node),
                begin,
            );
            self.unit.push_child(record, decl);
        }
    }
}

/// A record specifier without a body that declares the tag on its own:
/// `struct Foo;` at namespace or class scope.
fn is_forward_declaration(node: TsNode<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return false;
    };
    match parent.kind() {
        "translation_unit" | "declaration_list" | "field_declaration_list" | "template_declaration" => true,
        "declaration" | "field_declaration" => parent.child_by_field_name("declarator").is_none(),
        _ => false,
    }
}

fn is_static(node: TsNode<'_>) -> bool {
    let mut cursor = node.walk();
    let found = node
        .children(&mut cursor)
        .any(|child| child.kind() == "storage_class_specifier" && child.child(0).is_some_and(|kw| kw.kind() == "static"));
    found
}

/// The name declared by a member declarator, or `None` if it declares a
/// member function or has no plain field name.
///
/// Whether a declarator declares a function is decided by the operator
/// closest to the name: `int *f()` is a function, `int (*f)()` is a
/// pointer.
fn field_name(declarator: TsNode<'_>) -> Option<TsNode<'_>> {
    let mut current = declarator;
    let mut innermost = None;
    loop {
        match current.kind() {
            "field_identifier" => {
                return (innermost != Some("function_declarator")).then_some(current);
            }
            "parenthesized_declarator" | "attributed_declarator" => {
                current = current.named_child(0)?;
            }
            kind @ ("function_declarator" | "pointer_declarator" | "array_declarator" | "reference_declarator") => {
                innermost = Some(kind);
                current = match current.child_by_field_name("declarator") {
                    Some(inner) => inner,
                    None => first_declarator_child(current)?,
                };
            }
            _ => return None,
        }
    }
}

/// The function declarator under a definition's declarator, looking
/// through the pointers and references of its return type.
fn function_declarator(declarator: TsNode<'_>) -> Option<TsNode<'_>> {
    let mut current = declarator;
    loop {
        match current.kind() {
            "function_declarator" => return Some(current),
            "pointer_declarator" | "reference_declarator" | "parenthesized_declarator"
            | "attributed_declarator" => {
                current = match current.child_by_field_name("declarator") {
                    Some(inner) => inner,
                    None => first_declarator_child(current)?,
                };
            }
            _ => return None,
        }
    }
}

fn first_declarator_child(node: TsNode<'_>) -> Option<TsNode<'_>> {
    let mut cursor = node.walk();
    let found = node
        .named_children(&mut cursor)
        .find(|child| child.kind().ends_with("declarator") || child.kind() == "field_identifier");
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::compile_db::CompileOptions;
    use crate::frontend::parser::CppParser;
    use crate::frontend::preprocess::preprocess;
    use std::path::Path;
    use std::sync::Arc;

    fn lower_source(src: &str) -> TranslationUnit {
        let (map, buffer) =
            preprocess(Path::new("main.cpp"), Arc::from(src), &CompileOptions::default()).unwrap();
        let mut parser = CppParser::new().unwrap();
        let parsed = parser.parse_with_source(&buffer.text).unwrap();
        assert!(!parsed.has_errors(), "unexpected parse errors in {src:?}");
        lower(&parsed, &buffer, map)
    }

    fn names(unit: &TranslationUnit) -> Vec<(String, &'static str)> {
        unit.decls()
            .map(|n| {
                let kind = match n.kind() {
                    NodeKind::Record { is_definition: true, .. } => "record",
                    NodeKind::Record { .. } => "forward",
                    NodeKind::Field => "field",
                    NodeKind::Namespace => "namespace",
                    NodeKind::TranslationUnit => "tu",
                };
                (n.qualified_name().to_string(), kind)
            })
            .collect()
    }

    fn owned(list: &[(&str, &'static str)]) -> Vec<(String, &'static str)> {
        list.iter().map(|(n, k)| (n.to_string(), *k)).collect()
    }

    #[test]
    fn records_fields_and_namespaces() {
        let unit = lower_source("namespace ns { struct Foo { int x; }; }\n");
        assert_eq!(
            names(&unit),
            owned(&[("ns", "namespace"), ("ns::Foo", "record"), ("ns::Foo::x", "field")])
        );
    }

    #[test]
    fn begin_and_name_locations() {
        let src = "struct Foo { int x; };";
        let unit = lower_source(src);
        let map = unit.source_map();
        let decls: Vec<_> = unit.decls().collect();

        let offset = |loc| map.expansion_loc(loc).unwrap().offset;
        assert_eq!(offset(decls[0].begin_loc()), 0);
        assert_eq!(offset(decls[0].location()), 7);
        assert_eq!(offset(decls[1].begin_loc()), 13);
        assert_eq!(offset(decls[1].location()), 17);
    }

    #[test]
    fn multi_declarator_fields_share_begin() {
        let unit = lower_source("struct P { int x, *y, z[3]; };");
        let fields: Vec<_> = unit
            .decls()
            .filter(|n| n.kind() == NodeKind::Field)
            .collect();
        let names: Vec<_> = fields.iter().map(|f| f.name().unwrap()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
        assert!(fields.iter().all(|f| f.begin_loc() == fields[0].begin_loc()));
    }

    #[test]
    fn methods_statics_and_function_pointers() {
        let src = "\
class C {
public:
    int get() const;
    int* make();
    static int count;
    int (*callback)(int);
    C();
    ~C();
    int value;
};";
        let unit = lower_source(src);
        assert_eq!(
            names(&unit),
            owned(&[("C", "record"), ("C::callback", "field"), ("C::value", "field")])
        );
    }

    #[test]
    fn nested_and_anonymous_records() {
        let src = "struct Outer { struct Inner { int a; } inner; union { int i; float f; }; };";
        let unit = lower_source(src);
        assert_eq!(
            names(&unit),
            owned(&[
                ("Outer", "record"),
                ("Outer::Inner", "record"),
                ("Outer::Inner::a", "field"),
                ("Outer::inner", "field"),
                ("Outer::(anonymous union)", "record"),
                ("Outer::(anonymous union)::i", "field"),
                ("Outer::(anonymous union)::f", "field"),
            ])
        );
    }

    #[test]
    fn forward_declarations_and_elaborated_types() {
        let src = "struct Fwd;\nstruct User { struct Fwd* p; };\nnamespace { class Hidden; }\n";
        let unit = lower_source(src);
        assert_eq!(
            names(&unit),
            owned(&[
                ("Fwd", "forward"),
                ("User", "record"),
                ("User::p", "field"),
                ("(anonymous namespace)", "namespace"),
                ("(anonymous namespace)::Hidden", "forward"),
            ])
        );
    }

    #[test]
    fn local_classes_are_qualified_by_function() {
        let unit = lower_source("void f() { struct Local { int v; }; }\n");
        assert_eq!(
            names(&unit),
            owned(&[("f()::Local", "record"), ("f()::Local::v", "field")])
        );
    }

    #[test]
    fn function_scopes_list_parameter_types() {
        let src = "namespace n {\nint g(const char *s, int &r, char **argv, int a[], ...) { class L {}; return 0; }\n}\n";
        let unit = lower_source(src);
        assert_eq!(
            names(&unit),
            owned(&[
                ("n", "namespace"),
                ("n::g(const char *, int &, char **, int *, ...)::L", "record"),
            ])
        );

        let unit = lower_source("static int *h(void) { union U { int i; }; return 0; }\n");
        assert_eq!(
            names(&unit),
            owned(&[("h()::U", "record"), ("h()::U::i", "field")])
        );
    }

    #[test]
    fn method_bodies_are_scoped_by_class_and_method() {
        let src = "struct A {\n    void m(int) { struct In { int v; }; }\n    void out();\n};\nvoid A::out() { struct Q {}; }\n";
        let unit = lower_source(src);
        assert_eq!(
            names(&unit),
            owned(&[
                ("A", "record"),
                ("A::m(int)::In", "record"),
                ("A::m(int)::In::v", "field"),
                ("A::out()::Q", "record"),
            ])
        );
    }

    #[test]
    fn templates_and_linkage_blocks() {
        let src = "extern \"C\" { struct CApi { int fd; }; }\ntemplate <typename T> struct Box { T item; };\n";
        let unit = lower_source(src);
        assert_eq!(
            names(&unit),
            owned(&[
                ("CApi", "record"),
                ("CApi::fd", "field"),
                ("Box", "record"),
                ("Box::item", "field"),
            ])
        );
    }

    #[test]
    fn nested_namespace_definition() {
        let unit = lower_source("namespace a::b { struct S {}; }\n");
        assert_eq!(
            names(&unit),
            owned(&[("a::b", "namespace"), ("a::b::S", "record")])
        );
    }
}
