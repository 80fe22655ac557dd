//! Locate definitional constructs (CTAS, CREATE VIEW, INSERT ... SELECT).

use crate::ast::Node;

/// A statement that defines one named output from a SELECT body.
#[derive(Debug, Clone, PartialEq)]
pub struct LineageConstruct<'a> {
    /// Table or view written to; `None` when the name could not be read.
    pub target: Option<String>,
    /// Explicit target column list (`CREATE VIEW v (a, b)`,
    /// `INSERT INTO t (a, b)`), empty when absent.
    pub columns: Vec<String>,
    pub select: &'a Node,
}

/// Every construct anywhere in `ast`, in pre-order.
///
/// Constructs nested inside another construct's body are reported on their
/// own as well; overlapping results are expected.
pub fn extract_definitions(ast: &Node) -> Vec<LineageConstruct<'_>> {
    let mut out = Vec::new();
    for node in ast.walk() {
        match node {
            Node::Create {
                name,
                query: Some(query),
                ..
            } => out.push(LineageConstruct {
                target: name.clone(),
                columns: Vec::new(),
                select: query,
            }),
            Node::View {
                name,
                columns,
                query,
            } => out.push(LineageConstruct {
                target: name.clone(),
                columns: columns.clone(),
                select: query,
            }),
            Node::Insert {
                target,
                columns,
                source: Some(source),
            } => out.push(LineageConstruct {
                target: target.clone(),
                columns: columns.clone(),
                select: source,
            }),
            _ => {}
        }
    }
    out
}
