//! Statement tree produced by [`crate::parser`].
//!
//! The tree is a closed set of node kinds. Everything the lineage passes do
//! not care about is lowered to [`Node::Expr`], which keeps the canonical
//! rendered SQL text and whatever sub-expressions may still hold columns.

use std::fmt;

/// One node of a lowered SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// `CREATE TABLE name [(cols)] [AS SELECT ...]`
    Create {
        name: Option<String>,
        columns: Vec<String>,
        query: Option<Box<Node>>,
    },
    /// `INSERT INTO target [(cols)] SELECT ...`
    Insert {
        target: Option<String>,
        columns: Vec<String>,
        source: Option<Box<Node>>,
    },
    /// `CREATE VIEW name [(cols)] AS SELECT ...`
    View {
        name: Option<String>,
        columns: Vec<String>,
        query: Box<Node>,
    },
    Select(SelectNode),
    Table {
        name: String,
        alias: Option<String>,
    },
    Column {
        table: Option<String>,
        name: String,
    },
    Star {
        qualifier: Option<String>,
    },
    Alias {
        alias: String,
        child: Box<Node>,
    },
    /// Any other expression or statement, with its canonical SQL text.
    Expr {
        text: String,
        children: Vec<Node>,
    },
}

/// Kind tag of a [`Node`], handy for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Create,
    Insert,
    View,
    Select,
    Table,
    Column,
    Star,
    Alias,
    GenericExpression,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectNode {
    /// CTE bodies, each an [`Node::Alias`] named after the CTE.
    pub with: Vec<Node>,
    pub projection: Vec<Node>,
    /// Relations in FROM / JOIN order: [`Node::Table`], or [`Node::Alias`]
    /// / [`Node::Select`] for derived tables.
    pub from: Vec<Node>,
    /// WHERE, GROUP BY and HAVING expressions.
    pub predicates: Vec<Node>,
    /// Remaining arms of UNION / INTERSECT / EXCEPT, in source order.
    pub set_branches: Vec<SelectNode>,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Create { .. } => NodeKind::Create,
            Node::Insert { .. } => NodeKind::Insert,
            Node::View { .. } => NodeKind::View,
            Node::Select(_) => NodeKind::Select,
            Node::Table { .. } => NodeKind::Table,
            Node::Column { .. } => NodeKind::Column,
            Node::Star { .. } => NodeKind::Star,
            Node::Alias { .. } => NodeKind::Alias,
            Node::Expr { .. } => NodeKind::GenericExpression,
        }
    }

    /// Direct children in source order.
    pub fn children(&self) -> Vec<&Node> {
        match self {
            Node::Create { query, .. } => query.iter().map(|q| q.as_ref()).collect(),
            Node::Insert { source, .. } => source.iter().map(|s| s.as_ref()).collect(),
            Node::View { query, .. } => vec![query.as_ref()],
            Node::Select(select) => select.children(),
            Node::Alias { child, .. } => vec![child.as_ref()],
            Node::Expr { children, .. } => children.iter().collect(),
            Node::Table { .. } | Node::Column { .. } | Node::Star { .. } => Vec::new(),
        }
    }

    /// Pre-order traversal of this node and every descendant.
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }

    /// The identifier a definitional node writes to, if any.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            Node::Create { name, .. } | Node::View { name, .. } => name.as_deref(),
            Node::Insert { target, .. } => target.as_deref(),
            _ => None,
        }
    }
}

impl SelectNode {
    pub fn children(&self) -> Vec<&Node> {
        let mut out: Vec<&Node> = Vec::new();
        out.extend(self.with.iter());
        out.extend(self.projection.iter());
        out.extend(self.from.iter());
        out.extend(self.predicates.iter());
        for branch in &self.set_branches {
            out.extend(branch.children());
        }
        out
    }
}

pub struct Walk<'a> {
    stack: Vec<&'a Node>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        // push in reverse so the leftmost child is visited first
        self.stack.extend(node.children().into_iter().rev());
        Some(node)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Column {
                table: Some(t),
                name,
            } => write!(f, "{}.{}", t, name),
            Node::Column { table: None, name } => write!(f, "{}", name),
            Node::Star { qualifier: Some(q) } => write!(f, "{}.*", q),
            Node::Star { qualifier: None } => write!(f, "*"),
            Node::Alias { alias, child } => write!(f, "{} AS {}", child, alias),
            Node::Expr { text, .. } => write!(f, "{}", text),
            Node::Table {
                name,
                alias: Some(a),
            } => write!(f, "{} {}", name, a),
            Node::Table { name, alias: None } => write!(f, "{}", name),
            other => write!(f, "<{:?}>", other.kind()),
        }
    }
}
