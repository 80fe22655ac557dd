//! Map each output column of a SELECT to the input columns it derives from.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ast::{Node, SelectNode};

/// Marker for a wildcard whose columns could not be listed.
pub const UNRESOLVED_WILDCARD: &str = "*";

/// Known table schemas: table name -> columns in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Catalog {
    tables: BTreeMap<String, Vec<String>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, S>(&mut self, table: impl Into<String>, columns: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables
            .insert(table.into(), columns.into_iter().map(Into::into).collect());
    }

    /// Columns of `table`; exact match first, then the first name in sorted
    /// order that matches ASCII case-insensitively.
    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.tables
            .get(table)
            .or_else(|| {
                self.tables
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(table))
                    .map(|(_, cols)| cols)
            })
            .map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Record the schema of a `CREATE TABLE t (c1, c2, ...)` statement.
    /// Returns whether anything was learned.
    pub fn record_ddl(&mut self, stmt: &Node) -> bool {
        match stmt {
            Node::Create {
                name: Some(name),
                columns,
                ..
            } if !columns.is_empty() => {
                self.tables.insert(name.clone(), columns.clone());
                true
            }
            _ => false,
        }
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("Failed to parse catalog JSON")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read catalog file: {:?}", path.as_ref()))?;
        Self::from_json_str(&text)
    }
}

/// One output column and its deduplicated input references.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputColumn {
    pub name: String,
    pub inputs: Vec<String>,
}

/// Output columns in projection order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ColumnMapping {
    columns: Vec<OutputColumn>,
}

impl ColumnMapping {
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.inputs.as_slice())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, OutputColumn> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    fn push(&mut self, name: String, inputs: Vec<String>) {
        match self.columns.iter_mut().find(|c| c.name == name) {
            Some(existing) => {
                existing.inputs = std::mem::take(&mut existing.inputs)
                    .into_iter()
                    .chain(inputs)
                    .unique()
                    .collect();
            }
            None => self.columns.push(OutputColumn {
                name,
                inputs: inputs.into_iter().unique().collect(),
            }),
        }
    }
}

impl<'a> IntoIterator for &'a ColumnMapping {
    type Item = &'a OutputColumn;
    type IntoIter = std::slice::Iter<'a, OutputColumn>;

    fn into_iter(self) -> Self::IntoIter {
        self.columns.iter()
    }
}

/// Resolve every projection of `select` to its input column references.
///
/// Anything other than a SELECT node resolves to an empty mapping.
pub fn resolve(select: &Node, catalog: Option<&Catalog>) -> ColumnMapping {
    resolve_with_columns(select, catalog, &[])
}

/// Like [`resolve`], with the explicit column list of the statement that
/// writes the SELECT (`INSERT INTO t (a, b)`, `CREATE VIEW v (a, b)`).
///
/// A list with one name per projection renames the outputs by position
/// before same-named outputs are merged. Any other length is ignored.
pub fn resolve_with_columns(
    select: &Node,
    catalog: Option<&Catalog>,
    columns: &[String],
) -> ColumnMapping {
    let Node::Select(select) = select else {
        return ColumnMapping::default();
    };

    let mut positions = resolve_positions(select, catalog);
    if !columns.is_empty() {
        if columns.len() == positions.len() {
            for ((name, _), target) in positions.iter_mut().zip(columns) {
                name.clone_from(target);
            }
        } else {
            tracing::debug!(
                "Column list {:?} does not match {} outputs, keeping projection names",
                columns,
                positions.len()
            );
        }
    }

    let mut mapping = ColumnMapping::default();
    for (name, inputs) in positions {
        mapping.push(name, inputs);
    }
    mapping
}

/// One `(name, inputs)` per projection position of the first arm. Position
/// `i` of every set-operation arm feeds position `i`; when the first arm
/// ends in a wildcard, positions past its end feed that wildcard.
fn resolve_positions(select: &SelectNode, catalog: Option<&Catalog>) -> Vec<(String, Vec<String>)> {
    let mut positions = resolve_arm(select, catalog);
    let width = positions.len();
    let star_tail = positions
        .last()
        .is_some_and(|(name, _)| name.ends_with('*'));

    for branch in &select.set_branches {
        for (i, (name, inputs)) in resolve_arm(branch, catalog).into_iter().enumerate() {
            if i < width {
                positions[i].1.extend(inputs);
            } else if star_tail {
                positions[width - 1].1.extend(inputs);
            } else {
                tracing::debug!("Set operation arm has extra output '{}', dropped", name);
            }
        }
    }
    positions
}

struct Scope<'a> {
    /// lowercased qualifier (alias or table name) -> table name
    tables: HashMap<String, &'a str>,
    /// physical tables in FROM order, deduplicated
    referenced: Vec<&'a str>,
}

impl<'a> Scope<'a> {
    fn of(select: &'a SelectNode) -> Self {
        let mut tables = HashMap::new();
        let mut referenced: Vec<&str> = Vec::new();
        for rel in &select.from {
            if let Node::Table { name, alias } = rel {
                tables.insert(name.to_lowercase(), name.as_str());
                if let Some(a) = alias {
                    tables.insert(a.to_lowercase(), name.as_str());
                }
                if !referenced.contains(&name.as_str()) {
                    referenced.push(name.as_str());
                }
            }
        }
        Self { tables, referenced }
    }

    /// Table behind a qualifier; SQL identifiers match case-insensitively.
    fn lookup(&self, qualifier: &str) -> Option<&'a str> {
        self.tables.get(&qualifier.to_lowercase()).copied()
    }

    fn qualify(&self, table: Option<&str>, column: &str) -> String {
        match table {
            Some(t) => format!("{}.{}", self.lookup(t).unwrap_or(t), column),
            None => column.to_string(),
        }
    }
}

fn resolve_arm(select: &SelectNode, catalog: Option<&Catalog>) -> Vec<(String, Vec<String>)> {
    let scope = Scope::of(select);
    select
        .projection
        .iter()
        .map(|item| match item {
            Node::Alias { alias, child } => (alias.clone(), collect_inputs(child, &scope)),
            Node::Column { name, .. } => (name.clone(), collect_inputs(item, &scope)),
            Node::Star { qualifier } => (
                item.to_string(),
                expand_star(qualifier.as_deref(), &scope, catalog),
            ),
            other => (other.to_string(), collect_inputs(other, &scope)),
        })
        .collect()
}

fn collect_inputs(expr: &Node, scope: &Scope<'_>) -> Vec<String> {
    let mut acc = Vec::new();
    collect_columns(expr, scope, &mut acc);
    acc
}

fn collect_columns(node: &Node, scope: &Scope<'_>, acc: &mut Vec<String>) {
    match node {
        Node::Column { table, name } => acc.push(scope.qualify(table.as_deref(), name)),
        Node::Table { .. } | Node::Star { .. } => {}
        Node::Create { .. }
        | Node::Insert { .. }
        | Node::View { .. }
        | Node::Select(_)
        | Node::Alias { .. }
        | Node::Expr { .. } => {
            for child in node.children() {
                collect_columns(child, scope, acc);
            }
        }
    }
}

fn expand_star(qualifier: Option<&str>, scope: &Scope<'_>, catalog: Option<&Catalog>) -> Vec<String> {
    let unresolved = || match qualifier {
        Some(q) => vec![format!("{}.*", scope.lookup(q).unwrap_or(q))],
        None => vec![UNRESOLVED_WILDCARD.to_string()],
    };
    let Some(catalog) = catalog else {
        return unresolved();
    };

    let tables: Vec<&str> = match qualifier {
        Some(q) => scope.lookup(q).into_iter().collect(),
        None => scope.referenced.clone(),
    };
    let mut expanded = Vec::new();
    for table in tables {
        match catalog.columns(table) {
            Some(cols) => expanded.extend(cols.iter().map(|c| format!("{}.{}", table, c))),
            None => tracing::debug!("Table '{}' not in catalog; wildcard left partial", table),
        }
    }
    if expanded.is_empty() {
        unresolved()
    } else {
        expanded
    }
}
