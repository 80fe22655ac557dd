//! SQL text to [`Node`] trees.
//!
//! Parsing goes through `sqlparser` in two stages. The whole text is first
//! parsed as a script; if that fails the text is tokenized, cut at every
//! top-level `;`, and each chunk is parsed on its own so one broken statement
//! only costs itself. If neither stage yields a statement the result is empty.
//! Nothing here returns an error: callers only ever see fewer statements.

use sqlparser::ast::{
    self, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, ObjectName, ObjectNamePart,
    Query, Select, SelectItem, SetExpr, Statement, TableFactor, TableObject, TableWithJoins,
};
use sqlparser::dialect::{dialect_from_str, Dialect, GenericDialect};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};

use crate::ast::{Node, SelectNode};

#[derive(Debug)]
pub struct SqlParser {
    dialect: Box<dyn Dialect>,
}

impl Default for SqlParser {
    fn default() -> Self {
        Self {
            dialect: Box::new(GenericDialect {}),
        }
    }
}

impl SqlParser {
    /// Build a parser for a dialect name such as `generic`, `hive` or
    /// `postgres`. Unknown names fall back to the generic dialect.
    pub fn new(dialect: &str) -> Self {
        match dialect_from_str(dialect) {
            Some(d) => Self { dialect: d },
            None => {
                tracing::warn!("Unknown SQL dialect '{}', using generic", dialect);
                Self::default()
            }
        }
    }

    /// Parse `text` into lowered statement trees, in source order.
    pub fn parse(&self, text: &str) -> Vec<Node> {
        match self.parse_statements(text) {
            Some(statements) => statements.iter().map(lower_statement).collect(),
            None => Vec::new(),
        }
    }

    fn parse_statements(&self, text: &str) -> Option<Vec<Statement>> {
        if text.trim().is_empty() {
            return None;
        }
        match Parser::parse_sql(&*self.dialect, text) {
            Ok(statements) => Some(statements),
            Err(e) => {
                tracing::warn!("Script parse failed, retrying per statement: {}", e);
                self.parse_chunks(text)
            }
        }
    }

    fn parse_chunks(&self, text: &str) -> Option<Vec<Statement>> {
        let tokens = match Tokenizer::new(&*self.dialect, text).tokenize() {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::error!("Failed to tokenize SQL: {}", e);
                return None;
            }
        };

        let mut statements = Vec::new();
        for chunk in tokens.split(|t| matches!(t, Token::SemiColon)) {
            if chunk
                .iter()
                .all(|t| matches!(t, Token::Whitespace(_) | Token::EOF))
            {
                continue;
            }
            match Parser::new(&*self.dialect)
                .with_tokens(chunk.to_vec())
                .parse_statement()
            {
                Ok(stmt) => statements.push(stmt),
                Err(e) => tracing::warn!("Skipping unparsable statement: {}", e),
            }
        }

        if statements.is_empty() {
            tracing::error!("Failed to parse SQL: no statement could be recovered");
            None
        } else {
            Some(statements)
        }
    }
}

/// Parse with the generic dialect.
pub fn parse(text: &str) -> Vec<Node> {
    SqlParser::default().parse(text)
}

fn lower_statement(stmt: &Statement) -> Node {
    match stmt {
        Statement::CreateTable(ct) => Node::Create {
            name: object_name_last(&ct.name),
            columns: ct.columns.iter().map(|c| c.name.value.clone()).collect(),
            query: ct.query.as_ref().map(|q| Box::new(lower_query(q))),
        },
        Statement::CreateView {
            name,
            columns,
            query,
            ..
        } => Node::View {
            name: object_name_last(name),
            columns: columns.iter().map(|c| c.name.value.clone()).collect(),
            query: Box::new(lower_query(query)),
        },
        Statement::Insert(ins) => {
            let target = match &ins.table {
                TableObject::TableName(name) => object_name_last(name),
                TableObject::TableFunction(_) => None,
            };
            Node::Insert {
                target,
                columns: ins.columns.iter().map(|c| c.value.clone()).collect(),
                source: ins.source.as_ref().map(|q| Box::new(lower_query(q))),
            }
        }
        Statement::Query(q) => lower_query(q),
        other => Node::Expr {
            text: other.to_string(),
            children: Vec::new(),
        },
    }
}

fn lower_query(query: &Query) -> Node {
    let with: Vec<Node> = query
        .with
        .iter()
        .flat_map(|w| w.cte_tables.iter())
        .map(|cte| Node::Alias {
            alias: cte.alias.name.value.clone(),
            child: Box::new(lower_query(&cte.query)),
        })
        .collect();

    match lower_set_expr(&query.body) {
        Node::Select(mut select) => {
            select.with = with;
            Node::Select(select)
        }
        other if with.is_empty() => other,
        // a WITH over a non-SELECT body (e.g. INSERT): keep both reachable
        other => Node::Select(SelectNode {
            with,
            predicates: vec![other],
            ..Default::default()
        }),
    }
}

fn lower_set_expr(body: &SetExpr) -> Node {
    match body {
        SetExpr::Select(select) => Node::Select(lower_select(select)),
        SetExpr::Query(q) => lower_query(q),
        SetExpr::SetOperation { left, right, .. } => {
            let mut arms = Vec::new();
            collect_set_arms(left, &mut arms);
            collect_set_arms(right, &mut arms);
            let mut arms = arms.into_iter();
            match arms.next() {
                Some(mut first) => {
                    first.set_branches.extend(arms);
                    Node::Select(first)
                }
                None => Node::Expr {
                    text: body.to_string(),
                    children: Vec::new(),
                },
            }
        }
        SetExpr::Insert(stmt) => lower_statement(stmt),
        other => Node::Expr {
            text: other.to_string(),
            children: Vec::new(),
        },
    }
}

fn collect_set_arms(body: &SetExpr, out: &mut Vec<SelectNode>) {
    match body {
        SetExpr::SetOperation { left, right, .. } => {
            collect_set_arms(left, out);
            collect_set_arms(right, out);
        }
        other => {
            if let Node::Select(select) = lower_set_expr(other) {
                out.push(select);
            }
        }
    }
}

fn lower_select(select: &Select) -> SelectNode {
    let projection = select.projection.iter().map(lower_select_item).collect();

    let mut from = Vec::new();
    for twj in &select.from {
        lower_table_with_joins(twj, &mut from);
    }

    let mut predicates = Vec::new();
    if let Some(selection) = &select.selection {
        predicates.push(lower_expr(selection));
    }
    if let ast::GroupByExpr::Expressions(exprs, _) = &select.group_by {
        predicates.extend(exprs.iter().map(lower_expr));
    }
    if let Some(having) = &select.having {
        predicates.push(lower_expr(having));
    }

    SelectNode {
        with: Vec::new(),
        projection,
        from,
        predicates,
        set_branches: Vec::new(),
    }
}

fn lower_table_with_joins(twj: &TableWithJoins, out: &mut Vec<Node>) {
    lower_table_factor(&twj.relation, out);
    for join in &twj.joins {
        lower_table_factor(&join.relation, out);
    }
}

fn lower_table_factor(factor: &TableFactor, out: &mut Vec<Node>) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            if let Some(table) = object_name_last(name) {
                out.push(Node::Table {
                    name: table,
                    alias: alias.as_ref().map(|a| a.name.value.clone()),
                });
            }
        }
        TableFactor::Derived {
            subquery, alias, ..
        } => {
            let inner = lower_query(subquery);
            match alias {
                Some(a) => out.push(Node::Alias {
                    alias: a.name.value.clone(),
                    child: Box::new(inner),
                }),
                None => out.push(inner),
            }
        }
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => lower_table_with_joins(table_with_joins, out),
        _ => {}
    }
}

fn lower_select_item(item: &SelectItem) -> Node {
    match item {
        SelectItem::UnnamedExpr(expr) => lower_expr(expr),
        SelectItem::ExprWithAlias { expr, alias } => Node::Alias {
            alias: alias.value.clone(),
            child: Box::new(lower_expr(expr)),
        },
        SelectItem::Wildcard(_) => Node::Star { qualifier: None },
        SelectItem::QualifiedWildcard(kind, _) => {
            let qualifier = match kind {
                ast::SelectItemQualifiedWildcardKind::ObjectName(obj) => {
                    object_name_last(obj).unwrap_or_else(|| obj.to_string())
                }
                ast::SelectItemQualifiedWildcardKind::Expr(e) => e.to_string(),
            };
            Node::Star {
                qualifier: Some(qualifier),
            }
        }
    }
}

fn lower_expr(expr: &Expr) -> Node {
    match expr {
        Expr::Identifier(ident) => Node::Column {
            table: None,
            name: ident.value.clone(),
        },
        Expr::CompoundIdentifier(idents) => match idents.as_slice() {
            [] => generic(expr, Vec::new()),
            [only] => Node::Column {
                table: None,
                name: only.value.clone(),
            },
            [.., table, column] => Node::Column {
                table: Some(table.value.clone()),
                name: column.value.clone(),
            },
        },
        Expr::BinaryOp { left, right, .. } => {
            generic(expr, vec![lower_expr(left), lower_expr(right)])
        }
        Expr::UnaryOp { expr: inner, .. }
        | Expr::Nested(inner)
        | Expr::Cast { expr: inner, .. }
        | Expr::IsNull(inner)
        | Expr::IsNotNull(inner)
        | Expr::IsTrue(inner)
        | Expr::IsFalse(inner)
        | Expr::IsUnknown(inner)
        | Expr::IsNotUnknown(inner)
        | Expr::Collate { expr: inner, .. }
        | Expr::Extract { expr: inner, .. }
        | Expr::Ceil { expr: inner, .. }
        | Expr::Floor { expr: inner, .. }
        | Expr::JsonAccess { value: inner, .. }
        | Expr::CompoundFieldAccess { root: inner, .. } => generic(expr, vec![lower_expr(inner)]),
        Expr::Interval(interval) => generic(expr, vec![lower_expr(&interval.value)]),
        Expr::Array(array) => generic(expr, array.elem.iter().map(lower_expr).collect()),
        Expr::Position { expr: inner, r#in } => {
            generic(expr, vec![lower_expr(inner), lower_expr(r#in)])
        }
        Expr::AnyOp { left, right, .. } | Expr::AllOp { left, right, .. } => {
            generic(expr, vec![lower_expr(left), lower_expr(right)])
        }
        Expr::InUnnest {
            expr: inner,
            array_expr,
            ..
        } => generic(expr, vec![lower_expr(inner), lower_expr(array_expr)]),
        Expr::InSubquery {
            expr: inner,
            subquery,
            ..
        } => generic(expr, vec![lower_expr(inner), lower_query(subquery)]),
        Expr::Substring {
            expr: inner,
            substring_from,
            substring_for,
            ..
        } => {
            let mut children = vec![lower_expr(inner)];
            children.extend(substring_from.iter().map(|e| lower_expr(e)));
            children.extend(substring_for.iter().map(|e| lower_expr(e)));
            generic(expr, children)
        }
        Expr::Trim {
            expr: inner,
            trim_what,
            trim_characters,
            ..
        } => {
            let mut children = vec![lower_expr(inner)];
            children.extend(trim_what.iter().map(|e| lower_expr(e)));
            children.extend(trim_characters.iter().flatten().map(lower_expr));
            generic(expr, children)
        }
        Expr::Overlay {
            expr: inner,
            overlay_what,
            overlay_from,
            overlay_for,
            ..
        } => {
            let mut children = vec![
                lower_expr(inner),
                lower_expr(overlay_what),
                lower_expr(overlay_from),
            ];
            children.extend(overlay_for.iter().map(|e| lower_expr(e)));
            generic(expr, children)
        }
        Expr::Convert {
            expr: inner,
            styles,
            ..
        } => {
            let mut children = vec![lower_expr(inner)];
            children.extend(styles.iter().map(lower_expr));
            generic(expr, children)
        }
        Expr::Like {
            expr: inner,
            pattern,
            ..
        }
        | Expr::ILike {
            expr: inner,
            pattern,
            ..
        }
        | Expr::SimilarTo {
            expr: inner,
            pattern,
            ..
        }
        | Expr::RLike {
            expr: inner,
            pattern,
            ..
        } => generic(expr, vec![lower_expr(inner), lower_expr(pattern)]),
        Expr::IsDistinctFrom(a, b) | Expr::IsNotDistinctFrom(a, b) => {
            generic(expr, vec![lower_expr(a), lower_expr(b)])
        }
        Expr::AtTimeZone {
            timestamp,
            time_zone,
        } => generic(expr, vec![lower_expr(timestamp), lower_expr(time_zone)]),
        Expr::Between {
            expr: inner,
            low,
            high,
            ..
        } => generic(
            expr,
            vec![lower_expr(inner), lower_expr(low), lower_expr(high)],
        ),
        Expr::InList {
            expr: inner, list, ..
        } => {
            let mut children = vec![lower_expr(inner)];
            children.extend(list.iter().map(lower_expr));
            generic(expr, children)
        }
        Expr::Tuple(items) => generic(expr, items.iter().map(lower_expr).collect()),
        Expr::Case {
            operand,
            conditions,
            else_result,
            ..
        } => {
            let mut children = Vec::new();
            if let Some(op) = operand {
                children.push(lower_expr(op));
            }
            for c in conditions {
                children.push(lower_expr(&c.condition));
                children.push(lower_expr(&c.result));
            }
            if let Some(e) = else_result {
                children.push(lower_expr(e));
            }
            generic(expr, children)
        }
        Expr::Function(fun) => {
            let mut children = Vec::new();
            match &fun.args {
                FunctionArguments::None => {}
                FunctionArguments::Subquery(q) => children.push(lower_query(q)),
                FunctionArguments::List(list) => {
                    for arg in &list.args {
                        let arg_expr = match arg {
                            FunctionArg::Unnamed(a) => a,
                            FunctionArg::Named { arg, .. } | FunctionArg::ExprNamed { arg, .. } => {
                                arg
                            }
                        };
                        // wildcards inside calls (COUNT(*)) do not name columns
                        if let FunctionArgExpr::Expr(e) = arg_expr {
                            children.push(lower_expr(e));
                        }
                    }
                    // ARRAY_AGG(x ORDER BY y)
                    for clause in &list.clauses {
                        if let ast::FunctionArgumentClause::OrderBy(order_by) = clause {
                            children.extend(order_by.iter().map(|ob| lower_expr(&ob.expr)));
                        }
                    }
                }
            }
            // PERCENTILE_CONT(..) WITHIN GROUP (ORDER BY y)
            children.extend(fun.within_group.iter().map(|ob| lower_expr(&ob.expr)));
            if let Some(filter) = &fun.filter {
                children.push(lower_expr(filter));
            }
            if let Some(ast::WindowType::WindowSpec(spec)) = &fun.over {
                children.extend(spec.partition_by.iter().map(lower_expr));
                children.extend(spec.order_by.iter().map(|ob| lower_expr(&ob.expr)));
            }
            generic(expr, children)
        }
        Expr::Subquery(q) => generic(expr, vec![lower_query(q)]),
        Expr::Exists { subquery, .. } => generic(expr, vec![lower_query(subquery)]),
        _ => generic(expr, Vec::new()),
    }
}

fn generic(expr: &Expr, children: Vec<Node>) -> Node {
    Node::Expr {
        text: expr.to_string(),
        children,
    }
}

fn object_name_last(name: &ObjectName) -> Option<String> {
    name.0.iter().rev().find_map(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.clone()),
        #[allow(unreachable_patterns)]
        _ => None,
    })
}
