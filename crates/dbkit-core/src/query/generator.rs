//! Lowers a [`QueryPlan`] into SQL, a bound argument vector, an optional
//! [`RowAdapter`], and an estimated read [`Region`].
//!
//! The compiler has no schema catalog (cataloging tables is explicitly out
//! of scope), so selection synthesis only has one branch to take: a plan
//! with no joins and no explicit selection compiles to a bare `SELECT *`
//! with no adapter (the row already has the shape the caller wants); a plan
//! with joins requires every relation on the path to name its own
//! selection explicitly, since that's the only way the compiler can know
//! how many columns belong to each scope.

use crate::error::Error;
use crate::region::Region;
use crate::row::RowAdapter;
use crate::value::Value;

use super::plan::{
    AggKind, Child, Expr, JoinKind, Predicate, QueryPlan, Selectable, Source, SortDirection,
};

/// The output of compiling a [`QueryPlan`]: ready-to-bind SQL plus metadata
/// a caller needs to run and interpret it.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub sql: String,
    pub args: Vec<Value>,
    pub adapter: Option<RowAdapter>,
    pub region: Region,
}

pub struct SqlGenerator {
    alias_counter: std::cell::Cell<usize>,
}

impl Default for SqlGenerator {
    fn default() -> Self {
        SqlGenerator {
            alias_counter: std::cell::Cell::new(0),
        }
    }
}

impl SqlGenerator {
    pub fn new() -> SqlGenerator {
        SqlGenerator::default()
    }

    fn next_alias(&self) -> String {
        let n = self.alias_counter.get();
        self.alias_counter.set(n + 1);
        format!("t{n}")
    }

    /// Compiles a SELECT. `qualify` forces table aliases even with no
    /// joins (used by subqueries and CTEs in [`crate::query::prefetch`]).
    pub fn compile_select(&self, plan: &QueryPlan) -> Result<Compiled, Error> {
        validate_join_chain(plan)?;

        let needs_alias = !plan.joins.is_empty();
        let root_alias = match &plan.source {
            Source::Table { alias: Some(a), .. } => a.clone(),
            _ if needs_alias => self.next_alias(),
            _ => table_name(plan)?,
        };

        let mut args = Vec::new();
        let mut region = Region::empty();

        // Assign every join in the tree an alias up front, depth-first, so
        // the column list and the JOIN clauses (rendered in separate passes
        // below) agree on them at every nesting level, not just the top one.
        let join_tree = self.assign_join_aliases(&plan.joins);

        let use_star = plan.selection.is_empty() && plan.joins.is_empty() && plan.grouping.is_none();
        let (own_range, columns, scopes) = if use_star {
            (None, Vec::new(), std::collections::HashMap::new())
        } else {
            let mut columns = Vec::new();
            let (range, scopes) =
                self.collect_columns(plan, &root_alias, &join_tree, &mut columns, &mut args, &mut region)?;
            (Some(range), columns, scopes)
        };

        let mut sql = String::from("SELECT ");
        if plan.distinct {
            sql.push_str("DISTINCT ");
        }
        if use_star {
            sql.push('*');
        } else {
            let rendered: Vec<String> = columns.iter().map(|c| c.sql.clone()).collect();
            sql.push_str(&rendered.join(", "));
        }

        sql.push_str(" FROM ");
        sql.push_str(&from_clause(plan, &root_alias, needs_alias));
        sql.push_str(&render_join_tree(&join_tree, &root_alias, &mut args)?);

        if !plan.filters.is_empty() {
            let rendered = Predicate::And(plan.filters.clone()).to_sql(&root_alias, &mut args);
            sql.push_str(" WHERE ");
            sql.push_str(&rendered);
        }

        if let Some(grouping) = &plan.grouping {
            let rendered: Vec<String> = grouping
                .iter()
                .map(|e| e.to_sql(&root_alias, &mut args))
                .collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&rendered.join(", "));
        }

        if !plan.having.is_empty() {
            let rendered = Predicate::And(plan.having.clone()).to_sql(&root_alias, &mut args);
            sql.push_str(" HAVING ");
            sql.push_str(&rendered);
        }

        if !plan.orderings.is_empty() {
            let rendered: Vec<String> = plan
                .orderings
                .iter()
                .map(|term| {
                    let dir = match term.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("{} {}", term.expr.to_sql(&root_alias, &mut args), dir)
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&rendered.join(", "));
        }

        if let Some((count, offset)) = plan.limit {
            sql.push_str(&format!(" LIMIT {count} OFFSET {offset}"));
        }

        let adapter = own_range.map(|range| {
            RowAdapter::range(range).with_scopes(scopes)
        });

        Ok(Compiled {
            sql,
            args,
            adapter,
            region,
        })
    }

    /// Lowers a DELETE. If the plan has joins or a `GROUP BY`, rewrites to
    /// `DELETE FROM target WHERE pk IN (SELECT pk FROM <plan>)`; a grouped
    /// plan can never be deleted from directly since deleting grouped rows
    /// is ambiguous.
    pub fn compile_delete(&self, plan: &QueryPlan, primary_key: &str) -> Result<Compiled, Error> {
        if plan.is_aggregated() {
            return Err(Error::Programmer("cannot DELETE from a grouped query"));
        }
        let table = table_name(plan)?;

        if plan.joins.is_empty() {
            let mut args = Vec::new();
            let mut sql = format!("DELETE FROM {table}");
            if !plan.filters.is_empty() {
                let rendered = Predicate::And(plan.filters.clone()).to_sql(&table, &mut args);
                sql.push_str(" WHERE ");
                sql.push_str(&rendered);
            }
            return Ok(Compiled {
                sql,
                args,
                adapter: None,
                region: Region::full_table(&table),
            });
        }

        let inner = self.compile_root_projection(plan, &Expr::col(primary_key))?;
        let sql = format!(
            "DELETE FROM {table} WHERE {primary_key} IN ({})",
            inner.sql
        );
        Ok(Compiled {
            sql,
            args: inner.args,
            adapter: None,
            region: Region::full_table(&table),
        })
    }

    /// Lowers an UPDATE. An empty assignment list is a no-op: the caller
    /// should skip running SQL entirely and report 0 changed rows (the
    /// compiler reports this by returning `sql: String::new()`).
    pub fn compile_update(
        &self,
        plan: &QueryPlan,
        assignments: &[(String, Expr)],
        primary_key: &str,
    ) -> Result<Compiled, Error> {
        if assignments.is_empty() {
            return Ok(Compiled {
                sql: String::new(),
                args: Vec::new(),
                adapter: None,
                region: Region::empty(),
            });
        }
        let table = table_name(plan)?;
        let mut args = Vec::new();
        let assignment_sql: Vec<String> = assignments
            .iter()
            .map(|(col, expr)| format!("{col} = {}", expr.to_sql(&table, &mut args)))
            .collect();

        if plan.joins.is_empty() && !plan.is_aggregated() {
            let mut sql = format!("UPDATE {table} SET {}", assignment_sql.join(", "));
            if !plan.filters.is_empty() {
                let rendered = Predicate::And(plan.filters.clone()).to_sql(&table, &mut args);
                sql.push_str(" WHERE ");
                sql.push_str(&rendered);
            }
            return Ok(Compiled {
                sql,
                args,
                adapter: None,
                region: Region::full_table(&table),
            });
        }

        let inner = self.compile_root_projection(plan, &Expr::col(primary_key))?;
        let mut combined_args = args;
        combined_args.extend(inner.args);
        let sql = format!(
            "UPDATE {table} SET {} WHERE {primary_key} IN ({})",
            assignment_sql.join(", "),
            inner.sql
        );
        Ok(Compiled {
            sql,
            args: combined_args,
            adapter: None,
            region: Region::full_table(&table),
        })
    }

    /// Compiles `plan` selecting a single scalar expression from its root
    /// relation, keeping the FROM/JOIN/WHERE/GROUP BY/HAVING/ORDER BY/LIMIT
    /// structure intact. Used to build the `pk IN (...)` subquery for
    /// joined or grouped DELETE/UPDATE rewrites: the joins are kept (they
    /// constrain which rows qualify) but the SELECT list is always exactly
    /// `expr`, never the joined relations' own selections, so the subquery
    /// is guaranteed to return one column.
    fn compile_root_projection(&self, plan: &QueryPlan, expr: &Expr) -> Result<Compiled, Error> {
        validate_join_chain(plan)?;

        let needs_alias = !plan.joins.is_empty();
        let root_alias = match &plan.source {
            Source::Table { alias: Some(a), .. } => a.clone(),
            _ if needs_alias => self.next_alias(),
            _ => table_name(plan)?,
        };

        let join_tree = self.assign_join_aliases(&plan.joins);
        let mut args = Vec::new();
        let mut region = Region::full_table(&table_name(plan)?);

        let mut sql = String::from("SELECT ");
        if plan.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&expr.to_sql(&root_alias, &mut args));
        sql.push_str(" FROM ");
        sql.push_str(&from_clause(plan, &root_alias, needs_alias));
        sql.push_str(&render_join_tree(&join_tree, &root_alias, &mut args)?);

        if !plan.filters.is_empty() {
            let rendered = Predicate::And(plan.filters.clone()).to_sql(&root_alias, &mut args);
            sql.push_str(" WHERE ");
            sql.push_str(&rendered);
        }

        if let Some(grouping) = &plan.grouping {
            let rendered: Vec<String> = grouping
                .iter()
                .map(|e| e.to_sql(&root_alias, &mut args))
                .collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&rendered.join(", "));
        }

        if !plan.having.is_empty() {
            let rendered = Predicate::And(plan.having.clone()).to_sql(&root_alias, &mut args);
            sql.push_str(" HAVING ");
            sql.push_str(&rendered);
        }

        if !plan.orderings.is_empty() {
            let rendered: Vec<String> = plan
                .orderings
                .iter()
                .map(|term| {
                    let dir = match term.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("{} {}", term.expr.to_sql(&root_alias, &mut args), dir)
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&rendered.join(", "));
        }

        if let Some((count, offset)) = plan.limit {
            sql.push_str(&format!(" LIMIT {count} OFFSET {offset}"));
        }

        Ok(Compiled {
            sql,
            args,
            adapter: None,
            region,
        })
    }

    /// Assigns each join in the tree rooted at `joins` a depth-first alias,
    /// so both the column list and the JOIN clause rendering passes walk
    /// the exact same tree shape and agree on every alias, at every depth.
    fn assign_join_aliases<'a>(&self, joins: &'a [(String, Child)]) -> Vec<JoinNode<'a>> {
        joins
            .iter()
            .map(|(key, child)| {
                let alias = self.next_alias();
                let children = self.assign_join_aliases(&child.plan.joins);
                JoinNode {
                    key,
                    child,
                    alias,
                    children,
                }
            })
            .collect()
    }

    /// Appends `plan`'s own selected columns (then recurses into each join
    /// child, each under its own pre-assigned alias) and returns the range
    /// of `out` holding `plan`'s own columns plus a scope map for its
    /// children, keyed by join name.
    fn collect_columns(
        &self,
        plan: &QueryPlan,
        alias: &str,
        join_nodes: &[JoinNode],
        out: &mut Vec<RenderedColumn>,
        args: &mut Vec<Value>,
        region: &mut Region,
    ) -> Result<(std::ops::Range<usize>, std::collections::HashMap<String, RowAdapter>), Error> {
        if plan.selection.is_empty() && !plan.joins.is_empty() {
            return Err(Error::Programmer(
                "an explicit selection is required on every relation that participates in a join",
            ));
        }

        let start = out.len();
        let table = table_name(plan)?;
        *region = std::mem::take(region).union(Region::full_table(&table));

        for selectable in &plan.selection {
            out.push(render_column(selectable, alias, args));
        }
        let own_end = out.len();

        let mut scopes = std::collections::HashMap::new();
        for node in join_nodes {
            let (child_range, nested_scopes) = self.collect_columns(
                &node.child.plan,
                &node.alias,
                &node.children,
                out,
                args,
                region,
            )?;
            let adapter = RowAdapter::range(child_range).with_scopes(nested_scopes);
            scopes.insert(node.key.to_string(), adapter);
        }

        Ok((start..own_end, scopes))
    }
}

/// A join paired with its pre-assigned alias and its own children, each
/// similarly aliased. Built once per [`SqlGenerator::compile_select`]/
/// [`SqlGenerator::compile_root_projection`] call so every rendering pass
/// over the same plan sees identical aliases.
struct JoinNode<'a> {
    key: &'a str,
    child: &'a Child,
    alias: String,
    children: Vec<JoinNode<'a>>,
}

struct RenderedColumn {
    sql: String,
}

fn render_column(selectable: &Selectable, alias: &str, args: &mut Vec<Value>) -> RenderedColumn {
    let base = selectable.expr.to_sql(alias, args);
    let sql = match &selectable.alias {
        Some(name) => format!("{base} AS {name}"),
        None => base,
    };
    RenderedColumn { sql }
}

/// Renders the JOIN clauses for a whole join tree, recursing into each
/// node's own children with that node's alias as the new parent alias —
/// the counterpart to [`SqlGenerator::collect_columns`]'s recursion, so a
/// plan whose join child itself has joins doesn't end up with column
/// references to aliases missing from the FROM/JOIN list.
fn render_join_tree(nodes: &[JoinNode], parent_alias: &str, args: &mut Vec<Value>) -> Result<String, Error> {
    let mut sql = String::new();
    for node in nodes {
        sql.push_str(&join_clause(node.child, parent_alias, &node.alias, args)?);
        sql.push_str(&render_join_tree(&node.children, &node.alias, args)?);
    }
    Ok(sql)
}

fn table_name(plan: &QueryPlan) -> Result<String, Error> {
    match &plan.source {
        Source::Table { name, .. } => Ok(name.clone()),
        Source::Subquery(_) => Err(Error::Programmer("subquery sources are not yet named")),
    }
}

fn from_clause(plan: &QueryPlan, alias: &str, needs_alias: bool) -> String {
    match &plan.source {
        Source::Table { name, .. } => {
            if needs_alias && alias != name {
                format!("{name} AS {alias}")
            } else {
                name.clone()
            }
        }
        Source::Subquery(_) => format!("(/* subquery */) AS {alias}"),
    }
}

fn join_clause(
    child: &Child,
    parent_alias: &str,
    child_alias: &str,
    args: &mut Vec<Value>,
) -> Result<String, Error> {
    let verb = match child.kind {
        JoinKind::Required => "INNER JOIN",
        JoinKind::Optional => "LEFT JOIN",
    };
    let table = table_name(&child.plan)?;
    let (parent_col, child_col) = &child.foreign_key;
    let mut on = format!(
        "{child_alias}.{child_col} = {parent_alias}.{parent_col}"
    );
    if !child.plan.filters.is_empty() {
        let filter_sql = Predicate::And(child.plan.filters.clone()).to_sql(child_alias, args);
        on = format!("{on} AND {filter_sql}");
    }
    Ok(format!(" {verb} {table} AS {child_alias} ON {on}"))
}

/// Rejects a required join nested behind an optional one: SQL can't express
/// "this inner join only applies when that outer join matched" without a
/// subquery rewrite this compiler doesn't perform (see Open Questions).
fn validate_join_chain(plan: &QueryPlan) -> Result<(), Error> {
    for (_, child) in &plan.joins {
        if child.kind == JoinKind::Optional {
            for (_, grandchild) in &child.plan.joins {
                if grandchild.kind == JoinKind::Required {
                    return Err(Error::Programmer(
                        "chaining a required join behind an optional join is not supported",
                    ));
                }
            }
        }
        validate_join_chain(&child.plan)?;
    }
    Ok(())
}

impl Expr {
    fn to_sql(&self, alias: &str, args: &mut Vec<Value>) -> String {
        match self {
            Expr::Column(name) => format!("{alias}.{name}"),
            Expr::Literal(value) => {
                args.push(value.clone());
                "?".to_string()
            }
            Expr::Aggregate(kind, inner) => {
                format!("{}({})", kind.sql_fn(), inner.to_sql(alias, args))
            }
        }
    }
}

impl Predicate {
    fn to_sql(&self, alias: &str, args: &mut Vec<Value>) -> String {
        match self {
            Predicate::Eq(a, b) => format!("{} = {}", a.to_sql(alias, args), b.to_sql(alias, args)),
            Predicate::Ne(a, b) => format!("{} <> {}", a.to_sql(alias, args), b.to_sql(alias, args)),
            Predicate::Gt(a, b) => format!("{} > {}", a.to_sql(alias, args), b.to_sql(alias, args)),
            Predicate::Lt(a, b) => format!("{} < {}", a.to_sql(alias, args), b.to_sql(alias, args)),
            Predicate::And(items) => {
                if items.is_empty() {
                    "1".to_string()
                } else {
                    items
                        .iter()
                        .map(|p| format!("({})", p.to_sql(alias, args)))
                        .collect::<Vec<_>>()
                        .join(" AND ")
                }
            }
            Predicate::Or(items) => items
                .iter()
                .map(|p| format!("({})", p.to_sql(alias, args)))
                .collect::<Vec<_>>()
                .join(" OR "),
            Predicate::Raw(sql) => sql.clone(),
        }
    }
}
