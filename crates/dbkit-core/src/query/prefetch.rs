//! Eager loading of to-many associations (`including(all:)`) against an
//! already-fetched parent result set.
//!
//! A [`super::plan::PrefetchDescriptor`] names a pivot: the parent-side
//! columns identifying a parent row, and the child-side columns that
//! reference it. Single-column pivots compile to an `IN (...)` filter over
//! the child's own compiled SQL; composite pivots compile to a `grdb_pivot`
//! common table expression joined against it. By the time `attach` runs,
//! the parent rows are already in memory and the original parent query is
//! gone, so the CTE is built from the distinct pivot keys actually present
//! in `parent_rows` (a `VALUES` list) rather than by re-running the parent
//! query as `WITH grdb_base AS (<parent query>)`; both produce the same
//! filtered key set. Every prefetched row is annotated with its own pivot
//! values under `grdb_<col>` so the grouping pass (and callers debugging a
//! mis-attached row) can see them without re-deriving them from the
//! relation's regular columns.

use std::collections::HashMap;

use crate::connection::ConnectionSerializer;
use crate::error::Error;
use crate::row::Row;
use crate::statement::Arguments;
use crate::value::Value;

use super::generator::SqlGenerator;
use super::plan::PrefetchDescriptor;

/// A grouping key built from one or more column values. `Value` has no
/// `Hash`/`Eq` of its own (a bare `f64` can't provide one sensibly), so
/// this wrapper defines key equality the way the pivot join needs it:
/// bit-identical reals, exact matches otherwise.
#[derive(Debug, Clone, PartialEq)]
struct PivotKey(Vec<Value>);

impl Eq for PivotKey {}

impl std::hash::Hash for PivotKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for value in &self.0 {
            match value {
                Value::Null => 0u8.hash(state),
                Value::Integer(i) => {
                    1u8.hash(state);
                    i.hash(state);
                }
                Value::Real(r) => {
                    2u8.hash(state);
                    r.to_bits().hash(state);
                }
                Value::Text(s) => {
                    3u8.hash(state);
                    s.hash(state);
                }
                Value::Blob(b) => {
                    4u8.hash(state);
                    b.hash(state);
                }
            }
        }
    }
}

fn pivot_key(row: &Row, columns: &[String]) -> PivotKey {
    PivotKey(
        columns
            .iter()
            .map(|c| row.value_named(c).unwrap_or(Value::Null))
            .collect(),
    )
}

/// Fetches `descriptor`'s child rows for every distinct pivot key present
/// in `parent_rows` and attaches them under `descriptor.association_name`.
/// A no-op if `parent_rows` is empty: no SQL is issued.
pub fn attach(
    db: &ConnectionSerializer,
    generator: &SqlGenerator,
    parent_rows: &mut [Row],
    descriptor: &PrefetchDescriptor,
) -> Result<(), Error> {
    if parent_rows.is_empty() {
        return Ok(());
    }

    let mut seen = std::collections::HashSet::new();
    let mut ordered_keys = Vec::new();
    for row in parent_rows.iter() {
        let key = pivot_key(row, &descriptor.left_columns);
        if seen.insert(key.clone()) {
            ordered_keys.push(key);
        }
    }
    if ordered_keys.is_empty() {
        return Ok(());
    }

    let compiled = generator.compile_select(&descriptor.child_plan)?;
    let (sql, args) = if descriptor.pivot_columns.len() >= 2 {
        wrap_with_cte(&compiled.sql, compiled.args.clone(), &descriptor.pivot_columns, &ordered_keys)
    } else {
        wrap_with_in_list(&compiled.sql, compiled.args.clone(), &descriptor.pivot_columns[0], &ordered_keys)
    };

    let raw_rows = db.select(&sql, &Arguments::positional(args))?;
    let mut child_rows: Vec<Row> = raw_rows
        .iter()
        .map(|r| {
            let applied = match &compiled.adapter {
                Some(adapter) => adapter.apply(r),
                None => r.copy(),
            };
            let annotations: Vec<(String, Value)> = descriptor
                .pivot_columns
                .iter()
                .map(|c| (format!("grdb_{c}"), applied.value_named(c).unwrap_or(Value::Null)))
                .collect();
            applied.with_extra_columns(annotations)
        })
        .collect();

    for nested in &descriptor.child_plan.prefetches {
        attach(db, generator, &mut child_rows, nested)?;
    }

    let mut grouped: HashMap<PivotKey, Vec<Row>> = HashMap::new();
    for row in child_rows {
        let key = pivot_key(&row, &descriptor.pivot_columns);
        grouped.entry(key).or_default().push(row);
    }

    for row in parent_rows.iter_mut() {
        let key = pivot_key(row, &descriptor.left_columns);
        let matched = grouped.get(&key).cloned().unwrap_or_default();
        row.set_prefetched(descriptor.association_name.clone(), matched);
    }

    Ok(())
}

fn wrap_with_in_list(
    base_sql: &str,
    base_args: Vec<Value>,
    pivot_column: &str,
    keys: &[PivotKey],
) -> (String, Vec<Value>) {
    let placeholders = vec!["?"; keys.len()].join(", ");
    let sql = format!(
        "SELECT * FROM ({base_sql}) AS prefetch_base WHERE {pivot_column} IN ({placeholders})"
    );
    let mut args = base_args;
    args.extend(keys.iter().map(|k| k.0[0].clone()));
    (sql, args)
}

fn wrap_with_cte(
    base_sql: &str,
    base_args: Vec<Value>,
    pivot_columns: &[String],
    keys: &[PivotKey],
) -> (String, Vec<Value>) {
    let cte_columns: Vec<String> = (0..pivot_columns.len()).map(|i| format!("v{i}")).collect();
    let row_placeholder = format!("({})", vec!["?"; pivot_columns.len()].join(", "));
    let values_sql = vec![row_placeholder; keys.len()].join(", ");
    let on_clause: Vec<String> = pivot_columns
        .iter()
        .zip(cte_columns.iter())
        .map(|(col, cte_col)| format!("prefetch_base.{col} = grdb_pivot.{cte_col}"))
        .collect();

    let sql = format!(
        "WITH grdb_pivot({cols}) AS (VALUES {values_sql}) \
         SELECT prefetch_base.* FROM ({base_sql}) AS prefetch_base \
         JOIN grdb_pivot ON {on}",
        cols = cte_columns.join(", "),
        on = on_clause.join(" AND "),
    );

    let mut args: Vec<Value> = keys.iter().flat_map(|k| k.0.clone()).collect();
    args.extend(base_args);
    (sql, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Config;
    use crate::query::plan::{Expr, PrefetchDescriptor, QueryPlan, Selectable};

    fn seed() -> ConnectionSerializer {
        let conn = ConnectionSerializer::open(":memory:", Config::default()).unwrap();
        conn.execute("CREATE TABLE author(id INTEGER, name TEXT)", &Arguments::new())
            .unwrap();
        conn.execute(
            "CREATE TABLE book(id INTEGER, title TEXT, author_id INTEGER)",
            &Arguments::new(),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO author(id, name) VALUES (1, 'A'), (2, 'B')",
            &Arguments::new(),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO book(id, title, author_id) VALUES (1, 'X', 1), (2, 'Y', 1), (3, 'Z', 2)",
            &Arguments::new(),
        )
        .unwrap();
        conn
    }

    #[test]
    fn single_column_pivot_groups_children_under_their_parent() {
        let conn = seed();
        let generator = SqlGenerator::new();

        let mut authors = conn
            .select("SELECT id, name FROM author", &Arguments::new())
            .unwrap();

        let child_plan = QueryPlan::table("book").select(vec![
            Selectable::new(Expr::col("id")),
            Selectable::new(Expr::col("title")),
            Selectable::new(Expr::col("author_id")),
        ]);
        let descriptor = PrefetchDescriptor {
            association_name: "books".to_string(),
            child_table: "book".to_string(),
            left_columns: vec!["id".to_string()],
            pivot_columns: vec!["author_id".to_string()],
            child_plan,
        };

        attach(&conn, &generator, &mut authors, &descriptor).unwrap();

        let a = authors.iter().find(|r| r.value_named("name") == Some(Value::Text("A".into()))).unwrap();
        let books = a.prefetched_rows("books").unwrap();
        assert_eq!(books.len(), 2);

        let b = authors.iter().find(|r| r.value_named("name") == Some(Value::Text("B".into()))).unwrap();
        assert_eq!(b.prefetched_rows("books").unwrap().len(), 1);
    }

    #[test]
    fn composite_pivot_takes_the_cte_branch_and_annotates_rows() {
        let conn = ConnectionSerializer::open(":memory:", Config::default()).unwrap();
        conn.execute(
            "CREATE TABLE author(tenant_id INTEGER, id INTEGER, name TEXT)",
            &Arguments::new(),
        )
        .unwrap();
        conn.execute(
            "CREATE TABLE book(tenant_id INTEGER, author_id INTEGER, title TEXT)",
            &Arguments::new(),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO author(tenant_id, id, name) VALUES (1, 1, 'A'), (2, 1, 'B')",
            &Arguments::new(),
        )
        .unwrap();
        conn.execute(
            "INSERT INTO book(tenant_id, author_id, title) VALUES \
             (1, 1, 'X'), (1, 1, 'Y'), (2, 1, 'Z')",
            &Arguments::new(),
        )
        .unwrap();

        let generator = SqlGenerator::new();
        let mut authors = conn
            .select("SELECT tenant_id, id, name FROM author", &Arguments::new())
            .unwrap();

        let child_plan = QueryPlan::table("book").select(vec![
            Selectable::new(Expr::col("tenant_id")),
            Selectable::new(Expr::col("author_id")),
            Selectable::new(Expr::col("title")),
        ]);
        let descriptor = PrefetchDescriptor {
            association_name: "books".to_string(),
            child_table: "book".to_string(),
            left_columns: vec!["tenant_id".to_string(), "id".to_string()],
            pivot_columns: vec!["tenant_id".to_string(), "author_id".to_string()],
            child_plan,
        };

        attach(&conn, &generator, &mut authors, &descriptor).unwrap();

        let tenant_one = authors
            .iter()
            .find(|r| r.value_named("name") == Some(Value::Text("A".into())))
            .unwrap();
        let books = tenant_one.prefetched_rows("books").unwrap();
        assert_eq!(books.len(), 2);
        assert_eq!(books[0].value_named("grdb_tenant_id"), Some(Value::Integer(1)));
        assert_eq!(books[0].value_named("grdb_author_id"), Some(Value::Integer(1)));

        let tenant_two = authors
            .iter()
            .find(|r| r.value_named("name") == Some(Value::Text("B".into())))
            .unwrap();
        assert_eq!(tenant_two.prefetched_rows("books").unwrap().len(), 1);
    }

    #[test]
    fn empty_parent_set_short_circuits_without_querying() {
        let conn = seed();
        let generator = SqlGenerator::new();
        let mut empty: Vec<Row> = Vec::new();
        let child_plan = QueryPlan::table("book").select(vec![Selectable::new(Expr::col("id"))]);
        let descriptor = PrefetchDescriptor {
            association_name: "books".to_string(),
            child_table: "book".to_string(),
            left_columns: vec!["id".to_string()],
            pivot_columns: vec!["author_id".to_string()],
            child_plan,
        };
        attach(&conn, &generator, &mut empty, &descriptor).unwrap();
    }
}
