//! End-to-end tests against a real temp-file database, covering the
//! properties that only show up once the modules are wired together:
//! live-vs-detached iteration, join + adapter scoping, prefetch grouping,
//! observation ordering, and the pool bound.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dbkit_core::connection::Config;
use dbkit_core::observe::{self, Reducer};
use dbkit_core::query::generator::SqlGenerator;
use dbkit_core::query::plan::{Child, Expr, JoinKind, PrefetchDescriptor, QueryPlan, Selectable};
use dbkit_core::query::prefetch;
use dbkit_core::region::Region;
use dbkit_core::statement::Arguments;
use dbkit_core::value::Value;
use dbkit_core::{ConnectionSerializer, DatabaseQueue};
use tempfile::NamedTempFile;

fn open_temp() -> (NamedTempFile, ConnectionSerializer) {
    let file = NamedTempFile::new().unwrap();
    let conn = ConnectionSerializer::open(file.path().to_str().unwrap(), Config::default()).unwrap();
    (file, conn)
}

fn seed_author_book(conn: &ConnectionSerializer) {
    conn.execute("CREATE TABLE author(id INTEGER PRIMARY KEY, name TEXT)", &Arguments::new())
        .unwrap();
    conn.execute(
        "CREATE TABLE book(id INTEGER PRIMARY KEY, title TEXT, author_id INTEGER)",
        &Arguments::new(),
    )
    .unwrap();
    conn.execute(
        "INSERT INTO author(id, name) VALUES (1, 'Tove Jansson'), (2, 'Ursula Le Guin')",
        &Arguments::new(),
    )
    .unwrap();
    conn.execute(
        "INSERT INTO book(id, title, author_id) VALUES \
         (1, 'Comet in Moominland', 1), \
         (2, 'Finn Family Moomintroll', 1), \
         (3, 'A Wizard of Earthsea', 2)",
        &Arguments::new(),
    )
    .unwrap();
}

#[test]
fn empty_blob_bound_and_read_back_is_null() {
    let (_file, conn) = open_temp();
    conn.execute("CREATE TABLE t(payload BLOB)", &Arguments::new()).unwrap();
    conn.execute(
        "INSERT INTO t(payload) VALUES (?)",
        &Arguments::positional([Value::from(Vec::<u8>::new())]),
    )
    .unwrap();
    let rows = conn.select("SELECT payload FROM t", &Arguments::new()).unwrap();
    assert_eq!(rows[0].value_at(0), None);
}

#[test]
fn live_iteration_sees_each_row_only_during_its_callback() {
    let (_file, conn) = open_temp();
    conn.execute("CREATE TABLE t(id INTEGER)", &Arguments::new()).unwrap();
    conn.execute(
        "INSERT INTO t(id) VALUES (1), (2), (3)",
        &Arguments::new(),
    )
    .unwrap();

    let mut seen = Vec::new();
    conn.select_live("SELECT id FROM t ORDER BY id", &Arguments::new(), |row| {
        seen.push(row.require::<i64>(0)?);
        Ok(())
    })
    .unwrap();
    assert_eq!(seen, vec![1, 2, 3]);
}

#[test]
fn join_compiles_and_adapter_scopes_child_columns() {
    let (_file, conn) = open_temp();
    seed_author_book(&conn);

    let author = QueryPlan::table("author").select(vec![
        Selectable::new(Expr::col("id")),
        Selectable::new(Expr::col("name")),
    ]);
    let book = QueryPlan::table("book")
        .select(vec![
            Selectable::new(Expr::col("id")),
            Selectable::new(Expr::col("title")),
            Selectable::new(Expr::col("author_id")),
        ])
        .joining(
            "author",
            JoinKind::Required,
            Child {
                kind: JoinKind::Required,
                plan: author,
                foreign_key: ("author_id".into(), "id".into()),
            },
        )
        .order(Expr::col("id"), dbkit_core::query::plan::SortDirection::Asc);

    let generator = SqlGenerator::new();
    let compiled = generator.compile_select(&book).unwrap();
    let adapter = compiled.adapter.expect("joined plan carries an adapter");

    let raw_rows = conn.select(&compiled.sql, &Arguments::positional(compiled.args)).unwrap();
    assert_eq!(raw_rows.len(), 3);

    let first = adapter.apply(&raw_rows[0]);
    assert_eq!(first.count(), 3);
    assert_eq!(
        first.scope("author").unwrap().value_named("name"),
        Some(Value::Text("Tove Jansson".into()))
    );
}

#[test]
fn prefetch_groups_children_under_their_parent_via_cte_pivot() {
    let (_file, conn) = open_temp();
    seed_author_book(&conn);
    let generator = SqlGenerator::new();

    let mut authors = conn
        .select("SELECT id, name FROM author ORDER BY id", &Arguments::new())
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

    prefetch::attach(&conn, &generator, &mut authors, &descriptor).unwrap();

    let tove = authors
        .iter()
        .find(|r| r.value_named("name") == Some(Value::Text("Tove Jansson".into())))
        .unwrap();
    assert_eq!(tove.prefetched_rows("books").unwrap().len(), 2);

    let ursula = authors
        .iter()
        .find(|r| r.value_named("name") == Some(Value::Text("Ursula Le Guin".into())))
        .unwrap();
    assert_eq!(ursula.prefetched_rows("books").unwrap().len(), 1);
}

struct TitleCountReducer {
    last: Option<i64>,
}

impl Reducer for TitleCountReducer {
    type Fetched = i64;
    type Value = i64;

    fn fetch(&self, db: &ConnectionSerializer) -> Result<i64, dbkit_core::Error> {
        let rows = db.select("SELECT COUNT(*) AS n FROM book", &Arguments::new())?;
        Ok(rows[0].require::<i64>(0)?)
    }

    fn value(&mut self, fetched: i64) -> Option<i64> {
        if self.last == Some(fetched) {
            None
        } else {
            self.last = Some(fetched);
            Some(fetched)
        }
    }
}

#[tokio::test]
async fn observation_delivers_in_commit_order_and_dedups_no_op_commits() {
    let (_file, conn) = open_temp();
    seed_author_book(&conn);
    let writer = Arc::new(conn);

    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let for_cb = Arc::clone(&deliveries);

    let handle = observe::start(
        Arc::clone(&writer),
        TitleCountReducer { last: None },
        Region::full_table("book"),
        move |v| for_cb.lock().unwrap().push(v),
        |_| {},
    )
    .unwrap();

    writer
        .update_tracked(
            "INSERT INTO book(id, title, author_id) VALUES (4, 'Tehanu', 2)",
            &Arguments::new(),
            Region::full_table("book"),
        )
        .unwrap();

    // A write to an untracked region shouldn't wake this observer.
    writer
        .execute_tracked(
            "UPDATE author SET name = name WHERE id = 1",
            &Arguments::new(),
            Region::full_table("author"),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    let values = deliveries.lock().unwrap().clone();
    assert_eq!(values, vec![3, 4]);
    handle.cancel();
    assert!(handle.is_cancelled());
}

#[test]
fn database_queue_pool_never_exceeds_its_bound() {
    let file = NamedTempFile::new().unwrap();
    let queue = DatabaseQueue::open(file.path().to_str().unwrap(), Config::default(), 2).unwrap();
    queue
        .write(|db| db.execute("CREATE TABLE t(id INTEGER)", &Arguments::new()))
        .unwrap();

    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));
    let queue = Arc::new(queue);

    let mut handles = Vec::new();
    for _ in 0..6 {
        let queue = Arc::clone(&queue);
        let concurrent = Arc::clone(&concurrent);
        let max_seen = Arc::clone(&max_seen);
        handles.push(std::thread::spawn(move || {
            queue
                .read(|db| {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(15));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    db.select("SELECT id FROM t", &Arguments::new())
                })
                .unwrap();
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert!(max_seen.load(Ordering::SeqCst) <= 2);
}
