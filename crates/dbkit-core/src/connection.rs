//! [`ConnectionSerializer`]: the per-connection execution context that
//! guarantees at-most-one in-flight operation, with inline reentrancy for
//! nested calls from the same dispatch context.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Error;
use crate::ffi::{default_open_flags, RawDb};
use crate::region::Region;
use crate::row::Row;
use crate::statement::{Arguments, Statement, StatementCache};

/// Something that wants to hear about writes landing in a region it cares
/// about. Implemented by [`crate::observe::Observer`]; kept as a small
/// trait here (rather than having this module depend on `observe`) so the
/// serializer stays the one place that knows when a write actually lands.
pub trait TransactionObserver: Send + Sync {
    fn observed_region(&self) -> Region;
    fn notify_dirty(&self);
}

mod builder;
pub use builder::{Builder, Config};

thread_local! {
    /// Pointers of the [`ConnectionSerializer`]s this thread is currently
    /// dispatched inside of, innermost last. Used to detect reentrancy:
    /// a nested call targeting a serializer already on this stack runs
    /// inline instead of taking the lock (which would deadlock).
    static ACTIVE: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// How a transaction should begin: `BEGIN`, `BEGIN IMMEDIATE`, or
/// `BEGIN EXCLUSIVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionKind {
    fn begin_sql(self) -> &'static str {
        match self {
            TransactionKind::Deferred => "BEGIN",
            TransactionKind::Immediate => "BEGIN IMMEDIATE",
            TransactionKind::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// What a transaction body decided to do with its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    Active,
}

/// Owns exactly one engine connection and serializes every operation
/// against it.
///
/// Nested submissions from the same dispatch identity (i.e. a call to
/// [`ConnectionSerializer::in_database`] made from inside another call's
/// body, on the same thread) execute inline rather than deadlocking;
/// reentrant write transactions are rejected with [`Error::Programmer`].
pub struct ConnectionSerializer {
    identity: u64,
    db: RawDb,
    lock: Mutex<()>,
    cache: Mutex<StatementCache>,
    tx_state: Mutex<TxState>,
    config: Config,
    observers: Mutex<Vec<Weak<dyn TransactionObserver>>>,
    pending_region: Mutex<Region>,
}

impl std::fmt::Debug for ConnectionSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSerializer")
            .field("identity", &self.identity)
            .field("label", &self.config.label())
            .finish()
    }
}

impl ConnectionSerializer {
    pub fn open(path: &str, config: Config) -> Result<ConnectionSerializer, Error> {
        let db = RawDb::open(
            path,
            default_open_flags(config.read_only),
            config.vfs(),
            config.trace(),
        )?;
        db.set_extended_result_codes(config.extended_result_codes());
        if config.foreign_keys_enabled() {
            db.exec_pragma("PRAGMA foreign_keys = ON")?;
        }
        db.exec_pragma(&format!("PRAGMA busy_timeout = {}", config.busy_timeout_ms()))?;
        let serializer = ConnectionSerializer {
            identity: NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed),
            db,
            lock: Mutex::new(()),
            cache: Mutex::new(StatementCache::new(config.statement_cache_capacity)),
            tx_state: Mutex::new(TxState::Idle),
            config,
            observers: Mutex::new(Vec::new()),
            pending_region: Mutex::new(Region::empty()),
        };
        Ok(serializer)
    }

    /// Registers a weak observer reference; dead references are pruned
    /// opportunistically the next time a write is flushed.
    pub fn register_observer(&self, observer: Weak<dyn TransactionObserver>) {
        self.observers.lock().push(observer);
    }

    /// Folds `region` into the set of tables touched since the last flush.
    /// Inside a transaction this only accumulates; outside one (SQLite
    /// autocommits each statement) it flushes immediately, since that
    /// statement *is* its own commit.
    fn touch_region(&self, region: Region) {
        if region.is_empty() {
            return;
        }
        let in_transaction = *self.tx_state.lock() == TxState::Active;
        if in_transaction {
            let mut pending = self.pending_region.lock();
            *pending = std::mem::take(&mut *pending).union(region);
        } else {
            self.flush_region(region);
        }
    }

    fn flush_region(&self, region: Region) {
        if region.is_empty() {
            return;
        }
        let mut observers = self.observers.lock();
        observers.retain(|weak| weak.strong_count() > 0);
        for weak in observers.iter() {
            if let Some(observer) = weak.upgrade() {
                if observer.observed_region().intersects(&region) {
                    observer.notify_dirty();
                }
            }
        }
    }

    pub fn identity(&self) -> u64 {
        self.identity
    }

    fn is_on_own_dispatch(&self) -> bool {
        let key = self as *const _ as usize;
        ACTIVE.with(|stack| stack.borrow().contains(&key))
    }

    /// Runs `body` with exclusive access to the connection. If the caller
    /// is already dispatched on this serializer (a nested call), `body`
    /// runs inline; otherwise this blocks until the serial lock is free.
    pub fn in_database<R>(&self, body: impl FnOnce(&RawDb) -> Result<R, Error>) -> Result<R, Error> {
        if self.is_on_own_dispatch() {
            return body(&self.db);
        }
        let _span = tracing::debug_span!("db.serialize", label = %self.config.label()).entered();
        let _guard = self.lock.lock();
        let key = self as *const _ as usize;
        ACTIVE.with(|stack| stack.borrow_mut().push(key));
        let result = body(&self.db);
        ACTIVE.with(|stack| {
            stack.borrow_mut().pop();
        });
        result
    }

    /// Begins `kind`, runs `body`, and commits or rolls back according to
    /// its [`Completion`]. On return the connection is outside any
    /// transaction. Nested transaction calls are rejected.
    pub fn in_transaction(
        &self,
        kind: TransactionKind,
        body: impl FnOnce(&RawDb) -> Result<Completion, Error>,
    ) -> Result<(), Error> {
        self.in_database(|db| {
            {
                let mut state = self.tx_state.lock();
                if *state == TxState::Active {
                    return Err(Error::Programmer(
                        "nested transaction on the same connection serializer",
                    ));
                }
                *state = TxState::Active;
            }
            db.exec_pragma(kind.begin_sql())?;

            let body_result = body(db);
            let outcome = match body_result {
                Ok(Completion::Commit) => match db.exec_pragma("COMMIT") {
                    Ok(()) => {
                        let touched = std::mem::take(&mut *self.pending_region.lock());
                        self.flush_region(touched);
                        Ok(())
                    }
                    Err(commit_err) => {
                        if let Err(rollback_err) = db.exec_pragma("ROLLBACK") {
                            tracing::warn!(error = %rollback_err, "rollback after failed commit also failed");
                        }
                        *self.pending_region.lock() = Region::empty();
                        Err(commit_err)
                    }
                },
                Ok(Completion::Rollback) => {
                    if let Err(e) = db.exec_pragma("ROLLBACK") {
                        tracing::warn!(error = %e, "rollback failed");
                    }
                    *self.pending_region.lock() = Region::empty();
                    Ok(())
                }
                Err(body_err) => {
                    if let Err(rollback_err) = db.exec_pragma("ROLLBACK") {
                        tracing::warn!(error = %rollback_err, "rollback after failed transaction body also failed");
                    }
                    *self.pending_region.lock() = Region::empty();
                    Err(body_err)
                }
            };

            *self.tx_state.lock() = TxState::Idle;
            outcome
        })
    }

    /// `None` when the engine reports 0 (never inserted on this
    /// connection).
    pub fn last_inserted_rowid(&self) -> Option<i64> {
        let id = self.in_database(|db| Ok(db.last_insert_rowid())).unwrap_or(0);
        if id == 0 {
            None
        } else {
            Some(id)
        }
    }

    pub fn changes_count(&self) -> i64 {
        self.in_database(|db| Ok(db.changes())).unwrap_or(0)
    }

    pub fn is_autocommit(&self) -> bool {
        self.in_database(|db| Ok(db.is_autocommit())).unwrap_or(true)
    }

    /// Runs a statement with no expected result rows (DDL, or DML executed
    /// for its side effect).
    pub fn execute(&self, sql: &str, args: &Arguments) -> Result<(), Error> {
        self.in_database(|db| {
            let mut cache = self.cache.lock();
            let stmt = cache.get_or_prepare(db, sql, Region::empty)?;
            stmt.bind(args)?;
            stmt.cursor(db).detach_all()?;
            Ok(())
        })
    }

    /// Runs `sql` as a row-producing query, detaching every row.
    pub fn select(&self, sql: &str, args: &Arguments) -> Result<Vec<Row>, Error> {
        self.in_database(|db| {
            let mut cache = self.cache.lock();
            let stmt = cache.get_or_prepare(db, sql, Region::empty)?;
            stmt.bind(args)?;
            stmt.cursor(db).detach_all()
        })
    }

    /// Runs a live-row iteration, invoking `body` once per row with a
    /// borrow that cannot outlive the call.
    pub fn select_live(
        &self,
        sql: &str,
        args: &Arguments,
        mut body: impl FnMut(&Row) -> Result<(), Error>,
    ) -> Result<(), Error> {
        self.in_database(|db| {
            let mut cache = self.cache.lock();
            let stmt = cache.get_or_prepare(db, sql, Region::empty)?;
            stmt.bind(args)?;
            stmt.cursor(db).for_each_live(&mut body)
        })
    }

    /// Runs an UPDATE/INSERT/DELETE statement, returning the number of
    /// affected rows.
    pub fn update(&self, sql: &str, args: &Arguments) -> Result<i64, Error> {
        self.in_database(|db| {
            let mut cache = self.cache.lock();
            let stmt = cache.get_or_prepare(db, sql, Region::empty)?;
            stmt.bind(args)?;
            stmt.cursor(db).detach_all()?;
            Ok(db.changes())
        })
    }

    /// As [`ConnectionSerializer::execute`], but folds `region` into the
    /// set of tables touched by the current (or implicit autocommit)
    /// transaction, waking any observer whose region it overlaps. Used by
    /// the query compiler's write path, which always knows its region;
    /// raw-SQL callers that skip this stay invisible to observation.
    pub fn execute_tracked(&self, sql: &str, args: &Arguments, region: Region) -> Result<(), Error> {
        self.execute(sql, args)?;
        self.touch_region(region);
        Ok(())
    }

    /// As [`ConnectionSerializer::update`], tracking `region` the same way
    /// [`ConnectionSerializer::execute_tracked`] does.
    pub fn update_tracked(&self, sql: &str, args: &Arguments, region: Region) -> Result<i64, Error> {
        let changes = self.update(sql, args)?;
        self.touch_region(region);
        Ok(changes)
    }

    pub fn table_exists(&self, name: &str) -> Result<bool, Error> {
        let args = Arguments::positional([crate::value::Value::Text(name.to_owned())]);
        let rows = self.select(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            &args,
        )?;
        Ok(!rows.is_empty())
    }

    /// Drops every cached prepared statement. Called in response to a
    /// schema-change notification.
    pub fn invalidate_statement_cache(&self) {
        self.cache.lock().invalidate_all();
    }

    pub(crate) fn raw(&self) -> &RawDb {
        &self.db
    }

    pub(crate) fn prepared_statement_count(&self) -> usize {
        self.cache.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn open_memory() -> ConnectionSerializer {
        ConnectionSerializer::open(":memory:", Config::default()).unwrap()
    }

    #[test]
    fn execute_and_select_round_trip() {
        let conn = open_memory();
        conn.execute("CREATE TABLE t(id INTEGER, name TEXT)", &Arguments::new())
            .unwrap();
        conn.execute(
            "INSERT INTO t(id, name) VALUES (?, ?)",
            &Arguments::positional([Value::Integer(1), Value::Text("a".into())]),
        )
        .unwrap();
        let rows = conn.select("SELECT id, name FROM t", &Arguments::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value_named("name"), Some(Value::Text("a".into())));
        assert_eq!(conn.last_inserted_rowid(), Some(1));
    }

    #[test]
    fn transaction_rolls_back_on_body_error() {
        let conn = open_memory();
        conn.execute("CREATE TABLE t(id INTEGER)", &Arguments::new()).unwrap();
        let result = conn.in_transaction(TransactionKind::Immediate, |_db| {
            conn.execute(
                "INSERT INTO t(id) VALUES (1)",
                &Arguments::new(),
            )?;
            Err(Error::Programmer("fail on purpose"))
        });
        assert!(result.is_err());
        let rows = conn.select("SELECT id FROM t", &Arguments::new()).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn transaction_commits_when_body_asks() {
        let conn = open_memory();
        conn.execute("CREATE TABLE t(id INTEGER)", &Arguments::new()).unwrap();
        conn.in_transaction(TransactionKind::Immediate, |_db| {
            conn.execute("INSERT INTO t(id) VALUES (1)", &Arguments::new())?;
            Ok(Completion::Commit)
        })
        .unwrap();
        let rows = conn.select("SELECT id FROM t", &Arguments::new()).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn nested_transaction_is_rejected() {
        let conn = open_memory();
        let result = conn.in_transaction(TransactionKind::Deferred, |_db| {
            conn.in_transaction(TransactionKind::Deferred, |_db| Ok(Completion::Commit))
                .map(|_| Completion::Commit)
                .map_err(|_| Error::Programmer("nested"))
        });
        assert!(result.is_err());
    }

    #[test]
    fn nested_in_database_runs_inline() {
        let conn = open_memory();
        conn.execute("CREATE TABLE t(id INTEGER)", &Arguments::new()).unwrap();
        let result = conn.in_database(|_db| {
            // A nested call from the same dispatch identity must not deadlock.
            conn.in_database(|_db2| Ok(42))
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn table_exists_reflects_schema() {
        let conn = open_memory();
        assert!(!conn.table_exists("t").unwrap());
        conn.execute("CREATE TABLE t(id INTEGER)", &Arguments::new()).unwrap();
        assert!(conn.table_exists("t").unwrap());
    }
}
