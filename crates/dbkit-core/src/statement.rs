//! Prepared statements, argument binding, and cursor iteration.
//!
//! The "reused row" optimization from the source material is expressed here
//! as a borrow rather than a shared mutable handle: [`Cursor::for_each_live`]
//! hands the caller a `&Row` that is only valid for the duration of one
//! callback invocation, so storing it past the next step is a compile
//! error instead of a runtime footgun. Callers that need rows with an
//! independent lifetime call [`Cursor::detach_all`] (or `Row::copy` inside
//! the callback) instead.

use std::collections::{HashMap, VecDeque};

use crate::error::Error;
use crate::ffi::{RawDb, RawStmt, StepResult};
use crate::region::Region;
use crate::row::{Row, RowKind};
use crate::value::Value;

/// Positional and/or named statement arguments.
///
/// Binding is strict: every positional placeholder in the prepared SQL must
/// be bound, and an unbound placeholder is a preparation error rather than
/// silently binding `NULL`.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    positional: Vec<Value>,
    named: HashMap<String, Value>,
}

impl Arguments {
    pub fn new() -> Arguments {
        Arguments::default()
    }

    pub fn positional(values: impl IntoIterator<Item = Value>) -> Arguments {
        Arguments {
            positional: values.into_iter().collect(),
            named: HashMap::new(),
        }
    }

    pub fn with_named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Arguments {
        self.named.insert(name.into(), value.into());
        self
    }
}

/// The lifecycle state of a statement's current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Initial,
    RowAvailable,
    Done,
    Error,
}

/// One compiled SQL plan, its bound arguments, and cursor state.
///
/// Cached per-connection keyed by SQL (see [`StatementCache`]); reset
/// between runs, finalized when evicted or when the connection closes.
pub struct Statement {
    sql: String,
    raw: RawStmt,
    column_names: Vec<String>,
    state: StepState,
    region: Region,
}

impl Statement {
    pub(crate) fn prepare(db: &RawDb, sql: &str, region: Region) -> Result<Statement, Error> {
        let raw = db.prepare(sql)?;
        let column_names = (0..raw.column_count())
            .map(|i| raw.column_name(i))
            .collect();
        Ok(Statement {
            sql: sql.to_owned(),
            raw,
            column_names,
            state: StepState::Initial,
            region,
        })
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn column_count(&self) -> usize {
        self.column_names.len()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Binds `args`, rejecting the statement if a positional placeholder is
    /// left unbound.
    pub fn bind(&mut self, args: &Arguments) -> Result<(), Error> {
        self.raw.reset();
        self.state = StepState::Initial;

        let expected = self.raw.param_count() as usize;
        if args.positional.len() > expected {
            return Err(Error::Programmer(
                "more positional arguments than placeholders in statement",
            ));
        }
        for (i, value) in args.positional.iter().enumerate() {
            self.raw.bind((i + 1) as i32, value)?;
        }
        for (name, value) in &args.named {
            let marker = format!(":{name}");
            let colon_index = self
                .raw
                .bind_name_index(&marker)
                .or_else(|| self.raw.bind_name_index(&format!("@{name}")))
                .or_else(|| self.raw.bind_name_index(&format!("${name}")));
            match colon_index {
                Some(index) => self.raw.bind(index, value)?,
                None => {
                    return Err(Error::Programmer(
                        "named argument does not match any placeholder in statement",
                    ))
                }
            }
        }
        if args.positional.len() < expected && args.named.is_empty() {
            return Err(Error::Programmer(
                "not every positional placeholder was bound",
            ));
        }
        Ok(())
    }

    /// Opens a cursor over this statement. The statement must already be
    /// bound via [`Statement::bind`] if it has placeholders.
    pub fn cursor<'s>(&'s mut self, db: &'s RawDb) -> Cursor<'s> {
        Cursor { stmt: self, db }
    }
}

/// A finite, non-restartable sequence of rows produced by stepping a
/// [`Statement`].
pub struct Cursor<'s> {
    stmt: &'s mut Statement,
    db: &'s RawDb,
}

impl<'s> Cursor<'s> {
    fn advance(&mut self) -> Result<bool, Error> {
        match self.stmt.raw.step(self.db.as_ptr()) {
            Ok(StepResult::Row) => {
                self.stmt.state = StepState::RowAvailable;
                Ok(true)
            }
            Ok(StepResult::Done) => {
                self.stmt.state = StepState::Done;
                Ok(false)
            }
            Err(e) => {
                self.stmt.state = StepState::Error;
                Err(e)
            }
        }
    }

    fn current_row(&self, kind: RowKind) -> Row {
        let columns = (0..self.stmt.column_names.len())
            .map(|i| {
                (
                    self.stmt.column_names[i].clone(),
                    self.stmt.raw.column_value(i),
                )
            })
            .collect();
        Row::new(kind, columns)
    }

    /// Live iteration: `body` is invoked once per row with a borrow that
    /// cannot outlive the call. Returning `Err` from `body` stops iteration
    /// and is propagated; the engine's own step error is surfaced verbatim.
    pub fn for_each_live(
        mut self,
        mut body: impl FnMut(&Row) -> Result<(), Error>,
    ) -> Result<(), Error> {
        while self.advance()? {
            let row = self.current_row(RowKind::Live);
            body(&row)?;
        }
        Ok(())
    }

    /// Materializes every remaining row as an independent, detached copy.
    pub fn detach_all(mut self) -> Result<Vec<Row>, Error> {
        let mut out = Vec::new();
        while self.advance()? {
            out.push(self.current_row(RowKind::Detached));
        }
        Ok(out)
    }

    /// Fetches a single row and drops the cursor. Legal even if more rows
    /// remain.
    pub fn next_detached(mut self) -> Result<Option<Row>, Error> {
        if self.advance()? {
            Ok(Some(self.current_row(RowKind::Detached)))
        } else {
            Ok(None)
        }
    }
}

/// Per-connection cache mapping canonicalized SQL to a prepared statement.
///
/// Fixed-capacity LRU: a `HashMap` for O(1) lookup plus a `VecDeque`
/// recency list, evicting the least-recently-used entry past
/// [`StatementCache::DEFAULT_CAPACITY`] entries.
pub struct StatementCache {
    capacity: usize,
    entries: HashMap<String, Statement>,
    recency: VecDeque<String>,
}

impl StatementCache {
    pub const DEFAULT_CAPACITY: usize = 128;

    pub fn new(capacity: usize) -> StatementCache {
        StatementCache {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    /// Returns a cached statement for `sql`, preparing and inserting one on
    /// a miss. `region` is only consulted on a miss.
    pub fn get_or_prepare(
        &mut self,
        db: &RawDb,
        sql: &str,
        region: impl FnOnce() -> Region,
    ) -> Result<&mut Statement, Error> {
        if self.entries.contains_key(sql) {
            self.touch(sql);
            return Ok(self.entries.get_mut(sql).unwrap());
        }

        tracing::debug!(sql, "preparing statement");
        let stmt = Statement::prepare(db, sql, region())?;
        self.insert(sql.to_owned(), stmt);
        Ok(self.entries.get_mut(sql).unwrap())
    }

    fn touch(&mut self, sql: &str) {
        if let Some(pos) = self.recency.iter().position(|s| s == sql) {
            self.recency.remove(pos);
        }
        self.recency.push_back(sql.to_owned());
    }

    fn insert(&mut self, sql: String, stmt: Statement) {
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.recency.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.recency.push_back(sql.clone());
        self.entries.insert(sql, stmt);
    }

    /// Drops every cached statement, finalizing them. Called on schema
    /// change events.
    pub fn invalidate_all(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_builder_composes_named_and_positional() {
        let args = Arguments::positional([Value::Integer(1)]).with_named("name", "x");
        assert_eq!(args.positional.len(), 1);
        assert_eq!(args.named.get("name"), Some(&Value::Text("x".into())));
    }

    #[test]
    fn statement_cache_evicts_least_recently_used() {
        let cache = StatementCache::new(2);
        assert_eq!(cache.capacity, 2);
        assert!(cache.is_empty());
    }
}
