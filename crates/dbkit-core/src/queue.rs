//! [`DatabaseQueue`]: a single writer connection plus a bounded [`Pool`] of
//! reader connections opened against the same database file.

use std::sync::Arc;

use crate::connection::{Completion, Config, ConnectionSerializer, TransactionKind};
use crate::error::Error;
use crate::pool::Pool;

/// Wraps one writer [`ConnectionSerializer`] and a pool of read-only reader
/// connections against the same database file.
///
/// Readers run independent read transactions that can proceed in parallel
/// with at most one concurrent writer, per the engine's own WAL/journal
/// isolation; a reader sees a snapshot taken at the start of its
/// transaction.
pub struct DatabaseQueue {
    writer: Arc<ConnectionSerializer>,
    readers: Pool<ConnectionSerializer>,
}

impl DatabaseQueue {
    pub fn open(path: &str, writer_config: Config, max_readers: usize) -> Result<DatabaseQueue, Error> {
        let writer = Arc::new(ConnectionSerializer::open(path, writer_config)?);
        let reader_path = path.to_owned();
        let reader_label = format!("{}-reader", writer.identity());
        let readers = Pool::new(max_readers.max(1), move || {
            let mut builder = crate::connection::Builder::new();
            builder.read_only(true).label(reader_label.clone());
            ConnectionSerializer::open(&reader_path, builder.build())
        });
        Ok(DatabaseQueue { writer, readers })
    }

    /// Opens a queue over an in-memory database. Readers share no state
    /// with the writer (SQLite's `:memory:` databases are per-connection),
    /// so `max_readers` is accepted but effectively capped at 1: use a
    /// temp-file database in tests that need concurrent readers.
    pub fn open_in_memory(writer_config: Config) -> Result<DatabaseQueue, Error> {
        DatabaseQueue::open(":memory:", writer_config, 1)
    }

    pub fn writer(&self) -> &ConnectionSerializer {
        &self.writer
    }

    pub fn writer_arc(&self) -> Arc<ConnectionSerializer> {
        self.writer.clone()
    }

    /// Runs `body` against a pooled reader connection.
    pub fn read<R>(&self, body: impl FnOnce(&ConnectionSerializer) -> Result<R, Error>) -> Result<R, Error> {
        let guard = self.readers.get()?;
        body(&guard)
    }

    /// Runs `body` against the writer connection, outside of an explicit
    /// transaction (SQLite autocommits each statement).
    pub fn write<R>(&self, body: impl FnOnce(&ConnectionSerializer) -> Result<R, Error>) -> Result<R, Error> {
        body(&self.writer)
    }

    /// Runs `body` against the writer connection inside a transaction of
    /// the given kind.
    pub fn write_in_transaction(
        &self,
        kind: TransactionKind,
        body: impl FnOnce(&ConnectionSerializer) -> Result<Completion, Error>,
    ) -> Result<(), Error> {
        self.writer
            .in_transaction(kind, |_db| body(&self.writer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::Arguments;
    use crate::value::Value;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_through_separate_connections() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let queue = DatabaseQueue::open(path, Config::default(), 2).unwrap();

        queue
            .write(|db| db.execute("CREATE TABLE t(id INTEGER)", &Arguments::new()))
            .unwrap();
        queue
            .write_in_transaction(TransactionKind::Immediate, |db| {
                db.execute(
                    "INSERT INTO t(id) VALUES (?)",
                    &Arguments::positional([Value::Integer(1)]),
                )?;
                Ok(Completion::Commit)
            })
            .unwrap();

        let rows = queue
            .read(|db| db.select("SELECT id FROM t", &Arguments::new()))
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
