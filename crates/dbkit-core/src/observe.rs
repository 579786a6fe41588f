//! Change observation: reduces a sequence of commits touching a
//! [`Region`] into a sequence of delivered values.
//!
//! Dirty detection happens synchronously, on whichever thread commits a
//! transaction (see [`crate::connection::ConnectionSerializer::flush_region`]
//! via its `TransactionObserver` hook); the actual re-fetch and reduction
//! happen on a background task fed by an unbounded `tokio::sync::mpsc`
//! channel, one signal per affecting commit. A single-consumer channel
//! processed strictly in receive order is what gives delivery its ordering
//! guarantee even though reduction can take arbitrarily long per commit.

use std::sync::Arc;

use dbkit_cancel::{CancellationToken, CancellationTokenSource};
use tokio::sync::mpsc;

use crate::connection::{ConnectionSerializer, TransactionObserver};
use crate::error::Error;
use crate::region::Region;

/// The contract a reducer implements to turn re-fetches into delivered
/// values.
///
/// `fetch` is pure with respect to the reducer's own state (it may run on
/// a concurrent reader in a future revision; today it always runs against
/// the writer, see the module doc). `value` is where any stateful
/// deduplication happens: returning `None` suppresses delivery, which is
/// how "insert two rows in one transaction, deliver the new count once"
/// is implemented by a reducer that remembers its last emitted value.
pub trait Reducer: Send + 'static {
    type Fetched: Send;
    type Value: Send;

    fn fetch(&self, db: &ConnectionSerializer) -> Result<Self::Fetched, Error>;

    /// The first call (during [`start`]'s initial synchronous fetch) must
    /// return `Some`; later calls may return `None` to suppress delivery.
    fn value(&mut self, fetched: Self::Fetched) -> Option<Self::Value>;
}

struct ObserverCore {
    base_region: Region,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<()>,
}

impl TransactionObserver for ObserverCore {
    fn observed_region(&self) -> Region {
        self.base_region.clone()
    }

    fn notify_dirty(&self) {
        if self.token.is_cancelled() {
            return;
        }
        // A closed receiver means the background task has already exited
        // (e.g. the handle was dropped); nothing to wake.
        let _ = self.tx.send(());
    }
}

/// A running observation. Dropping this does not cancel it — the
/// background task keeps delivering until the writer itself is dropped,
/// matching the "observer removes itself from the writer on the next
/// write" framing; call [`ObservationHandle::cancel`] for an explicit stop.
pub struct ObservationHandle {
    core: Arc<ObserverCore>,
    source: CancellationTokenSource,
}

impl ObservationHandle {
    /// Cancels the observation. Idempotent; in-flight reductions complete
    /// but their result is discarded rather than delivered.
    pub fn cancel(&self) {
        self.source.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.token.is_cancelled()
    }
}

/// Registers `reducer` on `writer`, delivers its initial value
/// synchronously, and returns a handle controlling the subscription.
///
/// `on_value`/`on_error` run on the background delivery task, never on the
/// thread that committed the write that triggered them.
pub fn start<R: Reducer>(
    writer: Arc<ConnectionSerializer>,
    mut reducer: R,
    base_region: Region,
    on_value: impl Fn(R::Value) + Send + Sync + 'static,
    on_error: impl Fn(Error) + Send + Sync + 'static,
) -> Result<ObservationHandle, Error> {
    let fetched = reducer.fetch(&writer)?;
    if let Some(value) = reducer.value(fetched) {
        on_value(value);
    }

    let source = CancellationTokenSource::new();
    let token = source.token();
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    let core = Arc::new(ObserverCore {
        base_region,
        token: token.clone(),
        tx,
    });
    let core_weak: std::sync::Weak<dyn TransactionObserver> = Arc::downgrade(&core);
    writer.register_observer(core_weak);

    let task_token = token.clone();
    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            if task_token.is_cancelled() {
                continue;
            }
            match reducer.fetch(&writer) {
                Ok(fetched) => {
                    if let Some(value) = reducer.value(fetched) {
                        if !task_token.is_cancelled() {
                            on_value(value);
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "observation reducer failed");
                    on_error(err);
                }
            }
        }
    });

    Ok(ObservationHandle { core, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Completion, Config, TransactionKind};
    use crate::statement::Arguments;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountReducer {
        last: Option<i64>,
    }

    impl Reducer for CountReducer {
        type Fetched = i64;
        type Value = i64;

        fn fetch(&self, db: &ConnectionSerializer) -> Result<i64, Error> {
            let rows = db.select("SELECT COUNT(*) AS n FROM player", &Arguments::new())?;
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
    async fn delivers_initial_value_then_once_per_affecting_commit() {
        let writer = Arc::new(ConnectionSerializer::open(":memory:", Config::default()).unwrap());
        writer
            .execute("CREATE TABLE player(id INTEGER)", &Arguments::new())
            .unwrap();

        let deliveries = Arc::new(std::sync::Mutex::new(Vec::new()));
        let deliveries_for_value = Arc::clone(&deliveries);
        let error_count = Arc::new(AtomicUsize::new(0));
        let error_count_for_cb = Arc::clone(&error_count);

        let handle = start(
            Arc::clone(&writer),
            CountReducer { last: None },
            Region::full_table("player"),
            move |v| deliveries_for_value.lock().unwrap().push(v),
            move |_| {
                error_count_for_cb.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        assert!(!handle.is_cancelled());

        writer
            .update_tracked(
                "INSERT INTO player(id) VALUES (1)",
                &Arguments::new(),
                Region::full_table("player"),
            )
            .unwrap();

        writer
            .in_transaction(TransactionKind::Immediate, |_db| {
                writer.execute_tracked(
                    "INSERT INTO player(id) VALUES (2)",
                    &Arguments::new(),
                    Region::full_table("player"),
                )?;
                writer.execute_tracked(
                    "INSERT INTO player(id) VALUES (3)",
                    &Arguments::new(),
                    Region::full_table("player"),
                )?;
                Ok(Completion::Commit)
            })
            .unwrap();

        writer
            .in_transaction(TransactionKind::Immediate, |_db| {
                writer.execute_tracked(
                    "INSERT INTO player(id) VALUES (4)",
                    &Arguments::new(),
                    Region::full_table("player"),
                )?;
                Ok(Completion::Rollback)
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;

        let values = deliveries.lock().unwrap().clone();
        assert_eq!(values, vec![0, 1, 3]);
        assert_eq!(error_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_is_idempotent() {
        let writer = Arc::new(ConnectionSerializer::open(":memory:", Config::default()).unwrap());
        writer
            .execute("CREATE TABLE player(id INTEGER)", &Arguments::new())
            .unwrap();
        let handle = start(
            writer,
            CountReducer { last: None },
            Region::full_table("player"),
            |_: i64| {},
            |_| {},
        )
        .unwrap();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
