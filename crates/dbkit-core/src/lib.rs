//! Connection lifecycle, statement cache, query compiler, and change
//! observation engine on top of SQLite.
//!
//! Layout, bottom to top: [`ffi`] is the only module touching raw C calls;
//! [`value`] and [`row`] describe what a column/row looks like;
//! [`statement`] turns SQL text into a cursor over those rows;
//! [`connection`] serializes access to one engine connection and owns its
//! statement cache; [`pool`] multiplexes many reader connections behind a
//! bounded semaphore; [`query`] compiles a [`query::QueryPlan`] into SQL a
//! connection can run; [`observe`] turns commits into a stream of reduced
//! values; [`queue`] composes a writer and a reader pool into the surface
//! most callers actually use.

mod ffi;

pub mod connection;
pub mod error;
pub mod observe;
pub mod pool;
pub mod query;
pub mod queue;
pub mod region;
pub mod row;
mod semaphore;
pub mod statement;
pub mod value;

pub use connection::{Builder, Completion, Config, ConnectionSerializer, TransactionKind};
pub use error::{Error, PoolError, Result};
pub use observe::{start as observe, ObservationHandle, Reducer};
pub use pool::{Pool, PoolGuard};
pub use query::{
    AggKind, Child, Compiled, Expr, JoinKind, OrderTerm, PrefetchDescriptor, Predicate, QueryPlan,
    Selectable, SortDirection, Source, SqlGenerator,
};
pub use queue::DatabaseQueue;
pub use region::{ChangeEvent, Extent, Region, TableRegion};
pub use row::{Row, RowAdapter, RowKind};
pub use statement::{Arguments, Cursor, Statement, StatementCache, StepState};
pub use value::{FromValue, ToValue, Value};
