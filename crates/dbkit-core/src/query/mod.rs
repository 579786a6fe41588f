//! The query compiler: a small relational algebra that lowers a
//! [`plan::QueryPlan`] tree into parameterized SQL, an accompanying
//! [`crate::row::RowAdapter`], and an estimated read [`crate::region::Region`].

pub mod generator;
pub mod plan;
pub mod prefetch;

pub use generator::{Compiled, SqlGenerator};
pub use plan::*;
