//! An asynchronous bridge over a blocking database layer.
//!
//! Callers compose queries through an immutable [`ResultSet`] and await the
//! terminal operations; the [`Dispatcher`] hands each call to one of a pool
//! of worker threads, each owning a single long-lived connection to the
//! underlying database layer. Results cross back as plain data only.

#[macro_use]
extern crate slog_scope;

mod cache;
mod deflate;
mod dispatcher;
mod payload;
mod resultset;
mod schema;
mod stats;
mod txn;
mod worker;

pub use cache::{QueryCache, TtlCache};
pub use dispatcher::Dispatcher;
pub use payload::{BatchAction, BatchStep, Payload, TxnAction, TxnStep};
pub use resultset::{Pager, ResultSet};
pub use schema::Schema;
pub use stats::StatsSnapshot;

pub use asyncdb_db_common::error::{DbError, DbErrorIntrospect, DbResult};
pub use asyncdb_db_common::{
    AggFunc, Backend, ColumnInfo, Cond, Connection, QueryAttrs, Record, RelKind, Related,
    Relationship, Row, SourceInfo,
};
pub use asyncdb_settings::{RetrySettings, Settings};
