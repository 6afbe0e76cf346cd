//! The user-facing façade: vends resultsets by source name, answers
//! metadata questions without I/O, and forwards schema-level operations to
//! the dispatcher.

use std::sync::Arc;

use serde_json::Value;

use asyncdb_db_common::error::{DbError, DbResult};
use asyncdb_db_common::{Backend, ColumnInfo, SourceInfo};
use asyncdb_settings::Settings;

use crate::dispatcher::Dispatcher;
use crate::payload::{BatchStep, Payload, TxnStep};
use crate::resultset::ResultSet;
use crate::stats::StatsSnapshot;

pub struct Schema {
    dispatcher: Dispatcher,
}

impl Schema {
    /// Build the dispatcher (spawning its worker pool) and wrap it.
    pub fn create(settings: Settings, backend: Arc<dyn Backend>) -> DbResult<Self> {
        Ok(Self {
            dispatcher: Dispatcher::create(settings, backend)?,
        })
    }

    pub fn from_dispatcher(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// A fresh, unrestricted resultset for a named source.
    pub fn resultset(&self, source: &str) -> DbResult<ResultSet> {
        if self.dispatcher.source_info(source).is_none() {
            return Err(DbError::source_not_found(source));
        }
        Ok(ResultSet::new(self.dispatcher.clone(), source.to_owned()))
    }

    /// Source names known to the schema. Metadata only, no I/O.
    pub fn sources(&self) -> Vec<String> {
        self.dispatcher.sources()
    }

    /// The result class registered for a source.
    pub fn class(&self, source: &str) -> Option<String> {
        self.dispatcher
            .source_info(source)
            .map(|info| info.result_class)
    }

    pub fn source_info(&self, source: &str) -> Option<SourceInfo> {
        self.dispatcher.source_info(source)
    }

    pub fn column_info(&self, source: &str, column: &str) -> Option<ColumnInfo> {
        self.dispatcher
            .source_info(source)?
            .column_info(column)
            .cloned()
    }

    pub async fn ping(&self) -> DbResult<String> {
        match self.dispatcher.call(Payload::Ping).await? {
            Value::String(s) => Ok(s),
            other => Err(DbError::internal(format!("unexpected ping reply: {}", other))),
        }
    }

    /// Delegate schema deployment to the underlying layer.
    pub async fn deploy(&self, args: Value) -> DbResult<Value> {
        self.dispatcher.call(Payload::Deploy { args }).await
    }

    /// Run an ordered list of named steps atomically on one worker.
    pub async fn txn_do(&self, steps: Vec<TxnStep>) -> DbResult<Value> {
        self.dispatcher.call(Payload::TxnDo { steps }).await
    }

    /// Run a batch of homogeneous write steps atomically on one worker.
    pub async fn txn_batch(&self, steps: Vec<BatchStep>) -> DbResult<Value> {
        self.dispatcher.call(Payload::TxnBatch { steps }).await
    }

    /// Open a transaction on whichever worker round-robin picks. Separate
    /// begin/commit/rollback calls are NOT pinned to one worker; prefer
    /// [`txn_do`](Self::txn_do) or [`txn_batch`](Self::txn_batch) unless the
    /// pool has a single worker.
    pub async fn txn_begin(&self) -> DbResult<Value> {
        self.dispatcher.call(Payload::TxnBegin).await
    }

    pub async fn txn_commit(&self) -> DbResult<Value> {
        self.dispatcher.call(Payload::TxnCommit).await
    }

    pub async fn txn_rollback(&self) -> DbResult<Value> {
        self.dispatcher.call(Payload::TxnRollback).await
    }

    pub async fn health_check(&self) {
        self.dispatcher.health_check().await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats()
    }

    pub async fn disconnect(&self) {
        self.dispatcher.disconnect().await
    }
}
