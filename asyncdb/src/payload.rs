//! The serializable request handed to a worker. One variant per operation
//! tag; the tag is what shows up in trace logs and metric tags.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use asyncdb_db_common::error::DbResult;
use asyncdb_db_common::{Cond, QueryAttrs, Record};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Payload {
    Count {
        source_name: String,
        #[serde(default)]
        cond: Cond,
        #[serde(default)]
        attrs: QueryAttrs,
    },
    Sum {
        source_name: String,
        column: String,
        #[serde(default)]
        cond: Cond,
        #[serde(default)]
        attrs: QueryAttrs,
    },
    Max {
        source_name: String,
        column: String,
        #[serde(default)]
        cond: Cond,
        #[serde(default)]
        attrs: QueryAttrs,
    },
    Min {
        source_name: String,
        column: String,
        #[serde(default)]
        cond: Cond,
        #[serde(default)]
        attrs: QueryAttrs,
    },
    Avg {
        source_name: String,
        column: String,
        #[serde(default)]
        cond: Cond,
        #[serde(default)]
        attrs: QueryAttrs,
    },
    Search {
        source_name: String,
        #[serde(default)]
        cond: Cond,
        #[serde(default)]
        attrs: QueryAttrs,
    },
    All {
        source_name: String,
        #[serde(default)]
        cond: Cond,
        #[serde(default)]
        attrs: QueryAttrs,
    },
    Find {
        source_name: String,
        query: Value,
        #[serde(default)]
        attrs: QueryAttrs,
    },
    Create {
        source_name: String,
        data: Record,
    },
    Update {
        source_name: String,
        #[serde(default)]
        cond: Cond,
        updates: Record,
    },
    Delete {
        source_name: String,
        #[serde(default)]
        cond: Cond,
    },
    Populate {
        source_name: String,
        data: Vec<Record>,
    },
    PopulateBulk {
        source_name: String,
        data: Vec<Record>,
    },
    Deploy {
        #[serde(default)]
        args: Value,
    },
    TxnBatch {
        steps: Vec<BatchStep>,
    },
    TxnDo {
        steps: Vec<TxnStep>,
    },
    TxnBegin,
    TxnCommit,
    TxnRollback,
    Ping,
    HealthCheck,
}

impl Payload {
    pub fn operation(&self) -> &'static str {
        match self {
            Payload::Count { .. } => "count",
            Payload::Sum { .. } => "sum",
            Payload::Max { .. } => "max",
            Payload::Min { .. } => "min",
            Payload::Avg { .. } => "avg",
            Payload::Search { .. } => "search",
            Payload::All { .. } => "all",
            Payload::Find { .. } => "find",
            Payload::Create { .. } => "create",
            Payload::Update { .. } => "update",
            Payload::Delete { .. } => "delete",
            Payload::Populate { .. } => "populate",
            Payload::PopulateBulk { .. } => "populate_bulk",
            Payload::Deploy { .. } => "deploy",
            Payload::TxnBatch { .. } => "txn_batch",
            Payload::TxnDo { .. } => "txn_do",
            Payload::TxnBegin => "txn_begin",
            Payload::TxnCommit => "txn_commit",
            Payload::TxnRollback => "txn_rollback",
            Payload::Ping => "ping",
            Payload::HealthCheck => "health_check",
        }
    }

    fn attrs(&self) -> Option<&QueryAttrs> {
        match self {
            Payload::Count { attrs, .. }
            | Payload::Sum { attrs, .. }
            | Payload::Max { attrs, .. }
            | Payload::Min { attrs, .. }
            | Payload::Avg { attrs, .. }
            | Payload::Search { attrs, .. }
            | Payload::All { attrs, .. }
            | Payload::Find { attrs, .. } => Some(attrs),
            _ => None,
        }
    }

    /// Read-only operations opt into the query cache with `attrs.cache`.
    pub fn is_cacheable(&self) -> bool {
        self.attrs()
            .map(|attrs| attrs.cache == Some(true))
            .unwrap_or(false)
    }

    pub fn cache_key(&self) -> DbResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Update,
    Create,
    Delete,
    Raw,
}

/// One step of a `txn_batch` call.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct BatchStep {
    #[serde(rename = "type")]
    pub kind: BatchAction,
    pub resultset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bind: Vec<Value>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TxnAction {
    Create,
    Find,
    Update,
    Raw,
}

/// One step of a `txn_do` call. Steps with a `name` publish their result id
/// into the per-transaction register for later steps to reference.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TxnStep {
    pub action: TxnAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resultset: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bind: Vec<Value>,
}
