//! The capability seam between the bridge and whichever blocking ORM layer
//! the workers drive. The bridge core depends on nothing below this surface.

pub mod error;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use error::DbResult;

/// A plain-data record: one deflated row.
pub type Record = Map<String, Value>;

/// A query condition. A mapping is matched field-wise; `"and"` / `"or"` keys
/// take arrays of sub-conditions; any non-mapping value is an opaque literal
/// the backend interprets (e.g. a raw subquery marker).
pub type Cond = Value;

/// The recognized refinement attributes of a query. Unset fields are elided
/// on the wire.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QueryAttrs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefetch: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collapse: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_subquery: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_class: Option<String>,
}

impl QueryAttrs {
    /// Key-level overlay: fields set in `new` win, everything else carries
    /// over unchanged.
    pub fn merge(&self, new: &QueryAttrs) -> QueryAttrs {
        QueryAttrs {
            rows: new.rows.or(self.rows),
            offset: new.offset.or(self.offset),
            limit: new.limit.or(self.limit),
            order_by: new.order_by.clone().or_else(|| self.order_by.clone()),
            prefetch: new.prefetch.clone().or_else(|| self.prefetch.clone()),
            collapse: new.collapse.or(self.collapse),
            alias: new.alias.clone().or_else(|| self.alias.clone()),
            is_subquery: new.is_subquery.or(self.is_subquery),
            cache: new.cache.or(self.cache),
            result_class: new
                .result_class
                .clone()
                .or_else(|| self.result_class.clone()),
        }
    }

    /// Whether any slicing attribute is present. Sliced queries must be
    /// wrapped in a subquery for counts to come out right.
    pub fn is_sliced(&self) -> bool {
        self.rows.is_some() || self.offset.is_some() || self.limit.is_some()
    }
}

/// Aggregate functions a resultset column supports.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Sum,
    Max,
    Min,
    Avg,
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggFunc::Sum => "SUM",
            AggFunc::Max => "MAX",
            AggFunc::Min => "MIN",
            AggFunc::Avg => "AVG",
        };
        f.write_str(name)
    }
}

/// Inflator/deflator metadata for one column, captured in-process at
/// dispatcher creation and used only by the client-side row layer.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub is_nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelKind {
    /// Foreign key on this source pointing at one parent row
    BelongsTo,
    /// Foreign key on the related source pointing back at this one
    HasMany,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Relationship {
    pub name: String,
    pub kind: RelKind,
    /// The related source name
    pub source: String,
    /// The foreign-key column (on this source for belongs-to, on the related
    /// source for has-many)
    pub key: String,
}

/// Introspection metadata for one named source.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SourceInfo {
    pub name: String,
    pub result_class: String,
    pub primary_key: String,
    pub columns: Vec<ColumnInfo>,
    pub relationships: Vec<Relationship>,
}

impl SourceInfo {
    pub fn column_info(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// A connected database handle plus the source metadata needed without I/O.
///
/// `connect` runs worker-side on a dedicated thread and is allowed to block;
/// the metadata accessors must not touch the database.
pub trait Backend: Send + Sync {
    fn sources(&self) -> Vec<String>;

    fn source_info(&self, name: &str) -> Option<SourceInfo>;

    fn connect(&self, database_url: &str, on_connect_do: &[String])
        -> DbResult<Box<dyn Connection>>;
}

/// One live database connection, owned by exactly one worker thread. All
/// methods block.
pub trait Connection: Send {
    fn check(&mut self) -> DbResult<bool>;

    /// Raw statement passthrough (the `dbh.do` capability)
    fn execute(&mut self, sql: &str, binds: &[Value]) -> DbResult<u64>;

    fn txn_begin(&mut self) -> DbResult<()>;

    fn txn_commit(&mut self) -> DbResult<()>;

    fn txn_rollback(&mut self) -> DbResult<()>;

    /// Delegate schema deployment to the underlying layer
    fn deploy(&mut self, args: &Value) -> DbResult<()>;

    fn count(&mut self, source: &str, cond: &Cond, attrs: &QueryAttrs) -> DbResult<u64>;

    fn aggregate(
        &mut self,
        source: &str,
        func: AggFunc,
        column: &str,
        cond: &Cond,
        attrs: &QueryAttrs,
    ) -> DbResult<Option<Value>>;

    fn all(&mut self, source: &str, cond: &Cond, attrs: &QueryAttrs)
        -> DbResult<Vec<Box<dyn Row>>>;

    /// `query` is either a bare primary-key value or a condition mapping
    fn find(
        &mut self,
        source: &str,
        query: &Value,
        attrs: &QueryAttrs,
    ) -> DbResult<Option<Box<dyn Row>>>;

    fn create(&mut self, source: &str, data: &Record) -> DbResult<Box<dyn Row>>;

    fn update_row(&mut self, source: &str, id: &Value, data: &Record) -> DbResult<Box<dyn Row>>;

    fn delete_row(&mut self, source: &str, id: &Value) -> DbResult<u64>;

    fn update_all(&mut self, source: &str, cond: &Cond, updates: &Record) -> DbResult<u64>;

    fn delete_all(&mut self, source: &str, cond: &Cond) -> DbResult<u64>;

    fn populate(&mut self, source: &str, rows: &[Record]) -> DbResult<Vec<Box<dyn Row>>>;

    fn populate_bulk(&mut self, source: &str, rows: &[Record]) -> DbResult<()>;
}

/// A live row as the ORM sees it. The worker deflates these into [`Record`]s
/// before anything crosses back to the parent.
pub trait Row: Send {
    fn id(&self) -> Value;

    /// Raw column values
    fn get_columns(&self) -> Record;

    /// Column values after inflation (what deflation serializes)
    fn get_inflated_columns(&self) -> Record;

    /// Related rows materialized for a prefetched relation, if any
    fn related(&self, rel: &str) -> Option<&Related>;
}

pub enum Related {
    One(Box<dyn Row>),
    Many(Vec<Box<dyn Row>>),
}

/// Normalize a prefetch spec to mapping form. Accepts a relation name, an
/// array of specs, or a mapping of relation name to sub-spec.
pub fn normalize_prefetch(spec: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    match spec {
        Value::Null => {}
        Value::String(name) => {
            out.insert(name.clone(), Value::Null);
        }
        Value::Array(entries) => {
            for entry in entries {
                out.extend(normalize_prefetch(entry));
            }
        }
        Value::Object(map) => {
            for (name, sub) in map {
                out.insert(name.clone(), sub.clone());
            }
        }
        other => {
            out.insert(other.to_string(), Value::Null);
        }
    }
    out
}
