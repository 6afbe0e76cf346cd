//! A lazy, immutable query specification. Refinements clone; terminal
//! operations build a payload and hand it to the dispatcher.

use serde_json::{Map, Value};

use asyncdb_db_common::error::{DbError, DbResult};
use asyncdb_db_common::{Cond, QueryAttrs, Record};

use crate::dispatcher::Dispatcher;
use crate::payload::Payload;

static DEFAULT_PAGE_ROWS: u64 = 10;
static SUBQUERY_ALIAS: &str = "subquery_for_count";

#[derive(Clone)]
pub struct ResultSet {
    dispatcher: Dispatcher,
    source_name: String,
    cond: Cond,
    attrs: QueryAttrs,
    result_class: Option<String>,
}

impl ResultSet {
    pub(crate) fn new(dispatcher: Dispatcher, source_name: String) -> Self {
        Self {
            dispatcher,
            source_name,
            cond: Value::Null,
            attrs: QueryAttrs::default(),
            result_class: None,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn cond(&self) -> &Cond {
        &self.cond
    }

    pub fn attrs(&self) -> &QueryAttrs {
        &self.attrs
    }

    /// Refine the condition. Two mapping conds combine under an `and`
    /// wrapper; a literal (non-mapping) cond replaces the existing one; an
    /// empty existing cond is simply superseded. Slicing state (`rows`)
    /// resets unless the refinement carries its own.
    pub fn search(&self, cond: Cond) -> ResultSet {
        self.search_with_attrs(cond, QueryAttrs::default())
    }

    /// [`search`](Self::search) plus a key-level attrs overlay (new wins).
    pub fn search_with_attrs(&self, cond: Cond, attrs: QueryAttrs) -> ResultSet {
        let mut next = self.clone();
        next.cond = merge_cond(&self.cond, cond);
        next.attrs = self.attrs.merge(&attrs);
        next.attrs.rows = attrs.rows;
        next
    }

    /// The effective result class: the override if set, otherwise the
    /// schema's default for this source.
    pub fn result_class(&self) -> Option<String> {
        self.result_class.clone().or_else(|| {
            self.dispatcher
                .source_info(&self.source_name)
                .map(|info| info.result_class)
        })
    }

    pub fn with_result_class(&self, name: &str) -> ResultSet {
        let mut next = self.clone();
        next.result_class = Some(name.to_owned());
        next
    }

    pub fn rows(&self, rows: u64) -> ResultSet {
        let mut next = self.clone();
        next.attrs.rows = Some(rows);
        next
    }

    pub fn order_by(&self, spec: Value) -> ResultSet {
        let mut next = self.clone();
        next.attrs.order_by = Some(spec);
        next
    }

    /// Jump to a 1-based page. Page size is the current `rows` attr, default
    /// 10.
    pub fn page(&self, page: u64) -> ResultSet {
        let page = page.max(1);
        let rows = self.attrs.rows.unwrap_or(DEFAULT_PAGE_ROWS);
        let mut next = self.clone();
        next.attrs.rows = Some(rows);
        next.attrs.offset = Some((page - 1) * rows);
        next
    }

    /// Select rows `first..=last` (0-based). Bounds are validated here,
    /// before anything reaches a worker.
    pub fn slice(&self, first: i64, last: i64) -> DbResult<ResultSet> {
        if first < 0 || last < first {
            return Err(DbError::invalid_param(format!(
                "invalid slice bounds: {}..{}",
                first, last
            )));
        }
        let mut next = self.clone();
        next.attrs.offset = Some(first as u64);
        next.attrs.rows = Some((last - first + 1) as u64);
        Ok(next)
    }

    /// Pager view derived from the current slicing attrs.
    pub fn pager(&self) -> Pager {
        let rows = self.attrs.rows.unwrap_or(DEFAULT_PAGE_ROWS);
        let page = self.attrs.offset.unwrap_or(0) / rows.max(1) + 1;
        Pager {
            base: self.clone(),
            rows_per_page: rows,
            current_page: page,
        }
    }

    /// The worker payload body for this resultset. Sliced queries get the
    /// subquery alias stamped (unless the caller set their own) so counts
    /// over them come out as `COUNT(*) FROM (…)`.
    fn build_attrs(&self) -> QueryAttrs {
        let mut attrs = self.attrs.clone();
        if let Some(result_class) = &self.result_class {
            attrs.result_class = Some(result_class.clone());
        }
        if attrs.is_sliced() {
            attrs.alias.get_or_insert_with(|| SUBQUERY_ALIAS.to_owned());
            attrs.is_subquery.get_or_insert(true);
        }
        attrs
    }

    pub async fn all(&self) -> DbResult<Vec<Record>> {
        let value = self
            .dispatcher
            .call(Payload::Search {
                source_name: self.source_name.clone(),
                cond: self.cond.clone(),
                attrs: self.build_attrs(),
            })
            .await?;
        records_from(value)
    }

    pub async fn count(&self) -> DbResult<u64> {
        let value = self
            .dispatcher
            .call(Payload::Count {
                source_name: self.source_name.clone(),
                cond: self.cond.clone(),
                attrs: self.build_attrs(),
            })
            .await?;
        parse_count(value)
    }

    /// Count over the unsliced base resultset.
    pub async fn count_total(&self) -> DbResult<u64> {
        let mut base = self.clone();
        base.attrs.rows = None;
        base.attrs.offset = None;
        base.attrs.limit = None;
        base.attrs.alias = None;
        base.attrs.is_subquery = None;
        base.count().await
    }

    pub async fn find(&self, query: Value) -> DbResult<Option<Record>> {
        let value = self
            .dispatcher
            .call(Payload::Find {
                source_name: self.source_name.clone(),
                query,
                attrs: self.build_attrs(),
            })
            .await?;
        match value {
            Value::Null => Ok(None),
            Value::Object(record) => Ok(Some(record)),
            other => Err(DbError::internal(format!(
                "find returned a non-record: {}",
                other
            ))),
        }
    }

    pub async fn create(&self, data: Record) -> DbResult<Record> {
        let value = self
            .dispatcher
            .call(Payload::Create {
                source_name: self.source_name.clone(),
                data,
            })
            .await?;
        match value {
            Value::Object(record) => Ok(record),
            other => Err(DbError::internal(format!(
                "create returned a non-record: {}",
                other
            ))),
        }
    }

    /// Apply `updates` to every matching row. An empty updates map completes
    /// with 0 without any worker roundtrip.
    pub async fn update(&self, updates: Record) -> DbResult<u64> {
        if updates.is_empty() {
            return Ok(0);
        }
        let value = self
            .dispatcher
            .call(Payload::Update {
                source_name: self.source_name.clone(),
                cond: self.cond.clone(),
                updates,
            })
            .await?;
        parse_affected(value)
    }

    pub async fn delete(&self) -> DbResult<u64> {
        let value = self
            .dispatcher
            .call(Payload::Delete {
                source_name: self.source_name.clone(),
                cond: self.cond.clone(),
            })
            .await?;
        parse_affected(value)
    }

    pub async fn populate(&self, data: Vec<Record>) -> DbResult<Vec<Record>> {
        let value = self
            .dispatcher
            .call(Payload::Populate {
                source_name: self.source_name.clone(),
                data,
            })
            .await?;
        records_from(value)
    }

    pub async fn populate_bulk(&self, data: Vec<Record>) -> DbResult<u64> {
        let value = self
            .dispatcher
            .call(Payload::PopulateBulk {
                source_name: self.source_name.clone(),
                data,
            })
            .await?;
        parse_affected(value)
    }

    pub async fn sum(&self, column: &str) -> DbResult<Option<String>> {
        self.aggregate(column, |source_name, column, cond, attrs| Payload::Sum {
            source_name,
            column,
            cond,
            attrs,
        })
        .await
    }

    pub async fn max(&self, column: &str) -> DbResult<Option<String>> {
        self.aggregate(column, |source_name, column, cond, attrs| Payload::Max {
            source_name,
            column,
            cond,
            attrs,
        })
        .await
    }

    pub async fn min(&self, column: &str) -> DbResult<Option<String>> {
        self.aggregate(column, |source_name, column, cond, attrs| Payload::Min {
            source_name,
            column,
            cond,
            attrs,
        })
        .await
    }

    pub async fn avg(&self, column: &str) -> DbResult<Option<String>> {
        self.aggregate(column, |source_name, column, cond, attrs| Payload::Avg {
            source_name,
            column,
            cond,
            attrs,
        })
        .await
    }

    async fn aggregate<F>(&self, column: &str, build: F) -> DbResult<Option<String>>
    where
        F: FnOnce(String, String, Cond, QueryAttrs) -> Payload,
    {
        let payload = build(
            self.source_name.clone(),
            column.to_owned(),
            self.cond.clone(),
            self.build_attrs(),
        );
        match self.dispatcher.call(payload).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(DbError::internal(format!(
                "aggregate returned a non-string: {}",
                other
            ))),
        }
    }
}

/// Pagination arithmetic over a sliced resultset.
pub struct Pager {
    base: ResultSet,
    rows_per_page: u64,
    current_page: u64,
}

impl Pager {
    pub fn current_page(&self) -> u64 {
        self.current_page
    }

    pub fn rows_per_page(&self) -> u64 {
        self.rows_per_page
    }

    pub async fn total_entries(&self) -> DbResult<u64> {
        self.base.count_total().await
    }

    pub async fn last_page(&self) -> DbResult<u64> {
        let total = self.total_entries().await?;
        let per = self.rows_per_page.max(1);
        Ok(((total + per - 1) / per).max(1))
    }

    pub async fn entries_on_this_page(&self) -> DbResult<u64> {
        let total = self.total_entries().await?;
        let before = (self.current_page - 1) * self.rows_per_page;
        Ok(total.saturating_sub(before).min(self.rows_per_page))
    }
}

fn merge_cond(existing: &Cond, new: Cond) -> Cond {
    if new.is_null() {
        return existing.clone();
    }
    let existing_empty = match existing {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if existing_empty {
        return new;
    }
    // a literal new cond (raw subquery marker) replaces outright
    if !new.is_object() || !existing.is_object() {
        return new;
    }
    let mut wrapper = Map::new();
    wrapper.insert(
        "and".to_owned(),
        Value::Array(vec![existing.clone(), new]),
    );
    Value::Object(wrapper)
}

fn records_from(value: Value) -> DbResult<Vec<Record>> {
    let rows = match value {
        Value::Array(rows) => rows,
        other => {
            return Err(DbError::internal(format!(
                "expected an array of records, got: {}",
                other
            )))
        }
    };
    rows.into_iter()
        .map(|row| match row {
            Value::Object(record) => Ok(record),
            other => Err(DbError::internal(format!(
                "expected a record, got: {}",
                other
            ))),
        })
        .collect()
}

fn parse_count(value: Value) -> DbResult<u64> {
    match value {
        // the worker stringifies counts to defuse big-number wrappers
        Value::String(s) => s
            .parse::<u64>()
            .map_err(|_| DbError::internal(format!("unparseable count: {}", s))),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| DbError::internal(format!("unparseable count: {}", n))),
        other => Err(DbError::internal(format!("unparseable count: {}", other))),
    }
}

fn parse_affected(value: Value) -> DbResult<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| DbError::internal(format!("unparseable row count: {}", n))),
        other => Err(DbError::internal(format!(
            "unparseable row count: {}",
            other
        ))),
    }
}
