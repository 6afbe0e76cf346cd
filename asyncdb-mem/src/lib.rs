//! In-memory reference backend for the bridge.
//!
//! Every connection handed out by one [`MemBackend`] shares a single store,
//! so a pool of workers sees one consistent database. Transactions snapshot
//! the store on begin and restore it on rollback; the backend assumes one
//! writer at a time, which matches how the bridge pins a transaction to a
//! single worker.

#[macro_use]
extern crate slog_scope;

mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use asyncdb_db_common::error::{DbError, DbResult};
use asyncdb_db_common::{
    normalize_prefetch, AggFunc, Backend, Cond, Connection, QueryAttrs, Record, RelKind, Related,
    Row, SourceInfo,
};

use store::{cmp_values, matches, val_eq, Store, Table};

/// A statement that went through `execute()`, tagged with the serial of the
/// connection that ran it (connections number off in `connect()` order).
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutedStatement {
    pub conn: usize,
    pub sql: String,
    pub binds: Vec<Value>,
}

#[derive(Clone)]
pub struct MemBackend {
    sources: Arc<HashMap<String, SourceInfo>>,
    store: Arc<Mutex<Store>>,
    executed: Arc<Mutex<Vec<ExecutedStatement>>>,
    next_serial: Arc<AtomicUsize>,
    /// Number of upcoming `check()` calls that should fail, across all
    /// connections. Lets tests knock individual workers unhealthy.
    check_fail_budget: Arc<AtomicI64>,
    /// Number of upcoming write operations that should fail with a
    /// deadlock, across all connections. Lets tests exercise transient
    /// failure classification and retry.
    deadlock_budget: Arc<AtomicI64>,
}

impl MemBackend {
    pub fn new(sources: Vec<SourceInfo>) -> Self {
        let mut tables = HashMap::new();
        let mut by_name = HashMap::new();
        for info in sources {
            tables.insert(info.name.clone(), Table::default());
            by_name.insert(info.name.clone(), info);
        }
        Self {
            sources: Arc::new(by_name),
            store: Arc::new(Mutex::new(Store { tables })),
            executed: Arc::new(Mutex::new(Vec::new())),
            next_serial: Arc::new(AtomicUsize::new(0)),
            check_fail_budget: Arc::new(AtomicI64::new(0)),
            deadlock_budget: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Statements passed through `execute()` (and `on_connect_do`), oldest
    /// first.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.executed.lock().expect("executed lock").clone()
    }

    /// Make the next `n` health probes fail, whichever connections serve
    /// them.
    pub fn fail_next_checks(&self, n: i64) {
        self.check_fail_budget.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` write operations fail with a deadlock, whichever
    /// connections serve them.
    pub fn fail_next_writes_with_deadlock(&self, n: i64) {
        self.deadlock_budget.store(n, Ordering::SeqCst);
    }

    /// Direct row count, bypassing the bridge. Test helper.
    pub fn rows_in(&self, source: &str) -> usize {
        self.store
            .lock()
            .expect("store lock")
            .tables
            .get(source)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

impl Backend for MemBackend {
    fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }

    fn source_info(&self, name: &str) -> Option<SourceInfo> {
        self.sources.get(name).cloned()
    }

    fn connect(
        &self,
        database_url: &str,
        on_connect_do: &[String],
    ) -> DbResult<Box<dyn Connection>> {
        if database_url.is_empty() {
            return Err(DbError::worker_load("empty connect info".to_owned()));
        }
        let mut conn = MemConnection {
            serial: self.next_serial.fetch_add(1, Ordering::SeqCst),
            sources: Arc::clone(&self.sources),
            store: Arc::clone(&self.store),
            executed: Arc::clone(&self.executed),
            check_fail_budget: Arc::clone(&self.check_fail_budget),
            deadlock_budget: Arc::clone(&self.deadlock_budget),
            snapshot: None,
        };
        for stmt in on_connect_do {
            conn.execute(stmt, &[])?;
        }
        debug!("mem backend connected"; "url" => database_url);
        Ok(Box::new(conn))
    }
}

struct MemConnection {
    serial: usize,
    sources: Arc<HashMap<String, SourceInfo>>,
    store: Arc<Mutex<Store>>,
    executed: Arc<Mutex<Vec<ExecutedStatement>>>,
    check_fail_budget: Arc<AtomicI64>,
    deadlock_budget: Arc<AtomicI64>,
    /// Present while a transaction is open; rollback restores it
    snapshot: Option<Store>,
}

impl MemConnection {
    fn info(&self, source: &str) -> DbResult<&SourceInfo> {
        self.sources
            .get(source)
            .ok_or_else(|| DbError::source_not_found(source))
    }

    /// Consume one unit of the injected-deadlock budget, if any.
    fn take_deadlock(&self) -> DbResult<()> {
        let budget = &self.deadlock_budget;
        if budget.load(Ordering::SeqCst) > 0 && budget.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(DbError::deadlock());
        }
        Ok(())
    }

    fn lock(&self) -> DbResult<MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|_| DbError::internal("store lock".to_owned()))
    }

    /// Attach prefetched relations to one selected record, recursively.
    fn build_row(
        &self,
        store: &Store,
        info: &SourceInfo,
        record: Record,
        prefetch: &serde_json::Map<String, Value>,
    ) -> DbResult<MemRow> {
        let mut relations = HashMap::new();
        for (rel_name, sub_spec) in prefetch {
            let rel = info.relationship(rel_name).ok_or_else(|| {
                DbError::query(format!(
                    "no relationship {} on source {}",
                    rel_name, info.name
                ))
            })?;
            let rel_info = self.info(&rel.source)?;
            let sub_prefetch = normalize_prefetch(sub_spec);
            match rel.kind {
                RelKind::BelongsTo => {
                    let fk = record.get(&rel.key).cloned().unwrap_or(Value::Null);
                    let parent = store
                        .table(&rel.source)?
                        .rows
                        .iter()
                        .find(|r| val_eq(r.get(&rel_info.primary_key), Some(&fk)))
                        .cloned();
                    if let Some(parent) = parent {
                        let row = self.build_row(store, rel_info, parent, &sub_prefetch)?;
                        relations.insert(rel_name.clone(), Related::One(Box::new(row)));
                    }
                }
                RelKind::HasMany => {
                    let pk = record.get(&info.primary_key).cloned().unwrap_or(Value::Null);
                    let mut children: Vec<Box<dyn Row>> = Vec::new();
                    for child in &store.table(&rel.source)?.rows {
                        if val_eq(child.get(&rel.key), Some(&pk)) {
                            let row =
                                self.build_row(store, rel_info, child.clone(), &sub_prefetch)?;
                            children.push(Box::new(row));
                        }
                    }
                    relations.insert(rel_name.clone(), Related::Many(children));
                }
            }
        }
        Ok(MemRow {
            primary_key: info.primary_key.clone(),
            columns: record,
            relations,
        })
    }

    fn numeric_column<'a>(
        rows: &'a [Record],
        column: &str,
    ) -> impl Iterator<Item = &'a Value> + 'a {
        let column = column.to_owned();
        rows.iter().filter_map(move |r| {
            let v = r.get(&column)?;
            if v.is_null() {
                None
            } else {
                Some(v)
            }
        })
    }
}

impl Connection for MemConnection {
    fn check(&mut self) -> DbResult<bool> {
        let budget = &self.check_fail_budget;
        if budget.load(Ordering::SeqCst) > 0 && budget.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(DbError::query("health probe failed".to_owned()));
        }
        Ok(true)
    }

    fn execute(&mut self, sql: &str, binds: &[Value]) -> DbResult<u64> {
        self.executed
            .lock()
            .map_err(|_| DbError::internal("executed lock".to_owned()))?
            .push(ExecutedStatement {
                conn: self.serial,
                sql: sql.to_owned(),
                binds: binds.to_vec(),
            });
        Ok(0)
    }

    fn txn_begin(&mut self) -> DbResult<()> {
        if self.snapshot.is_some() {
            return Err(DbError::query("transaction already open".to_owned()));
        }
        let snapshot = self.lock()?.clone();
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn txn_commit(&mut self) -> DbResult<()> {
        self.snapshot = None;
        Ok(())
    }

    fn txn_rollback(&mut self) -> DbResult<()> {
        match self.snapshot.take() {
            Some(snapshot) => {
                *self.lock()? = snapshot;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn deploy(&mut self, _args: &Value) -> DbResult<()> {
        // Tables materialize from source definitions at construction; there
        // is no DDL to run.
        Ok(())
    }

    fn count(&mut self, source: &str, cond: &Cond, attrs: &QueryAttrs) -> DbResult<u64> {
        Ok(self.lock()?.select(source, cond, attrs)?.len() as u64)
    }

    fn aggregate(
        &mut self,
        source: &str,
        func: AggFunc,
        column: &str,
        cond: &Cond,
        attrs: &QueryAttrs,
    ) -> DbResult<Option<Value>> {
        let rows = self.lock()?.select(source, cond, attrs)?;
        let values: Vec<&Value> = Self::numeric_column(&rows, column).collect();
        if values.is_empty() {
            return Ok(None);
        }

        let result = match func {
            AggFunc::Max | AggFunc::Min => {
                let mut best = values[0];
                for &v in &values[1..] {
                    let ord = cmp_values(Some(v), best).ok_or_else(|| {
                        DbError::query(format!("cannot compare column {} values", column))
                    })?;
                    let take = match func {
                        AggFunc::Max => ord == std::cmp::Ordering::Greater,
                        _ => ord == std::cmp::Ordering::Less,
                    };
                    if take {
                        best = v;
                    }
                }
                best.clone()
            }
            AggFunc::Sum | AggFunc::Avg => {
                let mut total = 0f64;
                for v in &values {
                    total += v.as_f64().ok_or_else(|| {
                        DbError::query(format!("non-numeric value in column {}", column))
                    })?;
                }
                if func == AggFunc::Avg {
                    total /= values.len() as f64;
                }
                // keep integral results integral
                if total.fract() == 0.0 && total.abs() < i64::MAX as f64 {
                    Value::from(total as i64)
                } else {
                    Value::from(total)
                }
            }
        };
        Ok(Some(result))
    }

    fn all(
        &mut self,
        source: &str,
        cond: &Cond,
        attrs: &QueryAttrs,
    ) -> DbResult<Vec<Box<dyn Row>>> {
        let info = self.info(source)?.clone();
        let store = self.lock()?;
        let records = store.select(source, cond, attrs)?;
        let prefetch = normalize_prefetch(attrs.prefetch.as_ref().unwrap_or(&Value::Null));
        let mut out: Vec<Box<dyn Row>> = Vec::with_capacity(records.len());
        for record in records {
            out.push(Box::new(self.build_row(&store, &info, record, &prefetch)?));
        }
        Ok(out)
    }

    fn find(
        &mut self,
        source: &str,
        query: &Value,
        attrs: &QueryAttrs,
    ) -> DbResult<Option<Box<dyn Row>>> {
        let info = self.info(source)?.clone();
        let cond = match query {
            Value::Object(_) => query.clone(),
            scalar => {
                let mut map = serde_json::Map::new();
                map.insert(info.primary_key.clone(), scalar.clone());
                Value::Object(map)
            }
        };
        let store = self.lock()?;
        let records = store.select(source, &cond, attrs)?;
        let prefetch = normalize_prefetch(attrs.prefetch.as_ref().unwrap_or(&Value::Null));
        match records.into_iter().next() {
            Some(record) => Ok(Some(Box::new(
                self.build_row(&store, &info, record, &prefetch)?,
            ))),
            None => Ok(None),
        }
    }

    fn create(&mut self, source: &str, data: &Record) -> DbResult<Box<dyn Row>> {
        self.take_deadlock()?;
        let info = self.info(source)?.clone();
        let record = self.lock()?.insert(&info, data)?;
        Ok(Box::new(MemRow {
            primary_key: info.primary_key,
            columns: record,
            relations: HashMap::new(),
        }))
    }

    fn update_row(&mut self, source: &str, id: &Value, data: &Record) -> DbResult<Box<dyn Row>> {
        let info = self.info(source)?.clone();
        let mut store = self.lock()?;
        let table = store.table_mut(source)?;
        let row = table
            .rows
            .iter_mut()
            .find(|r| val_eq(r.get(&info.primary_key), Some(id)))
            .ok_or_else(DbError::record_not_found)?;
        for (k, v) in data {
            row.insert(k.clone(), v.clone());
        }
        Ok(Box::new(MemRow {
            primary_key: info.primary_key,
            columns: row.clone(),
            relations: HashMap::new(),
        }))
    }

    fn delete_row(&mut self, source: &str, id: &Value) -> DbResult<u64> {
        let info = self.info(source)?.clone();
        let mut store = self.lock()?;
        let table = store.table_mut(source)?;
        let before = table.rows.len();
        table
            .rows
            .retain(|r| !val_eq(r.get(&info.primary_key), Some(id)));
        Ok((before - table.rows.len()) as u64)
    }

    fn update_all(&mut self, source: &str, cond: &Cond, updates: &Record) -> DbResult<u64> {
        self.take_deadlock()?;
        let mut store = self.lock()?;
        let table = store.table_mut(source)?;
        let mut affected = 0;
        for row in table.rows.iter_mut() {
            if matches(row, cond)? {
                for (k, v) in updates {
                    row.insert(k.clone(), v.clone());
                }
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn delete_all(&mut self, source: &str, cond: &Cond) -> DbResult<u64> {
        self.take_deadlock()?;
        let mut store = self.lock()?;
        let table = store.table_mut(source)?;
        let before = table.rows.len();
        let mut err = None;
        table.rows.retain(|row| match matches(row, cond) {
            Ok(hit) => !hit,
            Err(e) => {
                err.get_or_insert(e);
                true
            }
        });
        if let Some(e) = err {
            return Err(e);
        }
        Ok((before - table.rows.len()) as u64)
    }

    fn populate(&mut self, source: &str, rows: &[Record]) -> DbResult<Vec<Box<dyn Row>>> {
        let mut out: Vec<Box<dyn Row>> = Vec::with_capacity(rows.len());
        for data in rows {
            out.push(self.create(source, data)?);
        }
        Ok(out)
    }

    fn populate_bulk(&mut self, source: &str, rows: &[Record]) -> DbResult<()> {
        let info = self.info(source)?.clone();
        let mut store = self.lock()?;
        for data in rows {
            store.insert(&info, data)?;
        }
        Ok(())
    }
}

struct MemRow {
    primary_key: String,
    columns: Record,
    relations: HashMap<String, Related>,
}

impl Row for MemRow {
    fn id(&self) -> Value {
        self.columns
            .get(&self.primary_key)
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn get_columns(&self) -> Record {
        self.columns.clone()
    }

    fn get_inflated_columns(&self) -> Record {
        // the mem backend stores plain values; nothing inflates
        self.columns.clone()
    }

    fn related(&self, rel: &str) -> Option<&Related> {
        self.relations.get(rel)
    }
}

/// Shorthand source description for tests and demos.
pub fn source(
    name: &str,
    result_class: &str,
    columns: &[(&str, &str, bool)],
    relationships: Vec<asyncdb_db_common::Relationship>,
) -> SourceInfo {
    SourceInfo {
        name: name.to_owned(),
        result_class: result_class.to_owned(),
        primary_key: "id".to_owned(),
        columns: columns
            .iter()
            .map(|(name, data_type, is_nullable)| asyncdb_db_common::ColumnInfo {
                name: (*name).to_owned(),
                data_type: (*data_type).to_owned(),
                is_nullable: *is_nullable,
                default_value: None,
            })
            .collect(),
        relationships,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn users_backend() -> MemBackend {
        MemBackend::new(vec![source(
            "User",
            "My::Schema::Result::User",
            &[("id", "integer", false), ("name", "text", true)],
            vec![],
        )])
    }

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn create_assigns_ids_and_shares_store() {
        let backend = users_backend();
        let mut a = backend.connect("mem://", &[]).unwrap();
        let mut b = backend.connect("mem://", &[]).unwrap();

        let row = a.create("User", &record(&[("name", json!("alice"))])).unwrap();
        assert_eq!(row.id(), json!(1));

        // the second connection sees the first one's write
        assert_eq!(b.count("User", &Value::Null, &Default::default()).unwrap(), 1);
    }

    #[test]
    fn rollback_restores_snapshot() {
        let backend = users_backend();
        let mut conn = backend.connect("mem://", &[]).unwrap();
        conn.create("User", &record(&[("name", json!("a"))])).unwrap();

        conn.txn_begin().unwrap();
        conn.create("User", &record(&[("name", json!("b"))])).unwrap();
        assert_eq!(backend.rows_in("User"), 2);
        conn.txn_rollback().unwrap();
        assert_eq!(backend.rows_in("User"), 1);
    }

    #[test]
    fn on_connect_do_is_recorded() {
        let backend = users_backend();
        backend
            .connect("mem://", &["PRAGMA foo".to_owned()])
            .unwrap();
        assert_eq!(backend.executed()[0].sql, "PRAGMA foo");
    }

    #[test]
    fn unknown_source_errors() {
        let backend = users_backend();
        let mut conn = backend.connect("mem://", &[]).unwrap();
        assert!(conn.count("Nope", &Value::Null, &Default::default()).is_err());
    }

    #[test]
    fn injected_deadlocks_drain_the_budget() {
        use asyncdb_db_common::error::DbErrorIntrospect;

        let backend = users_backend();
        let mut conn = backend.connect("mem://", &[]).unwrap();

        backend.fail_next_writes_with_deadlock(1);
        let err = match conn.create("User", &record(&[("name", json!("a"))])) {
            Ok(_) => panic!("budgeted deadlock"),
            Err(e) => e,
        };
        assert!(err.is_deadlock());

        // budget spent; the next write goes through
        conn.create("User", &record(&[("name", json!("a"))])).unwrap();
        assert_eq!(backend.rows_in("User"), 1);
    }
}
