//! Single-worker transaction execution: `txn_batch` and `txn_do`, including
//! the `txn_do` register and its placeholder resolution.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use asyncdb_db_common::error::{DbError, DbResult};
use asyncdb_db_common::{Connection, QueryAttrs, Record};

use crate::deflate::deflate_row;
use crate::payload::{BatchAction, BatchStep, TxnAction, TxnStep};

pub(crate) fn txn_batch(conn: &mut dyn Connection, steps: &[BatchStep]) -> DbResult<Value> {
    conn.txn_begin()?;
    match run_batch(conn, steps) {
        Ok(count) => {
            conn.txn_commit()?;
            Ok(json!({ "count": count, "success": true }))
        }
        Err(e) => {
            let _ = conn.txn_rollback();
            Err(e)
        }
    }
}

fn run_batch(conn: &mut dyn Connection, steps: &[BatchStep]) -> DbResult<u64> {
    let mut count = 0u64;
    for step in steps {
        match step.kind {
            BatchAction::Update => {
                let id = require(&step.id, "update step needs an id")?;
                let data = require(&step.data, "update step needs data")?;
                conn.update_row(&step.resultset, id, data)?;
            }
            BatchAction::Create => {
                let data = require(&step.data, "create step needs data")?;
                conn.create(&step.resultset, data)?;
            }
            BatchAction::Delete => {
                let id = require(&step.id, "delete step needs an id")?;
                conn.delete_row(&step.resultset, id)?;
            }
            BatchAction::Raw => {
                let sql = require(&step.sql, "raw step needs sql")?;
                conn.execute(sql, &step.bind)?;
            }
        }
        count += 1;
    }
    Ok(count)
}

pub(crate) fn txn_do(conn: &mut dyn Connection, steps: &[TxnStep]) -> DbResult<Value> {
    conn.txn_begin()?;
    match run_txn(conn, steps) {
        Ok(results) => {
            conn.txn_commit()?;
            Ok(json!({ "results": results, "success": true }))
        }
        Err(e) => {
            let _ = conn.txn_rollback();
            Err(e)
        }
    }
}

fn run_txn(conn: &mut dyn Connection, steps: &[TxnStep]) -> DbResult<Vec<Value>> {
    let empty = Map::new();
    let mut register: HashMap<String, Value> = HashMap::new();
    let mut results = Vec::with_capacity(steps.len());

    for step in steps {
        let step = resolve_step(step, &register);
        let result = match step.action {
            TxnAction::Create => {
                let source = require(&step.resultset, "create step needs a resultset")?;
                let data = require(&step.data, "create step needs data")?;
                let row = conn.create(source, data)?;
                Value::Object(deflate_row(row.as_ref(), &empty))
            }
            TxnAction::Find => {
                let source = require(&step.resultset, "find step needs a resultset")?;
                let id = require(&step.id, "find step needs an id")?;
                let row = conn
                    .find(source, id, &QueryAttrs::default())?
                    .ok_or_else(DbError::record_not_found)?;
                Value::Object(deflate_row(row.as_ref(), &empty))
            }
            TxnAction::Update => {
                let source = require(&step.resultset, "update step needs a resultset")?;
                let id = require(&step.id, "update step needs an id")?;
                let data = require(&step.data, "update step needs data")?;
                let row = conn.update_row(source, id, data)?;
                Value::Object(deflate_row(row.as_ref(), &empty))
            }
            TxnAction::Raw => {
                let sql = require(&step.sql, "raw step needs sql")?;
                Value::from(conn.execute(sql, &step.bind)?)
            }
        };

        if let Some(name) = &step.name {
            if let Some(id) = result.as_object().and_then(|o| o.get("id")) {
                register.insert(format!("${}.id", name), id.clone());
            }
        }
        results.push(result);
    }
    Ok(results)
}

fn require<'a, T>(field: &'a Option<T>, msg: &str) -> DbResult<&'a T> {
    field
        .as_ref()
        .ok_or_else(|| DbError::invalid_param(msg.to_owned()))
}

/// Substitute register placeholders throughout a step: a scalar string that
/// exactly matches a register key is replaced by the captured value, and
/// `${name.field}` tokens inside strings interpolate the captured value's
/// string form. Unknown tokens pass through untouched.
fn resolve_step(step: &TxnStep, register: &HashMap<String, Value>) -> TxnStep {
    if register.is_empty() {
        return step.clone();
    }
    TxnStep {
        action: step.action,
        name: step.name.clone(),
        resultset: step.resultset.clone(),
        id: step.id.as_ref().map(|v| resolve_value(v, register)),
        data: step.data.as_ref().map(|data| {
            data.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, register)))
                .collect::<Record>()
        }),
        sql: step
            .sql
            .as_ref()
            .map(|sql| interpolate_tokens(sql, register)),
        bind: step
            .bind
            .iter()
            .map(|v| resolve_value(v, register))
            .collect(),
    }
}

fn resolve_value(value: &Value, register: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => match register.get(s) {
            Some(captured) => captured.clone(),
            None => Value::String(interpolate_tokens(s, register)),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, register))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, register)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Replace `${name.field}` tokens. Tokens are parsed explicitly rather than
/// substring-replaced per register key, so one key being a prefix of another
/// cannot corrupt the output.
fn interpolate_tokens(input: &str, register: &HashMap<String, Value>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let token = &after[..end];
                match register.get(&format!("${}", token)) {
                    Some(value) => out.push_str(&value_to_string(value)),
                    None => {
                        out.push_str("${");
                        out.push_str(token);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
