use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use asyncdb_db_common::error::{DbError, DbResult};
use asyncdb_db_common::{Cond, QueryAttrs, Record, SourceInfo};

/// The whole database. Cloning it is how transactions snapshot state.
#[derive(Clone, Debug, Default)]
pub(crate) struct Store {
    pub(crate) tables: HashMap<String, Table>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Table {
    pub(crate) next_id: i64,
    pub(crate) rows: Vec<Record>,
}

impl Store {
    pub(crate) fn table(&self, source: &str) -> DbResult<&Table> {
        self.tables
            .get(source)
            .ok_or_else(|| DbError::source_not_found(source))
    }

    pub(crate) fn table_mut(&mut self, source: &str) -> DbResult<&mut Table> {
        self.tables
            .get_mut(source)
            .ok_or_else(|| DbError::source_not_found(source))
    }

    /// Filter, order, and slice a table per cond + attrs.
    pub(crate) fn select(
        &self,
        source: &str,
        cond: &Cond,
        attrs: &QueryAttrs,
    ) -> DbResult<Vec<Record>> {
        let table = self.table(source)?;
        let mut out = Vec::new();
        for row in &table.rows {
            if matches(row, cond)? {
                out.push(row.clone());
            }
        }
        if let Some(order_by) = &attrs.order_by {
            sort_rows(&mut out, order_by)?;
        }
        let offset = attrs.offset.unwrap_or(0) as usize;
        if offset > 0 {
            out = out.split_off(offset.min(out.len()));
        }
        if let Some(limit) = attrs.rows.or(attrs.limit) {
            out.truncate(limit as usize);
        }
        Ok(out)
    }

    /// Insert one row, materializing every declared column and assigning the
    /// primary key when absent.
    pub(crate) fn insert(&mut self, info: &SourceInfo, data: &Record) -> DbResult<Record> {
        let table = self.table_mut(&info.name)?;
        let mut row = Record::new();
        for col in &info.columns {
            let val = match data.get(&col.name) {
                Some(v) => v.clone(),
                None => col.default_value.clone().unwrap_or(Value::Null),
            };
            row.insert(col.name.clone(), val);
        }

        let pk = &info.primary_key;
        if row.get(pk).map(Value::is_null).unwrap_or(true) {
            table.next_id += 1;
            row.insert(pk.clone(), Value::from(table.next_id));
        } else {
            let id = row[pk].clone();
            if table.rows.iter().any(|r| val_eq(r.get(pk), Some(&id))) {
                return Err(DbError::query(format!(
                    "duplicate primary key for {}: {}",
                    info.name, id
                )));
            }
            if let Some(n) = id.as_i64() {
                table.next_id = table.next_id.max(n);
            }
        }

        table.rows.push(row.clone());
        Ok(row)
    }
}

/// Evaluate a condition mapping against one row.
pub(crate) fn matches(row: &Record, cond: &Cond) -> DbResult<bool> {
    let map = match cond {
        Value::Null => return Ok(true),
        Value::Object(map) => map,
        other => {
            return Err(DbError::query(format!(
                "unsupported literal condition: {}",
                other
            )))
        }
    };

    for (key, expected) in map {
        let hit = match key.as_str() {
            "and" => group(row, expected)?.iter().all(|m| *m),
            "or" => group(row, expected)?.iter().any(|m| *m),
            field => match_field(row.get(field), expected)?,
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

fn group(row: &Record, conds: &Value) -> DbResult<Vec<bool>> {
    let list = conds.as_array().ok_or_else(|| {
        DbError::query("and/or conditions take an array of sub-conditions".to_owned())
    })?;
    list.iter().map(|c| matches(row, c)).collect()
}

fn match_field(actual: Option<&Value>, expected: &Value) -> DbResult<bool> {
    match expected {
        // operator mapping, e.g. {"gt": 5} or {"in": [1, 2]}
        Value::Object(ops) => {
            for (op, operand) in ops {
                let hit = match op.as_str() {
                    "eq" => val_eq(actual, Some(operand)),
                    "ne" => !val_eq(actual, Some(operand)),
                    "gt" => cmp_is(actual, operand, &[Ordering::Greater])?,
                    "ge" => cmp_is(actual, operand, &[Ordering::Greater, Ordering::Equal])?,
                    "lt" => cmp_is(actual, operand, &[Ordering::Less])?,
                    "le" => cmp_is(actual, operand, &[Ordering::Less, Ordering::Equal])?,
                    "in" => operand
                        .as_array()
                        .map(|list| list.iter().any(|v| val_eq(actual, Some(v))))
                        .unwrap_or(false),
                    other => {
                        return Err(DbError::query(format!("unknown operator: {}", other)));
                    }
                };
                if !hit {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        scalar => Ok(val_eq(actual, Some(scalar))),
    }
}

/// Loose value equality: numbers compare numerically regardless of
/// integer/float representation.
pub(crate) fn val_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            x.as_f64().unwrap_or(f64::NAN) == y.as_f64().unwrap_or(f64::NAN)
        }
        (Some(x), Some(y)) => x == y,
        (None, None) => true,
        _ => false,
    }
}

fn cmp_is(actual: Option<&Value>, operand: &Value, accept: &[Ordering]) -> DbResult<bool> {
    match cmp_values(actual, operand) {
        Some(ord) => Ok(accept.contains(&ord)),
        None => Ok(false),
    }
}

pub(crate) fn cmp_values(a: Option<&Value>, b: &Value) -> Option<Ordering> {
    match (a?, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Order rows per an order_by spec: `"col"`, `"col DESC"`, or an array of
/// those. The sort is stable.
fn sort_rows(rows: &mut [Record], order_by: &Value) -> DbResult<()> {
    let specs = match order_by {
        Value::String(s) => vec![parse_order(s)],
        Value::Array(list) => list
            .iter()
            .map(|v| {
                v.as_str().map(parse_order).ok_or_else(|| {
                    DbError::query("order_by entries must be strings".to_owned())
                })
            })
            .collect::<DbResult<Vec<_>>>()?,
        other => {
            return Err(DbError::query(format!(
                "unsupported order_by spec: {}",
                other
            )))
        }
    };

    rows.sort_by(|a, b| {
        for (col, desc) in &specs {
            let ord = cmp_values(a.get(col), b.get(col).unwrap_or(&Value::Null))
                .unwrap_or(Ordering::Equal);
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn parse_order(spec: &str) -> (String, bool) {
    let trimmed = spec.trim();
    if let Some(col) = trimmed
        .strip_suffix(" DESC")
        .or_else(|| trimmed.strip_suffix(" desc"))
    {
        (col.trim().to_owned(), true)
    } else if let Some(col) = trimmed
        .strip_suffix(" ASC")
        .or_else(|| trimmed.strip_suffix(" asc"))
    {
        (col.trim().to_owned(), false)
    } else {
        (trimmed.to_owned(), false)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[test]
    fn empty_cond_matches_everything() {
        let r = row(&[("id", json!(1))]);
        assert!(matches(&r, &Value::Null).unwrap());
        assert!(matches(&r, &json!({})).unwrap());
    }

    #[test]
    fn field_equality_and_operators() {
        let r = row(&[("id", json!(3)), ("name", json!("carol"))]);
        assert!(matches(&r, &json!({"id": 3})).unwrap());
        assert!(matches(&r, &json!({"id": {"gt": 2}, "name": "carol"})).unwrap());
        assert!(!matches(&r, &json!({"id": {"in": [1, 2]}})).unwrap());
    }

    #[test]
    fn and_or_groups() {
        let r = row(&[("active", json!(1)), ("age", json!(30))]);
        let cond = json!({"and": [{"active": 1}, {"or": [{"age": {"lt": 10}}, {"age": {"ge": 30}}]}]});
        assert!(matches(&r, &cond).unwrap());
    }

    #[test]
    fn literal_cond_is_rejected() {
        let r = row(&[("id", json!(1))]);
        assert!(matches(&r, &json!("raw sql")).is_err());
    }

    #[test]
    fn numeric_equality_is_loose() {
        assert!(val_eq(Some(&json!(1)), Some(&json!(1.0))));
        assert!(!val_eq(Some(&json!(1)), Some(&json!("1"))));
    }

    #[test]
    fn sorting_desc_and_multi_key() {
        let mut rows = vec![
            row(&[("a", json!(1)), ("b", json!("x"))]),
            row(&[("a", json!(2)), ("b", json!("x"))]),
            row(&[("a", json!(2)), ("b", json!("a"))]),
        ];
        sort_rows(&mut rows, &json!(["a DESC", "b"])).unwrap();
        assert_eq!(rows[0]["b"], json!("a"));
        assert_eq!(rows[2]["a"], json!(1));
    }
}
