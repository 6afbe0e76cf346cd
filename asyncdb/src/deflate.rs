//! Deflation: turn live ORM rows into plain records before anything crosses
//! back to the parent. Prefetched relations serialize as nested records (one
//! relation) or arrays of records (has-many).

use serde_json::{Map, Value};

use asyncdb_db_common::{normalize_prefetch, Record, Related, Row};

pub(crate) fn deflate_rows(rows: &[Box<dyn Row>], prefetch: Option<&Value>) -> Value {
    let spec = normalize_prefetch(prefetch.unwrap_or(&Value::Null));
    Value::Array(
        rows.iter()
            .map(|row| Value::Object(deflate_row(row.as_ref(), &spec)))
            .collect(),
    )
}

pub(crate) fn deflate_row(row: &dyn Row, spec: &Map<String, Value>) -> Record {
    let mut record = row.get_inflated_columns();
    for (rel, sub) in spec {
        let sub_spec = normalize_prefetch(sub);
        let value = match row.related(rel) {
            Some(Related::Many(rows)) => Value::Array(
                rows.iter()
                    .map(|r| Value::Object(deflate_row(r.as_ref(), &sub_spec)))
                    .collect(),
            ),
            Some(Related::One(row)) => Value::Object(deflate_row(row.as_ref(), &sub_spec)),
            None => Value::Null,
        };
        record.insert(rel.clone(), value);
    }
    record
}
