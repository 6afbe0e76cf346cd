//! End-to-end tests of the bridge over the in-memory backend.

use std::sync::Arc;

use serde_json::{json, Value};

use asyncdb::{
    BatchAction, BatchStep, DbErrorIntrospect, Payload, QueryAttrs, Record, RelKind, Relationship,
    Schema, Settings, TxnAction, TxnStep,
};
use asyncdb_mem::{source, MemBackend};

fn backend() -> MemBackend {
    MemBackend::new(vec![
        source(
            "User",
            "My::Schema::Result::User",
            &[
                ("id", "integer", false),
                ("name", "text", true),
                ("active", "integer", true),
                ("age", "integer", true),
            ],
            vec![Relationship {
                name: "posts".to_owned(),
                kind: RelKind::HasMany,
                source: "Post".to_owned(),
                key: "user_id".to_owned(),
            }],
        ),
        source(
            "Post",
            "My::Schema::Result::Post",
            &[
                ("id", "integer", false),
                ("user_id", "integer", true),
                ("title", "text", true),
            ],
            vec![Relationship {
                name: "author".to_owned(),
                kind: RelKind::BelongsTo,
                source: "User".to_owned(),
                key: "user_id".to_owned(),
            }],
        ),
    ])
}

fn settings(worker_count: u32) -> Settings {
    Settings {
        database_url: "mem://test".to_owned(),
        worker_count,
        health_check_interval: 0,
        ..Default::default()
    }
}

fn bridge(worker_count: u32) -> (Schema, MemBackend) {
    let _ = env_logger::try_init();
    let backend = backend();
    let schema = Schema::create(settings(worker_count), Arc::new(backend.clone()))
        .expect("Could not create schema");
    (schema, backend)
}

fn rec(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

async fn seed_users(schema: &Schema, n: u64) {
    let rs = schema.resultset("User").unwrap();
    for i in 1..=n {
        rs.create(rec(&[
            ("name", json!(format!("user-{}", i))),
            ("active", json!(if i % 2 == 0 { 1 } else { 0 })),
            ("age", json!(i * 10)),
        ]))
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn ping_returns_pong_on_every_worker() {
    let (schema, _) = bridge(2);
    for _ in 0..2 {
        assert_eq!(schema.ping().await.unwrap(), "pong");
    }
    schema.disconnect().await;
}

#[tokio::test]
async fn create_then_find_round_trips() {
    let (schema, _) = bridge(2);
    let rs = schema.resultset("User").unwrap();

    let created = rs
        .create(rec(&[("name", json!("Alice")), ("active", json!(1))]))
        .await
        .unwrap();
    let id = created.get("id").cloned().unwrap();
    assert!(!id.is_null());
    // unset declared columns are materialized
    assert!(created.contains_key("age"));

    let found = rs.find(id.clone()).await.unwrap().expect("row not found");
    assert_eq!(found["name"], json!("Alice"));
    assert_eq!(found["id"], id);
    schema.disconnect().await;
}

#[tokio::test]
async fn count_with_filter() {
    let (schema, _) = bridge(2);
    seed_users(&schema, 9).await;

    let rs = schema.resultset("User").unwrap();
    assert_eq!(rs.search(json!({ "active": 1 })).count().await.unwrap(), 4);
    assert_eq!(rs.count().await.unwrap(), 9);
    schema.disconnect().await;
}

#[tokio::test]
async fn count_on_empty_table_is_zero() {
    let (schema, _) = bridge(1);
    let rs = schema.resultset("User").unwrap();
    assert_eq!(rs.count().await.unwrap(), 0);
    schema.disconnect().await;
}

#[tokio::test]
async fn pagination_arithmetic() {
    let (schema, _) = bridge(2);
    seed_users(&schema, 25).await;

    let rs = schema.resultset("User").unwrap().order_by(json!("id"));
    let page3 = rs.page(3);
    let pager = page3.pager();

    assert_eq!(pager.current_page(), 3);
    assert_eq!(pager.total_entries().await.unwrap(), 25);
    assert_eq!(pager.last_page().await.unwrap(), 3);
    assert_eq!(pager.entries_on_this_page().await.unwrap(), 5);
    assert_eq!(page3.all().await.unwrap().len(), 5);
    assert_eq!(page3.count_total().await.unwrap(), 25);
    schema.disconnect().await;
}

#[tokio::test]
async fn slice_boundaries() {
    let (schema, _) = bridge(2);
    seed_users(&schema, 9).await;

    let rs = schema.resultset("User").unwrap().order_by(json!("id"));
    assert_eq!(rs.slice(0, 0).unwrap().all().await.unwrap().len(), 1);
    assert_eq!(rs.slice(7, 15).unwrap().all().await.unwrap().len(), 2);
    assert!(rs.slice(5, 3).is_err());
    assert!(rs.slice(-1, 3).is_err());
    schema.disconnect().await;
}

#[tokio::test]
async fn resultsets_are_immutable() {
    let (schema, _) = bridge(1);
    let rs = schema.resultset("User").unwrap();
    let refined = rs.search(json!({ "active": 1 }));

    assert_eq!(rs.cond(), &Value::Null);
    assert_eq!(refined.cond(), &json!({ "active": 1 }));

    let further = refined.search(json!({ "age": { "gt": 20 } }));
    assert_eq!(
        further.cond(),
        &json!({ "and": [{ "active": 1 }, { "age": { "gt": 20 } }] })
    );
    assert_eq!(refined.cond(), &json!({ "active": 1 }));

    // slicing state resets across search unless the refinement carries it
    let sliced = rs.rows(5);
    assert_eq!(sliced.search(Value::Null).attrs().rows, None);
    let carried = QueryAttrs {
        rows: Some(2),
        ..Default::default()
    };
    assert_eq!(
        sliced.search_with_attrs(Value::Null, carried).attrs().rows,
        Some(2)
    );
    schema.disconnect().await;
}

#[tokio::test]
async fn update_with_empty_updates_short_circuits() {
    let (schema, _) = bridge(1);
    seed_users(&schema, 3).await;
    let before = schema.stats();

    let rs = schema.resultset("User").unwrap();
    assert_eq!(rs.update(Record::new()).await.unwrap(), 0);

    // no worker roundtrip: counters unchanged
    assert_eq!(schema.stats(), before);
    schema.disconnect().await;
}

#[tokio::test]
async fn update_and_delete_report_affected_rows() {
    let (schema, backend) = bridge(2);
    seed_users(&schema, 9).await;

    let rs = schema.resultset("User").unwrap();
    let active = rs.search(json!({ "active": 1 }));
    assert_eq!(active.update(rec(&[("name", json!("on"))])).await.unwrap(), 4);

    let before = rs.count().await.unwrap();
    let created = rs
        .create(rec(&[("name", json!("doomed")), ("active", json!(9))]))
        .await
        .unwrap();
    assert_eq!(
        rs.search(json!({ "id": created["id"].clone() }))
            .delete()
            .await
            .unwrap(),
        1
    );
    assert_eq!(rs.count().await.unwrap(), before);
    assert_eq!(backend.rows_in("User"), before as usize);
    schema.disconnect().await;
}

#[tokio::test]
async fn aggregates_cross_as_strings() {
    let (schema, _) = bridge(2);
    seed_users(&schema, 3).await; // ages 10, 20, 30

    let rs = schema.resultset("User").unwrap();
    assert_eq!(rs.sum("age").await.unwrap(), Some("60".to_owned()));
    assert_eq!(rs.max("age").await.unwrap(), Some("30".to_owned()));
    assert_eq!(rs.min("age").await.unwrap(), Some("10".to_owned()));
    assert_eq!(rs.avg("age").await.unwrap(), Some("20".to_owned()));

    // no rows, no value
    let none = rs.search(json!({ "active": 7 })).sum("age").await.unwrap();
    assert_eq!(none, None);
    schema.disconnect().await;
}

#[tokio::test]
async fn populate_and_populate_bulk() {
    let (schema, backend) = bridge(2);
    let rs = schema.resultset("User").unwrap();

    let rows = rs
        .populate(vec![
            rec(&[("name", json!("a"))]),
            rec(&[("name", json!("b"))]),
        ])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| !r["id"].is_null()));

    assert_eq!(
        rs.populate_bulk(vec![rec(&[("name", json!("c"))])])
            .await
            .unwrap(),
        1
    );
    assert_eq!(backend.rows_in("User"), 3);
    schema.disconnect().await;
}

#[tokio::test]
async fn prefetch_serializes_relations() {
    let (schema, _) = bridge(2);
    let users = schema.resultset("User").unwrap();
    let posts = schema.resultset("Post").unwrap();

    let alice = users.create(rec(&[("name", json!("Alice"))])).await.unwrap();
    let alice_id = alice["id"].clone();
    for title in ["one", "two"] {
        posts
            .create(rec(&[
                ("user_id", alice_id.clone()),
                ("title", json!(title)),
            ]))
            .await
            .unwrap();
    }

    // has-many comes back as an array of nested records
    let attrs = QueryAttrs {
        prefetch: Some(json!("posts")),
        ..Default::default()
    };
    let rows = users
        .search_with_attrs(Value::Null, attrs)
        .all()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    let fetched_posts = rows[0]["posts"].as_array().expect("posts array");
    assert_eq!(fetched_posts.len(), 2);
    assert_eq!(fetched_posts[0]["title"], json!("one"));

    // single relation comes back as one nested record
    let attrs = QueryAttrs {
        prefetch: Some(json!("author")),
        ..Default::default()
    };
    let with_author = posts
        .search_with_attrs(Value::Null, attrs)
        .all()
        .await
        .unwrap();
    assert_eq!(with_author[0]["author"]["name"], json!("Alice"));
    schema.disconnect().await;
}

#[tokio::test]
async fn round_robin_across_two_workers() {
    let (schema, backend) = bridge(2);

    // four raw statements, submitted one at a time; strict round-robin
    // means workers alternate 0,1,0,1
    for i in 0..4 {
        schema
            .txn_batch(vec![BatchStep {
                kind: BatchAction::Raw,
                resultset: "User".to_owned(),
                id: None,
                data: None,
                sql: Some(format!("SELECT {}", i)),
                bind: vec![],
            }])
            .await
            .unwrap();
    }

    let conns: Vec<usize> = backend.executed().iter().map(|s| s.conn).collect();
    assert_eq!(conns, vec![0, 1, 0, 1]);
    schema.disconnect().await;
}

#[tokio::test]
async fn txn_do_rolls_back_on_failing_step() {
    let (schema, backend) = bridge(2);
    seed_users(&schema, 1).await;
    let before = backend.rows_in("User");

    let result = schema
        .txn_do(vec![
            TxnStep {
                action: TxnAction::Create,
                name: None,
                resultset: Some("User".to_owned()),
                id: None,
                data: Some(rec(&[("name", json!("A"))])),
                sql: None,
                bind: vec![],
            },
            TxnStep {
                action: TxnAction::Find,
                name: None,
                resultset: Some("User".to_owned()),
                id: Some(json!(999_999)),
                data: None,
                sql: None,
                bind: vec![],
            },
        ])
        .await;

    let err = result.expect_err("txn should fail");
    assert!(err.to_string().contains("record not found"));
    assert_eq!(backend.rows_in("User"), before);
    assert_eq!(schema.stats().errors, 1);
    schema.disconnect().await;
}

#[tokio::test]
async fn txn_do_register_resolves_placeholders() {
    let (schema, backend) = bridge(2);

    let result = schema
        .txn_do(vec![
            TxnStep {
                action: TxnAction::Create,
                name: Some("user".to_owned()),
                resultset: Some("User".to_owned()),
                id: None,
                data: Some(rec(&[("name", json!("Bob"))])),
                sql: None,
                bind: vec![],
            },
            TxnStep {
                action: TxnAction::Create,
                name: None,
                resultset: Some("Post".to_owned()),
                id: None,
                data: Some(rec(&[
                    ("title", json!("hello")),
                    ("user_id", json!("$user.id")),
                ])),
                sql: None,
                bind: vec![],
            },
            TxnStep {
                action: TxnAction::Raw,
                name: None,
                resultset: None,
                id: None,
                data: None,
                sql: Some("DELETE FROM audit WHERE user = ${user.id}".to_owned()),
                bind: vec![],
            },
        ])
        .await
        .unwrap();

    assert_eq!(result["success"], json!(true));
    let results = result["results"].as_array().unwrap();
    let user_id = results[0]["id"].clone();
    assert_eq!(results[1]["user_id"], user_id);

    let executed = backend.executed();
    assert_eq!(
        executed[0].sql,
        format!("DELETE FROM audit WHERE user = {}", user_id)
    );
    schema.disconnect().await;
}

#[tokio::test]
async fn txn_batch_applies_all_steps() {
    let (schema, backend) = bridge(1);
    seed_users(&schema, 2).await;

    let result = schema
        .txn_batch(vec![
            BatchStep {
                kind: BatchAction::Create,
                resultset: "User".to_owned(),
                id: None,
                data: Some(rec(&[("name", json!("fresh"))])),
                sql: None,
                bind: vec![],
            },
            BatchStep {
                kind: BatchAction::Update,
                resultset: "User".to_owned(),
                id: Some(json!(1)),
                data: Some(rec(&[("name", json!("renamed"))])),
                sql: None,
                bind: vec![],
            },
            BatchStep {
                kind: BatchAction::Delete,
                resultset: "User".to_owned(),
                id: Some(json!(2)),
                data: None,
                sql: None,
                bind: vec![],
            },
        ])
        .await
        .unwrap();

    assert_eq!(result, json!({ "count": 3, "success": true }));
    assert_eq!(backend.rows_in("User"), 2);

    let rs = schema.resultset("User").unwrap();
    let renamed = rs.find(json!(1)).await.unwrap().unwrap();
    assert_eq!(renamed["name"], json!("renamed"));
    assert!(rs.find(json!(2)).await.unwrap().is_none());
    schema.disconnect().await;
}

#[tokio::test]
async fn bare_txn_calls_work_on_a_single_worker_pool() {
    let (schema, backend) = bridge(1);
    let rs = schema.resultset("User").unwrap();

    schema.txn_begin().await.unwrap();
    rs.create(rec(&[("name", json!("ghost"))])).await.unwrap();
    schema.txn_rollback().await.unwrap();
    assert_eq!(backend.rows_in("User"), 0);

    schema.txn_begin().await.unwrap();
    rs.create(rec(&[("name", json!("kept"))])).await.unwrap();
    schema.txn_commit().await.unwrap();
    assert_eq!(backend.rows_in("User"), 1);
    schema.disconnect().await;
}

#[tokio::test]
async fn health_sweep_downgrades_failing_worker() {
    let (schema, backend) = bridge(2);

    assert_eq!(schema.dispatcher().healthy_workers(), 2);
    backend.fail_next_checks(1);
    schema.health_check().await;
    assert_eq!(schema.dispatcher().healthy_workers(), 1);

    // a later sweep restores it
    schema.health_check().await;
    assert_eq!(schema.dispatcher().healthy_workers(), 2);
    schema.disconnect().await;
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let (schema, _) = bridge(2);

    schema.disconnect().await;
    assert!(!schema.dispatcher().is_connected());
    schema.disconnect().await;
    assert!(!schema.dispatcher().is_connected());
    assert_eq!(schema.dispatcher().worker_count(), 0);

    let err = schema
        .resultset("User")
        .unwrap()
        .count()
        .await
        .expect_err("pool is gone");
    assert_eq!(err.to_string(), "no workers available");
}

#[tokio::test]
async fn cached_reads_hit_the_query_cache() {
    let (schema, _) = bridge(2);
    seed_users(&schema, 4).await;

    let attrs = QueryAttrs {
        cache: Some(true),
        ..Default::default()
    };
    let rs = schema
        .resultset("User")
        .unwrap()
        .search_with_attrs(Value::Null, attrs);

    assert_eq!(rs.count().await.unwrap(), 4);
    assert_eq!(rs.count().await.unwrap(), 4);

    let stats = schema.stats();
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 1);
    schema.disconnect().await;
}

#[tokio::test]
async fn worker_errors_fail_the_future_and_count() {
    let (schema, _) = bridge(1);
    let rs = schema.resultset("User").unwrap();

    // a literal cond is a raw marker the mem backend refuses
    let err = rs.search(json!("raw cond")).count().await.expect_err("bad cond");
    assert!(err.to_string().contains("unsupported literal condition"));

    let stats = schema.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.queries, 0);
    // not a transient failure: nothing was retried
    assert_eq!(stats.retries, 0);
    schema.disconnect().await;
}

#[tokio::test]
async fn call_with_retry_retries_transient_deadlocks() {
    let _ = env_logger::try_init();
    let backend = backend();
    let mut s = settings(1);
    // keep the backoff instant for the test; the doubling still happens
    s.retry.initial_delay = 0;
    let schema = Schema::create(s, Arc::new(backend.clone())).unwrap();
    seed_users(&schema, 2).await;

    let update = Payload::Update {
        source_name: "User".to_owned(),
        cond: Value::Null,
        updates: rec(&[("active", json!(0))]),
    };

    // two injected deadlocks, then the third attempt lands
    backend.fail_next_writes_with_deadlock(2);
    let value = schema
        .dispatcher()
        .call_with_retry(update.clone())
        .await
        .unwrap();
    assert_eq!(value, json!(2));

    let stats = schema.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.deadlocks, 2);
    assert_eq!(stats.errors, 2);

    // a persistent deadlock exhausts max_retries and surfaces
    backend.fail_next_writes_with_deadlock(10);
    let err = schema
        .dispatcher()
        .call_with_retry(update)
        .await
        .expect_err("retries exhausted");
    assert!(err.is_deadlock());
    assert_eq!(schema.stats().retries, 5);
    schema.disconnect().await;
}

#[tokio::test]
async fn call_with_retry_leaves_permanent_failures_alone() {
    let (schema, _) = bridge(1);

    let bad = Payload::Count {
        source_name: "User".to_owned(),
        cond: json!("raw cond"),
        attrs: QueryAttrs::default(),
    };
    let err = schema
        .dispatcher()
        .call_with_retry(bad)
        .await
        .expect_err("bad cond");
    assert!(err.to_string().contains("unsupported literal condition"));
    assert_eq!(schema.stats().retries, 0);
    assert_eq!(schema.stats().errors, 1);
    schema.disconnect().await;
}

#[tokio::test]
async fn schema_introspection_is_metadata_only() {
    let (schema, _) = bridge(1);

    assert_eq!(schema.sources(), vec!["Post".to_owned(), "User".to_owned()]);
    assert_eq!(
        schema.class("User"),
        Some("My::Schema::Result::User".to_owned())
    );
    assert!(schema.class("Nope").is_none());
    assert!(schema.resultset("Nope").is_err());

    let info = schema.source_info("Post").unwrap();
    assert_eq!(info.primary_key, "id");
    assert_eq!(schema.column_info("User", "age").unwrap().data_type, "integer");

    let rs = schema.resultset("User").unwrap();
    assert_eq!(rs.result_class(), Some("My::Schema::Result::User".to_owned()));
    assert_eq!(
        rs.with_result_class("My::App::Row").result_class(),
        Some("My::App::Row".to_owned())
    );
    schema.disconnect().await;
}

#[tokio::test]
async fn deploy_delegates_and_reports_success() {
    let (schema, _) = bridge(1);
    let result = schema.deploy(Value::Null).await.unwrap();
    assert_eq!(result, json!({ "success": true }));
    schema.disconnect().await;
}

#[tokio::test]
async fn invalid_configuration_fails_synchronously() {
    let backend = Arc::new(backend());

    let mut bad = settings(2);
    bad.database_url = String::new();
    assert!(Schema::create(bad, backend.clone()).is_err());

    let mut bad = settings(0);
    bad.worker_count = 0;
    assert!(Schema::create(bad, backend).is_err());
}

#[tokio::test]
async fn on_connect_do_runs_once_per_connection() {
    let _ = env_logger::try_init();
    let backend = backend();
    let mut s = settings(2);
    s.on_connect_do = vec!["SET search_path TO app".to_owned()];
    let schema = Schema::create(s, Arc::new(backend.clone())).unwrap();

    let rs = schema.resultset("User").unwrap();
    // touch both workers so both connections bootstrap
    rs.count().await.unwrap();
    rs.count().await.unwrap();
    rs.count().await.unwrap();

    let executed = backend.executed();
    let setup = executed
        .iter()
        .filter(|s| s.sql.starts_with("SET search_path"))
        .count();
    assert_eq!(setup, 2);
    schema.disconnect().await;
}
