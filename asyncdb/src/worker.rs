//! The worker side of the bridge: a dedicated OS thread owning one blocking
//! database connection, fed jobs over a bounded channel of capacity 1 so a
//! connection never sees two requests at once. The connection is established
//! lazily on the first job and lives for the thread's lifetime; a bootstrap
//! failure fails that job and the next one retries.

use std::sync::Arc;
use std::thread;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use asyncdb_db_common::error::{DbError, DbErrorIntrospect, DbResult};
use asyncdb_db_common::{AggFunc, Backend, Connection, QueryAttrs};
use asyncdb_settings::Settings;

use crate::deflate::{deflate_row, deflate_rows};
use crate::payload::Payload;
use crate::txn;

pub(crate) enum Job {
    Call {
        payload: Payload,
        reply: oneshot::Sender<DbResult<Value>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct WorkerHandle {
    pub(crate) sender: mpsc::Sender<Job>,
}

impl WorkerHandle {
    pub(crate) fn spawn(id: usize, backend: Arc<dyn Backend>, settings: &Settings) -> DbResult<Self> {
        let (sender, receiver) = mpsc::channel(1);
        let state = WorkerState {
            id,
            backend,
            database_url: settings.database_url.clone(),
            on_connect_do: settings.on_connect_do.clone(),
            trace: settings.trace,
            conn: None,
        };
        // detached; the thread exits on a shutdown job or channel close
        thread::Builder::new()
            .name(format!("asyncdb-worker-{}", id))
            .spawn(move || worker_main(state, receiver))
            .map_err(|e| DbError::worker_load(format!("could not spawn worker thread: {}", e)))?;
        Ok(Self { sender })
    }

    /// Ask the thread to finish its in-flight job and exit, then await its
    /// acknowledgement. Never blocks the executor; if the channel is already
    /// closed the thread is gone and there is nothing to wait for.
    pub(crate) async fn shutdown(self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .sender
            .send(Job::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

fn worker_main(mut state: WorkerState, mut receiver: mpsc::Receiver<Job>) {
    while let Some(job) = receiver.blocking_recv() {
        match job {
            Job::Shutdown { reply } => {
                let _ = reply.send(());
                break;
            }
            Job::Call { payload, reply } => {
                let result = state.run(payload);
                // the caller may have timed out and gone away; its loss
                let _ = reply.send(result);
            }
        }
    }
    if state.trace {
        trace!("worker exiting"; "worker" => state.id);
    }
}

struct WorkerState {
    id: usize,
    backend: Arc<dyn Backend>,
    database_url: String,
    on_connect_do: Vec<String>,
    trace: bool,
    conn: Option<Box<dyn Connection>>,
}

impl WorkerState {
    /// The lazily-bootstrapped connection, established once per thread.
    fn conn(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        match self.conn {
            Some(ref mut conn) => Ok(conn),
            None => {
                let conn = self
                    .backend
                    .connect(&self.database_url, &self.on_connect_do)
                    .map_err(|e| {
                        if e.is_worker_load() {
                            e
                        } else {
                            DbError::worker_load(e.to_string())
                        }
                    })?;
                if self.trace {
                    trace!("worker connected"; "worker" => self.id);
                }
                Ok(self.conn.insert(conn))
            }
        }
    }

    fn run(&mut self, payload: Payload) -> DbResult<Value> {
        if self.trace {
            trace!("worker executing"; "worker" => self.id, "operation" => payload.operation());
        }
        match payload {
            Payload::Count {
                source_name,
                cond,
                attrs,
            } => {
                let n = self.conn()?.count(&source_name, &cond, &attrs)?;
                Ok(Value::String(n.to_string()))
            }
            Payload::Sum {
                source_name,
                column,
                cond,
                attrs,
            } => self.aggregate(AggFunc::Sum, &source_name, &column, &cond, &attrs),
            Payload::Max {
                source_name,
                column,
                cond,
                attrs,
            } => self.aggregate(AggFunc::Max, &source_name, &column, &cond, &attrs),
            Payload::Min {
                source_name,
                column,
                cond,
                attrs,
            } => self.aggregate(AggFunc::Min, &source_name, &column, &cond, &attrs),
            Payload::Avg {
                source_name,
                column,
                cond,
                attrs,
            } => self.aggregate(AggFunc::Avg, &source_name, &column, &cond, &attrs),
            Payload::Search {
                source_name,
                cond,
                attrs,
            }
            | Payload::All {
                source_name,
                cond,
                attrs,
            } => {
                let mut attrs = attrs;
                if attrs.prefetch.is_some() {
                    // joined rows must merge per parent row
                    attrs.collapse = Some(true);
                }
                let rows = self.conn()?.all(&source_name, &cond, &attrs)?;
                Ok(deflate_rows(&rows, attrs.prefetch.as_ref()))
            }
            Payload::Find {
                source_name,
                query,
                attrs,
            } => {
                let mut attrs = attrs;
                if attrs.prefetch.is_some() {
                    attrs.collapse = Some(true);
                }
                let prefetch = attrs.prefetch.clone();
                match self.conn()?.find(&source_name, &query, &attrs)? {
                    Some(row) => {
                        let spec =
                            asyncdb_db_common::normalize_prefetch(prefetch.as_ref().unwrap_or(&Value::Null));
                        Ok(Value::Object(deflate_row(row.as_ref(), &spec)))
                    }
                    None => Ok(Value::Null),
                }
            }
            Payload::Create { source_name, data } => {
                let conn = self.conn()?;
                let row = conn.create(&source_name, &data)?;
                // re-read so defaults and the assigned primary key are
                // materialized from storage, not from the input
                let id = row.id();
                let stored = conn
                    .find(&source_name, &id, &QueryAttrs::default())?
                    .ok_or_else(|| {
                        DbError::internal(format!("created row vanished from {}", source_name))
                    })?;
                Ok(Value::Object(deflate_row(
                    stored.as_ref(),
                    &serde_json::Map::new(),
                )))
            }
            Payload::Update {
                source_name,
                cond,
                updates,
            } => {
                let n = self.conn()?.update_all(&source_name, &cond, &updates)?;
                Ok(Value::from(n))
            }
            Payload::Delete { source_name, cond } => {
                let n = self.conn()?.delete_all(&source_name, &cond)?;
                Ok(Value::from(n))
            }
            Payload::Populate { source_name, data } => {
                let rows = self.conn()?.populate(&source_name, &data)?;
                Ok(deflate_rows(&rows, None))
            }
            Payload::PopulateBulk { source_name, data } => {
                self.conn()?.populate_bulk(&source_name, &data)?;
                Ok(Value::from(1))
            }
            Payload::Deploy { args } => {
                self.conn()?.deploy(&args)?;
                Ok(json!({ "success": true }))
            }
            Payload::TxnBatch { steps } => txn::txn_batch(self.conn()?.as_mut(), &steps),
            Payload::TxnDo { steps } => txn::txn_do(self.conn()?.as_mut(), &steps),
            Payload::TxnBegin => {
                self.conn()?.txn_begin()?;
                Ok(json!({ "success": true }))
            }
            Payload::TxnCommit => {
                self.conn()?.txn_commit()?;
                Ok(json!({ "success": true }))
            }
            Payload::TxnRollback => {
                self.conn()?.txn_rollback()?;
                Ok(json!({ "success": true }))
            }
            Payload::Ping => Ok(Value::String("pong".to_owned())),
            Payload::HealthCheck => {
                let ok = self.conn()?.check()?;
                Ok(Value::Bool(ok))
            }
        }
    }

    fn aggregate(
        &mut self,
        func: AggFunc,
        source: &str,
        column: &str,
        cond: &Value,
        attrs: &QueryAttrs,
    ) -> DbResult<Value> {
        let result = self.conn()?.aggregate(source, func, column, cond, attrs)?;
        // force to string so arbitrary-precision values survive the boundary
        Ok(match result {
            Some(Value::String(s)) => Value::String(s),
            Some(other) => Value::String(other.to_string()),
            None => Value::Null,
        })
    }
}
