//! The parent-side pool manager. Owns the ordered worker slots, the
//! round-robin cursor, the counters, and the periodic health sweep, and
//! turns a [`Payload`] into a future of plain data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use asyncdb_common::{metrics_from_opts, Metrics};
use asyncdb_db_common::error::{DbError, DbErrorIntrospect, DbResult};
use asyncdb_db_common::{Backend, SourceInfo};
use asyncdb_settings::Settings;

use crate::cache::{QueryCache, TtlCache};
use crate::payload::Payload;
use crate::stats::{Stats, StatsSnapshot};
use crate::worker::{Job, WorkerHandle};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

struct WorkerSlot {
    handle: WorkerHandle,
    healthy: AtomicBool,
}

/// Cheaply cloneable handle on the bridge. Dropping the last clone tears the
/// workers down; call [`disconnect`](Self::disconnect) for an orderly exit.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    metadata: HashMap<String, SourceInfo>,
    workers: RwLock<Vec<WorkerSlot>>,
    cursor: AtomicUsize,
    stats: Stats,
    metrics: Metrics,
    cache: Arc<dyn QueryCache>,
    connected: AtomicBool,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Validate the settings, capture source metadata, and eagerly spawn the
    /// worker pool. When `health_check_interval > 0` this also installs the
    /// periodic health sweep, which requires a running tokio runtime.
    pub fn create(settings: Settings, backend: Arc<dyn Backend>) -> DbResult<Self> {
        let ttl = match settings.cache_ttl {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let cache: Arc<dyn QueryCache> = Arc::new(TtlCache::new(ttl));
        Self::create_with_cache(settings, backend, cache)
    }

    /// Like [`create`](Self::create) but with a caller-supplied query cache
    /// (an external store, say) instead of the built-in TTL map.
    pub fn create_with_cache(
        settings: Settings,
        backend: Arc<dyn Backend>,
        cache: Arc<dyn QueryCache>,
    ) -> DbResult<Self> {
        if settings.database_url.is_empty() {
            return Err(DbError::invalid_config(
                "database_url must not be empty".to_owned(),
            ));
        }
        if settings.worker_count == 0 {
            return Err(DbError::invalid_config(
                "worker_count must be at least 1".to_owned(),
            ));
        }

        // Inflator/deflator metadata, captured in-process. Workers never see
        // this; the client-side row layer reads it back off the dispatcher.
        let metadata: HashMap<String, SourceInfo> = backend
            .sources()
            .into_iter()
            .filter_map(|name| backend.source_info(&name).map(|info| (name, info)))
            .collect();

        let metrics = if settings.enable_metrics {
            match metrics_from_opts(
                &settings.statsd_label,
                settings.statsd_host.as_deref(),
                settings.statsd_port,
            ) {
                Ok(client) => Metrics::from(&client),
                Err(e) => {
                    warn!("⚠️ Could not initialize metrics, disabling: {:?}", e);
                    Metrics::noop()
                }
            }
        } else {
            Metrics::noop()
        };

        let mut slots = Vec::with_capacity(settings.worker_count as usize);
        for id in 0..settings.worker_count as usize {
            slots.push(WorkerSlot {
                handle: WorkerHandle::spawn(id, Arc::clone(&backend), &settings)?,
                healthy: AtomicBool::new(true),
            });
        }
        debug!("bridge connected"; "workers" => settings.worker_count);

        let health_check_interval = settings.health_check_interval;
        let inner = Arc::new(Inner {
            settings,
            metadata,
            workers: RwLock::new(slots),
            cursor: AtomicUsize::new(0),
            stats: Stats::default(),
            metrics,
            cache,
            connected: AtomicBool::new(true),
            health_task: Mutex::new(None),
        });

        if health_check_interval > 0 {
            let weak = Arc::downgrade(&inner);
            let task = tokio::spawn(health_loop(weak, Duration::from_secs(health_check_interval)));
            if let Ok(mut slot) = inner.health_task.lock() {
                *slot = Some(task);
            }
        }

        Ok(Self { inner })
    }

    /// Dispatch one payload to the next worker and await its plain-data
    /// result.
    pub async fn call(&self, payload: Payload) -> DbResult<Value> {
        self.inner.call(payload).await
    }

    /// [`call`](Self::call), retried with exponential backoff on transient
    /// failures (deadlock, timeout) per the configured retry policy. The
    /// base dispatch path never retries on its own.
    pub async fn call_with_retry(&self, payload: Payload) -> DbResult<Value> {
        let retry = &self.inner.settings.retry;
        let mut delay = Duration::from_secs(retry.initial_delay);
        let mut attempt = 0u32;
        loop {
            match self.call(payload.clone()).await {
                Ok(value) => return Ok(value),
                Err(e)
                    if retry.enabled
                        && attempt < retry.max_retries
                        && (e.is_deadlock() || e.is_timeout()) =>
                {
                    attempt += 1;
                    self.inner.stats.incr_retries();
                    debug!("retrying transient failure"; "attempt" => attempt, "error" => %e);
                    tokio::time::sleep(delay).await;
                    delay *= retry.factor;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Probe every worker and refresh the healthy flags. Never fails: a bad
    /// probe only downgrades the slot.
    pub async fn health_check(&self) {
        self.inner.health_check().await
    }

    /// Idempotent teardown: stop the health sweep, clear the pool, and
    /// await every worker's shutdown acknowledgement.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.read().map(|ws| ws.len()).unwrap_or(0)
    }

    pub fn healthy_workers(&self) -> usize {
        self.inner
            .workers
            .read()
            .map(|ws| {
                ws.iter()
                    .filter(|slot| slot.healthy.load(Ordering::SeqCst))
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.metadata.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn source_info(&self, name: &str) -> Option<SourceInfo> {
        self.inner.metadata.get(name).cloned()
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }
}

async fn health_loop(inner: Weak<Inner>, interval: Duration) {
    let mut tick = tokio::time::interval(interval);
    // the first tick completes immediately; skip it
    tick.tick().await;
    loop {
        tick.tick().await;
        match inner.upgrade() {
            Some(inner) => inner.health_check().await,
            None => break,
        }
    }
}

impl Inner {
    async fn call(&self, payload: Payload) -> DbResult<Value> {
        let op = payload.operation();

        let cache_key = if payload.is_cacheable() {
            Some(payload.cache_key()?)
        } else {
            None
        };
        if let Some(key) = cache_key.as_deref() {
            if let Some(value) = self.cache.get(key) {
                self.stats.incr_cache_hits();
                self.metrics.incr_with_tag("cache_hits_total", "operation", op);
                if self.settings.trace {
                    trace!("cache hit"; "operation" => op);
                }
                return Ok(value);
            }
            self.stats.incr_cache_misses();
            self.metrics
                .incr_with_tag("cache_misses_total", "operation", op);
        }

        let mut timer = self.metrics.clone();
        let mut tags = HashMap::new();
        tags.insert("operation".to_owned(), op.to_owned());
        timer.start_timer("query_duration", Some(tags));

        match self.dispatch(payload).await {
            Ok(value) => {
                self.stats.incr_queries();
                self.metrics.incr_with_tag("queries_total", "operation", op);
                if let Some(key) = cache_key.as_deref() {
                    self.cache.put(key, value.clone());
                }
                Ok(value)
            }
            Err(e) => {
                self.stats.incr_errors();
                if e.is_deadlock() {
                    self.stats.incr_deadlocks();
                }
                self.metrics.incr_with_tag("errors_total", "operation", op);
                Err(e)
            }
        }
    }

    async fn dispatch(&self, payload: Payload) -> DbResult<Value> {
        let sender = {
            let workers = self
                .workers
                .read()
                .map_err(|_| DbError::internal("worker pool lock".to_owned()))?;
            if workers.is_empty() {
                return Err(DbError::no_workers());
            }
            let index = self.next_worker_index(workers.len());
            if self.settings.trace {
                trace!("dispatching"; "worker" => index, "operation" => payload.operation());
            }
            workers[index].handle.sender.clone()
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        sender
            .send(Job::Call {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DbError::internal("worker channel closed".to_owned()))?;

        let timeout = Duration::from_secs(self.settings.query_timeout);
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DbError::internal("worker reply channel closed".to_owned())),
            Err(_) => Err(DbError::timeout(format!(
                "query timed out after {}s",
                self.settings.query_timeout
            ))),
        }
    }

    /// Strict round-robin: advance on every dispatch regardless of health.
    /// The stored cursor stays below the pool length.
    fn next_worker_index(&self, len: usize) -> usize {
        let previous = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cursor| {
                Some((cursor + 1) % len)
            })
            .unwrap_or(0);
        previous % len
    }

    async fn health_check(&self) {
        let probes: Vec<(usize, mpsc::Sender<Job>)> = match self.workers.read() {
            Ok(workers) => workers
                .iter()
                .enumerate()
                .map(|(index, slot)| (index, slot.handle.sender.clone()))
                .collect(),
            Err(_) => return,
        };

        let checks = probes.into_iter().map(|(index, sender)| async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            let sent = sender
                .send(Job::Call {
                    payload: Payload::HealthCheck,
                    reply: reply_tx,
                })
                .await;
            let ok = if sent.is_err() {
                false
            } else {
                match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, reply_rx).await {
                    Ok(Ok(Ok(value))) => value.as_bool().unwrap_or(true),
                    _ => false,
                }
            };
            (index, ok)
        });

        let results = join_all(checks).await;
        let mut healthy = 0u64;
        if let Ok(workers) = self.workers.read() {
            for (index, ok) in results {
                if let Some(slot) = workers.get(index) {
                    slot.healthy.store(ok, Ordering::SeqCst);
                    if ok {
                        healthy += 1;
                    }
                }
            }
        }
        self.metrics.gauge("workers_active", healthy);
        if self.settings.trace {
            trace!("health sweep complete"; "healthy" => healthy);
        }
    }

    async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut task) = self.health_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        let slots: Vec<WorkerSlot> = match self.workers.write() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => return,
        };
        join_all(slots.into_iter().map(|slot| slot.handle.shutdown())).await;
        debug!("bridge disconnected");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // best effort: closing the channels is enough for the threads to
        // exit; joining here could stall an unrelated executor thread
        if let Ok(mut task) = self.health_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        if let Ok(mut workers) = self.workers.write() {
            for slot in workers.drain(..) {
                let (reply_tx, _reply_rx) = oneshot::channel();
                let _ = slot.handle.sender.try_send(Job::Shutdown { reply: reply_tx });
            }
        }
    }
}
