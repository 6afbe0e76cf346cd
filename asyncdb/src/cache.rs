use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Parent-side cache for read-only query results. The built-in
/// [`TtlCache`] is the default; callers may plug in an external store.
pub trait QueryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn put(&self, key: &str, value: Value);
}

/// In-process cache keyed by serialized payload. `ttl: None` means entries
/// never expire (the dispatcher maps a configured ttl of 0 to this).
#[derive(Debug, Default)]
pub struct TtlCache {
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, (Value, Option<Instant>)>>,
}

impl TtlCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: RwLock::default(),
        }
    }
}

impl QueryCache for TtlCache {
    fn get(&self, key: &str) -> Option<Value> {
        let stale = {
            let entries = self.entries.read().ok()?;
            match entries.get(key) {
                None => return None,
                Some((value, deadline)) => {
                    let expired = deadline.map(|d| Instant::now() >= d).unwrap_or(false);
                    if !expired {
                        return Some(value.clone());
                    }
                    true
                }
            }
        };
        if stale {
            if let Ok(mut entries) = self.entries.write() {
                entries.remove(key);
            }
        }
        None
    }

    fn put(&self, key: &str, value: Value) {
        let deadline = self.ttl.map(|ttl| Instant::now() + ttl);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_owned(), (value, deadline));
        }
    }
}
