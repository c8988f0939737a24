//! Fixed-window counters for rate limiting.
//!
//! One server-side script increments the key and, when the count is 1 (a new
//! window) or the key has somehow lost its TTL, sets `EXPIRE` in the same
//! step. A burst straddling a window boundary can reach about twice the
//! nominal rate; callers accept that.

use super::resp::Reply;
use super::CoordinationBackend;
use crate::error::MeteringError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Atomic increment that (re)arms the window expiry.
pub(crate) const INCR_SCRIPT: &str = "local c = redis.call('INCR', KEYS[1]) \
if c == 1 or redis.call('TTL', KEYS[1]) < 0 then redis.call('EXPIRE', KEYS[1], ARGV[1]) end \
return c";

/// Local windows are swept once the map grows past this many keys.
const LOCAL_SWEEP_THRESHOLD: usize = 1024;

/// In-process window used when no backend is configured.
#[derive(Debug, Clone, Copy)]
struct LocalWindow {
    count: i64,
    started: Instant,
    length: Duration,
}

pub struct CounterService {
    backend: Option<Arc<dyn CoordinationBackend>>,
    namespace: String,
    local: Mutex<HashMap<String, LocalWindow>>,
}

impl CounterService {
    pub fn new(backend: Option<Arc<dyn CoordinationBackend>>, namespace: &str) -> Self {
        Self {
            backend,
            namespace: namespace.to_string(),
            local: Mutex::new(HashMap::new()),
        }
    }

    /// Count one event for `key` in the current `window_secs` window and
    /// return the running count (1 for the first event of a window).
    pub async fn increment(&self, key: &str, window_secs: u64) -> Result<i64, MeteringError> {
        let window_secs = window_secs.max(1);
        let Some(ref backend) = self.backend else {
            return Ok(self.increment_local(key, window_secs, Instant::now()));
        };

        let storage_key = format!("{}counter:{key}", self.namespace);
        let secs = window_secs.to_string();
        let count = match backend
            .command(&["EVAL", INCR_SCRIPT, "1", &storage_key, &secs])
            .await?
        {
            Reply::Integer(n) => n,
            Reply::Error(msg) => {
                return Err(MeteringError::unreachable(format!(
                    "INCR {storage_key} rejected: {msg}"
                )))
            }
            other => {
                return Err(MeteringError::UnexpectedReply {
                    command: "EVAL".into(),
                    reply: other.to_string(),
                })
            }
        };

        Ok(count)
    }

    fn increment_local(&self, key: &str, window_secs: u64, now: Instant) -> i64 {
        let mut windows = self.local.lock();
        if windows.len() >= LOCAL_SWEEP_THRESHOLD {
            windows.retain(|_, w| now.duration_since(w.started) < w.length);
        }

        let length = Duration::from_secs(window_secs);
        let window = windows.entry(key.to_string()).or_insert(LocalWindow {
            count: 0,
            started: now,
            length,
        });
        if now.duration_since(window.started) >= window.length {
            *window = LocalWindow {
                count: 0,
                started: now,
                length,
            };
        }
        window.count += 1;
        window.count
    }
}
