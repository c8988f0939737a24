//! In-process backend with a controllable clock, for unit tests.
//!
//! Implements just the commands the lock and counter services send, with the
//! same reply shapes a real server gives.

use super::counter::INCR_SCRIPT;
use super::lock::RELEASE_SCRIPT;
use super::resp::Reply;
use super::CoordinationBackend;
use crate::error::MeteringError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

pub(crate) struct MemoryBackend {
    entries: Mutex<HashMap<String, Entry>>,
    skew: Mutex<Duration>,
    down: AtomicBool,
    fail_next: AtomicUsize,
    before_set: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    expire_calls: AtomicUsize,
}

impl MemoryBackend {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            skew: Mutex::new(Duration::ZERO),
            down: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            before_set: Mutex::new(None),
            expire_calls: AtomicUsize::new(0),
        }
    }

    /// Move the backend's clock forward.
    pub(crate) fn advance(&self, by: Duration) {
        *self.skew.lock() += by;
    }

    /// Make every subsequent command fail as unreachable.
    pub(crate) fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` commands as unreachable, then recover.
    pub(crate) fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Run `hook` just before the next `SET` is applied.
    pub(crate) fn before_next_set(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_set.lock() = Some(Box::new(hook));
    }

    pub(crate) fn expire_calls(&self) -> usize {
        self.expire_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        let now = self.now();
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|e| live(e, now))
            .map(|e| String::from_utf8_lossy(&e.value).into_owned())
    }

    fn now(&self) -> Instant {
        Instant::now() + *self.skew.lock()
    }

    fn apply(&self, parts: &[&str]) -> Reply {
        let now = self.now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| live(e, now));

        let name = parts.first().map(|p| p.to_ascii_uppercase()).unwrap_or_default();
        match (name.as_str(), parts.get(1..).unwrap_or_default()) {
            ("SET", [key, value, flags @ ..]) => {
                let nx = flags.iter().any(|f| f.eq_ignore_ascii_case("NX"));
                let px = flags
                    .iter()
                    .position(|f| f.eq_ignore_ascii_case("PX"))
                    .and_then(|i| flags.get(i + 1))
                    .and_then(|ms| ms.parse::<u64>().ok());
                if nx && entries.contains_key(*key) {
                    return Reply::Bulk(None);
                }
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.as_bytes().to_vec(),
                        expires_at: px.map(|ms| now + Duration::from_millis(ms)),
                    },
                );
                Reply::Simple("OK".into())
            }
            ("GET", [key]) => Reply::Bulk(entries.get(*key).map(|e| e.value.clone())),
            ("INCR", [key]) => incr(&mut entries, key),
            ("EXPIRE", [key, secs]) => {
                self.expire_calls.fetch_add(1, Ordering::SeqCst);
                let Ok(secs) = secs.parse::<u64>() else {
                    return Reply::Error("ERR value is not an integer or out of range".into());
                };
                match entries.get_mut(*key) {
                    Some(entry) => {
                        entry.expires_at = Some(now + Duration::from_secs(secs));
                        Reply::Integer(1)
                    }
                    None => Reply::Integer(0),
                }
            }
            ("EVAL", [script, "1", key, secs]) if *script == INCR_SCRIPT => {
                let Ok(secs) = secs.parse::<u64>() else {
                    return Reply::Error("ERR value is not an integer or out of range".into());
                };
                let reply = incr(&mut entries, key);
                if let (Reply::Integer(n), Some(entry)) = (&reply, entries.get_mut(*key)) {
                    if *n == 1 || entry.expires_at.is_none() {
                        self.expire_calls.fetch_add(1, Ordering::SeqCst);
                        entry.expires_at = Some(now + Duration::from_secs(secs));
                    }
                }
                reply
            }
            ("EVAL", [script, "1", key, token]) if *script == RELEASE_SCRIPT => {
                let matches = entries
                    .get(*key)
                    .is_some_and(|e| e.value == token.as_bytes());
                if matches {
                    entries.remove(*key);
                    Reply::Integer(1)
                } else {
                    Reply::Integer(0)
                }
            }
            _ => Reply::Error(format!("ERR unknown command '{name}'")),
        }
    }
}

fn incr(entries: &mut HashMap<String, Entry>, key: &str) -> Reply {
    let entry = entries.entry(key.to_string()).or_insert(Entry {
        value: b"0".to_vec(),
        expires_at: None,
    });
    let Some(n) = std::str::from_utf8(&entry.value)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
    else {
        return Reply::Error("ERR value is not an integer or out of range".into());
    };
    entry.value = (n + 1).to_string().into_bytes();
    Reply::Integer(n + 1)
}

fn live(entry: &Entry, now: Instant) -> bool {
    entry.expires_at.is_none_or(|at| at > now)
}

#[async_trait]
impl CoordinationBackend for MemoryBackend {
    async fn command(&self, parts: &[&str]) -> Result<Reply, MeteringError> {
        let blip = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if blip || self.down.load(Ordering::SeqCst) {
            return Err(MeteringError::unreachable("connection refused"));
        }
        if parts.first().is_some_and(|p| p.eq_ignore_ascii_case("SET")) {
            let hook = self.before_set.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        Ok(self.apply(parts))
    }
}
