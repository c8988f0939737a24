//! Distributed mutual exclusion: `SET NX PX` to acquire, token-checked delete to release.
//!
//! ## Guarantees and limits
//! - At most one holder per key across all processes while the TTL runs.
//! - No re-entrancy: a held key refuses every acquire, including from the holder.
//! - No renewal or heartbeat. If the protected work outlives the TTL, a second
//!   caller can acquire the same key and run concurrently. Pick a TTL well
//!   above worst-case execution time.
//! - Release deletes only when the stored token is still ours, in one atomic
//!   script call, so a holder whose TTL lapsed cannot free a successor's lock.

use super::resp::Reply;
use super::CoordinationBackend;
use crate::error::MeteringError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Server-side compare-and-delete used for release.
pub(crate) const RELEASE_SCRIPT: &str =
    "if redis.call('GET', KEYS[1]) == ARGV[1] then return redis.call('DEL', KEYS[1]) else return 0 end";

/// Opaque proof of holding a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lock manager over an optional coordination backend.
pub struct LockManager {
    backend: Option<Arc<dyn CoordinationBackend>>,
    namespace: String,
}

impl LockManager {
    pub fn new(backend: Option<Arc<dyn CoordinationBackend>>, namespace: &str) -> Self {
        Self {
            backend,
            namespace: namespace.to_string(),
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}lock:{key}", self.namespace)
    }

    /// Try once to take `key` for `ttl`. `Ok(None)` means someone else holds it.
    ///
    /// Without a backend every attempt succeeds with a process-local token.
    pub async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>, MeteringError> {
        let token = LockToken::generate();
        let Some(ref backend) = self.backend else {
            return Ok(Some(token));
        };

        let storage_key = self.storage_key(key);
        let ttl_ms = ttl.as_millis().max(1).to_string();
        let reply = backend
            .command(&["SET", &storage_key, token.as_str(), "NX", "PX", &ttl_ms])
            .await?;

        match reply {
            r if r.is_ok() => Ok(Some(token)),
            r if r.is_null() => Ok(None),
            Reply::Error(msg) => Err(MeteringError::unreachable(format!(
                "SET {storage_key} rejected: {msg}"
            ))),
            other => Err(MeteringError::UnexpectedReply {
                command: "SET NX PX".into(),
                reply: other.to_string(),
            }),
        }
    }

    /// Release `key` if `token` still owns it. Never fails; returns whether a delete happened.
    pub async fn release(&self, key: &str, token: &LockToken) -> bool {
        let Some(ref backend) = self.backend else {
            return true;
        };

        let storage_key = self.storage_key(key);
        match backend
            .command(&["EVAL", RELEASE_SCRIPT, "1", &storage_key, token.as_str()])
            .await
        {
            Ok(Reply::Integer(1)) => true,
            Ok(Reply::Integer(_)) => {
                tracing::debug!(key, "Lock already expired or taken over; nothing released");
                false
            }
            Ok(other) => {
                tracing::warn!(key, reply = %other, "Unexpected reply releasing lock; relying on TTL");
                false
            }
            Err(e) => {
                tracing::warn!(key, "Failed to release lock, relying on TTL: {e}");
                false
            }
        }
    }

    /// Run `f` while holding `key`.
    ///
    /// Fails fast with [`MeteringError::LockHeld`] when another holder exists;
    /// there is no internal wait or retry. The lock is released after `f`
    /// completes whether it succeeded or not.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<MeteringError>,
    {
        if self.backend.is_none() {
            tracing::debug!(key, "No coordination backend; running critical section unlocked");
            return f().await;
        }

        let token = self
            .try_acquire(key, ttl)
            .await?
            .ok_or_else(|| MeteringError::LockHeld {
                key: key.to_string(),
            })?;

        let result = f().await;
        self.release(key, &token).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryBackend;
    use tokio::sync::oneshot;

    fn manager() -> (Arc<MemoryBackend>, Arc<LockManager>) {
        let backend = Arc::new(MemoryBackend::new());
        let locks = Arc::new(LockManager::new(Some(backend.clone()), "qg:"));
        (backend, locks)
    }

    #[tokio::test]
    async fn with_lock_returns_closure_result_and_releases() {
        let (backend, locks) = manager();

        let value = locks
            .with_lock("story:1", Duration::from_secs(5), || async {
                Ok::<_, MeteringError>(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(backend.get("qg:lock:story:1"), None);
    }

    #[tokio::test]
    async fn nested_attempt_on_same_key_is_refused() {
        let (_backend, locks) = manager();
        let inner_locks = locks.clone();

        let inner = locks
            .with_lock("sync:a@b.c", Duration::from_secs(5), || async move {
                let attempt = inner_locks
                    .with_lock("sync:a@b.c", Duration::from_secs(5), || async {
                        Ok::<_, MeteringError>(())
                    })
                    .await;
                Ok::<_, MeteringError>(attempt)
            })
            .await
            .unwrap();

        match inner {
            Err(MeteringError::LockHeld { key }) => assert_eq!(key, "sync:a@b.c"),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_holder_excludes_until_release() {
        let (_backend, locks) = manager();
        let (acquired_tx, acquired_rx) = oneshot::channel();
        let (finish_tx, finish_rx) = oneshot::channel::<()>();

        let holder_locks = locks.clone();
        let holder = tokio::spawn(async move {
            holder_locks
                .with_lock("credits:u", Duration::from_secs(30), || async move {
                    let _ = acquired_tx.send(());
                    let _ = finish_rx.await;
                    Ok::<_, MeteringError>("done")
                })
                .await
        });

        acquired_rx.await.unwrap();
        let blocked = locks
            .with_lock("credits:u", Duration::from_secs(30), || async {
                Ok::<_, MeteringError>(())
            })
            .await;
        assert!(matches!(blocked, Err(MeteringError::LockHeld { .. })));

        finish_tx.send(()).unwrap();
        assert_eq!(holder.await.unwrap().unwrap(), "done");

        let after = locks
            .with_lock("credits:u", Duration::from_secs(30), || async {
                Ok::<_, MeteringError>(())
            })
            .await;
        assert!(after.is_ok());
    }

    #[tokio::test]
    async fn lock_is_released_when_closure_fails() {
        let (backend, locks) = manager();

        let result: Result<(), MeteringError> = locks
            .with_lock("story:9", Duration::from_secs(5), || async {
                Err(MeteringError::invalid("boom"))
            })
            .await;

        assert!(matches!(result, Err(MeteringError::InvalidInput(_))));
        assert_eq!(backend.get("qg:lock:story:9"), None);
    }

    #[tokio::test]
    async fn expired_ttl_lets_next_caller_in() {
        let (backend, locks) = manager();

        let first = locks.try_acquire("k", Duration::from_millis(500)).await.unwrap();
        assert!(first.is_some());
        assert!(locks.try_acquire("k", Duration::from_millis(500)).await.unwrap().is_none());

        backend.advance(Duration::from_millis(600));
        assert!(locks.try_acquire("k", Duration::from_millis(500)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_token_cannot_release_successor() {
        let (backend, locks) = manager();

        let stale = locks
            .try_acquire("story:7", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        backend.advance(Duration::from_millis(200));

        let current = locks
            .try_acquire("story:7", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        assert!(!locks.release("story:7", &stale).await);
        assert_eq!(backend.get("qg:lock:story:7").as_deref(), Some(current.as_str()));
        assert!(locks.try_acquire("story:7", Duration::from_secs(10)).await.unwrap().is_none());

        assert!(locks.release("story:7", &current).await);
        assert_eq!(backend.get("qg:lock:story:7"), None);
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_hard_failure() {
        let (backend, locks) = manager();
        backend.set_down(true);

        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = locks
            .with_lock("story:1", Duration::from_secs(5), || async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, MeteringError>(())
            })
            .await;

        assert!(matches!(result, Err(MeteringError::CoordinationUnreachable { .. })));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn release_failure_is_swallowed() {
        let (backend, locks) = manager();
        let token = locks.try_acquire("k", Duration::from_secs(5)).await.unwrap().unwrap();
        backend.set_down(true);
        assert!(!locks.release("k", &token).await);
    }

    #[tokio::test]
    async fn unconfigured_manager_runs_directly() {
        let locks = LockManager::new(None, "");

        let first = locks
            .with_lock("k", Duration::from_secs(1), || async {
                locks
                    .with_lock("k", Duration::from_secs(1), || async {
                        Ok::<_, MeteringError>(7)
                    })
                    .await
            })
            .await
            .unwrap();
        assert_eq!(first, 7);
    }
}
