use std::future::Future;

use anyhow::{Context, Result};
use postproc_core::models::RepoRef;

use crate::services::LockService;

/// A held per-pull-request lock. Hand it back to the service that issued it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Lock {
    pub key: String,
    /// Identifies this holder so a stale release cannot drop someone else's lock.
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {key} is held by another delivery")]
    Contended { key: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub fn lock_key(repo: &RepoRef, number: u64) -> String {
    format!("{}/{}/{}", repo.owner, repo.name, number)
}

pub struct LockManager<'a> {
    service: &'a dyn LockService,
}

impl<'a> LockManager<'a> {
    pub fn new(service: &'a dyn LockService) -> Self { Self { service } }

    /// Runs `work` while holding the lock for `key`.
    ///
    /// Returns `Ok(None)` without polling `work` when another delivery holds
    /// the lock. Once acquired, the lock is released exactly once whether
    /// `work` succeeds or fails.
    pub async fn with_lock<T, F>(&self, key: &str, work: F) -> Result<Option<T>>
    where F: Future<Output = Result<T>> {
        let lock = match self.service.acquire(key).await {
            Ok(lock) => lock,
            Err(LockError::Contended { .. }) => {
                tracing::info!("Lock {key} is held by another delivery, skipping");
                return Ok(None);
            }
            Err(LockError::Backend(e)) => {
                return Err(e.context(format!("Failed to acquire lock {key}")));
            }
        };
        tracing::debug!("Acquired lock {key}");

        let result = work.await;
        let released = self.service.release(lock).await;
        match (result, released) {
            (Ok(value), Ok(())) => Ok(Some(value)),
            (Ok(_), Err(e)) => Err(e).with_context(|| format!("Failed to release lock {key}")),
            (Err(e), released) => {
                if let Err(release_err) = released {
                    tracing::error!("Failed to release lock {key}: {release_err:?}");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct RecordingLocks {
        contended: bool,
        backend_down: bool,
        released: Mutex<Vec<Lock>>,
    }

    #[async_trait]
    impl LockService for RecordingLocks {
        async fn acquire(&self, key: &str) -> Result<Lock, LockError> {
            if self.backend_down {
                return Err(anyhow!("database is locked").into());
            }
            if self.contended {
                return Err(LockError::Contended { key: key.to_string() });
            }
            Ok(Lock { key: key.to_string(), token: "t1".to_string() })
        }

        async fn release(&self, lock: Lock) -> Result<()> {
            self.released.lock().unwrap().push(lock);
            Ok(())
        }
    }

    #[test]
    fn test_lock_key() {
        assert_eq!(lock_key(&RepoRef::new("googleapis", "nodejs-dlp"), 33), "googleapis/nodejs-dlp/33");
    }

    #[tokio::test]
    async fn test_releases_after_success() {
        let locks = RecordingLocks::default();
        let value = LockManager::new(&locks).with_lock("a/b/1", async { Ok(7) }).await.unwrap();
        assert_eq!(value, Some(7));
        assert_eq!(*locks.released.lock().unwrap(), vec![Lock {
            key: "a/b/1".to_string(),
            token: "t1".to_string()
        }]);
    }

    #[tokio::test]
    async fn test_releases_after_error() {
        let locks = RecordingLocks::default();
        let result = LockManager::new(&locks)
            .with_lock("a/b/1", async { Err::<(), _>(anyhow!("build exploded")) })
            .await;
        assert_eq!(result.unwrap_err().to_string(), "build exploded");
        assert_eq!(locks.released.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_contention_skips_work() {
        let locks = RecordingLocks { contended: true, ..Default::default() };
        let ran = Mutex::new(false);
        let result = LockManager::new(&locks)
            .with_lock("a/b/1", async {
                *ran.lock().unwrap() = true;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(!*ran.lock().unwrap());
        assert!(locks.released.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let locks = RecordingLocks { backend_down: true, ..Default::default() };
        let err = LockManager::new(&locks).with_lock("a/b/1", async { Ok(()) }).await.unwrap_err();
        assert!(format!("{err:#}").contains("database is locked"));
        assert!(locks.released.lock().unwrap().is_empty());
    }
}
