use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use postproc_engine::{
    lock::{Lock, LockError},
    services::LockService,
};
use time::UtcDateTime;

use crate::Database;

/// Per-pull-request locks stored in the `pr_locks` table. A lock that
/// outlives its TTL may be taken over by the next delivery.
#[derive(Clone)]
pub struct SqliteLockService {
    db: Database,
    ttl: Duration,
}

impl SqliteLockService {
    pub fn new(db: Database, ttl: Duration) -> Self { Self { db, ttl } }

    async fn acquire_at(&self, key: &str, now: i64) -> Result<Lock, LockError> {
        let token = format!("{:016x}", rand::random::<u64>());
        let expires_at = now + self.ttl.as_secs() as i64;
        let mut conn = self.db.pool.acquire().await.context("Failed to acquire connection")?;
        let acquired = sqlx::query(
            r#"
            INSERT INTO pr_locks (lock_key, token, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT (lock_key) DO UPDATE
            SET token = excluded.token, expires_at = excluded.expires_at
            WHERE pr_locks.expires_at <= ?
            "#,
        )
        .bind(key)
        .bind(&token)
        .bind(expires_at)
        .bind(now)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to acquire lock {key}"))?
        .rows_affected()
            > 0;
        if !acquired {
            return Err(LockError::Contended { key: key.to_string() });
        }
        Ok(Lock { key: key.to_string(), token })
    }
}

#[async_trait]
impl LockService for SqliteLockService {
    async fn acquire(&self, key: &str) -> Result<Lock, LockError> {
        self.acquire_at(key, UtcDateTime::now().unix_timestamp()).await
    }

    async fn release(&self, lock: Lock) -> Result<()> {
        let mut conn = self.db.pool.acquire().await?;
        let released = sqlx::query(
            r#"
            DELETE FROM pr_locks
            WHERE lock_key = ? AND token = ?
            "#,
        )
        .bind(&lock.key)
        .bind(&lock.token)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to release lock {}", lock.key))?
        .rows_affected();
        if released == 0 {
            tracing::warn!("Lock {} expired and was taken over before release", lock.key);
        }
        Ok(())
    }
}
