use anyhow::{Context, Result};
use async_trait::async_trait;
use postproc_core::models::Configs;
use postproc_engine::services::ConfigsStore;
use sqlx::Row;

use crate::Database;

#[async_trait]
impl ConfigsStore for Database {
    async fn get_configs(&self, repo: &str) -> Result<Option<Configs>> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query(
            r#"
            SELECT installation_id, branch_name, commit_hash
            FROM configs
            WHERE repo = ?
            "#,
        )
        .bind(repo)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("Failed to fetch configs for {repo}"))?;
        Ok(row.map(|row| Configs {
            installation_id: row.get::<i64, _>(0) as u64,
            branch_name: row.get(1),
            commit_hash: row.get(2),
        }))
    }

    async fn store_configs(&self, repo: &str, configs: &Configs) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(
            r#"
            INSERT INTO configs (repo, installation_id, branch_name, commit_hash, updated_at)
            VALUES (?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT (repo) DO UPDATE
            SET installation_id = excluded.installation_id,
                branch_name = excluded.branch_name,
                commit_hash = excluded.commit_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(repo)
        .bind(configs.installation_id as i64)
        .bind(&configs.branch_name)
        .bind(&configs.commit_hash)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to store configs for {repo}"))?;
        Ok(())
    }
}
