pub mod configs;
pub mod locks;

use anyhow::{Context, Result};
use postproc_core::config::DbConfig;
use sqlx::{Pool, Sqlite, migrate::MigrateDatabase, sqlite::SqlitePoolOptions};

#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DbConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .context("Failed to connect to database")?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database is unavailable")?;
        Ok(())
    }

    pub async fn close(&self) { self.pool.close().await }
}

#[cfg(test)]
pub(crate) async fn test_database() -> Database {
    // A single connection keeps every query on the same in-memory database
    Database::new(&DbConfig { url: "sqlite::memory:".to_string(), max_connections: 1 })
        .await
        .unwrap()
}
