//! Embedded SQLite backend.
//!
//! WAL journal mode, foreign keys, a 5-second busy timeout, and a single
//! pooled connection set through which every local write goes. The schema is
//! initialised lazily at open via versioned migrations, so pre-existing
//! databases pick up later columns (`deleted_at`, `purge_at`) in place.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

use agentvault_core::identity::hash_token;
use agentvault_core::time::unix_timestamp;
use agentvault_core::{Agent, AgentStatus, Backup, DataStore, StoreError};

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open or create a database at the given path and run migrations.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }

        let options =
            SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
                .map_err(|e| StoreError::Connection(e.to_string()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .foreign_keys(true)
                .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        info!(path = %path.display(), "Backup database opened");

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;

        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        info!("Backup database migrations complete");
        Ok(())
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Permanently remove soft-deleted backups whose `purge_at` has passed,
    /// returning the removed rows so the caller can clean up their objects.
    pub async fn purge_expired(&self) -> Result<Vec<Backup>, StoreError> {
        let now = unix_timestamp();

        let expired = sqlx::query_as::<_, Backup>(
            "SELECT * FROM backups WHERE deleted_at IS NOT NULL AND purge_at <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        if !expired.is_empty() {
            sqlx::query("DELETE FROM backups WHERE deleted_at IS NOT NULL AND purge_at <= ?")
                .bind(now)
                .execute(&self.pool)
                .await?;
        }

        Ok(expired)
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    // =========================================================================
    // Agent operations
    // =========================================================================

    async fn create_agent(&self, agent: &Agent, token_hash: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agents (id, name, hostname, os, arch, client_version, fingerprint,
                 encrypt_tool, public_key, token_hash, status, quota_bytes, used_bytes, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.hostname)
        .bind(&agent.os)
        .bind(&agent.arch)
        .bind(&agent.client_version)
        .bind(&agent.fingerprint)
        .bind(&agent.encrypt_tool)
        .bind(&agent.public_key)
        .bind(token_hash)
        .bind(agent.status)
        .bind(agent.quota_bytes)
        .bind(agent.used_bytes)
        .bind(agent.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn lookup_agent_by_token(&self, token: &str) -> Result<Option<Agent>, StoreError> {
        let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE token_hash = ?")
            .bind(hash_token(token))
            .fetch_optional(&self.pool)
            .await?;

        Ok(agent)
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(agent)
    }

    async fn rotate_agent_token(&self, id: &str, new_token_hash: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE agents SET token_hash = ? WHERE id = ?")
            .bind(new_token_hash)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Agent {id}")));
        }
        Ok(())
    }

    async fn recompute_used_bytes(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE agents SET used_bytes = (
                 SELECT COALESCE(SUM(encrypted_bytes), 0) FROM backups
                 WHERE agent_id = ? AND deleted_at IS NULL
             ) WHERE id = ?",
        )
        .bind(id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_agents(&self, status: Option<AgentStatus>) -> Result<Vec<Agent>, StoreError> {
        let agents = if let Some(status) = status {
            sqlx::query_as::<_, Agent>(
                "SELECT * FROM agents WHERE status = ? ORDER BY created_at DESC",
            )
            .bind(status)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, Agent>("SELECT * FROM agents ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?
        };

        Ok(agents)
    }

    async fn update_agent_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE agents SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Agent {id}")));
        }
        Ok(())
    }

    async fn count_agents_by_status(&self, status: AgentStatus) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents WHERE status = ?")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.0)
    }

    // =========================================================================
    // Backup operations
    // =========================================================================

    async fn create_backup(&self, backup: &Backup) -> Result<(), StoreError> {
        // REPLACE keeps retries idempotent: a re-mint for the same
        // (agent_id, timestamp) supersedes the earlier row.
        sqlx::query(
            "INSERT OR REPLACE INTO backups (agent_id, timestamp, encrypted_bytes,
                 source_file_count, encrypted_sha256, blob_key, manifest_key, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&backup.agent_id)
        .bind(&backup.timestamp)
        .bind(backup.encrypted_bytes)
        .bind(backup.source_file_count)
        .bind(&backup.encrypted_sha256)
        .bind(&backup.blob_key)
        .bind(&backup.manifest_key)
        .bind(backup.created_at)
        .execute(&self.pool)
        .await?;

        self.recompute_used_bytes(&backup.agent_id).await
    }

    async fn list_backups(&self, agent_id: &str, limit: u32) -> Result<Vec<Backup>, StoreError> {
        let limit = if limit == 0 { 100 } else { limit };

        // Lexical timestamp as tiebreak keeps ordering stable when several
        // records land within the same second.
        let backups = sqlx::query_as::<_, Backup>(
            "SELECT * FROM backups WHERE agent_id = ? AND deleted_at IS NULL
             ORDER BY created_at DESC, timestamp DESC LIMIT ?",
        )
        .bind(agent_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(backups)
    }

    async fn count_and_sum(&self, agent_id: &str) -> Result<(i64, i64), StoreError> {
        let row: (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(encrypted_bytes), 0)
             FROM backups WHERE agent_id = ? AND deleted_at IS NULL",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    async fn get_backup(
        &self,
        agent_id: &str,
        timestamp: &str,
    ) -> Result<Option<Backup>, StoreError> {
        let backup = sqlx::query_as::<_, Backup>(
            "SELECT * FROM backups WHERE agent_id = ? AND timestamp = ? AND deleted_at IS NULL",
        )
        .bind(agent_id)
        .bind(timestamp)
        .fetch_optional(&self.pool)
        .await?;

        Ok(backup)
    }

    async fn soft_delete_backup(
        &self,
        agent_id: &str,
        timestamp: &str,
        grace: Duration,
    ) -> Result<Option<Backup>, StoreError> {
        let Some(backup) = self.get_backup(agent_id, timestamp).await? else {
            return Ok(None);
        };

        let now = unix_timestamp();
        sqlx::query(
            "UPDATE backups SET deleted_at = ?, purge_at = ?
             WHERE agent_id = ? AND timestamp = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now + grace.as_secs() as i64)
        .bind(agent_id)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        self.recompute_used_bytes(agent_id).await?;
        Ok(Some(backup))
    }

    async fn soft_delete_all_backups(
        &self,
        agent_id: &str,
        grace: Duration,
    ) -> Result<Vec<Backup>, StoreError> {
        let backups = self.list_backups(agent_id, 10_000).await?;

        let now = unix_timestamp();
        sqlx::query(
            "UPDATE backups SET deleted_at = ?, purge_at = ?
             WHERE agent_id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now + grace.as_secs() as i64)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;

        self.recompute_used_bytes(agent_id).await?;
        Ok(backups)
    }

    async fn undelete_backup(&self, agent_id: &str, timestamp: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE backups SET deleted_at = NULL, purge_at = NULL
             WHERE agent_id = ? AND timestamp = ? AND deleted_at IS NOT NULL",
        )
        .bind(agent_id)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "Backup {agent_id}/{timestamp} in deleted state"
            )));
        }

        self.recompute_used_bytes(agent_id).await
    }
}
