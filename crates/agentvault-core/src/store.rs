//! The data-store contract shared by every storage backend.
//!
//! Handlers hold the store behind `Arc<dyn DataStore>`; the embedded SQL
//! backend serves local deployments and tests, the cloud KV backend serves
//! hosted deployments. Both satisfy the same semantics: soft-deleted backups
//! are invisible to every read path, and any mutation of a backup's
//! visibility or size recomputes the owning agent's `used_bytes` before
//! returning.

use std::time::Duration;

use async_trait::async_trait;

use crate::model::{Agent, AgentStatus, Backup};

/// Storage errors shared across backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Persistence contract for agents and backups.
///
/// Implementations must be safe under concurrent callers and leave the
/// `used_bytes` invariant intact after every completed mutation.
#[async_trait]
pub trait DataStore: Send + Sync {
    // Agents

    /// Insert a new agent with its token hash. Fails when `id` or
    /// `token_hash` collides with an existing row.
    async fn create_agent(&self, agent: &Agent, token_hash: &str) -> Result<(), StoreError>;

    /// Hash the presented token and return the matching agent, if any.
    async fn lookup_agent_by_token(&self, token: &str) -> Result<Option<Agent>, StoreError>;

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError>;

    /// Atomically replace the agent's token hash; the previous token is
    /// unusable the moment this commits.
    async fn rotate_agent_token(&self, id: &str, new_token_hash: &str) -> Result<(), StoreError>;

    /// Set `used_bytes` to the sum of `encrypted_bytes` over the agent's
    /// visible backups. Idempotent.
    async fn recompute_used_bytes(&self, id: &str) -> Result<(), StoreError>;

    async fn list_agents(&self, status: Option<AgentStatus>) -> Result<Vec<Agent>, StoreError>;

    /// Set the agent's status. Returns `NotFound` when the agent is absent.
    async fn update_agent_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError>;

    async fn count_agents_by_status(&self, status: AgentStatus) -> Result<i64, StoreError>;

    // Backups

    /// Insert a backup record. Repeated creates for the same
    /// `(agent_id, timestamp)` replace the existing row, so client retries
    /// re-mint cleanly instead of conflicting.
    async fn create_backup(&self, backup: &Backup) -> Result<(), StoreError>;

    /// Visible backups, newest first by `created_at`. A `limit` of 0 falls
    /// back to 100.
    async fn list_backups(&self, agent_id: &str, limit: u32) -> Result<Vec<Backup>, StoreError>;

    /// `(count, sum of encrypted_bytes)` over the agent's visible backups.
    async fn count_and_sum(&self, agent_id: &str) -> Result<(i64, i64), StoreError>;

    /// A visible backup, or `None` when absent or soft-deleted.
    async fn get_backup(
        &self,
        agent_id: &str,
        timestamp: &str,
    ) -> Result<Option<Backup>, StoreError>;

    /// Soft-delete a visible backup, scheduling its purge `grace` from now.
    /// Returns the pre-delete snapshot, or `None` when there was nothing
    /// visible to delete.
    async fn soft_delete_backup(
        &self,
        agent_id: &str,
        timestamp: &str,
        grace: Duration,
    ) -> Result<Option<Backup>, StoreError>;

    /// Soft-delete every visible backup; returns the pre-delete snapshots.
    async fn soft_delete_all_backups(
        &self,
        agent_id: &str,
        grace: Duration,
    ) -> Result<Vec<Backup>, StoreError>;

    /// Restore a soft-deleted backup. Returns `NotFound` unless a record for
    /// `(agent_id, timestamp)` exists in soft-deleted state.
    async fn undelete_backup(&self, agent_id: &str, timestamp: &str) -> Result<(), StoreError>;
}
