//! Server configuration.
//!
//! Every knob is a CLI flag with an environment-variable fallback, so the
//! binary configures identically from a shell, a unit file, or a container
//! environment. Defaults target local development against an S3-compatible
//! store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};

/// Environment marker set by the hosting platform; its presence switches the
/// default store mode to the cloud KV backend.
pub const HOSTED_ENV_MARKER: &str = "AWS_LAMBDA_FUNCTION_NAME";

/// Which persistence backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreMode {
    /// Embedded SQLite database (local dev and tests).
    Sql,
    /// Cloud key-value store (hosted deployments).
    Kv,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "agentvault-server",
    version,
    about = "AgentVault backup control plane"
)]
pub struct Config {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "LISTEN_ADDR")]
    pub listen_addr: SocketAddr,

    /// Persistence backend.
    #[arg(long, value_enum, default_value = "sql", env = "STORE_MODE")]
    pub store_mode: StoreMode,

    /// Path to the SQLite database file (sql mode).
    #[arg(long, default_value = "./agentvault.db", env = "DATABASE_PATH")]
    pub database_path: PathBuf,

    /// KV store endpoint override (kv mode; empty uses the platform default).
    #[arg(long, env = "KV_ENDPOINT")]
    pub kv_endpoint: Option<String>,

    /// KV table holding agent records.
    #[arg(long, default_value = "agentvault-agents", env = "KV_AGENTS_TABLE")]
    pub kv_agents_table: String,

    /// KV table holding backup records.
    #[arg(long, default_value = "agentvault-backups", env = "KV_BACKUPS_TABLE")]
    pub kv_backups_table: String,

    /// Object store endpoint (empty uses the platform default).
    #[arg(long, env = "OBJECT_ENDPOINT")]
    pub object_endpoint: Option<String>,

    /// Endpoint used when minting presigned URLs, when clients must reach the
    /// store at a different address than the server does (dev-mode NAT).
    #[arg(long, env = "OBJECT_PUBLIC_ENDPOINT")]
    pub object_public_endpoint: Option<String>,

    /// Object store / KV region.
    #[arg(long, default_value = "us-east-1", env = "OBJECT_REGION")]
    pub object_region: String,

    /// Bucket holding backup objects.
    #[arg(long, default_value = "agentvault-backups", env = "OBJECT_BUCKET")]
    pub object_bucket: String,

    /// Static object-store access key (empty uses the default provider chain).
    #[arg(long, env = "OBJECT_ACCESS_KEY")]
    pub object_access_key: Option<String>,

    /// Static object-store secret key.
    #[arg(long, env = "OBJECT_SECRET_KEY")]
    pub object_secret_key: Option<String>,

    /// Force path-style bucket addressing (MinIO and friends).
    #[arg(
        long,
        default_value = "false",
        env = "OBJECT_FORCE_PATH_STYLE",
        action = ArgAction::Set
    )]
    pub object_force_path_style: bool,

    /// Comma-separated admin API keys; empty leaves the admin surface open
    /// (local dev only).
    #[arg(long, default_value = "", env = "ADMIN_API_KEY")]
    pub admin_api_key: String,

    /// Per-agent storage cap in bytes.
    #[arg(long, default_value_t = 500 * 1024 * 1024, env = "DEFAULT_QUOTA_BYTES")]
    pub default_quota_bytes: i64,

    /// Maximum size of a single upload in bytes.
    #[arg(long, default_value_t = 5 * 1024 * 1024, env = "MAX_UPLOAD_BYTES")]
    pub max_upload_bytes: i64,

    /// Minimum hours between backups per agent; 0 disables the check.
    #[arg(long, default_value_t = 12, env = "MIN_BACKUP_INTERVAL_HOURS")]
    pub min_backup_interval_hours: i64,

    /// Visible backups retained per agent before the oldest rotate out.
    #[arg(long, default_value_t = 7, env = "MAX_BACKUPS_PER_AGENT")]
    pub max_backups_per_agent: usize,

    /// Cap on agents waiting for approval; registration refuses above it.
    #[arg(long, default_value_t = 100, env = "MAX_PENDING_AGENTS")]
    pub max_pending_agents: i64,

    /// Registration requests allowed per IP per minute.
    #[arg(long, default_value_t = 10, env = "REGISTER_RATE_LIMIT")]
    pub register_rate_limit: u32,

    /// Lifetime of presigned URLs in seconds.
    #[arg(long, default_value_t = 900, env = "PRESIGN_EXPIRY_SECONDS")]
    pub presign_expiry_seconds: u64,

    /// Retention horizon for visible backups in days (kv-mode TTL).
    #[arg(long, default_value_t = 7, env = "RETENTION_DAYS")]
    pub retention_days: i64,

    /// Hours a soft-deleted backup stays restorable before hard purge.
    #[arg(long, default_value_t = 72, env = "DELETE_GRACE_HOURS")]
    pub delete_grace_hours: i64,

    /// Seconds between hard-purge sweeps (sql mode).
    #[arg(long, default_value_t = 3600, env = "PURGE_INTERVAL_SECONDS")]
    pub purge_interval_seconds: u64,

    /// Emit JSON log lines instead of the human-readable format.
    #[arg(long, default_value = "false", env = "LOG_JSON", action = ArgAction::Set)]
    pub log_json: bool,
}

impl Config {
    /// The store mode actually in effect: `sql` auto-switches to `kv` when
    /// the hosting-platform marker is present in the environment.
    pub fn effective_store_mode(&self) -> StoreMode {
        if self.store_mode == StoreMode::Sql && std::env::var(HOSTED_ENV_MARKER).is_ok() {
            StoreMode::Kv
        } else {
            self.store_mode
        }
    }

    /// Accepted admin keys, whitespace-trimmed; an empty list disables the
    /// admin-key check.
    pub fn admin_api_keys(&self) -> Vec<&str> {
        self.admin_api_key
            .split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_seconds)
    }

    pub fn min_backup_interval(&self) -> Duration {
        Duration::from_secs(self.min_backup_interval_hours.max(0) as u64 * 3600)
    }

    pub fn delete_grace(&self) -> Duration {
        Duration::from_secs(self.delete_grace_hours.max(0) as u64 * 3600)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.max(0) as u64 * 24 * 3600)
    }
}
