//! Data models for AgentVault storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Object-store filename of the encrypted backup payload.
pub const BLOB_FILE: &str = "backup.ciphertext";

/// Object-store filename of the client-produced manifest.
pub const MANIFEST_FILE: &str = "manifest.meta";

/// Admission state of an enrolled agent.
///
/// Agents enroll as `pending` and cannot mutate state until an admin approves
/// them; `suspended` is the terminal state (deletion is not modeled) but an
/// admin may re-approve back to `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AgentStatus {
    Pending,
    Active,
    Suspended,
}

impl AgentStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "suspended" => Ok(Self::Suspended),
            other => Err(format!("unknown agent status: {other}")),
        }
    }
}

/// An enrolled client process.
///
/// All identity fields besides `id` are self-reported and unvalidated; the
/// token hash is stored alongside this record but never travels with it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub client_version: String,
    pub fingerprint: String,
    pub encrypt_tool: String,
    pub public_key: String,
    pub status: AgentStatus,
    pub quota_bytes: i64,
    /// Cached sum of `encrypted_bytes` over visible backups; authoritative
    /// only immediately after a recompute.
    pub used_bytes: i64,
    pub created_at: i64,
}

/// Metadata record for one encrypted snapshot.
///
/// `timestamp` is a client-provided opaque ordering key. A record with
/// `deleted_at` set is invisible to every read path except undelete;
/// `purge_at` is only meaningful while `deleted_at` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Backup {
    pub agent_id: String,
    pub timestamp: String,
    pub encrypted_bytes: i64,
    pub source_file_count: i64,
    pub encrypted_sha256: String,
    pub blob_key: String,
    pub manifest_key: String,
    pub created_at: i64,
    pub deleted_at: Option<i64>,
    pub purge_at: Option<i64>,
}

impl Backup {
    /// Build a new visible backup record with derived object keys.
    pub fn new(
        agent_id: &str,
        timestamp: &str,
        encrypted_bytes: i64,
        source_file_count: i64,
        encrypted_sha256: &str,
        created_at: i64,
    ) -> Self {
        let (blob_key, manifest_key) = object_keys(agent_id, timestamp);
        Self {
            agent_id: agent_id.to_string(),
            timestamp: timestamp.to_string(),
            encrypted_bytes,
            source_file_count,
            encrypted_sha256: encrypted_sha256.to_string(),
            blob_key,
            manifest_key,
            created_at,
            deleted_at: None,
            purge_at: None,
        }
    }

    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Derive the object-store keys for a backup. This is the only place the key
/// layout is spelled out; nothing else in an agent's prefix is recognized.
pub fn object_keys(agent_id: &str, timestamp: &str) -> (String, String) {
    (
        format!("{agent_id}/{timestamp}/{BLOB_FILE}"),
        format!("{agent_id}/{timestamp}/{MANIFEST_FILE}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            AgentStatus::Pending,
            AgentStatus::Active,
            AgentStatus::Suspended,
        ] {
            assert_eq!(status.as_str().parse::<AgentStatus>().unwrap(), status);
        }
        assert!("deleted".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AgentStatus::Pending).unwrap(),
            "\"pending\""
        );
    }

    #[test]
    fn object_key_layout() {
        let (blob, manifest) = object_keys("ag_abc", "2026-02-22T030000Z");
        assert_eq!(blob, "ag_abc/2026-02-22T030000Z/backup.ciphertext");
        assert_eq!(manifest, "ag_abc/2026-02-22T030000Z/manifest.meta");
    }

    #[test]
    fn new_backup_is_visible() {
        let b = Backup::new("ag_abc", "t1", 1024, 3, "deadbeef", 1_700_000_000);
        assert!(!b.is_deleted());
        assert_eq!(b.blob_key, "ag_abc/t1/backup.ciphertext");
        assert_eq!(b.manifest_key, "ag_abc/t1/manifest.meta");
        assert!(b.purge_at.is_none());
    }
}
