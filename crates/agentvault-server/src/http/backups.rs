//! Backup lifecycle handlers.
//!
//! Upload-URL minting is the admission gate to storage: validation order is
//! timestamp, size cap, quota, frequency, each short-circuiting. The record
//! is persisted before the client uploads; a retry with the same timestamp
//! re-mints idempotently rather than conflicting.

use std::collections::HashMap;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use agentvault_core::model::{BLOB_FILE, MANIFEST_FILE};
use agentvault_core::time::{format_rfc3339, unix_timestamp};
use agentvault_core::{Agent, Backup};

use super::error::ApiError;
use super::AppState;

// =========================================================================
// POST /v1/backups/upload-url
// =========================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct UploadUrlRequest {
    pub timestamp: String,
    pub files: Option<Vec<String>>,
    pub encrypted_bytes: i64,
    pub encrypted_sha256: String,
    pub source_file_count: i64,
}

#[derive(Debug, Serialize)]
pub struct UploadUrlResponse {
    pub urls: HashMap<String, String>,
    pub expires_in: u64,
}

pub async fn upload_url(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    body: Result<Json<UploadUrlRequest>, JsonRejection>,
) -> Result<Json<UploadUrlResponse>, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::Validation("invalid JSON body".into()))?;

    if req.timestamp.is_empty() {
        return Err(ApiError::Validation("timestamp is required".into()));
    }

    if req.encrypted_bytes <= 0 {
        return Err(ApiError::Validation(
            "encrypted_bytes must be greater than zero".into(),
        ));
    }
    if req.encrypted_bytes > state.config.max_upload_bytes {
        return Err(ApiError::Validation(format!(
            "encrypted_bytes {} exceeds maximum upload size {}",
            req.encrypted_bytes, state.config.max_upload_bytes
        )));
    }

    if agent.used_bytes + req.encrypted_bytes > agent.quota_bytes {
        return Err(ApiError::QuotaExceeded {
            used: agent.used_bytes,
            new: req.encrypted_bytes,
            quota: agent.quota_bytes,
        });
    }

    // Frequency gate. A repeat request for an existing timestamp is an
    // idempotent re-mint and passes; a new timestamp inside the interval is
    // refused.
    let interval = state.config.min_backup_interval();
    if !interval.is_zero() {
        let existing = state.store.get_backup(&agent.id, &req.timestamp).await?;
        if existing.is_none() {
            if let Some(newest) = state
                .store
                .list_backups(&agent.id, 1)
                .await?
                .into_iter()
                .next()
            {
                let elapsed = unix_timestamp() - newest.created_at;
                if elapsed < interval.as_secs() as i64 {
                    return Err(ApiError::TooFrequent);
                }
            }
        }
    }

    let backup = Backup::new(
        &agent.id,
        &req.timestamp,
        req.encrypted_bytes,
        req.source_file_count,
        &req.encrypted_sha256,
        unix_timestamp(),
    );
    state.store.create_backup(&backup).await?;

    rotate_surplus(&state, &agent.id).await?;

    let files = req
        .files
        .unwrap_or_else(|| vec![BLOB_FILE.to_string(), MANIFEST_FILE.to_string()]);

    let mut urls = HashMap::with_capacity(files.len());
    for file in files {
        let key = format!("{}/{}/{}", agent.id, req.timestamp, file);
        // Only the ciphertext carries a length binding; the manifest's size
        // is unknown at mint time.
        let length = (file == BLOB_FILE).then_some(req.encrypted_bytes);
        let content_type = if file == MANIFEST_FILE {
            "application/json"
        } else {
            "application/octet-stream"
        };
        let url = state.broker.presign_put(&key, content_type, length).await?;
        urls.insert(file, url);
    }

    info!(
        agent_id = %agent.id,
        timestamp = %req.timestamp,
        encrypted_bytes = req.encrypted_bytes,
        "minted upload URLs"
    );

    Ok(Json(UploadUrlResponse {
        urls,
        expires_in: state.config.presign_expiry_seconds,
    }))
}

/// Soft-delete visible backups beyond the per-agent cap, oldest first. Runs
/// after the insert so the newest record always survives.
async fn rotate_surplus(state: &AppState, agent_id: &str) -> Result<(), ApiError> {
    let visible = state.store.list_backups(agent_id, 10_000).await?;
    let cap = state.config.max_backups_per_agent;

    if visible.len() > cap {
        for surplus in &visible[cap..] {
            state
                .store
                .soft_delete_backup(agent_id, &surplus.timestamp, state.config.delete_grace())
                .await?;
            info!(
                agent_id = %agent_id,
                timestamp = %surplus.timestamp,
                "rotated out surplus backup"
            );
        }
    }
    Ok(())
}

// =========================================================================
// GET /v1/backups
// =========================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ListQuery {
    pub limit: Option<u32>,
    pub count_only: bool,
}

#[derive(Debug, Serialize)]
pub struct BackupInfo {
    pub timestamp: String,
    pub encrypted_bytes: i64,
    pub source_file_count: i64,
    pub encrypted_sha256: String,
    pub created_at: String,
}

impl From<Backup> for BackupInfo {
    fn from(b: Backup) -> Self {
        Self {
            timestamp: b.timestamp,
            encrypted_bytes: b.encrypted_bytes,
            source_file_count: b.source_file_count,
            encrypted_sha256: b.encrypted_sha256,
            created_at: format_rfc3339(b.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListBackupsResponse {
    pub backups: Vec<BackupInfo>,
    pub count: i64,
    pub used_bytes: i64,
    pub quota_bytes: i64,
}

pub async fn list_backups(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<ListBackupsResponse>, ApiError> {
    let Query(query) = query.map_err(|_| ApiError::Validation("invalid query string".into()))?;

    let (count, used_bytes) = state.store.count_and_sum(&agent.id).await?;

    let backups = if query.count_only {
        Vec::new()
    } else {
        // Non-positive limits fall back to the default page size.
        let limit = query.limit.filter(|n| *n > 0).unwrap_or(100);
        state
            .store
            .list_backups(&agent.id, limit)
            .await?
            .into_iter()
            .map(BackupInfo::from)
            .collect()
    };

    Ok(Json(ListBackupsResponse {
        backups,
        count,
        used_bytes,
        quota_bytes: agent.quota_bytes,
    }))
}

// =========================================================================
// GET /v1/backups/{timestamp}
// =========================================================================

pub async fn get_backup(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Path(timestamp): Path<String>,
) -> Result<Json<BackupInfo>, ApiError> {
    let backup = state
        .store
        .get_backup(&agent.id, &timestamp)
        .await?
        .ok_or(ApiError::NotFound("backup not found"))?;

    Ok(Json(BackupInfo::from(backup)))
}

// =========================================================================
// POST /v1/backups/download-url
// =========================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DownloadUrlRequest {
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct DownloadUrlResponse {
    pub urls: HashMap<String, String>,
    pub expires_in: u64,
}

pub async fn download_url(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    body: Result<Json<DownloadUrlRequest>, JsonRejection>,
) -> Result<Json<DownloadUrlResponse>, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::Validation("invalid JSON body".into()))?;

    if req.timestamp.is_empty() {
        return Err(ApiError::Validation("timestamp is required".into()));
    }

    let backup = state
        .store
        .get_backup(&agent.id, &req.timestamp)
        .await?
        .ok_or(ApiError::NotFound("backup not found"))?;

    let mut urls = HashMap::with_capacity(2);
    urls.insert(
        BLOB_FILE.to_string(),
        state.broker.presign_get(&backup.blob_key).await?,
    );
    urls.insert(
        MANIFEST_FILE.to_string(),
        state.broker.presign_get(&backup.manifest_key).await?,
    );

    Ok(Json(DownloadUrlResponse {
        urls,
        expires_in: state.config.presign_expiry_seconds,
    }))
}

// =========================================================================
// DELETE /v1/backups/{timestamp}
// =========================================================================

#[derive(Debug, Serialize)]
pub struct DeleteBackupResponse {
    pub deleted: String,
    pub can_undelete_until: String,
}

pub async fn delete_backup(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Path(timestamp): Path<String>,
) -> Result<Json<DeleteBackupResponse>, ApiError> {
    let grace = state.config.delete_grace();
    let deleted = state
        .store
        .soft_delete_backup(&agent.id, &timestamp, grace)
        .await?;

    if deleted.is_none() {
        return Err(ApiError::NotFound("backup not found"));
    }

    // Object deletion is deferred to the purge sweep; within the grace
    // window the metadata can still be restored.
    info!(agent_id = %agent.id, timestamp = %timestamp, "soft-deleted backup");

    Ok(Json(DeleteBackupResponse {
        deleted: timestamp,
        can_undelete_until: format_rfc3339(unix_timestamp() + grace.as_secs() as i64),
    }))
}

// =========================================================================
// DELETE /v1/backups
// =========================================================================

#[derive(Debug, Serialize)]
pub struct DeleteAllResponse {
    pub deleted_count: usize,
    pub can_undelete_until: String,
}

pub async fn delete_all_backups(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
) -> Result<Json<DeleteAllResponse>, ApiError> {
    let grace = state.config.delete_grace();
    let deleted = state
        .store
        .soft_delete_all_backups(&agent.id, grace)
        .await?;

    info!(agent_id = %agent.id, count = deleted.len(), "soft-deleted all backups");

    Ok(Json(DeleteAllResponse {
        deleted_count: deleted.len(),
        can_undelete_until: format_rfc3339(unix_timestamp() + grace.as_secs() as i64),
    }))
}

// =========================================================================
// POST /v1/backups/{timestamp}/undelete
// =========================================================================

#[derive(Debug, Serialize)]
pub struct UndeleteResponse {
    pub restored: BackupInfo,
}

pub async fn undelete_backup(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
    Path(timestamp): Path<String>,
) -> Result<Json<UndeleteResponse>, ApiError> {
    state
        .store
        .undelete_backup(&agent.id, &timestamp)
        .await
        .map_err(|e| ApiError::not_found_or_storage(e, "backup not found"))?;

    let restored = state
        .store
        .get_backup(&agent.id, &timestamp)
        .await?
        .ok_or(ApiError::NotFound("backup not found"))?;

    info!(agent_id = %agent.id, timestamp = %timestamp, "restored backup");

    Ok(Json(UndeleteResponse {
        restored: BackupInfo::from(restored),
    }))
}
