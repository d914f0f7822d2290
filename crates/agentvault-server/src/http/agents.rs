//! Agent lifecycle handlers: enrollment, self-service, and admin control.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use tracing::info;

use agentvault_core::time::{format_rfc3339, unix_timestamp};
use agentvault_core::{identity, Agent, AgentStatus};

use super::error::ApiError;
use super::AppState;

// =========================================================================
// POST /v1/agents/register
// =========================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RegisterRequest {
    pub agent_name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub client_version: String,
    pub fingerprint: String,
    pub encrypt_tool: String,
    pub public_key: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    /// The bearer token in plaintext. Shown exactly once; only its hash is
    /// stored.
    pub token: String,
    pub status: AgentStatus,
    pub quota_mb: i64,
    pub backup_prefix: String,
}

pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    let Json(req) = body.map_err(|_| ApiError::Validation("invalid JSON body".into()))?;

    if req.agent_name.trim().is_empty() {
        return Err(ApiError::Validation("agent_name is required".into()));
    }

    // Anti-flood: refuse new enrollments while too many sit unapproved.
    let pending = state
        .store
        .count_agents_by_status(AgentStatus::Pending)
        .await?;
    if pending >= state.config.max_pending_agents {
        return Err(ApiError::PendingFlood);
    }

    let agent_id = identity::generate_agent_id();
    let (token, token_hash) = identity::generate_token();

    let agent = Agent {
        id: agent_id.clone(),
        name: req.agent_name,
        hostname: req.hostname,
        os: req.os,
        arch: req.arch,
        client_version: req.client_version,
        fingerprint: req.fingerprint,
        encrypt_tool: req.encrypt_tool,
        public_key: req.public_key,
        status: AgentStatus::Pending,
        quota_bytes: state.config.default_quota_bytes,
        used_bytes: 0,
        created_at: unix_timestamp(),
    };

    state.store.create_agent(&agent, &token_hash).await?;

    info!(agent_id = %agent.id, name = %agent.name, hostname = %agent.hostname, "registered agent");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            backup_prefix: format!("{agent_id}/"),
            agent_id,
            token,
            status: AgentStatus::Pending,
            quota_mb: state.config.default_quota_bytes / (1024 * 1024),
        }),
    ))
}

// =========================================================================
// GET /v1/agents/me
// =========================================================================

#[derive(Debug, Serialize)]
pub struct AgentInfoResponse {
    pub agent_id: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub client_version: String,
    pub encrypt_tool: String,
    pub status: AgentStatus,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub created_at: String,
}

pub async fn agent_info(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
) -> Result<Json<AgentInfoResponse>, ApiError> {
    // Refresh the cached usage figure before reporting it.
    state.store.recompute_used_bytes(&agent.id).await?;
    let agent = state.store.get_agent(&agent.id).await?.unwrap_or(agent);

    Ok(Json(AgentInfoResponse {
        agent_id: agent.id,
        name: agent.name,
        hostname: agent.hostname,
        os: agent.os,
        arch: agent.arch,
        client_version: agent.client_version,
        encrypt_tool: agent.encrypt_tool,
        status: agent.status,
        quota_bytes: agent.quota_bytes,
        used_bytes: agent.used_bytes,
        created_at: format_rfc3339(agent.created_at),
    }))
}

// =========================================================================
// POST /v1/agents/me/rotate-token
// =========================================================================

#[derive(Debug, Serialize)]
pub struct RotateTokenResponse {
    pub token: String,
}

pub async fn rotate_token(
    State(state): State<AppState>,
    Extension(agent): Extension<Agent>,
) -> Result<Json<RotateTokenResponse>, ApiError> {
    let (token, token_hash) = identity::generate_token();
    state
        .store
        .rotate_agent_token(&agent.id, &token_hash)
        .await?;

    info!(agent_id = %agent.id, "rotated agent token");

    Ok(Json(RotateTokenResponse { token }))
}

// =========================================================================
// Admin: GET /v1/admin/agents, approve, suspend
// =========================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AdminListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AdminAgentInfo {
    pub agent_id: String,
    pub name: String,
    pub hostname: String,
    pub status: AgentStatus,
    pub quota_bytes: i64,
    pub used_bytes: i64,
    pub created_at: String,
}

pub async fn admin_list_agents(
    State(state): State<AppState>,
    query: Result<Query<AdminListQuery>, QueryRejection>,
) -> Result<Json<Vec<AdminAgentInfo>>, ApiError> {
    let Query(query) = query.map_err(|_| ApiError::Validation("invalid query string".into()))?;

    let status = match query.status.as_deref() {
        None | Some("") => None,
        Some(value) => Some(
            value
                .parse::<AgentStatus>()
                .map_err(ApiError::Validation)?,
        ),
    };

    let agents = state.store.list_agents(status).await?;

    Ok(Json(
        agents
            .into_iter()
            .map(|a| AdminAgentInfo {
                agent_id: a.id,
                name: a.name,
                hostname: a.hostname,
                status: a.status,
                quota_bytes: a.quota_bytes,
                used_bytes: a.used_bytes,
                created_at: format_rfc3339(a.created_at),
            })
            .collect(),
    ))
}

#[derive(Debug, Serialize)]
pub struct AdminStatusResponse {
    pub agent_id: String,
    pub status: AgentStatus,
}

async fn set_status(
    state: &AppState,
    id: String,
    status: AgentStatus,
) -> Result<Json<AdminStatusResponse>, ApiError> {
    state
        .store
        .update_agent_status(&id, status)
        .await
        .map_err(|e| ApiError::not_found_or_storage(e, "agent not found"))?;

    info!(agent_id = %id, status = %status, "admin changed agent status");

    Ok(Json(AdminStatusResponse {
        agent_id: id,
        status,
    }))
}

pub async fn admin_approve_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AdminStatusResponse>, ApiError> {
    set_status(&state, id, AgentStatus::Active).await
}

pub async fn admin_suspend_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AdminStatusResponse>, ApiError> {
    set_status(&state, id, AgentStatus::Suspended).await
}
