//! DynamoDB backend for hosted deployments.
//!
//! Agents live in a table keyed by `id` with a `token-hash-index` GSI for
//! constant-time authentication; backups live in a table with partition key
//! `agent_id` and sort key `timestamp`. The `expires_at` attribute is the
//! table's TTL: the retention horizon while a backup is visible, the purge
//! deadline once it is soft-deleted, so the platform's TTL sweeper performs
//! the hard purge of rows without a server-side job.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::types::{AttributeValue, Select};
use aws_sdk_dynamodb::Client;

use agentvault_core::identity::hash_token;
use agentvault_core::time::unix_timestamp;
use agentvault_core::{Agent, AgentStatus, Backup, DataStore, StoreError};

use crate::config::Config;

/// Name of the GSI over `token_hash` on the agents table.
const TOKEN_HASH_INDEX: &str = "token-hash-index";

pub struct DynamoStore {
    client: Client,
    agents_table: String,
    backups_table: String,
    retention: Duration,
}

impl DynamoStore {
    /// Build a client from the configured region and optional endpoint
    /// override, using the platform's default credential chain.
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.object_region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Some(endpoint) = &config.kv_endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            agents_table: config.kv_agents_table.clone(),
            backups_table: config.kv_backups_table.clone(),
            retention: config.retention(),
        })
    }

    fn retention_expiry(&self) -> i64 {
        unix_timestamp() + self.retention.as_secs() as i64
    }

    async fn set_used_bytes(&self, agent_id: &str, used: i64) -> Result<(), StoreError> {
        self.client
            .update_item()
            .table_name(&self.agents_table)
            .key("id", AttributeValue::S(agent_id.to_string()))
            .update_expression("SET used_bytes = :ub")
            .expression_attribute_values(":ub", AttributeValue::N(used.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("update used_bytes: {e}")))?;

        Ok(())
    }

    /// Raw fetch of a backup item, soft-deleted included.
    async fn get_backup_raw(
        &self,
        agent_id: &str,
        timestamp: &str,
    ) -> Result<Option<Backup>, StoreError> {
        let out = self
            .client
            .get_item()
            .table_name(&self.backups_table)
            .key("agent_id", AttributeValue::S(agent_id.to_string()))
            .key("timestamp", AttributeValue::S(timestamp.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("get backup: {e}")))?;

        out.item().map(backup_from_item).transpose()
    }

    async fn mark_deleted(
        &self,
        agent_id: &str,
        timestamp: &str,
        deleted_at: i64,
        purge_at: i64,
    ) -> Result<(), StoreError> {
        self.client
            .update_item()
            .table_name(&self.backups_table)
            .key("agent_id", AttributeValue::S(agent_id.to_string()))
            .key("timestamp", AttributeValue::S(timestamp.to_string()))
            .update_expression("SET deleted_at = :da, expires_at = :ea")
            .expression_attribute_values(":da", AttributeValue::N(deleted_at.to_string()))
            .expression_attribute_values(":ea", AttributeValue::N(purge_at.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("soft-delete backup: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl DataStore for DynamoStore {
    // =========================================================================
    // Agent operations
    // =========================================================================

    async fn create_agent(&self, agent: &Agent, token_hash: &str) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.agents_table)
            .set_item(Some(agent_to_item(agent, token_hash)))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("create agent: {e}")))?;

        Ok(())
    }

    async fn lookup_agent_by_token(&self, token: &str) -> Result<Option<Agent>, StoreError> {
        let out = self
            .client
            .query()
            .table_name(&self.agents_table)
            .index_name(TOKEN_HASH_INDEX)
            .key_condition_expression("token_hash = :th")
            .expression_attribute_values(":th", AttributeValue::S(hash_token(token)))
            .limit(1)
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("query token index: {e}")))?;

        out.items().first().map(agent_from_item).transpose()
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let out = self
            .client
            .get_item()
            .table_name(&self.agents_table)
            .key("id", AttributeValue::S(id.to_string()))
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("get agent: {e}")))?;

        out.item().map(agent_from_item).transpose()
    }

    async fn rotate_agent_token(&self, id: &str, new_token_hash: &str) -> Result<(), StoreError> {
        self.client
            .update_item()
            .table_name(&self.agents_table)
            .key("id", AttributeValue::S(id.to_string()))
            .update_expression("SET token_hash = :th")
            .expression_attribute_values(":th", AttributeValue::S(new_token_hash.to_string()))
            .condition_expression("attribute_exists(id)")
            .send()
            .await
            .map_err(|e| {
                if is_condition_failure(&e) {
                    StoreError::NotFound(format!("Agent {id}"))
                } else {
                    StoreError::Query(format!("rotate token: {e}"))
                }
            })?;

        Ok(())
    }

    async fn recompute_used_bytes(&self, id: &str) -> Result<(), StoreError> {
        let (_, total) = self.count_and_sum(id).await?;
        self.set_used_bytes(id, total).await
    }

    async fn list_agents(&self, status: Option<AgentStatus>) -> Result<Vec<Agent>, StoreError> {
        let mut scan = self.client.scan().table_name(&self.agents_table);

        if let Some(status) = status {
            scan = scan
                .filter_expression("#s = :s")
                .expression_attribute_names("#s", "status")
                .expression_attribute_values(":s", AttributeValue::S(status.to_string()));
        }

        let out = scan
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("scan agents: {e}")))?;

        out.items().iter().map(agent_from_item).collect()
    }

    async fn update_agent_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError> {
        self.client
            .update_item()
            .table_name(&self.agents_table)
            .key("id", AttributeValue::S(id.to_string()))
            .update_expression("SET #s = :s")
            .expression_attribute_names("#s", "status")
            .expression_attribute_values(":s", AttributeValue::S(status.to_string()))
            .condition_expression("attribute_exists(id)")
            .send()
            .await
            .map_err(|e| {
                if is_condition_failure(&e) {
                    StoreError::NotFound(format!("Agent {id}"))
                } else {
                    StoreError::Query(format!("update status: {e}"))
                }
            })?;

        Ok(())
    }

    async fn count_agents_by_status(&self, status: AgentStatus) -> Result<i64, StoreError> {
        let out = self
            .client
            .scan()
            .table_name(&self.agents_table)
            .filter_expression("#s = :s")
            .expression_attribute_names("#s", "status")
            .expression_attribute_values(":s", AttributeValue::S(status.to_string()))
            .select(Select::Count)
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("count agents: {e}")))?;

        Ok(i64::from(out.count()))
    }

    // =========================================================================
    // Backup operations
    // =========================================================================

    async fn create_backup(&self, backup: &Backup) -> Result<(), StoreError> {
        // Unconditional put: a re-mint for the same (agent_id, timestamp)
        // replaces the earlier item.
        self.client
            .put_item()
            .table_name(&self.backups_table)
            .set_item(Some(backup_to_item(backup, self.retention_expiry())))
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("create backup: {e}")))?;

        self.recompute_used_bytes(&backup.agent_id).await
    }

    async fn list_backups(&self, agent_id: &str, limit: u32) -> Result<Vec<Backup>, StoreError> {
        let limit = if limit == 0 { 100 } else { limit };

        let out = self
            .client
            .query()
            .table_name(&self.backups_table)
            .key_condition_expression("agent_id = :aid")
            .filter_expression("attribute_not_exists(deleted_at)")
            .expression_attribute_values(":aid", AttributeValue::S(agent_id.to_string()))
            // Newest first by sort key; client timestamps order lexically.
            .scan_index_forward(false)
            .limit(limit.min(i32::MAX as u32) as i32)
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("query backups: {e}")))?;

        out.items().iter().map(backup_from_item).collect()
    }

    async fn count_and_sum(&self, agent_id: &str) -> Result<(i64, i64), StoreError> {
        let out = self
            .client
            .query()
            .table_name(&self.backups_table)
            .key_condition_expression("agent_id = :aid")
            .filter_expression("attribute_not_exists(deleted_at)")
            .expression_attribute_values(":aid", AttributeValue::S(agent_id.to_string()))
            .projection_expression("encrypted_bytes")
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("count backups: {e}")))?;

        let mut count = 0i64;
        let mut total = 0i64;
        for item in out.items() {
            count += 1;
            total += get_n(item, "encrypted_bytes").unwrap_or(0);
        }

        Ok((count, total))
    }

    async fn get_backup(
        &self,
        agent_id: &str,
        timestamp: &str,
    ) -> Result<Option<Backup>, StoreError> {
        let backup = self.get_backup_raw(agent_id, timestamp).await?;
        Ok(backup.filter(|b| !b.is_deleted()))
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
        self.mark_deleted(agent_id, timestamp, now, now + grace.as_secs() as i64)
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
        let purge_at = now + grace.as_secs() as i64;
        for backup in &backups {
            self.mark_deleted(agent_id, &backup.timestamp, now, purge_at)
                .await?;
        }

        self.recompute_used_bytes(agent_id).await?;
        Ok(backups)
    }

    async fn undelete_backup(&self, agent_id: &str, timestamp: &str) -> Result<(), StoreError> {
        let Some(backup) = self.get_backup_raw(agent_id, timestamp).await? else {
            return Err(StoreError::NotFound(format!(
                "Backup {agent_id}/{timestamp} in deleted state"
            )));
        };
        if !backup.is_deleted() {
            return Err(StoreError::NotFound(format!(
                "Backup {agent_id}/{timestamp} in deleted state"
            )));
        }

        self.client
            .update_item()
            .table_name(&self.backups_table)
            .key("agent_id", AttributeValue::S(agent_id.to_string()))
            .key("timestamp", AttributeValue::S(timestamp.to_string()))
            .update_expression("REMOVE deleted_at SET expires_at = :ea")
            .expression_attribute_values(
                ":ea",
                AttributeValue::N(self.retention_expiry().to_string()),
            )
            .send()
            .await
            .map_err(|e| StoreError::Query(format!("undelete backup: {e}")))?;

        self.recompute_used_bytes(agent_id).await
    }
}

// =========================================================================
// Item codecs
// =========================================================================

fn is_condition_failure<E, R>(err: &aws_sdk_dynamodb::error::SdkError<E, R>) -> bool
where
    E: aws_sdk_dynamodb::error::ProvideErrorMetadata,
{
    err.as_service_error()
        .and_then(|se| se.code())
        .is_some_and(|code| code == "ConditionalCheckFailedException")
}

fn get_s(item: &HashMap<String, AttributeValue>, key: &str) -> String {
    item.get(key)
        .and_then(|v| v.as_s().ok())
        .cloned()
        .unwrap_or_default()
}

fn get_n(item: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    item.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse().ok())
}

fn agent_to_item(agent: &Agent, token_hash: &str) -> HashMap<String, AttributeValue> {
    HashMap::from([
        ("id".into(), AttributeValue::S(agent.id.clone())),
        ("name".into(), AttributeValue::S(agent.name.clone())),
        ("hostname".into(), AttributeValue::S(agent.hostname.clone())),
        ("os".into(), AttributeValue::S(agent.os.clone())),
        ("arch".into(), AttributeValue::S(agent.arch.clone())),
        (
            "client_version".into(),
            AttributeValue::S(agent.client_version.clone()),
        ),
        (
            "fingerprint".into(),
            AttributeValue::S(agent.fingerprint.clone()),
        ),
        (
            "encrypt_tool".into(),
            AttributeValue::S(agent.encrypt_tool.clone()),
        ),
        (
            "public_key".into(),
            AttributeValue::S(agent.public_key.clone()),
        ),
        ("token_hash".into(), AttributeValue::S(token_hash.into())),
        ("status".into(), AttributeValue::S(agent.status.to_string())),
        (
            "quota_bytes".into(),
            AttributeValue::N(agent.quota_bytes.to_string()),
        ),
        (
            "used_bytes".into(),
            AttributeValue::N(agent.used_bytes.to_string()),
        ),
        (
            "created_at".into(),
            AttributeValue::N(agent.created_at.to_string()),
        ),
    ])
}

fn agent_from_item(item: &HashMap<String, AttributeValue>) -> Result<Agent, StoreError> {
    // Records that predate admission control carry no status; treat them as
    // already approved.
    let status = get_s(item, "status")
        .parse()
        .unwrap_or(AgentStatus::Active);

    Ok(Agent {
        id: get_s(item, "id"),
        name: get_s(item, "name"),
        hostname: get_s(item, "hostname"),
        os: get_s(item, "os"),
        arch: get_s(item, "arch"),
        client_version: get_s(item, "client_version"),
        fingerprint: get_s(item, "fingerprint"),
        encrypt_tool: get_s(item, "encrypt_tool"),
        public_key: get_s(item, "public_key"),
        status,
        quota_bytes: get_n(item, "quota_bytes").unwrap_or(0),
        used_bytes: get_n(item, "used_bytes").unwrap_or(0),
        created_at: get_n(item, "created_at").unwrap_or(0),
    })
}

fn backup_to_item(backup: &Backup, retention_expiry: i64) -> HashMap<String, AttributeValue> {
    let expires_at = backup.purge_at.unwrap_or(retention_expiry);

    let mut item = HashMap::from([
        ("agent_id".into(), AttributeValue::S(backup.agent_id.clone())),
        (
            "timestamp".into(),
            AttributeValue::S(backup.timestamp.clone()),
        ),
        (
            "encrypted_bytes".into(),
            AttributeValue::N(backup.encrypted_bytes.to_string()),
        ),
        (
            "source_file_count".into(),
            AttributeValue::N(backup.source_file_count.to_string()),
        ),
        (
            "encrypted_sha256".into(),
            AttributeValue::S(backup.encrypted_sha256.clone()),
        ),
        ("blob_key".into(), AttributeValue::S(backup.blob_key.clone())),
        (
            "manifest_key".into(),
            AttributeValue::S(backup.manifest_key.clone()),
        ),
        (
            "created_at".into(),
            AttributeValue::N(backup.created_at.to_string()),
        ),
        ("expires_at".into(), AttributeValue::N(expires_at.to_string())),
    ]);

    if let Some(deleted_at) = backup.deleted_at {
        item.insert(
            "deleted_at".into(),
            AttributeValue::N(deleted_at.to_string()),
        );
    }

    item
}

fn backup_from_item(item: &HashMap<String, AttributeValue>) -> Result<Backup, StoreError> {
    let deleted_at = get_n(item, "deleted_at");
    // While soft-deleted, the TTL attribute is the purge deadline.
    let purge_at = deleted_at.and(get_n(item, "expires_at"));

    Ok(Backup {
        agent_id: get_s(item, "agent_id"),
        timestamp: get_s(item, "timestamp"),
        encrypted_bytes: get_n(item, "encrypted_bytes").unwrap_or(0),
        source_file_count: get_n(item, "source_file_count").unwrap_or(0),
        encrypted_sha256: get_s(item, "encrypted_sha256"),
        blob_key: get_s(item, "blob_key"),
        manifest_key: get_s(item, "manifest_key"),
        created_at: get_n(item, "created_at").unwrap_or(0),
        deleted_at,
        purge_at,
    })
}
