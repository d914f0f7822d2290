//! Storage contract tests, run against the embedded SQLite backend.
//!
//! These pin the semantics every backend must satisfy: soft-deleted rows are
//! invisible, `used_bytes` tracks the visible set after every mutation, and
//! repeated creates replace rather than conflict.

use std::time::Duration;

use agentvault_core::identity::{generate_token, hash_token};
use agentvault_core::time::unix_timestamp;
use agentvault_core::{Agent, AgentStatus, Backup, DataStore, StoreError};

use super::sqlite::SqliteStore;

const GRACE: Duration = Duration::from_secs(72 * 3600);

async fn test_db() -> SqliteStore {
    SqliteStore::open_in_memory().await.unwrap()
}

fn agent(id: &str, status: AgentStatus) -> Agent {
    Agent {
        id: id.to_string(),
        name: "test-agent".into(),
        hostname: "devbox".into(),
        os: "Linux".into(),
        arch: "x86_64".into(),
        client_version: "0.3.0".into(),
        fingerprint: "fp".into(),
        encrypt_tool: "age".into(),
        public_key: "age1xyz".into(),
        status,
        quota_bytes: 500 * 1024 * 1024,
        used_bytes: 0,
        created_at: unix_timestamp(),
    }
}

fn backup(agent_id: &str, timestamp: &str, bytes: i64, created_at: i64) -> Backup {
    Backup::new(agent_id, timestamp, bytes, 3, "abc123", created_at)
}

// === Agent tests ===

#[tokio::test]
async fn create_and_get_agent() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Pending), "hash1")
        .await
        .unwrap();

    let found = db.get_agent("ag_1").await.unwrap().unwrap();
    assert_eq!(found.name, "test-agent");
    assert_eq!(found.status, AgentStatus::Pending);
    assert_eq!(found.used_bytes, 0);

    assert!(db.get_agent("ag_missing").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_agent_id_fails() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Pending), "hash1")
        .await
        .unwrap();

    let err = db
        .create_agent(&agent("ag_1", AgentStatus::Pending), "hash2")
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn duplicate_token_hash_fails() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Pending), "same-hash")
        .await
        .unwrap();

    let err = db
        .create_agent(&agent("ag_2", AgentStatus::Pending), "same-hash")
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn lookup_agent_by_token() {
    let db = test_db().await;
    let (token, hash) = generate_token();
    db.create_agent(&agent("ag_1", AgentStatus::Active), &hash)
        .await
        .unwrap();

    let found = db.lookup_agent_by_token(&token).await.unwrap();
    assert_eq!(found.unwrap().id, "ag_1");

    let miss = db.lookup_agent_by_token("ocb_wrong").await.unwrap();
    assert!(miss.is_none());
}

#[tokio::test]
async fn rotate_token_invalidates_old_immediately() {
    let db = test_db().await;
    let (old_token, old_hash) = generate_token();
    db.create_agent(&agent("ag_1", AgentStatus::Active), &old_hash)
        .await
        .unwrap();

    let (new_token, new_hash) = generate_token();
    db.rotate_agent_token("ag_1", &new_hash).await.unwrap();

    assert!(db.lookup_agent_by_token(&old_token).await.unwrap().is_none());
    assert_eq!(
        db.lookup_agent_by_token(&new_token)
            .await
            .unwrap()
            .unwrap()
            .id,
        "ag_1"
    );
}

#[tokio::test]
async fn rotate_token_unknown_agent_is_not_found() {
    let db = test_db().await;
    let err = db.rotate_agent_token("ag_missing", &hash_token("t")).await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn update_status_and_count() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Pending), "h1")
        .await
        .unwrap();
    db.create_agent(&agent("ag_2", AgentStatus::Pending), "h2")
        .await
        .unwrap();

    assert_eq!(
        db.count_agents_by_status(AgentStatus::Pending).await.unwrap(),
        2
    );

    db.update_agent_status("ag_1", AgentStatus::Active)
        .await
        .unwrap();

    assert_eq!(
        db.count_agents_by_status(AgentStatus::Pending).await.unwrap(),
        1
    );
    assert_eq!(
        db.count_agents_by_status(AgentStatus::Active).await.unwrap(),
        1
    );

    let err = db
        .update_agent_status("ag_missing", AgentStatus::Active)
        .await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn list_agents_with_filter() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Pending), "h1")
        .await
        .unwrap();
    db.create_agent(&agent("ag_2", AgentStatus::Active), "h2")
        .await
        .unwrap();
    db.create_agent(&agent("ag_3", AgentStatus::Suspended), "h3")
        .await
        .unwrap();

    assert_eq!(db.list_agents(None).await.unwrap().len(), 3);

    let suspended = db.list_agents(Some(AgentStatus::Suspended)).await.unwrap();
    assert_eq!(suspended.len(), 1);
    assert_eq!(suspended[0].id, "ag_3");
}

// === Backup tests ===

#[tokio::test]
async fn create_backup_updates_used_bytes() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();

    db.create_backup(&backup("ag_1", "t1", 1024, 100))
        .await
        .unwrap();
    db.create_backup(&backup("ag_1", "t2", 2048, 200))
        .await
        .unwrap();

    let found = db.get_agent("ag_1").await.unwrap().unwrap();
    assert_eq!(found.used_bytes, 3072);

    let (count, sum) = db.count_and_sum("ag_1").await.unwrap();
    assert_eq!(count, 2);
    assert_eq!(sum, 3072);
}

#[tokio::test]
async fn create_backup_replaces_same_timestamp() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();

    db.create_backup(&backup("ag_1", "t1", 1024, 100))
        .await
        .unwrap();
    db.create_backup(&backup("ag_1", "t1", 4096, 200))
        .await
        .unwrap();

    let (count, sum) = db.count_and_sum("ag_1").await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(sum, 4096);

    let found = db.get_backup("ag_1", "t1").await.unwrap().unwrap();
    assert_eq!(found.encrypted_bytes, 4096);
}

#[tokio::test]
async fn list_backups_newest_first_with_limit() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();

    db.create_backup(&backup("ag_1", "t1", 100, 100)).await.unwrap();
    db.create_backup(&backup("ag_1", "t2", 100, 200)).await.unwrap();
    db.create_backup(&backup("ag_1", "t3", 100, 300)).await.unwrap();

    let all = db.list_backups("ag_1", 0).await.unwrap();
    let timestamps: Vec<_> = all.iter().map(|b| b.timestamp.as_str()).collect();
    assert_eq!(timestamps, vec!["t3", "t2", "t1"]);

    let limited = db.list_backups("ag_1", 2).await.unwrap();
    assert_eq!(limited.len(), 2);
    assert_eq!(limited[0].timestamp, "t3");
}

#[tokio::test]
async fn soft_delete_hides_backup_and_restores_used_bytes() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();
    db.create_backup(&backup("ag_1", "t1", 1024, 100))
        .await
        .unwrap();

    let snapshot = db
        .soft_delete_backup("ag_1", "t1", GRACE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.encrypted_bytes, 1024);
    assert!(!snapshot.is_deleted());

    assert!(db.get_backup("ag_1", "t1").await.unwrap().is_none());
    assert!(db.list_backups("ag_1", 0).await.unwrap().is_empty());
    assert_eq!(db.count_and_sum("ag_1").await.unwrap(), (0, 0));

    let found = db.get_agent("ag_1").await.unwrap().unwrap();
    assert_eq!(found.used_bytes, 0);

    // Deleting again finds nothing visible.
    assert!(db
        .soft_delete_backup("ag_1", "t1", GRACE)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn soft_delete_schedules_purge_after_grace() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();
    db.create_backup(&backup("ag_1", "t1", 1024, 100))
        .await
        .unwrap();

    let before = unix_timestamp();
    db.soft_delete_backup("ag_1", "t1", GRACE).await.unwrap();

    // The row still exists underneath with a purge deadline one grace
    // window out.
    let rows = sqlx::query_as::<_, Backup>(
        "SELECT * FROM backups WHERE agent_id = ? AND timestamp = ?",
    )
    .bind("ag_1")
    .bind("t1")
    .fetch_all(db.pool())
    .await
    .unwrap();

    assert_eq!(rows.len(), 1);
    let purge_at = rows[0].purge_at.unwrap();
    assert!(purge_at >= before + GRACE.as_secs() as i64);
}

#[tokio::test]
async fn soft_delete_all_backups() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();
    db.create_backup(&backup("ag_1", "t1", 100, 100)).await.unwrap();
    db.create_backup(&backup("ag_1", "t2", 200, 200)).await.unwrap();

    let deleted = db.soft_delete_all_backups("ag_1", GRACE).await.unwrap();
    assert_eq!(deleted.len(), 2);

    assert_eq!(db.count_and_sum("ag_1").await.unwrap(), (0, 0));
    assert_eq!(db.get_agent("ag_1").await.unwrap().unwrap().used_bytes, 0);
}

#[tokio::test]
async fn undelete_restores_identical_record() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();

    let original = backup("ag_1", "t1", 1024, 100);
    db.create_backup(&original).await.unwrap();
    db.soft_delete_backup("ag_1", "t1", GRACE).await.unwrap();

    db.undelete_backup("ag_1", "t1").await.unwrap();

    let restored = db.get_backup("ag_1", "t1").await.unwrap().unwrap();
    assert_eq!(restored, original);
    assert_eq!(db.get_agent("ag_1").await.unwrap().unwrap().used_bytes, 1024);
}

#[tokio::test]
async fn undelete_requires_deleted_state() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();
    db.create_backup(&backup("ag_1", "t1", 1024, 100))
        .await
        .unwrap();

    // Visible record: not a valid undelete target.
    let err = db.undelete_backup("ag_1", "t1").await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));

    // Missing record.
    let err = db.undelete_backup("ag_1", "t_missing").await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));

    // Double undelete.
    db.soft_delete_backup("ag_1", "t1", GRACE).await.unwrap();
    db.undelete_backup("ag_1", "t1").await.unwrap();
    let err = db.undelete_backup("ag_1", "t1").await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn purge_removes_expired_rows_only() {
    let db = test_db().await;
    db.create_agent(&agent("ag_1", AgentStatus::Active), "h1")
        .await
        .unwrap();
    db.create_backup(&backup("ag_1", "t1", 100, 100)).await.unwrap();
    db.create_backup(&backup("ag_1", "t2", 200, 200)).await.unwrap();

    // t1 past its grace window, t2 still inside it.
    db.soft_delete_backup("ag_1", "t1", Duration::ZERO)
        .await
        .unwrap();
    db.soft_delete_backup("ag_1", "t2", GRACE).await.unwrap();

    let purged = db.purge_expired().await.unwrap();
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].timestamp, "t1");

    // t2 is still restorable.
    db.undelete_backup("ag_1", "t2").await.unwrap();
    assert!(db.get_backup("ag_1", "t2").await.unwrap().is_some());

    // t1 is gone for good.
    let err = db.undelete_backup("ag_1", "t1").await;
    assert!(matches!(err, Err(StoreError::NotFound(_))));
}
