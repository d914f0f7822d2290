//! Background hard-purge for the embedded SQL backend.
//!
//! Soft-deleted rows whose grace window has elapsed are removed and their
//! objects deleted best-effort. The cloud KV backend does not need this: its
//! table TTL removes expired rows, with object cleanup handled by bucket
//! lifecycle rules.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use agentvault_core::StoreError;

use crate::objectstore::ObjectStoreBroker;
use crate::storage::SqliteStore;

/// Run the purge sweep forever at the given interval.
pub async fn run(store: Arc<SqliteStore>, broker: Arc<ObjectStoreBroker>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match run_once(&store, &broker).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "hard-purged expired backups"),
            Err(cause) => error!(%cause, "hard purge sweep failed"),
        }
    }
}

/// One sweep: remove every row past its `purge_at` and delete its objects.
pub async fn run_once(
    store: &SqliteStore,
    broker: &ObjectStoreBroker,
) -> Result<usize, StoreError> {
    let purged = store.purge_expired().await?;
    for backup in &purged {
        broker.delete_backup_objects(backup).await;
    }
    Ok(purged.len())
}
