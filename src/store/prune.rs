//! Retention-based pruning loop.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetentionConfig;

use super::Store;

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Run one prune pass immediately, then one per hour until cancelled.
pub async fn run_pruner(store: Arc<Store>, retention: RetentionConfig, token: CancellationToken) {
    loop {
        let now = proxmox_time::epoch_i64();
        store.prune(now, &retention);

        tokio::select! {
            _ = tokio::time::sleep(PRUNE_INTERVAL) => (),
            _ = token.cancelled() => {
                log::debug!("pruner shutting down");
                return;
            }
        }
    }
}
