use crate::backend_state::{
    BackendState, CONVERSATION_SWEEP_INTERVAL, QUARANTINE_SWEEP_INTERVAL,
};
use crate::users::UserStore;
use std::time::Duration;

const USAGE_LOG_RETENTION_DAYS: i64 = 7;
const USAGE_LOG_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Spawn the housekeeping loops: quarantine sweep, conversation sweep, and
/// the daily usage-log purge. Each runs until the process exits.
pub fn spawn_sweepers(state: BackendState, users: UserStore) {
    let quarantine_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(QUARANTINE_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = quarantine_state.sweep_quarantine().await;
            if removed > 0 {
                tracing::debug!(removed, "quarantine sweep");
            }
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CONVERSATION_SWEEP_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = state.sweep_conversations().await;
            if removed > 0 {
                tracing::debug!(removed, "conversation sweep");
            }
        }
    });

    tokio::spawn(async move {
        // purge once at startup, then daily
        loop {
            match users
                .purge_usage_logs_older_than(USAGE_LOG_RETENTION_DAYS)
                .await
            {
                Ok(purged) if purged > 0 => {
                    tracing::info!(purged, "usage log retention purge");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("usage log purge failed: {err}"),
            }
            tokio::time::sleep(USAGE_LOG_SWEEP_INTERVAL).await;
        }
    });
}
