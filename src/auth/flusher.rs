//! Background writer for the stats and token-access queues.
//!
//! A single task wakes on the configured interval, swaps each queue out
//! under the lock, and writes the drained entries in one transaction per
//! queue. Errors are logged and the next tick retries with whatever has
//! been enqueued since; the counters are advisory and a batch lost on
//! crash stays lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::errors::AuthResult;
use super::manager::AuthManager;
use super::models::{Stats, TokenUpdate};

/// Spawn the queue writer. It holds only a weak reference, so dropping the
/// manager stops the task on its next tick.
pub(super) fn spawn(manager: &Arc<AuthManager>, interval: Duration) {
    let weak = Arc::downgrade(manager);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately, skip it
        loop {
            ticker.tick().await;
            let Some(manager) = weak.upgrade() else {
                break;
            };
            if let Err(err) = manager.flush_user_stats().await {
                warn!(error = %err, "Writing user stats queue failed");
            }
            if let Err(err) = manager.flush_token_updates().await {
                warn!(error = %err, "Writing token update queue failed");
            }
        }
    });
}

impl AuthManager {
    /// Write all queued stats updates in one transaction. Normally driven
    /// by the background writer; callable directly to force a flush.
    pub async fn flush_user_stats(&self) -> AuthResult<()> {
        let stats_queue: HashMap<String, Stats> = {
            let mut queues = self.queues.lock().await;
            std::mem::take(&mut queues.stats)
        };
        if stats_queue.is_empty() {
            trace!("No user stats updates to commit");
            return Ok(());
        }
        debug!(users = stats_queue.len(), "Writing user stats queue");
        let mut tx = self.pool().begin().await?;
        for (user_id, stats) in stats_queue {
            sqlx::query(
                "UPDATE user SET stats_messages = ?, stats_emails = ?, stats_calls = ? WHERE id = ?",
            )
            .bind(stats.messages)
            .bind(stats.emails)
            .bind(stats.calls)
            .bind(&user_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Write all queued token last-access updates in one transaction
    pub async fn flush_token_updates(&self) -> AuthResult<()> {
        let token_queue: HashMap<String, TokenUpdate> = {
            let mut queues = self.queues.lock().await;
            std::mem::take(&mut queues.tokens)
        };
        if token_queue.is_empty() {
            trace!("No token updates to commit");
            return Ok(());
        }
        debug!(tokens = token_queue.len(), "Writing token update queue");
        let mut tx = self.pool().begin().await?;
        for (token, update) in token_queue {
            sqlx::query("UPDATE user_token SET last_access = ?, last_origin = ? WHERE token = ?")
                .bind(update.last_access.timestamp())
                .bind(update.last_origin.to_string())
                .bind(&token)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
