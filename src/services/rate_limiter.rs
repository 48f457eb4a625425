//! Monthly sync quota gate.
//!
//! The only code path allowed to bump a connection's sync counter.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{next_reset_after, QuotaCheck};
use crate::error::Result;
use crate::store::FarmStore;

#[derive(Clone)]
pub struct SyncRateLimiter {
    store: Arc<dyn FarmStore>,
    monthly_limit: i32,
}

impl SyncRateLimiter {
    pub fn new(store: Arc<dyn FarmStore>, monthly_limit: i32) -> Self {
        Self {
            store,
            monthly_limit,
        }
    }

    pub fn monthly_limit(&self) -> i32 {
        self.monthly_limit
    }

    pub async fn check_and_increment(&self, connection_id: Uuid) -> Result<QuotaCheck> {
        self.check_and_increment_at(connection_id, self.monthly_limit, Utc::now())
            .await
    }

    /// Atomic check-and-increment against `max_syncs`, evaluated at `now`
    pub async fn check_and_increment_at(
        &self,
        connection_id: Uuid,
        max_syncs: i32,
        now: DateTime<Utc>,
    ) -> Result<QuotaCheck> {
        let check = self
            .store
            .check_and_increment_sync(connection_id, max_syncs, now, next_reset_after(now))
            .await?;

        if check.reset_needed {
            info!(%connection_id, "monthly sync counter reset");
        }
        if check.can_sync {
            debug!(%connection_id, count = check.current_count, max = max_syncs, "sync slot granted");
        } else {
            info!(%connection_id, count = check.current_count, max = max_syncs, "sync refused by monthly quota");
        }
        Ok(check)
    }
}

/// User-visible refusal persisted on the connection
pub fn quota_message(current: i32, max: i32) -> String {
    format!(
        "Monthly sync limit reached ({}/{}). Resets on the 1st.",
        current, max
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::domain::{ConnectionStatus, SyncConnection};
    use chrono::Duration;

    fn connection(count: i32, reset_at: DateTime<Utc>) -> SyncConnection {
        SyncConnection {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            server: "Broker-Demo".into(),
            login: "1001".into(),
            encrypted_password: "pw".into(),
            bridge_account_id: None,
            status: ConnectionStatus::Undeployed,
            error_message: None,
            last_synced_at: None,
            syncs_this_month: count,
            syncs_reset_at: reset_at,
        }
    }

    #[test]
    fn test_quota_message() {
        assert_eq!(
            quota_message(60, 60),
            "Monthly sync limit reached (60/60). Resets on the 1st."
        );
    }

    #[tokio::test]
    async fn test_last_slot_then_refusal() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let conn = connection(59, now + Duration::days(3));
        let id = conn.id;
        store.insert_connection(conn).await;

        let limiter = SyncRateLimiter::new(store.clone(), 60);
        let first = limiter.check_and_increment_at(id, 60, now).await.unwrap();
        assert!(first.can_sync);
        assert_eq!(first.current_count, 60);

        let second = limiter.check_and_increment_at(id, 60, now).await.unwrap();
        assert!(!second.can_sync);
        assert_eq!(second.current_count, 60);
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let limiter = SyncRateLimiter::new(store, 60);
        let err = limiter.check_and_increment(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_expected());
    }
}
