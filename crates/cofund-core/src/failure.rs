//! Per-user payment failure circuit breaker.

use chrono::Utc;
use std::sync::Arc;

use crate::activity::{ActivityEntry, ActivityKind};
use crate::error::CofundError;
use crate::store::{AccountStore, FailureStore, Store};
use crate::types::{FailureStatus, PaymentFailureRecord, UserAccount};

/// Counts consecutive payment failures and suspends payers that hit the threshold.
///
/// Suspension is only cleared by [`FailureTracker::unsuspend`]; a later success
/// resets the counter but leaves the flag set.
#[derive(Clone)]
pub struct FailureTracker {
    store: Arc<dyn Store>,
    threshold: u32,
}

impl FailureTracker {
    pub fn new(store: Arc<dyn Store>, threshold: u32) -> Self {
        Self {
            store,
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub async fn status(&self, user_id: &str) -> Result<FailureStatus, CofundError> {
        let record = self
            .store
            .get_failure_record(user_id)
            .await?
            .unwrap_or_else(|| PaymentFailureRecord::clean(user_id));
        Ok(FailureStatus::from_record(&record, self.threshold))
    }

    pub async fn record_failure(&self, user_id: &str) -> Result<FailureStatus, CofundError> {
        let update = self
            .store
            .record_failure(
                user_id,
                self.threshold,
                Utc::now(),
                suspension_entry(user_id, self.threshold),
            )
            .await?;
        if update.newly_suspended {
            tracing::warn!(
                user_id = %user_id,
                failures = update.record.consecutive_failure_count,
                "payer suspended after consecutive payment failures"
            );
        }
        Ok(FailureStatus::from_record(&update.record, self.threshold))
    }

    pub async fn record_success(&self, user_id: &str) -> Result<(), CofundError> {
        self.store.record_success(user_id).await?;
        Ok(())
    }

    /// Administrative suspension; `Conflict` if the user is already suspended.
    pub async fn suspend(&self, user_id: &str, reason: &str) -> Result<(), CofundError> {
        let entry = ActivityEntry::new(
            ActivityKind::AccountSuspended,
            user_id,
            format!("Payments suspended: {reason}"),
        );
        let changed = self.store.suspend(user_id, Utc::now(), entry).await?;
        if !changed {
            return Err(CofundError::Conflict(format!(
                "user {user_id} is already suspended"
            )));
        }
        tracing::info!(user_id = %user_id, reason, "payer suspended by administrator");
        Ok(())
    }

    /// Administrative reset of the counter and the suspension flag.
    pub async fn unsuspend(&self, user_id: &str) -> Result<FailureStatus, CofundError> {
        let entry = ActivityEntry::new(
            ActivityKind::AccountUnsuspended,
            user_id,
            "Payment suspension lifted",
        );
        let record = self.store.unsuspend(user_id, entry).await?;
        tracing::info!(user_id = %user_id, "payer unsuspended");
        Ok(FailureStatus::from_record(&record, self.threshold))
    }

    /// Reject banned or suspended payers at request acceptance.
    ///
    /// Returns the stored account, if there is one.
    pub async fn check_standing(&self, user_id: &str) -> Result<Option<UserAccount>, CofundError> {
        let account = self.store.get_account(user_id).await?;
        if account.as_ref().is_some_and(|account| account.banned) {
            return Err(CofundError::Forbidden(format!("user {user_id} is banned")));
        }

        let status = self.status(user_id).await?;
        if status.suspended {
            return Err(CofundError::Forbidden(format!(
                "payments are suspended for user {user_id} after {} consecutive failures",
                status.failure_count
            )));
        }
        Ok(account)
    }
}

/// Activity written when a failure crosses the threshold.
pub(crate) fn suspension_entry(user_id: &str, threshold: u32) -> ActivityEntry {
    ActivityEntry::new(
        ActivityKind::AccountSuspended,
        user_id,
        format!("Payments suspended after {threshold} consecutive failures"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityQuery;
    use crate::store::ActivityStore;
    use crate::store::MemoryStore;

    fn tracker() -> (Arc<dyn Store>, FailureTracker) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        (store.clone(), FailureTracker::new(store, 3))
    }

    #[tokio::test]
    async fn threshold_suspends_and_success_does_not_clear() {
        let (store, tracker) = tracker();

        let first = tracker.record_failure("u1").await.unwrap();
        assert_eq!(first.failure_count, 1);
        assert_eq!(first.remaining_attempts, 2);
        assert!(!first.suspended);

        tracker.record_failure("u1").await.unwrap();
        let third = tracker.record_failure("u1").await.unwrap();
        assert!(third.suspended);
        assert_eq!(third.remaining_attempts, 0);

        tracker.record_success("u1").await.unwrap();
        let after = tracker.status("u1").await.unwrap();
        assert_eq!(after.failure_count, 0);
        assert!(after.suspended);

        let suspensions = store
            .list_activity(&ActivityQuery::for_user("u1").kind(ActivityKind::AccountSuspended))
            .await
            .unwrap();
        assert_eq!(suspensions.len(), 1);
    }

    #[tokio::test]
    async fn suspended_payer_is_rejected_until_unsuspended() {
        let (store, tracker) = tracker();
        for _ in 0..3 {
            tracker.record_failure("u1").await.unwrap();
        }
        assert!(matches!(
            tracker.check_standing("u1").await,
            Err(CofundError::Forbidden(_))
        ));

        let status = tracker.unsuspend("u1").await.unwrap();
        assert_eq!(status.failure_count, 0);
        assert!(!status.suspended);
        assert!(tracker.check_standing("u1").await.is_ok());

        let record = store.get_failure_record("u1").await.unwrap().unwrap();
        assert_eq!(record.last_failure_at, None);
        let lifted = store
            .list_activity(&ActivityQuery::for_user("u1").kind(ActivityKind::AccountUnsuspended))
            .await
            .unwrap();
        assert_eq!(lifted.len(), 1);
    }

    #[tokio::test]
    async fn suspending_twice_conflicts() {
        let (_, tracker) = tracker();
        tracker.suspend("u1", "chargeback").await.unwrap();
        assert!(matches!(
            tracker.suspend("u1", "chargeback").await,
            Err(CofundError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_failures_are_all_counted() {
        let (_, tracker) = tracker();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record_failure("u1").await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let status = tracker.status("u1").await.unwrap();
        assert_eq!(status.failure_count, 8);
        assert!(status.suspended);
    }
}
