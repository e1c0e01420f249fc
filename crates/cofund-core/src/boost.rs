//! Paid visibility boosts.
//!
//! A purchase is charged synchronously against the owner's stored payment
//! method. The charge result goes through the same reconciler as the webhook,
//! so whichever path lands first activates the boost and the other is absorbed.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind};
use crate::config::FeePolicy;
use crate::error::CofundError;
use crate::failure::FailureTracker;
use crate::gateway::{
    GatewayClient, GatewayStatus, IntentMetadata, PaymentEvent, PaymentKind, PaymentOutcome,
};
use crate::reconciler::{SettlementOutcome, SettlementReconciler};
use crate::store::{BoostStore, ResourceStore, Store};
use crate::types::{Boost, SweepReport};

#[derive(Clone)]
pub struct BoostLedger {
    store: Arc<dyn Store>,
    gateway: GatewayClient,
    reconciler: SettlementReconciler,
    failures: FailureTracker,
    cap: usize,
    price_minor: u64,
    fees: FeePolicy,
}

impl BoostLedger {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: GatewayClient,
        reconciler: SettlementReconciler,
        failures: FailureTracker,
        cap: usize,
        price_minor: u64,
        fees: FeePolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            reconciler,
            failures,
            cap,
            price_minor,
            fees,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn price_minor(&self) -> u64 {
        self.price_minor
    }

    /// Charge the owner and activate a boost for `resource_id`.
    ///
    /// The pre-checks here only fail fast; the live-boost and cap limits are
    /// enforced again inside the settlement.
    pub async fn request_boost(
        &self,
        owner_id: &str,
        resource_id: Uuid,
    ) -> Result<Boost, CofundError> {
        let account = self.failures.check_standing(owner_id).await?;

        let resource = self
            .store
            .get_resource(resource_id)
            .await?
            .ok_or_else(|| CofundError::NotFound(format!("resource {resource_id}")))?;
        if resource.owner_id != owner_id {
            return Err(CofundError::Forbidden(
                "only the resource owner can boost it".to_string(),
            ));
        }
        if !resource.active {
            return Err(CofundError::Conflict(format!(
                "resource {resource_id} is not active"
            )));
        }

        let now = Utc::now();
        if self
            .store
            .live_boost_for_resource(resource_id, now)
            .await?
            .is_some()
        {
            return Err(CofundError::Conflict(format!(
                "resource {resource_id} already has a live boost"
            )));
        }
        let live = self.store.count_live_boosts(now).await?;
        if live >= self.cap {
            return Err(CofundError::Capacity(format!(
                "all {} boost slots are taken",
                self.cap
            )));
        }

        let payment_method = account
            .and_then(|account| account.payment_method)
            .ok_or_else(|| {
                CofundError::Validation(format!("user {owner_id} has no stored payment method"))
            })?;

        let metadata = IntentMetadata {
            resource_id,
            owner_id: owner_id.to_string(),
            payer_id: owner_id.to_string(),
            kind: PaymentKind::Boost,
            fees: self.fees.quote(self.price_minor),
        };
        let intent_id = self
            .gateway
            .create_intent(self.price_minor, &metadata)
            .await?;

        let status = self
            .gateway
            .confirm_intent(&intent_id, &payment_method)
            .await?;
        let outcome = match &status {
            GatewayStatus::Succeeded => PaymentOutcome::Succeeded,
            GatewayStatus::Declined { reason } => PaymentOutcome::Failed {
                reason: reason.clone(),
            },
            GatewayStatus::Processing => {
                tracing::info!(
                    intent_id = %intent_id,
                    resource_id = %resource_id,
                    "boost payment still processing, deferring to webhook"
                );
                return Err(CofundError::UpstreamTimeout(
                    "boost payment is still processing".to_string(),
                ));
            }
        };

        let event = PaymentEvent {
            event_id: format!("sync:{intent_id}"),
            intent_id: intent_id.clone(),
            amount_minor: self.price_minor,
            metadata,
            outcome,
            occurred_at: Utc::now(),
        };

        match self.reconciler.apply(&event).await? {
            SettlementOutcome::BoostActivated { boost } => Ok(boost),
            SettlementOutcome::Duplicate => self.settled_elsewhere(&event).await,
            SettlementOutcome::BoostRejected {
                reason,
                cap_reached: true,
            } => Err(CofundError::Capacity(format!("{reason}; payment refunded"))),
            SettlementOutcome::BoostRejected { reason, .. } => {
                Err(CofundError::Conflict(format!("{reason}; payment refunded")))
            }
            SettlementOutcome::FailureRecorded { status } => Err(CofundError::declined(
                decline_reason(&event),
                Some(status.remaining_attempts),
            )),
            other => Err(CofundError::Persistence(format!(
                "unexpected boost settlement outcome {other:?}"
            ))),
        }
    }

    // The webhook applied this outcome first; report what it did.
    async fn settled_elsewhere(&self, event: &PaymentEvent) -> Result<Boost, CofundError> {
        if let PaymentOutcome::Failed { .. } = event.outcome {
            let status = self.failures.status(&event.metadata.payer_id).await?;
            return Err(CofundError::declined(
                decline_reason(event),
                Some(status.remaining_attempts),
            ));
        }

        let live = self
            .store
            .live_boost_for_resource(event.metadata.resource_id, Utc::now())
            .await?;
        match live {
            Some(boost) if boost.intent_id == event.intent_id => Ok(boost),
            _ => Err(CofundError::Conflict(format!(
                "boost payment {} was refunded",
                event.intent_id
            ))),
        }
    }

    pub async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Boost>, CofundError> {
        Ok(self.store.list_live_boosts(now).await?)
    }

    /// Deactivate boosts past their deadline. A failing row does not stop the sweep.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<SweepReport, CofundError> {
        let due = self.store.list_expired_active(now).await?;
        let mut report = SweepReport::default();

        for boost in due {
            let entry = ActivityEntry::new(
                ActivityKind::BoostExpired,
                boost.owner_id.clone(),
                "Boost expired",
            )
            .with_resource(boost.resource_id)
            .at(now);
            match self.store.expire_boost(boost.id, entry).await {
                Ok(true) => report.processed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(boost_id = %boost.id, error = %e, "failed to expire boost");
                    report.failed += 1;
                }
            }
        }

        if report.processed > 0 || report.failed > 0 {
            tracing::info!(
                expired = report.processed,
                failed = report.failed,
                "boost expiry sweep finished"
            );
        }
        Ok(report)
    }
}

fn decline_reason(event: &PaymentEvent) -> String {
    match &event.outcome {
        PaymentOutcome::Failed { reason } => format!("boost payment declined: {reason}"),
        _ => "boost payment declined".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityQuery;
    use crate::gateway::{PaymentGateway, Payout, TransferReceipt};
    use crate::store::{AccountStore, ActivityStore, MemoryStore};
    use crate::types::Resource;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Charges `pm_ok`, declines everything else.
    #[derive(Default)]
    struct CardGateway {
        next: AtomicU64,
        refunds: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PaymentGateway for CardGateway {
        fn name(&self) -> &'static str {
            "card"
        }

        async fn create_intent(
            &self,
            _amount_minor: u64,
            _metadata: &IntentMetadata,
        ) -> Result<String, CofundError> {
            Ok(format!("pi_{}", self.next.fetch_add(1, Ordering::SeqCst)))
        }

        async fn confirm_intent(
            &self,
            _intent_id: &str,
            payment_method: &str,
        ) -> Result<GatewayStatus, CofundError> {
            tokio::task::yield_now().await;
            Ok(match payment_method {
                "pm_ok" => GatewayStatus::Succeeded,
                "pm_slow" => GatewayStatus::Processing,
                _ => GatewayStatus::Declined {
                    reason: "card_declined".to_string(),
                },
            })
        }

        fn verify_and_parse_event(
            &self,
            _raw_body: &[u8],
            _signature: &str,
        ) -> Result<PaymentEvent, CofundError> {
            Err(CofundError::SignatureInvalid("not supported".to_string()))
        }

        async fn refund(&self, intent_id: &str, _reason: &str) -> Result<(), CofundError> {
            self.refunds.lock().unwrap().push(intent_id.to_string());
            Ok(())
        }

        async fn transfer(&self, _payout: &Payout) -> Result<TransferReceipt, CofundError> {
            Err(CofundError::gateway("not supported"))
        }
    }

    struct Fixture {
        store: Arc<dyn Store>,
        gateway: Arc<CardGateway>,
        reconciler: SettlementReconciler,
        boosts: BoostLedger,
    }

    fn fixture(cap: usize) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let gateway = Arc::new(CardGateway::default());
        let client = GatewayClient::new(gateway.clone(), Duration::from_secs(1));
        let reconciler = SettlementReconciler::new(
            store.clone(),
            client.clone(),
            3,
            cap,
            chrono::Duration::hours(24),
        );
        let failures = FailureTracker::new(store.clone(), 3);
        let boosts = BoostLedger::new(
            store.clone(),
            client,
            reconciler.clone(),
            failures,
            cap,
            500,
            FeePolicy::default(),
        );
        Fixture {
            store,
            gateway,
            reconciler,
            boosts,
        }
    }

    async fn owned_resource(store: &Arc<dyn Store>, owner: &str, payment_method: &str) -> Resource {
        let resource = Resource::new(owner, format!("{owner}-server"), 10_000, 200);
        store.insert_resource(resource.clone()).await.unwrap();
        store.set_payment_method(owner, payment_method).await.unwrap();
        resource
    }

    #[tokio::test]
    async fn purchase_activates_boost_for_24_hours() {
        let fx = fixture(10);
        let resource = owned_resource(&fx.store, "owner", "pm_ok").await;

        let boost = fx.boosts.request_boost("owner", resource.id).await.unwrap();
        assert_eq!(boost.resource_id, resource.id);
        assert_eq!(boost.expires_at - boost.created_at, chrono::Duration::hours(24));
        assert_eq!(fx.boosts.list_active(Utc::now()).await.unwrap().len(), 1);

        assert!(matches!(
            fx.boosts.request_boost("owner", resource.id).await,
            Err(CofundError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_purchases_never_exceed_the_cap() {
        let fx = fixture(10);
        let mut resources = Vec::new();
        for i in 0..14 {
            let owner = format!("owner{i}");
            resources.push((owner.clone(), owned_resource(&fx.store, &owner, "pm_ok").await));
        }

        let mut handles = Vec::new();
        for (owner, resource) in resources {
            let boosts = fx.boosts.clone();
            handles.push(tokio::spawn(async move {
                boosts.request_boost(&owner, resource.id).await
            }));
        }

        let mut activated = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => activated += 1,
                Err(err) => assert!(matches!(err, CofundError::Capacity(_))),
            }
        }
        assert_eq!(activated, 10);
        assert_eq!(fx.store.count_live_boosts(Utc::now()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn webhook_after_sync_confirm_is_absorbed() {
        let fx = fixture(10);
        let resource = owned_resource(&fx.store, "owner", "pm_ok").await;
        let boost = fx.boosts.request_boost("owner", resource.id).await.unwrap();

        let webhook = PaymentEvent {
            event_id: "evt_late".to_string(),
            intent_id: boost.intent_id.clone(),
            amount_minor: 500,
            metadata: IntentMetadata {
                resource_id: resource.id,
                owner_id: "owner".to_string(),
                payer_id: "owner".to_string(),
                kind: PaymentKind::Boost,
                fees: FeePolicy::default().quote(500),
            },
            outcome: PaymentOutcome::Succeeded,
            occurred_at: Utc::now(),
        };
        assert_eq!(
            fx.reconciler.apply(&webhook).await.unwrap(),
            SettlementOutcome::Duplicate
        );
        assert_eq!(fx.store.count_live_boosts(Utc::now()).await.unwrap(), 1);
        assert!(fx.gateway.refunds.lock().unwrap().is_empty());

        let purchases = fx
            .store
            .list_activity(&ActivityQuery::for_user("owner").kind(ActivityKind::BoostPurchased))
            .await
            .unwrap();
        assert_eq!(purchases.len(), 1);
    }

    #[tokio::test]
    async fn declines_count_toward_suspension() {
        let fx = fixture(10);
        let resource = owned_resource(&fx.store, "owner", "pm_declined").await;

        for expected_remaining in [2, 1, 0] {
            let err = fx.boosts.request_boost("owner", resource.id).await.unwrap_err();
            match err {
                CofundError::PaymentProcessing {
                    remaining_attempts, ..
                } => assert_eq!(remaining_attempts, Some(expected_remaining)),
                other => panic!("expected a decline, got {other:?}"),
            }
        }

        assert!(matches!(
            fx.boosts.request_boost("owner", resource.id).await,
            Err(CofundError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn processing_is_not_a_failure() {
        let fx = fixture(10);
        let resource = owned_resource(&fx.store, "owner", "pm_slow").await;
        let err = fx.boosts.request_boost("owner", resource.id).await.unwrap_err();
        assert!(err.is_indeterminate());
        let status = FailureTracker::new(fx.store.clone(), 3)
            .status("owner")
            .await
            .unwrap();
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn rejects_non_owner_and_missing_payment_method() {
        let fx = fixture(10);
        let resource = owned_resource(&fx.store, "owner", "pm_ok").await;
        assert!(matches!(
            fx.boosts.request_boost("intruder", resource.id).await,
            Err(CofundError::Forbidden(_))
        ));

        let bare = Resource::new("bare", "bare-server", 10_000, 200);
        fx.store.insert_resource(bare.clone()).await.unwrap();
        assert!(matches!(
            fx.boosts.request_boost("bare", bare.id).await,
            Err(CofundError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn expiry_sweep_frees_slots() {
        let fx = fixture(1);
        let resource = owned_resource(&fx.store, "owner", "pm_ok").await;
        fx.boosts.request_boost("owner", resource.id).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(25);
        assert!(fx.boosts.list_active(later).await.unwrap().is_empty());
        let report = fx.boosts.expire_due(later).await.unwrap();
        assert_eq!(report, SweepReport { processed: 1, failed: 0 });
        assert_eq!(fx.boosts.expire_due(later).await.unwrap().processed, 0);

        let other = owned_resource(&fx.store, "other", "pm_ok").await;
        fx.boosts.request_boost("other", other.id).await.unwrap();
    }
}
