use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::activity::{ActivityEntry, ActivityKind, ActivityQuery};
use crate::boost::BoostLedger;
use crate::config::EngineConfig;
use crate::error::CofundError;
use crate::failure::FailureTracker;
use crate::gateway::{GatewayClient, PaymentGateway};
use crate::pledge::PledgeLedger;
use crate::reconciler::SettlementReconciler;
use crate::store::{bootstrap_store, AccountStore, ActivityStore, ResourceStore, Store};
use crate::types::{FailureStatus, Resource, SweepReport, UserAccount};
use crate::withdrawal::WithdrawalScheduler;

/// Co-funding engine wiring the ledgers, the reconciler and the scheduler over
/// one store and one gateway.
#[derive(Clone)]
pub struct CofundEngine {
    store: Arc<dyn Store>,
    gateway: GatewayClient,
    pledges: PledgeLedger,
    boosts: BoostLedger,
    reconciler: SettlementReconciler,
    failures: FailureTracker,
    withdrawals: WithdrawalScheduler,
    config: EngineConfig,
}

impl CofundEngine {
    /// Open the configured store and wire every component.
    pub async fn bootstrap(
        config: EngineConfig,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self, CofundError> {
        let store = bootstrap_store(&config.storage).await?;
        tracing::info!(
            backend = store.backend_label(),
            gateway = gateway.name(),
            "cofund engine bootstrapped"
        );
        Ok(Self::with_store(config, store, gateway))
    }

    pub fn with_store(
        config: EngineConfig,
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let gateway = GatewayClient::new(gateway, config.gateway_timeout());
        let failures = FailureTracker::new(store.clone(), config.failure_threshold);
        let reconciler = SettlementReconciler::new(
            store.clone(),
            gateway.clone(),
            config.failure_threshold,
            config.boost_cap,
            config.boost_duration(),
        );
        let pledges = PledgeLedger::new(
            store.clone(),
            gateway.clone(),
            failures.clone(),
            config.fees.clone(),
        );
        let boosts = BoostLedger::new(
            store.clone(),
            gateway.clone(),
            reconciler.clone(),
            failures.clone(),
            config.boost_cap,
            config.boost_price_minor,
            config.fees.clone(),
        );
        let withdrawals = WithdrawalScheduler::new(
            store.clone(),
            gateway.clone(),
            config.fees.clone(),
            config.withdrawal_day_of_month,
        );

        Self {
            store,
            gateway,
            pledges,
            boosts,
            reconciler,
            failures,
            withdrawals,
            config,
        }
    }

    pub fn pledges(&self) -> &PledgeLedger {
        &self.pledges
    }

    pub fn boosts(&self) -> &BoostLedger {
        &self.boosts
    }

    pub fn reconciler(&self) -> &SettlementReconciler {
        &self.reconciler
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn withdrawals(&self) -> &WithdrawalScheduler {
        &self.withdrawals
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn backend_label(&self) -> &'static str {
        self.store.backend_label()
    }

    pub fn gateway_name(&self) -> &'static str {
        self.gateway.name()
    }

    pub async fn create_resource(
        &self,
        owner_id: &str,
        name: &str,
        target_cost_minor: u64,
        min_cost_per_person_minor: u64,
    ) -> Result<Resource, CofundError> {
        if name.trim().is_empty() {
            return Err(CofundError::Validation("resource name is required".to_string()));
        }
        if target_cost_minor == 0 || min_cost_per_person_minor == 0 {
            return Err(CofundError::Validation(
                "target cost and minimum cost per person must be positive".to_string(),
            ));
        }
        if min_cost_per_person_minor > target_cost_minor {
            return Err(CofundError::Validation(
                "minimum cost per person cannot exceed the target cost".to_string(),
            ));
        }

        let resource = Resource::new(
            owner_id,
            name.trim(),
            target_cost_minor,
            min_cost_per_person_minor,
        );
        self.store.insert_resource(resource.clone()).await?;
        tracing::info!(
            resource_id = %resource.id,
            owner_id = %owner_id,
            target_cost_minor,
            min_cost_per_person_minor,
            "resource created"
        );
        Ok(resource)
    }

    pub async fn resource(&self, resource_id: Uuid) -> Result<Resource, CofundError> {
        self.store
            .get_resource(resource_id)
            .await?
            .ok_or_else(|| CofundError::NotFound(format!("resource {resource_id}")))
    }

    /// Store the token the gateway charges for boosts.
    pub async fn set_payment_method(
        &self,
        user_id: &str,
        payment_method: &str,
    ) -> Result<UserAccount, CofundError> {
        let payment_method = payment_method.trim();
        if payment_method.is_empty() {
            return Err(CofundError::Validation(
                "payment method token is required".to_string(),
            ));
        }
        Ok(self.store.set_payment_method(user_id, payment_method).await?)
    }

    /// Ban a user. The ban and the payment suspension commit together.
    pub async fn ban(&self, user_id: &str, reason: &str) -> Result<(), CofundError> {
        let now = Utc::now();
        let entry = ActivityEntry::new(
            ActivityKind::AccountBanned,
            user_id,
            format!("Account banned: {reason}"),
        )
        .at(now);
        let suspension = ActivityEntry::new(
            ActivityKind::AccountSuspended,
            user_id,
            "Payments suspended with account ban",
        )
        .at(now);
        if !self.store.ban_account(user_id, now, entry, suspension).await? {
            return Err(CofundError::Conflict(format!("user {user_id} is already banned")));
        }
        tracing::warn!(user_id = %user_id, reason, "user banned");
        Ok(())
    }

    /// Lift a ban. Payment suspension is left for [`CofundEngine::unsuspend`].
    pub async fn unban(&self, user_id: &str) -> Result<(), CofundError> {
        let entry = ActivityEntry::new(ActivityKind::AccountUnbanned, user_id, "Account ban lifted");
        if !self.store.lift_ban(user_id, entry).await? {
            return Err(CofundError::Conflict(format!("user {user_id} is not banned")));
        }
        tracing::info!(user_id = %user_id, "user unbanned");
        Ok(())
    }

    pub async fn unsuspend(&self, user_id: &str) -> Result<FailureStatus, CofundError> {
        self.failures.unsuspend(user_id).await
    }

    pub async fn activity(&self, query: &ActivityQuery) -> Result<Vec<ActivityEntry>, CofundError> {
        Ok(self.store.list_activity(query).await?)
    }

    pub async fn expire_stale_pledges(&self, now: DateTime<Utc>) -> Result<SweepReport, CofundError> {
        self.pledges
            .expire_stale(now, self.config.stale_pending_ttl())
            .await
    }
}

impl std::fmt::Debug for CofundEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CofundEngine")
            .field("backend", &self.store.backend_label())
            .field("gateway", &self.gateway)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        GatewayStatus, IntentMetadata, PaymentEvent, PaymentKind, PaymentOutcome, Payout,
        TransferReceipt,
    };
    use crate::reconciler::SettlementOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct AcceptingGateway {
        next: AtomicU64,
    }

    #[async_trait]
    impl PaymentGateway for AcceptingGateway {
        fn name(&self) -> &'static str {
            "accepting"
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
            _payment_method: &str,
        ) -> Result<GatewayStatus, CofundError> {
            Ok(GatewayStatus::Succeeded)
        }

        fn verify_and_parse_event(
            &self,
            _raw_body: &[u8],
            _signature: &str,
        ) -> Result<PaymentEvent, CofundError> {
            Err(CofundError::SignatureInvalid("not supported".to_string()))
        }

        async fn refund(&self, _intent_id: &str, _reason: &str) -> Result<(), CofundError> {
            Ok(())
        }

        async fn transfer(&self, payout: &Payout) -> Result<TransferReceipt, CofundError> {
            Ok(TransferReceipt {
                reference: format!("tr_{}", payout.idempotency_key),
                settled_at: Utc::now(),
            })
        }
    }

    async fn engine() -> CofundEngine {
        CofundEngine::bootstrap(EngineConfig::default(), Arc::new(AcceptingGateway::default()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn resource_validation() {
        let engine = engine().await;
        assert!(matches!(
            engine.create_resource("owner", " ", 10_000, 200).await,
            Err(CofundError::Validation(_))
        ));
        assert!(matches!(
            engine.create_resource("owner", "mc", 100, 200).await,
            Err(CofundError::Validation(_))
        ));
        let resource = engine.create_resource("owner", " mc ", 10_000, 200).await.unwrap();
        assert_eq!(resource.name, "mc");
        assert_eq!(engine.resource(resource.id).await.unwrap(), resource);
        assert_eq!(engine.backend_label(), "memory");
    }

    #[tokio::test]
    async fn ban_blocks_pledging_and_unban_keeps_suspension() {
        let engine = engine().await;
        let resource = engine.create_resource("owner", "mc", 10_000, 200).await.unwrap();

        engine.ban("u1", "fraud").await.unwrap();
        assert!(matches!(
            engine.ban("u1", "fraud").await,
            Err(CofundError::Conflict(_))
        ));
        assert!(matches!(
            engine.pledges().create("u1", resource.id, 1_000).await,
            Err(CofundError::Forbidden(_))
        ));

        engine.unban("u1").await.unwrap();
        assert!(engine.failures().status("u1").await.unwrap().suspended);
        assert!(matches!(
            engine.pledges().create("u1", resource.id, 1_000).await,
            Err(CofundError::Forbidden(_))
        ));

        engine.unsuspend("u1").await.unwrap();
        engine.pledges().create("u1", resource.id, 1_000).await.unwrap();

        let trail = engine
            .activity(&ActivityQuery::for_user("u1"))
            .await
            .unwrap();
        let kinds: Vec<ActivityKind> = trail.iter().map(|entry| entry.kind).collect();
        assert!(kinds.contains(&ActivityKind::AccountBanned));
        assert!(kinds.contains(&ActivityKind::AccountUnbanned));
        assert!(kinds.contains(&ActivityKind::AccountUnsuspended));
    }

    #[tokio::test]
    async fn pledge_settles_into_pricing() {
        let engine = engine().await;
        let resource = engine.create_resource("owner", "mc", 10_000, 200).await.unwrap();
        let receipt = engine.pledges().create("u1", resource.id, 12_000).await.unwrap();

        let event = PaymentEvent {
            event_id: "evt_1".to_string(),
            intent_id: receipt.intent_id.clone(),
            amount_minor: 12_000,
            metadata: IntentMetadata {
                resource_id: resource.id,
                owner_id: "owner".to_string(),
                payer_id: "u1".to_string(),
                kind: PaymentKind::Pledge,
                fees: engine.config().fees.quote(12_000),
            },
            outcome: PaymentOutcome::Succeeded,
            occurred_at: Utc::now(),
        };
        assert!(matches!(
            engine.reconciler().apply(&event).await.unwrap(),
            SettlementOutcome::PledgeCompleted { .. }
        ));

        let pricing = engine.pledges().pricing(resource.id).await.unwrap();
        assert_eq!(pricing.pledge_count, 1);
        assert_eq!(pricing.entries[0].optimized_minor, 10_000);
        assert_eq!(pricing.entries[0].savings_minor, 2_000);
        assert!(pricing.is_funded);
    }

    #[tokio::test]
    async fn payment_method_must_be_present() {
        let engine = engine().await;
        assert!(matches!(
            engine.set_payment_method("u1", "  ").await,
            Err(CofundError::Validation(_))
        ));
        let account = engine.set_payment_method("u1", "pm_card_ok").await.unwrap();
        assert_eq!(account.payment_method.as_deref(), Some("pm_card_ok"));
    }
}
