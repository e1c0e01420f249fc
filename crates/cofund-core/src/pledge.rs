//! Pledge lifecycle and the public pricing view.
//!
//! A pledge is `pending` from the moment its payment intent is requested until
//! the reconciler applies a confirmed payment. Only completed pledges count
//! toward pricing and headcount.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::activity::{format_minor, ActivityEntry, ActivityKind};
use crate::allocator::{allocate, savings};
use crate::config::FeePolicy;
use crate::error::CofundError;
use crate::failure::FailureTracker;
use crate::gateway::{GatewayClient, IntentMetadata, PaymentKind};
use crate::store::{PledgeStore, ResourceStore, Store};
use crate::types::{
    Pledge, PledgeStatus, PricingEntry, Resource, ResourcePricing, SweepReport,
};

/// Returned to the caller so the client can complete the payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PledgeReceipt {
    pub pledge: Pledge,
    pub intent_id: String,
}

#[derive(Clone)]
pub struct PledgeLedger {
    store: Arc<dyn Store>,
    gateway: GatewayClient,
    failures: FailureTracker,
    fees: FeePolicy,
}

impl PledgeLedger {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: GatewayClient,
        failures: FailureTracker,
        fees: FeePolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            failures,
            fees,
        }
    }

    /// Open a pending pledge and request its payment intent.
    pub async fn create(
        &self,
        owner_id: &str,
        resource_id: Uuid,
        amount_minor: u64,
    ) -> Result<PledgeReceipt, CofundError> {
        if amount_minor == 0 {
            return Err(CofundError::Validation(
                "pledge amount must be positive".to_string(),
            ));
        }

        self.failures.check_standing(owner_id).await?;
        let resource = self.active_resource(resource_id).await?;
        if resource.owner_id == owner_id {
            return Err(CofundError::Forbidden(
                "owners cannot pledge to their own resource".to_string(),
            ));
        }
        if amount_minor < resource.min_cost_per_person_minor {
            return Err(CofundError::Validation(format!(
                "pledge of {} is below the minimum of {} per person",
                format_minor(amount_minor),
                format_minor(resource.min_cost_per_person_minor)
            )));
        }

        // Pending pledges hold a seat too; settlement re-checks against completed ones.
        let pricing = self.pricing_for(&resource).await?;
        let pending = self
            .store
            .list_pledges(resource_id, PledgeStatus::Pending)
            .await?
            .len();
        let open = (pricing.pledge_count + pending) as u64;
        if !pricing.is_accepting_pledges || open >= pricing.max_people {
            return Err(CofundError::Conflict(format!(
                "resource {resource_id} is not accepting pledges ({} backers, {pending} pending)",
                pricing.pledge_count
            )));
        }

        let now = Utc::now();
        let mut pledge = Pledge::pending(owner_id, resource_id, amount_minor, now);
        self.store.insert_pending_pledge(pledge.clone()).await?;

        let metadata = IntentMetadata {
            resource_id,
            owner_id: resource.owner_id.clone(),
            payer_id: owner_id.to_string(),
            kind: PaymentKind::Pledge,
            fees: self.fees.quote(amount_minor),
        };
        let intent_id = match self.gateway.create_intent(amount_minor, &metadata).await {
            Ok(intent_id) => intent_id,
            Err(err) => {
                self.release_slot(pledge.id).await;
                return Err(err);
            }
        };

        // A payment on the unattached intent settles as orphaned and is refunded.
        if let Err(err) = self.store.attach_intent(pledge.id, &intent_id).await {
            tracing::warn!(
                pledge_id = %pledge.id,
                intent_id = %intent_id,
                error = %err,
                "failed to attach intent"
            );
            self.release_slot(pledge.id).await;
            return Err(err.into());
        }
        pledge.intent_id = Some(intent_id.clone());

        tracing::info!(
            user_id = %owner_id,
            resource_id = %resource_id,
            pledge_id = %pledge.id,
            intent_id = %intent_id,
            amount_minor,
            "pledge pending payment"
        );
        Ok(PledgeReceipt { pledge, intent_id })
    }

    /// Unpledge: withdraw the owner's open pledge on the resource.
    pub async fn withdraw(&self, owner_id: &str, resource_id: Uuid) -> Result<Pledge, CofundError> {
        let mut pledge = self
            .store
            .find_open_pledge(owner_id, resource_id)
            .await?
            .ok_or_else(|| {
                CofundError::NotFound(format!(
                    "no open pledge by {owner_id} on resource {resource_id}"
                ))
            })?;

        let now = Utc::now();
        let entry = ActivityEntry::new(
            ActivityKind::PledgeWithdrawn,
            owner_id,
            format!("Withdrew pledge of {}", format_minor(pledge.pledged_minor)),
        )
        .with_amount(pledge.pledged_minor)
        .with_resource(resource_id)
        .at(now);

        if !self
            .store
            .withdraw_pledge(pledge.id, false, now, Some(entry))
            .await?
        {
            return Err(CofundError::NotFound(format!(
                "pledge {} was already withdrawn",
                pledge.id
            )));
        }

        tracing::info!(user_id = %owner_id, resource_id = %resource_id, pledge_id = %pledge.id, "pledge withdrawn");
        pledge.status = PledgeStatus::Withdrawn;
        pledge.updated_at = now;
        Ok(pledge)
    }

    /// Completed pledges in pricing order.
    pub async fn list_active(&self, resource_id: Uuid) -> Result<Vec<Pledge>, CofundError> {
        Ok(self
            .store
            .list_pledges(resource_id, PledgeStatus::Completed)
            .await?)
    }

    pub async fn pricing(&self, resource_id: Uuid) -> Result<ResourcePricing, CofundError> {
        let resource = self
            .store
            .get_resource(resource_id)
            .await?
            .ok_or_else(|| CofundError::NotFound(format!("resource {resource_id}")))?;
        self.pricing_for(&resource).await
    }

    /// Withdraw pending pledges created before `now - ttl`.
    pub async fn expire_stale(
        &self,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<SweepReport, CofundError> {
        let stale = self.store.list_stale_pending(now - ttl).await?;
        let mut report = SweepReport::default();

        for pledge in stale {
            let entry = ActivityEntry::new(
                ActivityKind::PledgeExpired,
                pledge.owner_id.clone(),
                format!(
                    "Pending pledge of {} expired without payment",
                    format_minor(pledge.pledged_minor)
                ),
            )
            .with_amount(pledge.pledged_minor)
            .with_resource(pledge.resource_id)
            .at(now);

            match self
                .store
                .withdraw_pledge(pledge.id, true, now, Some(entry))
                .await
            {
                Ok(true) => report.processed += 1,
                // Completed or withdrawn since the scan.
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(pledge_id = %pledge.id, error = %e, "failed to expire stale pledge");
                    report.failed += 1;
                }
            }
        }

        if report.processed > 0 || report.failed > 0 {
            tracing::info!(
                expired = report.processed,
                failed = report.failed,
                "stale pending pledge sweep finished"
            );
        }
        Ok(report)
    }

    /// Withdraw a pledge that never got a usable intent so the owner can retry.
    async fn release_slot(&self, pledge_id: Uuid) {
        if let Err(e) = self
            .store
            .withdraw_pledge(pledge_id, true, Utc::now(), None)
            .await
        {
            tracing::error!(pledge_id = %pledge_id, error = %e, "failed to release pending pledge");
        }
    }

    async fn active_resource(&self, resource_id: Uuid) -> Result<Resource, CofundError> {
        let resource = self
            .store
            .get_resource(resource_id)
            .await?
            .ok_or_else(|| CofundError::NotFound(format!("resource {resource_id}")))?;
        if !resource.active {
            return Err(CofundError::Conflict(format!(
                "resource {resource_id} is not active"
            )));
        }
        Ok(resource)
    }

    async fn pricing_for(&self, resource: &Resource) -> Result<ResourcePricing, CofundError> {
        let pledges = self
            .store
            .list_pledges(resource.id, PledgeStatus::Completed)
            .await?;
        build_pricing(resource, &pledges)
    }
}

/// Run the allocator over completed pledges and shape the public view.
pub fn build_pricing(resource: &Resource, pledges: &[Pledge]) -> Result<ResourcePricing, CofundError> {
    let amounts: Vec<u64> = pledges.iter().map(|pledge| pledge.pledged_minor).collect();
    let allocation = allocate(
        &amounts,
        resource.target_cost_minor,
        resource.min_cost_per_person_minor,
    )?;

    let entries: Vec<PricingEntry> = pledges
        .iter()
        .zip(&allocation.optimized_costs)
        .map(|(pledge, optimized)| PricingEntry {
            pledge_id: pledge.id,
            user_id: pledge.owner_id.clone(),
            pledged_minor: pledge.pledged_minor,
            optimized_minor: *optimized,
            savings_minor: savings(pledge.pledged_minor, *optimized),
        })
        .collect();
    let funded_total_minor = allocation.total();

    Ok(ResourcePricing {
        resource_id: resource.id,
        target_cost_minor: resource.target_cost_minor,
        min_cost_per_person_minor: resource.min_cost_per_person_minor,
        max_people: allocation.max_people,
        pledge_count: entries.len(),
        funded_total_minor,
        is_accepting_pledges: allocation.is_accepting_pledges,
        is_funded: funded_total_minor >= resource.target_cost_minor,
        entries,
    })
}
