//! Exactly-once application of payment outcomes.
//!
//! The webhook and the synchronous confirm path both end up in
//! [`SettlementReconciler::apply`]. The store records the outcome's idempotency
//! key in the same atomic unit as its side effects, so duplicates and races
//! between the two paths collapse into a single application.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::activity::{format_minor, ActivityEntry, ActivityKind};
use crate::error::CofundError;
use crate::failure::suspension_entry;
use crate::gateway::{GatewayClient, PaymentEvent, PaymentKind, PaymentOutcome};
use crate::store::{
    BoostRejection, Settlement, SettlementApplied, SettlementEffect, SettlementStore, Store,
};
use crate::types::{Boost, FailureStatus, Pledge};

/// What applying one payment event did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    PledgeCompleted { pledge: Pledge },
    BoostActivated { boost: Boost },
    /// Already applied earlier; nothing changed.
    Duplicate,
    /// Payment succeeded for a pledge that is no longer pending.
    Orphaned,
    /// Payment succeeded but the resource was already full; refund requested.
    PledgeRejected { reason: String },
    /// Payment succeeded but the boost guard refused the insert; refund requested.
    BoostRejected { reason: String, cap_reached: bool },
    FailureRecorded { status: FailureStatus },
    /// Outcome unknown; nothing recorded so a later definitive event still applies.
    Indeterminate,
}

#[derive(Clone)]
pub struct SettlementReconciler {
    store: Arc<dyn Store>,
    gateway: GatewayClient,
    failure_threshold: u32,
    boost_cap: usize,
    boost_duration: Duration,
}

impl SettlementReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: GatewayClient,
        failure_threshold: u32,
        boost_cap: usize,
        boost_duration: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            failure_threshold: failure_threshold.max(1),
            boost_cap,
            boost_duration,
        }
    }

    /// Verify a raw webhook delivery and apply it.
    pub async fn handle_webhook(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<SettlementOutcome, CofundError> {
        let event = self.gateway.verify_and_parse_event(raw_body, signature)?;
        tracing::debug!(
            event_id = %event.event_id,
            intent_id = %event.intent_id,
            kind = event.metadata.kind.as_str(),
            "payment webhook verified"
        );
        self.apply(&event).await
    }

    pub async fn apply(&self, event: &PaymentEvent) -> Result<SettlementOutcome, CofundError> {
        let Some(idempotency_key) = event.idempotency_key() else {
            tracing::info!(
                intent_id = %event.intent_id,
                payer_id = %event.metadata.payer_id,
                "payment outcome indeterminate, waiting for a definitive event"
            );
            return Ok(SettlementOutcome::Indeterminate);
        };

        let recorded_at = Utc::now();
        let settlement = Settlement {
            idempotency_key,
            intent_id: event.intent_id.clone(),
            event_id: event.event_id.clone(),
            payer_id: event.metadata.payer_id.clone(),
            recorded_at,
            effect: self.effect_for(event, recorded_at),
        };

        let applied = self.store.apply_settlement(settlement).await?;
        Ok(self.finish(event, applied).await)
    }

    fn effect_for(&self, event: &PaymentEvent, recorded_at: chrono::DateTime<Utc>) -> SettlementEffect {
        let meta = &event.metadata;
        match (&event.outcome, meta.kind) {
            (PaymentOutcome::Failed { reason }, _) => SettlementEffect::RecordFailure {
                threshold: self.failure_threshold,
                activity: ActivityEntry::new(
                    ActivityKind::PaymentFailed,
                    meta.payer_id.clone(),
                    format!(
                        "{} payment of {} failed: {reason}",
                        meta.kind.as_str(),
                        format_minor(event.amount_minor)
                    ),
                )
                .with_amount(event.amount_minor)
                .with_resource(meta.resource_id)
                .at(recorded_at),
                suspension_activity: suspension_entry(&meta.payer_id, self.failure_threshold)
                    .at(recorded_at),
            },
            (_, PaymentKind::Pledge) => SettlementEffect::CompletePledge {
                activities: vec![
                    ActivityEntry::new(
                        ActivityKind::PledgeCompleted,
                        meta.payer_id.clone(),
                        format!("Pledged {} per month", format_minor(event.amount_minor)),
                    )
                    .with_amount(event.amount_minor)
                    .with_resource(meta.resource_id)
                    .at(recorded_at),
                    fee_entry(event, recorded_at),
                ],
                rejection_activity: ActivityEntry::new(
                    ActivityKind::PledgeRefunded,
                    meta.payer_id.clone(),
                    format!(
                        "Pledge payment of {} refunded, the server is full",
                        format_minor(event.amount_minor)
                    ),
                )
                .with_amount(event.amount_minor)
                .with_resource(meta.resource_id)
                .at(recorded_at),
            },
            (_, PaymentKind::Boost) => {
                let boost = Boost {
                    id: Uuid::new_v4(),
                    resource_id: meta.resource_id,
                    owner_id: meta.owner_id.clone(),
                    amount_minor: event.amount_minor,
                    intent_id: event.intent_id.clone(),
                    created_at: recorded_at,
                    expires_at: recorded_at + self.boost_duration,
                    active: true,
                };
                SettlementEffect::ActivateBoost {
                    boost,
                    cap: self.boost_cap,
                    activities: vec![
                        ActivityEntry::new(
                            ActivityKind::BoostPurchased,
                            meta.payer_id.clone(),
                            format!("Boost purchased for {}", format_minor(event.amount_minor)),
                        )
                        .with_amount(event.amount_minor)
                        .with_resource(meta.resource_id)
                        .at(recorded_at),
                        fee_entry(event, recorded_at),
                    ],
                    rejection_activity: ActivityEntry::new(
                        ActivityKind::BoostRefunded,
                        meta.payer_id.clone(),
                        format!(
                            "Boost payment of {} refunded, no boost slot available",
                            format_minor(event.amount_minor)
                        ),
                    )
                    .with_amount(event.amount_minor)
                    .with_resource(meta.resource_id)
                    .at(recorded_at),
                }
            }
        }
    }

    async fn finish(&self, event: &PaymentEvent, applied: SettlementApplied) -> SettlementOutcome {
        match applied {
            SettlementApplied::Duplicate => {
                tracing::debug!(
                    event_id = %event.event_id,
                    intent_id = %event.intent_id,
                    "duplicate payment event absorbed"
                );
                SettlementOutcome::Duplicate
            }
            SettlementApplied::PledgeCompleted(pledge) => {
                tracing::info!(
                    pledge_id = %pledge.id,
                    resource_id = %pledge.resource_id,
                    intent_id = %event.intent_id,
                    "pledge completed"
                );
                SettlementOutcome::PledgeCompleted { pledge }
            }
            SettlementApplied::PledgeMissing => {
                tracing::warn!(
                    intent_id = %event.intent_id,
                    payer_id = %event.metadata.payer_id,
                    "payment succeeded for a pledge that is no longer pending"
                );
                self.refund(event, "pledge no longer pending").await;
                SettlementOutcome::Orphaned
            }
            SettlementApplied::PledgeRejected { pledge, max_people } => {
                let reason = format!("resource already has {max_people} backers");
                tracing::warn!(
                    pledge_id = %pledge.id,
                    resource_id = %pledge.resource_id,
                    intent_id = %event.intent_id,
                    max_people,
                    "pledge rejected at settlement"
                );
                self.refund(event, &reason).await;
                SettlementOutcome::PledgeRejected { reason }
            }
            SettlementApplied::BoostActivated(boost) => {
                tracing::info!(
                    boost_id = %boost.id,
                    resource_id = %boost.resource_id,
                    expires_at = %boost.expires_at,
                    "boost activated"
                );
                SettlementOutcome::BoostActivated { boost }
            }
            SettlementApplied::BoostRejected(rejection) => {
                let reason = rejection.to_string();
                tracing::warn!(
                    intent_id = %event.intent_id,
                    resource_id = %event.metadata.resource_id,
                    reason = %reason,
                    "boost rejected at settlement"
                );
                self.refund(event, &reason).await;
                SettlementOutcome::BoostRejected {
                    reason,
                    cap_reached: matches!(rejection, BoostRejection::CapReached { .. }),
                }
            }
            SettlementApplied::FailureRecorded(update) => {
                if update.newly_suspended {
                    tracing::warn!(
                        user_id = %update.record.user_id,
                        failures = update.record.consecutive_failure_count,
                        "payer suspended after consecutive payment failures"
                    );
                }
                SettlementOutcome::FailureRecorded {
                    status: FailureStatus::from_record(&update.record, self.failure_threshold),
                }
            }
        }
    }

    // Settlement is already committed; a failed refund is logged for follow-up.
    async fn refund(&self, event: &PaymentEvent, reason: &str) {
        if let Err(e) = self.gateway.refund(&event.intent_id, reason).await {
            tracing::error!(
                intent_id = %event.intent_id,
                error = %e,
                "refund request failed"
            );
        }
    }
}

fn fee_entry(event: &PaymentEvent, recorded_at: chrono::DateTime<Utc>) -> ActivityEntry {
    let fees = &event.metadata.fees;
    ActivityEntry::new(
        ActivityKind::PaymentFee,
        event.metadata.payer_id.clone(),
        format!(
            "Platform fee {} and gateway fee {} on {} {} payment, {} net to owner",
            format_minor(fees.platform_fee_minor),
            format_minor(fees.gateway_fee_minor),
            format_minor(event.amount_minor),
            event.metadata.kind.as_str(),
            format_minor(fees.net_minor)
        ),
    )
    .with_amount(fees.platform_fee_minor)
    .with_resource(event.metadata.resource_id)
    .at(recorded_at)
}
