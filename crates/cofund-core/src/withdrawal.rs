//! Monthly owner payouts.
//!
//! Scheduling materialises one `scheduled` row per resource and calendar month;
//! processing transfers every due row independently. Neither phase aborts on a
//! single item.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::activity::{format_minor, ActivityEntry, ActivityKind};
use crate::config::FeePolicy;
use crate::error::CofundError;
use crate::gateway::{GatewayClient, Payout};
use crate::pledge::build_pricing;
use crate::store::{PledgeStore, ResourceStore, Store, WithdrawalStore};
use crate::types::{PledgeStatus, Resource, WithdrawalSchedule, WithdrawalStatus};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleReport {
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Transfers whose outcome is unknown; they stay scheduled for the next run.
    pub indeterminate: usize,
}

#[derive(Clone)]
pub struct WithdrawalScheduler {
    store: Arc<dyn Store>,
    gateway: GatewayClient,
    fees: FeePolicy,
    day_of_month: u32,
}

impl WithdrawalScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: GatewayClient,
        fees: FeePolicy,
        day_of_month: u32,
    ) -> Self {
        Self {
            store,
            gateway,
            fees,
            day_of_month: day_of_month.clamp(1, 28),
        }
    }

    /// Create this month's schedule for every funded resource that lacks one.
    pub async fn schedule(&self, now: DateTime<Utc>) -> Result<ScheduleReport, CofundError> {
        let cycle = cycle_of(now);
        let due_at = due_at(now, self.day_of_month)?;
        let resources = self.store.list_active_resources().await?;
        let mut report = ScheduleReport::default();

        for resource in resources {
            match self.schedule_resource(&resource, &cycle, due_at, now).await {
                Ok(true) => report.created += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        resource_id = %resource.id,
                        cycle = %cycle,
                        error = %e,
                        "failed to schedule withdrawal"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            cycle = %cycle,
            created = report.created,
            skipped = report.skipped,
            failed = report.failed,
            "withdrawal scheduling finished"
        );
        Ok(report)
    }

    async fn schedule_resource(
        &self,
        resource: &Resource,
        cycle: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, CofundError> {
        let pledges = self
            .store
            .list_pledges(resource.id, PledgeStatus::Completed)
            .await?;
        if pledges.is_empty() {
            return Ok(false);
        }

        let pricing = build_pricing(resource, &pledges)?;
        let amount_minor: u64 = pricing
            .entries
            .iter()
            .map(|entry| self.fees.quote(entry.optimized_minor).net_minor)
            .sum();
        if amount_minor == 0 {
            return Ok(false);
        }

        let schedule = WithdrawalSchedule {
            id: Uuid::new_v4(),
            resource_id: resource.id,
            owner_id: resource.owner_id.clone(),
            cycle: cycle.to_string(),
            amount_minor,
            due_at,
            status: WithdrawalStatus::Scheduled,
            created_at: now,
            processed_at: None,
            transfer_reference: None,
        };
        let entry = ActivityEntry::new(
            ActivityKind::WithdrawalScheduled,
            resource.owner_id.clone(),
            format!(
                "Payout of {} for {cycle} scheduled for {}",
                format_minor(amount_minor),
                due_at.format("%Y-%m-%d")
            ),
        )
        .with_amount(amount_minor)
        .with_resource(resource.id)
        .at(now);

        Ok(self.store.insert_schedule_if_absent(schedule, entry).await?)
    }

    /// Transfer every schedule that is due.
    pub async fn process(&self, now: DateTime<Utc>) -> Result<ProcessReport, CofundError> {
        let due = self.store.list_due_schedules(now).await?;
        let mut report = ProcessReport::default();

        for schedule in due {
            let payout = Payout {
                schedule_id: schedule.id,
                owner_id: schedule.owner_id.clone(),
                resource_id: schedule.resource_id,
                amount_minor: schedule.amount_minor,
                idempotency_key: schedule.id.to_string(),
            };

            let receipt = match self.gateway.transfer(&payout).await {
                Ok(receipt) => receipt,
                Err(e) if e.is_indeterminate() => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        error = %e,
                        "payout outcome unknown, leaving scheduled"
                    );
                    report.indeterminate += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        schedule_id = %schedule.id,
                        owner_id = %schedule.owner_id,
                        error = %e,
                        "payout transfer failed"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let entry = ActivityEntry::new(
                ActivityKind::WithdrawalProcessed,
                schedule.owner_id.clone(),
                format!(
                    "Payout of {} for {} sent",
                    format_minor(schedule.amount_minor),
                    schedule.cycle
                ),
            )
            .with_amount(schedule.amount_minor)
            .with_resource(schedule.resource_id)
            .at(receipt.settled_at);

            match self
                .store
                .mark_processed(schedule.id, &receipt.reference, receipt.settled_at, entry)
                .await
            {
                Ok(true) => report.succeeded += 1,
                Ok(false) => {
                    tracing::debug!(schedule_id = %schedule.id, "payout already marked processed");
                }
                Err(e) => {
                    tracing::error!(
                        schedule_id = %schedule.id,
                        reference = %receipt.reference,
                        error = %e,
                        "payout sent but not recorded"
                    );
                    report.failed += 1;
                }
            }
        }

        if report != ProcessReport::default() {
            tracing::info!(
                succeeded = report.succeeded,
                failed = report.failed,
                indeterminate = report.indeterminate,
                "withdrawal processing finished"
            );
        }
        Ok(report)
    }

    pub async fn list(&self, resource_id: Uuid) -> Result<Vec<WithdrawalSchedule>, CofundError> {
        Ok(self.store.list_schedules(resource_id).await?)
    }
}

/// Calendar month a payout covers, `YYYY-MM`.
pub fn cycle_of(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}

/// `day_of_month` of the month after `now`, at midnight UTC.
pub fn due_at(now: DateTime<Utc>, day_of_month: u32) -> Result<DateTime<Utc>, CofundError> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let midnight = NaiveDate::from_ymd_opt(year, month, day_of_month.clamp(1, 28))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| {
            CofundError::Validation(format!("no payout date for {year}-{month:02}"))
        })?;
    Ok(Utc.from_utc_datetime(&midnight))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityEntry, ActivityKind, ActivityQuery};
    use crate::gateway::{
        GatewayStatus, IntentMetadata, PaymentEvent, PaymentGateway, TransferReceipt,
    };
    use crate::store::{ActivityStore, MemoryStore, Settlement, SettlementEffect, SettlementStore};
    use crate::types::Pledge;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct PayoutGateway {
        declined_owners: HashSet<String>,
        stalled_owners: HashSet<String>,
        transfers: Mutex<Vec<Payout>>,
    }

    #[async_trait]
    impl PaymentGateway for PayoutGateway {
        fn name(&self) -> &'static str {
            "payout"
        }

        async fn create_intent(
            &self,
            _amount_minor: u64,
            _metadata: &IntentMetadata,
        ) -> Result<String, CofundError> {
            Err(CofundError::gateway("not supported"))
        }

        async fn confirm_intent(
            &self,
            _intent_id: &str,
            _payment_method: &str,
        ) -> Result<GatewayStatus, CofundError> {
            Err(CofundError::gateway("not supported"))
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
            if self.stalled_owners.contains(&payout.owner_id) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if self.declined_owners.contains(&payout.owner_id) {
                return Err(CofundError::declined("account_closed", None));
            }
            self.transfers.lock().unwrap().push(payout.clone());
            Ok(TransferReceipt {
                reference: format!("tr_{}", payout.idempotency_key),
                settled_at: Utc::now(),
            })
        }
    }

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    async fn funded_resource(store: &Arc<dyn Store>, owner: &str, amounts: &[u64]) -> Resource {
        let resource = Resource::new(owner, format!("{owner}-server"), 10_000, 200);
        store.insert_resource(resource.clone()).await.unwrap();
        for (i, amount) in amounts.iter().enumerate() {
            let pledge = Pledge::pending(
                format!("{owner}-backer{i}"),
                resource.id,
                *amount,
                Utc::now() + chrono::Duration::seconds(i as i64),
            );
            store.insert_pending_pledge(pledge.clone()).await.unwrap();
            let intent = format!("pi_{}", pledge.id);
            store.attach_intent(pledge.id, &intent).await.unwrap();
            store
                .apply_settlement(Settlement {
                    idempotency_key: format!("{intent}:succeeded"),
                    intent_id: intent.clone(),
                    event_id: format!("evt_{intent}"),
                    payer_id: pledge.owner_id.clone(),
                    recorded_at: Utc::now(),
                    effect: SettlementEffect::CompletePledge {
                        activities: Vec::new(),
                        rejection_activity: ActivityEntry::new(
                            ActivityKind::PledgeRefunded,
                            pledge.owner_id.clone(),
                            "Pledge refunded",
                        ),
                    },
                })
                .await
                .unwrap();
        }
        resource
    }

    fn scheduler(store: Arc<dyn Store>, gateway: PayoutGateway) -> WithdrawalScheduler {
        let client = GatewayClient::new(Arc::new(gateway), Duration::from_millis(50));
        WithdrawalScheduler::new(store, client, FeePolicy::default(), 1)
    }

    #[test]
    fn due_date_rolls_into_next_month() {
        assert_eq!(cycle_of(at(2026, 3, 15)), "2026-03");
        assert_eq!(
            due_at(at(2026, 3, 15), 1).unwrap(),
            Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            due_at(at(2026, 12, 31), 31).unwrap(),
            Utc.with_ymd_and_hms(2027, 1, 28, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn scheduling_is_idempotent_per_cycle() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let resource = funded_resource(&store, "owner", &[1_000, 2_000, 3_000, 5_000]).await;
        let idle = Resource::new("idle", "idle-server", 10_000, 200);
        store.insert_resource(idle).await.unwrap();
        let scheduler = scheduler(store.clone(), PayoutGateway::default());

        let now = at(2026, 3, 15);
        let first = scheduler.schedule(now).await.unwrap();
        assert_eq!(first, ScheduleReport { created: 1, skipped: 1, failed: 0 });
        let second = scheduler.schedule(now).await.unwrap();
        assert_eq!(second, ScheduleReport { created: 0, skipped: 2, failed: 0 });

        let schedules = scheduler.list(resource.id).await.unwrap();
        assert_eq!(schedules.len(), 1);
        let fees = FeePolicy::default();
        let expected: u64 = [922, 1_824, 2_725, 4_529]
            .iter()
            .map(|charge| fees.quote(*charge).net_minor)
            .sum();
        assert_eq!(schedules[0].amount_minor, expected);
        assert_eq!(schedules[0].cycle, "2026-03");

        let next_month = scheduler.schedule(at(2026, 4, 2)).await.unwrap();
        assert_eq!(next_month.created, 1);
    }

    #[tokio::test]
    async fn processing_tolerates_item_failures() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        funded_resource(&store, "paid", &[5_000, 6_000]).await;
        funded_resource(&store, "closed", &[5_000, 6_000]).await;
        funded_resource(&store, "slow", &[5_000, 6_000]).await;
        let gateway = PayoutGateway {
            declined_owners: HashSet::from(["closed".to_string()]),
            stalled_owners: HashSet::from(["slow".to_string()]),
            ..PayoutGateway::default()
        };
        let scheduler = scheduler(store.clone(), gateway);

        scheduler.schedule(at(2026, 3, 15)).await.unwrap();
        let early = scheduler.process(at(2026, 3, 31)).await.unwrap();
        assert_eq!(early, ProcessReport::default());

        let report = scheduler.process(at(2026, 4, 1)).await.unwrap();
        assert_eq!(
            report,
            ProcessReport {
                succeeded: 1,
                failed: 1,
                indeterminate: 1
            }
        );

        let rerun = scheduler.process(at(2026, 4, 2)).await.unwrap();
        assert_eq!(rerun.succeeded, 0);
        assert_eq!(rerun.failed + rerun.indeterminate, 2);

        let processed = store
            .list_activity(&ActivityQuery::for_user("paid").kind(ActivityKind::WithdrawalProcessed))
            .await
            .unwrap();
        assert_eq!(processed.len(), 1);
    }
}
