//! In-memory storage implementation

use super::traits::*;
use super::StorageError;
use crate::activity::{ActivityEntry, ActivityQuery};
use crate::types::{
    Boost, PaymentFailureRecord, Pledge, PledgeStatus, Resource, UserAccount, WithdrawalSchedule,
    WithdrawalStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    resources: HashMap<Uuid, Resource>,
    pledges: HashMap<Uuid, Pledge>,
    boosts: HashMap<Uuid, Boost>,
    failures: HashMap<String, PaymentFailureRecord>,
    schedules: HashMap<Uuid, WithdrawalSchedule>,
    activity: Vec<ActivityEntry>,
    settlements: HashSet<String>,
    accounts: HashMap<String, UserAccount>,
}

impl Tables {
    fn live_boosts(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Boost> {
        self.boosts.values().filter(move |boost| boost.is_live(now))
    }

    fn record_failure(
        &mut self,
        user_id: &str,
        threshold: u32,
        now: DateTime<Utc>,
        suspension_activity: ActivityEntry,
    ) -> FailureUpdate {
        let record = self
            .failures
            .entry(user_id.to_string())
            .or_insert_with(|| PaymentFailureRecord::clean(user_id));
        let newly_suspended = record.register_failure(threshold, now);
        let record = record.clone();
        if newly_suspended {
            self.activity.push(suspension_activity);
        }
        FailureUpdate {
            record,
            newly_suspended,
        }
    }

    fn completed_pledges(&self, resource_id: Uuid) -> u64 {
        self.pledges
            .values()
            .filter(|pledge| {
                pledge.resource_id == resource_id && pledge.status == PledgeStatus::Completed
            })
            .count() as u64
    }

    fn reset_failures(&mut self, user_id: &str) {
        if let Some(record) = self.failures.get_mut(user_id) {
            record.consecutive_failure_count = 0;
        }
    }
}

/// Process-local storage for development and tests.
///
/// One lock guards every table, so each trait method is a single atomic
/// critical section. Nothing is held across awaits outside the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn backend_label(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn insert_resource(&self, resource: Resource) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        if tables.resources.contains_key(&resource.id) {
            return Err(StorageError::Conflict(format!(
                "resource {} already exists",
                resource.id
            )));
        }
        tables.resources.insert(resource.id, resource);
        Ok(())
    }

    async fn get_resource(&self, id: Uuid) -> StorageResult<Option<Resource>> {
        let tables = self.tables.read().await;
        Ok(tables.resources.get(&id).cloned())
    }

    async fn list_active_resources(&self) -> StorageResult<Vec<Resource>> {
        let tables = self.tables.read().await;
        let mut resources: Vec<Resource> = tables
            .resources
            .values()
            .filter(|resource| resource.active)
            .cloned()
            .collect();
        resources.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(resources)
    }
}

#[async_trait]
impl PledgeStore for MemoryStore {
    async fn insert_pending_pledge(&self, pledge: Pledge) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let duplicate = tables.pledges.values().any(|existing| {
            existing.owner_id == pledge.owner_id
                && existing.resource_id == pledge.resource_id
                && existing.status.is_open()
        });
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "user {} already has an open pledge on resource {}",
                pledge.owner_id, pledge.resource_id
            )));
        }
        tables.pledges.insert(pledge.id, pledge);
        Ok(())
    }

    async fn attach_intent(&self, pledge_id: Uuid, intent_id: &str) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        let pledge = tables
            .pledges
            .get_mut(&pledge_id)
            .ok_or_else(|| StorageError::NotFound(format!("pledge {pledge_id}")))?;
        if pledge.status != PledgeStatus::Pending || pledge.intent_id.is_some() {
            return Err(StorageError::Conflict(format!(
                "pledge {pledge_id} cannot take intent {intent_id}"
            )));
        }
        pledge.intent_id = Some(intent_id.to_string());
        pledge.updated_at = Utc::now();
        Ok(())
    }

    async fn find_open_pledge(
        &self,
        owner_id: &str,
        resource_id: Uuid,
    ) -> StorageResult<Option<Pledge>> {
        let tables = self.tables.read().await;
        Ok(tables
            .pledges
            .values()
            .find(|pledge| {
                pledge.owner_id == owner_id
                    && pledge.resource_id == resource_id
                    && pledge.status.is_open()
            })
            .cloned())
    }

    async fn withdraw_pledge(
        &self,
        pledge_id: Uuid,
        only_if_pending: bool,
        now: DateTime<Utc>,
        activity: Option<ActivityEntry>,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(pledge) = tables.pledges.get_mut(&pledge_id) else {
            return Err(StorageError::NotFound(format!("pledge {pledge_id}")));
        };
        let allowed = match pledge.status {
            PledgeStatus::Withdrawn => false,
            PledgeStatus::Completed => !only_if_pending,
            PledgeStatus::Pending => true,
        };
        if !allowed {
            return Ok(false);
        }
        pledge.status = PledgeStatus::Withdrawn;
        pledge.updated_at = now;
        if let Some(entry) = activity {
            tables.activity.push(entry);
        }
        Ok(true)
    }

    async fn list_pledges(
        &self,
        resource_id: Uuid,
        status: PledgeStatus,
    ) -> StorageResult<Vec<Pledge>> {
        let tables = self.tables.read().await;
        let mut pledges: Vec<Pledge> = tables
            .pledges
            .values()
            .filter(|pledge| pledge.resource_id == resource_id && pledge.status == status)
            .cloned()
            .collect();
        pledges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pledges)
    }

    async fn list_stale_pending(
        &self,
        created_before: DateTime<Utc>,
    ) -> StorageResult<Vec<Pledge>> {
        let tables = self.tables.read().await;
        let mut pledges: Vec<Pledge> = tables
            .pledges
            .values()
            .filter(|pledge| {
                pledge.status == PledgeStatus::Pending && pledge.created_at < created_before
            })
            .cloned()
            .collect();
        pledges.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(pledges)
    }
}

#[async_trait]
impl BoostStore for MemoryStore {
    async fn count_live_boosts(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let tables = self.tables.read().await;
        Ok(tables.live_boosts(now).count())
    }

    async fn live_boost_for_resource(
        &self,
        resource_id: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Boost>> {
        let tables = self.tables.read().await;
        let boost = tables
            .live_boosts(now)
            .find(|boost| boost.resource_id == resource_id)
            .cloned();
        Ok(boost)
    }

    async fn list_live_boosts(&self, now: DateTime<Utc>) -> StorageResult<Vec<Boost>> {
        let tables = self.tables.read().await;
        let mut boosts: Vec<Boost> = tables.live_boosts(now).cloned().collect();
        boosts.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        Ok(boosts)
    }

    async fn list_expired_active(&self, now: DateTime<Utc>) -> StorageResult<Vec<Boost>> {
        let tables = self.tables.read().await;
        let mut boosts: Vec<Boost> = tables
            .boosts
            .values()
            .filter(|boost| boost.active && boost.is_expired(now))
            .cloned()
            .collect();
        boosts.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then(a.id.cmp(&b.id)));
        Ok(boosts)
    }

    async fn expire_boost(&self, boost_id: Uuid, activity: ActivityEntry) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        let boost = tables
            .boosts
            .get_mut(&boost_id)
            .ok_or_else(|| StorageError::NotFound(format!("boost {boost_id}")))?;
        if !boost.active {
            return Ok(false);
        }
        boost.active = false;
        tables.activity.push(activity);
        Ok(true)
    }
}

#[async_trait]
impl FailureStore for MemoryStore {
    async fn get_failure_record(
        &self,
        user_id: &str,
    ) -> StorageResult<Option<PaymentFailureRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.failures.get(user_id).cloned())
    }

    async fn record_failure(
        &self,
        user_id: &str,
        threshold: u32,
        now: DateTime<Utc>,
        suspension_activity: ActivityEntry,
    ) -> StorageResult<FailureUpdate> {
        let mut tables = self.tables.write().await;
        Ok(tables.record_failure(user_id, threshold, now, suspension_activity))
    }

    async fn record_success(&self, user_id: &str) -> StorageResult<()> {
        let mut tables = self.tables.write().await;
        tables.reset_failures(user_id);
        Ok(())
    }

    async fn suspend(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        activity: ActivityEntry,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        let record = tables
            .failures
            .entry(user_id.to_string())
            .or_insert_with(|| PaymentFailureRecord::clean(user_id));
        if record.suspended {
            return Ok(false);
        }
        record.suspended = true;
        record.payment_suspended_at = Some(now);
        tables.activity.push(activity);
        Ok(true)
    }

    async fn unsuspend(
        &self,
        user_id: &str,
        activity: ActivityEntry,
    ) -> StorageResult<PaymentFailureRecord> {
        let mut tables = self.tables.write().await;
        let record = tables
            .failures
            .entry(user_id.to_string())
            .or_insert_with(|| PaymentFailureRecord::clean(user_id));
        record.reset();
        let record = record.clone();
        tables.activity.push(activity);
        Ok(record)
    }
}

#[async_trait]
impl WithdrawalStore for MemoryStore {
    async fn insert_schedule_if_absent(
        &self,
        schedule: WithdrawalSchedule,
        activity: ActivityEntry,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        let exists = tables.schedules.values().any(|existing| {
            existing.resource_id == schedule.resource_id && existing.cycle == schedule.cycle
        });
        if exists {
            return Ok(false);
        }
        tables.schedules.insert(schedule.id, schedule);
        tables.activity.push(activity);
        Ok(true)
    }

    async fn list_due_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<WithdrawalSchedule>> {
        let tables = self.tables.read().await;
        let mut due: Vec<WithdrawalSchedule> = tables
            .schedules
            .values()
            .filter(|schedule| {
                schedule.status == WithdrawalStatus::Scheduled && schedule.due_at <= now
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn list_schedules(&self, resource_id: Uuid) -> StorageResult<Vec<WithdrawalSchedule>> {
        let tables = self.tables.read().await;
        let mut schedules: Vec<WithdrawalSchedule> = tables
            .schedules
            .values()
            .filter(|schedule| schedule.resource_id == resource_id)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.cycle.cmp(&b.cycle));
        Ok(schedules)
    }

    async fn mark_processed(
        &self,
        schedule_id: Uuid,
        transfer_reference: &str,
        processed_at: DateTime<Utc>,
        activity: ActivityEntry,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        let schedule = tables
            .schedules
            .get_mut(&schedule_id)
            .ok_or_else(|| StorageError::NotFound(format!("withdrawal schedule {schedule_id}")))?;
        if schedule.status == WithdrawalStatus::Processed {
            return Ok(false);
        }
        schedule.status = WithdrawalStatus::Processed;
        schedule.processed_at = Some(processed_at);
        schedule.transfer_reference = Some(transfer_reference.to_string());
        tables.activity.push(activity);
        Ok(true)
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn list_activity(&self, query: &ActivityQuery) -> StorageResult<Vec<ActivityEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .activity
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(query.effective_limit())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn apply_settlement(&self, settlement: Settlement) -> StorageResult<SettlementApplied> {
        let mut tables = self.tables.write().await;
        if tables.settlements.contains(&settlement.idempotency_key) {
            return Ok(SettlementApplied::Duplicate);
        }

        let applied = match settlement.effect {
            SettlementEffect::CompletePledge {
                activities,
                rejection_activity,
            } => {
                tables.reset_failures(&settlement.payer_id);
                let pending = tables
                    .pledges
                    .values()
                    .find(|pledge| {
                        pledge.status == PledgeStatus::Pending
                            && pledge.intent_id.as_deref() == Some(settlement.intent_id.as_str())
                    })
                    .map(|pledge| (pledge.id, pledge.resource_id));

                match pending {
                    Some((pledge_id, resource_id)) => {
                        let max_people = tables.resources.get(&resource_id).map(Resource::max_people);
                        let completed = tables.completed_pledges(resource_id);
                        let full = max_people.is_some_and(|max| completed >= max);

                        let pledge = tables
                            .pledges
                            .get_mut(&pledge_id)
                            .ok_or_else(|| StorageError::NotFound(format!("pledge {pledge_id}")))?;
                        pledge.updated_at = settlement.recorded_at;
                        if full {
                            pledge.status = PledgeStatus::Withdrawn;
                            let pledge = pledge.clone();
                            tables.activity.push(rejection_activity);
                            SettlementApplied::PledgeRejected {
                                pledge,
                                max_people: max_people.unwrap_or_default(),
                            }
                        } else {
                            pledge.status = PledgeStatus::Completed;
                            let pledge = pledge.clone();
                            tables.activity.extend(activities);
                            SettlementApplied::PledgeCompleted(pledge)
                        }
                    }
                    None => SettlementApplied::PledgeMissing,
                }
            }
            SettlementEffect::ActivateBoost {
                boost,
                cap,
                activities,
                rejection_activity,
            } => {
                tables.reset_failures(&settlement.payer_id);
                let now = settlement.recorded_at;
                let resource_taken = tables
                    .live_boosts(now)
                    .any(|live| live.resource_id == boost.resource_id);
                let live_count = tables.live_boosts(now).count();
                let rejection = if resource_taken {
                    Some(BoostRejection::ResourceTaken)
                } else if live_count >= cap {
                    Some(BoostRejection::CapReached { cap })
                } else {
                    None
                };
                if let Some(rejection) = rejection {
                    tables.activity.push(rejection_activity);
                    SettlementApplied::BoostRejected(rejection)
                } else {
                    tables.boosts.insert(boost.id, boost.clone());
                    tables.activity.extend(activities);
                    SettlementApplied::BoostActivated(boost)
                }
            }
            SettlementEffect::RecordFailure {
                threshold,
                activity,
                suspension_activity,
            } => {
                tables.activity.push(activity);
                let update = tables.record_failure(
                    &settlement.payer_id,
                    threshold,
                    settlement.recorded_at,
                    suspension_activity,
                );
                SettlementApplied::FailureRecorded(update)
            }
        };

        tables.settlements.insert(settlement.idempotency_key);
        Ok(applied)
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, user_id: &str) -> StorageResult<Option<UserAccount>> {
        let tables = self.tables.read().await;
        Ok(tables.accounts.get(user_id).cloned())
    }

    async fn set_payment_method(
        &self,
        user_id: &str,
        payment_method: &str,
    ) -> StorageResult<UserAccount> {
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| UserAccount::new(user_id));
        account.payment_method = Some(payment_method.to_string());
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    async fn ban_account(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        ban_activity: ActivityEntry,
        suspension_activity: ActivityEntry,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        let account = tables
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| UserAccount::new(user_id));
        if account.banned {
            return Ok(false);
        }
        account.banned = true;
        account.updated_at = now;
        tables.activity.push(ban_activity);

        let record = tables
            .failures
            .entry(user_id.to_string())
            .or_insert_with(|| PaymentFailureRecord::clean(user_id));
        if !record.suspended {
            record.suspended = true;
            record.payment_suspended_at = Some(now);
            tables.activity.push(suspension_activity);
        }
        Ok(true)
    }

    async fn lift_ban(&self, user_id: &str, activity: ActivityEntry) -> StorageResult<bool> {
        let mut tables = self.tables.write().await;
        let Some(account) = tables.accounts.get_mut(user_id) else {
            return Ok(false);
        };
        if !account.banned {
            return Ok(false);
        }
        account.banned = false;
        account.updated_at = Utc::now();
        tables.activity.push(activity);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;
    use chrono::Duration;

    fn boost(resource_id: Uuid, now: DateTime<Utc>) -> Boost {
        Boost {
            id: Uuid::new_v4(),
            resource_id,
            owner_id: "owner".to_string(),
            amount_minor: 500,
            intent_id: format!("pi_{}", Uuid::new_v4()),
            created_at: now,
            expires_at: now + Duration::hours(24),
            active: true,
        }
    }

    fn activate(boost: Boost, cap: usize, now: DateTime<Utc>) -> Settlement {
        Settlement {
            idempotency_key: format!("{}:succeeded", boost.intent_id),
            intent_id: boost.intent_id.clone(),
            event_id: "evt".to_string(),
            payer_id: boost.owner_id.clone(),
            recorded_at: now,
            effect: SettlementEffect::ActivateBoost {
                activities: vec![ActivityEntry::new(
                    ActivityKind::BoostPurchased,
                    "owner",
                    "Boost purchased",
                )],
                rejection_activity: ActivityEntry::new(
                    ActivityKind::BoostRefunded,
                    "owner",
                    "Boost refunded",
                ),
                boost,
                cap,
            },
        }
    }

    fn complete(pledge: &Pledge, intent_id: &str, now: DateTime<Utc>) -> Settlement {
        Settlement {
            idempotency_key: format!("{intent_id}:succeeded"),
            intent_id: intent_id.to_string(),
            event_id: format!("evt_{intent_id}"),
            payer_id: pledge.owner_id.clone(),
            recorded_at: now,
            effect: SettlementEffect::CompletePledge {
                activities: vec![ActivityEntry::new(
                    ActivityKind::PledgeCompleted,
                    pledge.owner_id.clone(),
                    "Pledged",
                )],
                rejection_activity: ActivityEntry::new(
                    ActivityKind::PledgeRefunded,
                    pledge.owner_id.clone(),
                    "Pledge refunded",
                ),
            },
        }
    }

    #[tokio::test]
    async fn open_pledge_is_unique_per_owner_and_resource() {
        let store = MemoryStore::new();
        let resource_id = Uuid::new_v4();
        let now = Utc::now();

        let first = Pledge::pending("u1", resource_id, 1_000, now);
        store.insert_pending_pledge(first.clone()).await.unwrap();
        let err = store
            .insert_pending_pledge(Pledge::pending("u1", resource_id, 2_000, now))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        assert!(store.withdraw_pledge(first.id, false, now, None).await.unwrap());
        store
            .insert_pending_pledge(Pledge::pending("u1", resource_id, 2_000, now))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn intent_attaches_once() {
        let store = MemoryStore::new();
        let pledge = Pledge::pending("u1", Uuid::new_v4(), 1_000, Utc::now());
        store.insert_pending_pledge(pledge.clone()).await.unwrap();

        store.attach_intent(pledge.id, "pi_1").await.unwrap();
        let err = store.attach_intent(pledge.id, "pi_2").await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
        let stored = store
            .find_open_pledge("u1", pledge.resource_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.intent_id.as_deref(), Some("pi_1"));
    }

    #[tokio::test]
    async fn settlement_key_is_recorded_once() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let settlement = activate(boost(Uuid::new_v4(), now), 10, now);

        let first = store.apply_settlement(settlement.clone()).await.unwrap();
        assert!(matches!(first, SettlementApplied::BoostActivated(_)));
        let second = store.apply_settlement(settlement).await.unwrap();
        assert_eq!(second, SettlementApplied::Duplicate);
        assert_eq!(store.count_live_boosts(now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn boost_insert_rechecks_cap_and_resource() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let resource_id = Uuid::new_v4();

        let applied = store
            .apply_settlement(activate(boost(resource_id, now), 2, now))
            .await
            .unwrap();
        assert!(matches!(applied, SettlementApplied::BoostActivated(_)));

        let same_resource = store
            .apply_settlement(activate(boost(resource_id, now), 2, now))
            .await
            .unwrap();
        assert_eq!(
            same_resource,
            SettlementApplied::BoostRejected(BoostRejection::ResourceTaken)
        );

        store
            .apply_settlement(activate(boost(Uuid::new_v4(), now), 2, now))
            .await
            .unwrap();
        let over_cap = store
            .apply_settlement(activate(boost(Uuid::new_v4(), now), 2, now))
            .await
            .unwrap();
        assert_eq!(
            over_cap,
            SettlementApplied::BoostRejected(BoostRejection::CapReached { cap: 2 })
        );
        assert_eq!(store.count_live_boosts(now).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn schedules_are_unique_per_cycle() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let resource_id = Uuid::new_v4();
        let schedule = |cycle: &str| WithdrawalSchedule {
            id: Uuid::new_v4(),
            resource_id,
            owner_id: "owner".to_string(),
            cycle: cycle.to_string(),
            amount_minor: 9_000,
            due_at: now,
            status: WithdrawalStatus::Scheduled,
            created_at: now,
            processed_at: None,
            transfer_reference: None,
        };
        let entry = || ActivityEntry::new(ActivityKind::WithdrawalScheduled, "owner", "Scheduled");

        assert!(store
            .insert_schedule_if_absent(schedule("2026-09"), entry())
            .await
            .unwrap());
        assert!(!store
            .insert_schedule_if_absent(schedule("2026-09"), entry())
            .await
            .unwrap());
        assert!(store
            .insert_schedule_if_absent(schedule("2026-10"), entry())
            .await
            .unwrap());
        assert_eq!(store.list_schedules(resource_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn settlement_stops_at_max_people() {
        let store = MemoryStore::new();
        let now = Utc::now();
        // 600 / 200: three people at most.
        let resource = Resource::new("owner", "small", 600, 200);
        store.insert_resource(resource.clone()).await.unwrap();

        let mut outcomes = Vec::new();
        for i in 0..4 {
            let pledge = Pledge::pending(format!("p{i}"), resource.id, 200, now);
            store.insert_pending_pledge(pledge.clone()).await.unwrap();
            let intent_id = format!("pi_{i}");
            store.attach_intent(pledge.id, &intent_id).await.unwrap();
            outcomes.push(
                store
                    .apply_settlement(complete(&pledge, &intent_id, now))
                    .await
                    .unwrap(),
            );
        }

        assert!(outcomes[..3]
            .iter()
            .all(|applied| matches!(applied, SettlementApplied::PledgeCompleted(_))));
        let SettlementApplied::PledgeRejected { pledge, max_people } = &outcomes[3] else {
            panic!("fourth pledge should be rejected, got {:?}", outcomes[3]);
        };
        assert_eq!(*max_people, 3);
        assert_eq!(pledge.status, PledgeStatus::Withdrawn);

        let completed = store
            .list_pledges(resource.id, PledgeStatus::Completed)
            .await
            .unwrap();
        assert_eq!(completed.len(), 3);
        let funded: u64 = completed.iter().map(|pledge| pledge.pledged_minor).sum();
        assert!(funded <= resource.target_cost_minor);
        assert!(store.find_open_pledge("p3", resource.id).await.unwrap().is_none());

        let refunded = store
            .list_activity(&ActivityQuery::default().kind(ActivityKind::PledgeRefunded))
            .await
            .unwrap();
        assert_eq!(refunded.len(), 1);
        assert_eq!(refunded[0].user_id, "p3");
    }

    #[tokio::test]
    async fn ban_suspends_in_the_same_step() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let ban = || ActivityEntry::new(ActivityKind::AccountBanned, "u1", "Banned");
        let suspend = || ActivityEntry::new(ActivityKind::AccountSuspended, "u1", "Suspended");

        assert!(store.ban_account("u1", now, ban(), suspend()).await.unwrap());
        assert!(!store.ban_account("u1", now, ban(), suspend()).await.unwrap());

        let account = store.get_account("u1").await.unwrap().unwrap();
        assert!(account.banned);
        let record = store.get_failure_record("u1").await.unwrap().unwrap();
        assert!(record.suspended);
        assert_eq!(record.payment_suspended_at, Some(now));
        assert_eq!(
            store
                .list_activity(&ActivityQuery::for_user("u1"))
                .await
                .unwrap()
                .len(),
            2
        );

        let lifted = ActivityEntry::new(ActivityKind::AccountUnbanned, "u1", "Unbanned");
        assert!(store.lift_ban("u1", lifted.clone()).await.unwrap());
        assert!(!store.lift_ban("u1", lifted).await.unwrap());
        assert!(store.get_failure_record("u1").await.unwrap().unwrap().suspended);
    }
}
