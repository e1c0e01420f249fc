//! Storage trait definitions

use super::StorageError;
use crate::activity::{ActivityEntry, ActivityQuery};
use crate::types::{
    Boost, PaymentFailureRecord, Pledge, PledgeStatus, Resource, UserAccount, WithdrawalSchedule,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Combined storage trait
pub trait Store:
    ResourceStore
    + PledgeStore
    + BoostStore
    + FailureStore
    + WithdrawalStore
    + ActivityStore
    + SettlementStore
    + AccountStore
    + Send
    + Sync
{
    fn backend_label(&self) -> &'static str;
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn insert_resource(&self, resource: Resource) -> StorageResult<()>;

    async fn get_resource(&self, id: Uuid) -> StorageResult<Option<Resource>>;

    async fn list_active_resources(&self) -> StorageResult<Vec<Resource>>;
}

#[async_trait]
pub trait PledgeStore: Send + Sync {
    /// Insert a pending pledge; `Conflict` if the owner already has an open pledge on the resource.
    async fn insert_pending_pledge(&self, pledge: Pledge) -> StorageResult<()>;

    /// Attach the payment intent once; `Conflict` if the pledge is no longer
    /// pending or already carries an intent.
    async fn attach_intent(&self, pledge_id: Uuid, intent_id: &str) -> StorageResult<()>;

    /// The owner's non-withdrawn pledge on a resource, if any.
    async fn find_open_pledge(
        &self,
        owner_id: &str,
        resource_id: Uuid,
    ) -> StorageResult<Option<Pledge>>;

    /// Mark a pledge withdrawn and append `activity` in the same unit.
    ///
    /// Returns false when the pledge was already withdrawn, or when
    /// `only_if_pending` is set and it has completed in the meantime.
    async fn withdraw_pledge(
        &self,
        pledge_id: Uuid,
        only_if_pending: bool,
        now: DateTime<Utc>,
        activity: Option<ActivityEntry>,
    ) -> StorageResult<bool>;

    /// Pledges in `status`, ordered by creation time then id.
    async fn list_pledges(
        &self,
        resource_id: Uuid,
        status: PledgeStatus,
    ) -> StorageResult<Vec<Pledge>>;

    async fn list_stale_pending(&self, created_before: DateTime<Utc>)
        -> StorageResult<Vec<Pledge>>;
}

#[async_trait]
pub trait BoostStore: Send + Sync {
    async fn count_live_boosts(&self, now: DateTime<Utc>) -> StorageResult<usize>;

    async fn live_boost_for_resource(
        &self,
        resource_id: Uuid,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Boost>>;

    async fn list_live_boosts(&self, now: DateTime<Utc>) -> StorageResult<Vec<Boost>>;

    /// Boosts still flagged active whose deadline has passed.
    async fn list_expired_active(&self, now: DateTime<Utc>) -> StorageResult<Vec<Boost>>;

    /// Flip `active` off and log `activity`; false if another sweep got there first.
    async fn expire_boost(&self, boost_id: Uuid, activity: ActivityEntry) -> StorageResult<bool>;
}

/// Outcome of counting one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    pub record: PaymentFailureRecord,
    pub newly_suspended: bool,
}

#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn get_failure_record(&self, user_id: &str)
        -> StorageResult<Option<PaymentFailureRecord>>;

    /// Atomic increment; writes `suspension_activity` only if the threshold was crossed.
    async fn record_failure(
        &self,
        user_id: &str,
        threshold: u32,
        now: DateTime<Utc>,
        suspension_activity: ActivityEntry,
    ) -> StorageResult<FailureUpdate>;

    /// Resets the counter; leaves the suspension flag alone.
    async fn record_success(&self, user_id: &str) -> StorageResult<()>;

    /// Administrative suspension; false if the user was already suspended.
    async fn suspend(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        activity: ActivityEntry,
    ) -> StorageResult<bool>;

    async fn unsuspend(
        &self,
        user_id: &str,
        activity: ActivityEntry,
    ) -> StorageResult<PaymentFailureRecord>;
}

#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    /// Insert unless the (resource, cycle) pair already has a schedule.
    async fn insert_schedule_if_absent(
        &self,
        schedule: WithdrawalSchedule,
        activity: ActivityEntry,
    ) -> StorageResult<bool>;

    /// `scheduled` rows with `due_at <= now`, oldest first.
    async fn list_due_schedules(&self, now: DateTime<Utc>)
        -> StorageResult<Vec<WithdrawalSchedule>>;

    async fn list_schedules(&self, resource_id: Uuid) -> StorageResult<Vec<WithdrawalSchedule>>;

    /// Scheduled → processed; false if it was already processed.
    async fn mark_processed(
        &self,
        schedule_id: Uuid,
        transfer_reference: &str,
        processed_at: DateTime<Utc>,
        activity: ActivityEntry,
    ) -> StorageResult<bool>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Matching entries, newest first, capped at the query limit.
    async fn list_activity(&self, query: &ActivityQuery) -> StorageResult<Vec<ActivityEntry>>;
}

/// Side effects of one definitive payment outcome.
#[derive(Debug, Clone)]
pub enum SettlementEffect {
    /// Pending pledge carrying the intent → completed, unless the resource
    /// already holds `max_people` completed pledges; then it is withdrawn and
    /// `rejection_activity` is logged instead.
    CompletePledge {
        activities: Vec<ActivityEntry>,
        rejection_activity: ActivityEntry,
    },
    /// Insert the boost if the resource has no live boost and the global cap allows it.
    ActivateBoost {
        boost: Boost,
        cap: usize,
        activities: Vec<ActivityEntry>,
        rejection_activity: ActivityEntry,
    },
    RecordFailure {
        threshold: u32,
        activity: ActivityEntry,
        suspension_activity: ActivityEntry,
    },
}

/// Everything `apply_settlement` needs, checked and recorded atomically.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub idempotency_key: String,
    pub intent_id: String,
    pub event_id: String,
    pub payer_id: String,
    pub recorded_at: DateTime<Utc>,
    pub effect: SettlementEffect,
}

/// Why the boost guard refused an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoostRejection {
    ResourceTaken,
    CapReached { cap: usize },
}

impl std::fmt::Display for BoostRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResourceTaken => write!(f, "resource already has a live boost"),
            Self::CapReached { cap } => write!(f, "global boost cap of {cap} reached"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementApplied {
    /// Key already recorded; nothing changed.
    Duplicate,
    PledgeCompleted(Pledge),
    /// No pending pledge carries the intent any more.
    PledgeMissing,
    /// Headcount was full at settlement; the pledge was withdrawn.
    PledgeRejected { pledge: Pledge, max_people: u64 },
    BoostActivated(Boost),
    BoostRejected(BoostRejection),
    FailureRecorded(FailureUpdate),
}

#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Record the idempotency key and apply the effect in one atomic unit.
    ///
    /// Success effects also reset the payer's failure counter.
    async fn apply_settlement(&self, settlement: Settlement) -> StorageResult<SettlementApplied>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, user_id: &str) -> StorageResult<Option<UserAccount>>;

    async fn set_payment_method(
        &self,
        user_id: &str,
        payment_method: &str,
    ) -> StorageResult<UserAccount>;

    /// Ban the account and suspend its payments in one unit.
    ///
    /// False if the account was already banned. The suspension and its
    /// activity are skipped when payments were already suspended.
    async fn ban_account(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        ban_activity: ActivityEntry,
        suspension_activity: ActivityEntry,
    ) -> StorageResult<bool>;

    /// Clear the ban flag only; false if the account was not banned.
    async fn lift_ban(&self, user_id: &str, activity: ActivityEntry) -> StorageResult<bool>;
}
