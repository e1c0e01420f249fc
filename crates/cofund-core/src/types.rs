use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A co-funded server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    /// Monthly cost the backers try to cover (minor units).
    pub target_cost_minor: u64,
    /// Nobody is ever charged less than this per month (minor units).
    pub min_cost_per_person_minor: u64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(
        owner_id: impl Into<String>,
        name: impl Into<String>,
        target_cost_minor: u64,
        min_cost_per_person_minor: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            name: name.into(),
            target_cost_minor,
            min_cost_per_person_minor,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Most completed pledges the resource takes: `floor(target / min)`.
    pub fn max_people(&self) -> u64 {
        self.target_cost_minor
            .checked_div(self.min_cost_per_person_minor)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PledgeStatus {
    Pending,
    Completed,
    Withdrawn,
}

impl PledgeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Withdrawn => "withdrawn",
        }
    }

    pub fn is_open(self) -> bool {
        !matches!(self, Self::Withdrawn)
    }
}

/// A backer's monthly commitment toward a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pledge {
    pub id: Uuid,
    pub owner_id: String,
    pub resource_id: Uuid,
    pub pledged_minor: u64,
    pub status: PledgeStatus,
    /// Gateway intent that will settle this pledge, once requested.
    pub intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pledge {
    pub fn pending(
        owner_id: impl Into<String>,
        resource_id: Uuid,
        pledged_minor: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            resource_id,
            pledged_minor,
            status: PledgeStatus::Pending,
            intent_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Paid, time-limited visibility promotion for a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Boost {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub owner_id: String,
    pub amount_minor: u64,
    pub intent_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
}

impl Boost {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Active and not yet expired; only live boosts count toward capacity.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.active && !self.is_expired(now)
    }
}

/// Consecutive payment failure state for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentFailureRecord {
    pub user_id: String,
    pub consecutive_failure_count: u32,
    pub suspended: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub payment_suspended_at: Option<DateTime<Utc>>,
}

impl PaymentFailureRecord {
    pub fn clean(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            consecutive_failure_count: 0,
            suspended: false,
            last_failure_at: None,
            payment_suspended_at: None,
        }
    }

    /// Count one failure; returns true when this failure crossed the threshold.
    pub fn register_failure(&mut self, threshold: u32, now: DateTime<Utc>) -> bool {
        self.consecutive_failure_count = self.consecutive_failure_count.saturating_add(1);
        self.last_failure_at = Some(now);
        if !self.suspended && self.consecutive_failure_count >= threshold.max(1) {
            self.suspended = true;
            self.payment_suspended_at = Some(now);
            return true;
        }
        false
    }

    /// Administrative reset: clears the counter and the suspension.
    pub fn reset(&mut self) {
        self.consecutive_failure_count = 0;
        self.suspended = false;
        self.last_failure_at = None;
        self.payment_suspended_at = None;
    }
}

/// Failure tracker view returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureStatus {
    pub failure_count: u32,
    pub suspended: bool,
    pub remaining_attempts: u32,
}

impl FailureStatus {
    pub fn from_record(record: &PaymentFailureRecord, threshold: u32) -> Self {
        let remaining_attempts = if record.suspended {
            0
        } else {
            threshold.saturating_sub(record.consecutive_failure_count)
        };
        Self {
            failure_count: record.consecutive_failure_count,
            suspended: record.suspended,
            remaining_attempts,
        }
    }
}

/// Boundary record for the user collaborator: stored payment method and ban flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAccount {
    pub user_id: String,
    pub payment_method: Option<String>,
    pub banned: bool,
    pub updated_at: DateTime<Utc>,
}

impl UserAccount {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            payment_method: None,
            banned: false,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Scheduled,
    Processed,
}

impl WithdrawalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Processed => "processed",
        }
    }
}

/// One monthly payout obligation toward a resource owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WithdrawalSchedule {
    pub id: Uuid,
    pub resource_id: Uuid,
    pub owner_id: String,
    /// Calendar month the payout covers, `YYYY-MM`.
    pub cycle: String,
    pub amount_minor: u64,
    pub due_at: DateTime<Utc>,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub transfer_reference: Option<String>,
}

/// Public pricing row for one completed pledge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PricingEntry {
    pub pledge_id: Uuid,
    pub user_id: String,
    pub pledged_minor: u64,
    pub optimized_minor: u64,
    pub savings_minor: u64,
}

/// Resource pricing view, recomputed on every read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourcePricing {
    pub resource_id: Uuid,
    pub target_cost_minor: u64,
    pub min_cost_per_person_minor: u64,
    pub max_people: u64,
    pub pledge_count: usize,
    pub funded_total_minor: u64,
    pub is_accepting_pledges: bool,
    pub is_funded: bool,
    pub entries: Vec<PricingEntry>,
}

/// Aggregate result of a batch sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn boost_expires_exactly_at_deadline() {
        let now = Utc::now();
        let boost = Boost {
            id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            owner_id: "owner".to_string(),
            amount_minor: 500,
            intent_id: "pi_1".to_string(),
            created_at: now,
            expires_at: now + Duration::hours(24),
            active: true,
        };

        assert!(boost.is_live(now));
        assert!(!boost.is_expired(now + Duration::hours(24) - Duration::seconds(1)));
        assert!(boost.is_expired(now + Duration::hours(24)));
        assert!(!boost.is_live(now + Duration::hours(24)));
    }

    #[test]
    fn third_failure_suspends_once() {
        let now = Utc::now();
        let mut record = PaymentFailureRecord::clean("u1");
        assert!(!record.register_failure(3, now));
        assert!(!record.register_failure(3, now));
        assert!(record.register_failure(3, now));
        assert!(record.suspended);
        assert_eq!(record.payment_suspended_at, Some(now));
        assert!(!record.register_failure(3, now));
        assert_eq!(record.consecutive_failure_count, 4);

        record.reset();
        assert_eq!(record, PaymentFailureRecord::clean("u1"));
    }

    #[test]
    fn suspended_status_has_no_remaining_attempts() {
        let mut record = PaymentFailureRecord::clean("u1");
        record.consecutive_failure_count = 1;
        assert_eq!(FailureStatus::from_record(&record, 3).remaining_attempts, 2);

        record.suspended = true;
        assert_eq!(FailureStatus::from_record(&record, 3).remaining_attempts, 0);
    }
}
