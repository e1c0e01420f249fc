//! Append-only activity log entries.
//!
//! Entries are written alongside the state change they describe and are never
//! mutated afterwards. The UI and reporting collaborators read them back through
//! [`ActivityQuery`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CofundError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PledgeCompleted,
    PledgeWithdrawn,
    PledgeExpired,
    PledgeRefunded,
    PaymentFailed,
    PaymentFee,
    BoostPurchased,
    BoostExpired,
    BoostRefunded,
    AccountSuspended,
    AccountUnsuspended,
    AccountBanned,
    AccountUnbanned,
    WithdrawalScheduled,
    WithdrawalProcessed,
}

impl ActivityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PledgeCompleted => "pledge_completed",
            Self::PledgeWithdrawn => "pledge_withdrawn",
            Self::PledgeExpired => "pledge_expired",
            Self::PledgeRefunded => "pledge_refunded",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentFee => "payment_fee",
            Self::BoostPurchased => "boost_purchased",
            Self::BoostExpired => "boost_expired",
            Self::BoostRefunded => "boost_refunded",
            Self::AccountSuspended => "account_suspended",
            Self::AccountUnsuspended => "account_unsuspended",
            Self::AccountBanned => "account_banned",
            Self::AccountUnbanned => "account_unbanned",
            Self::WithdrawalScheduled => "withdrawal_scheduled",
            Self::WithdrawalProcessed => "withdrawal_processed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, CofundError> {
        let kind = match value {
            "pledge_completed" => Self::PledgeCompleted,
            "pledge_withdrawn" => Self::PledgeWithdrawn,
            "pledge_expired" => Self::PledgeExpired,
            "pledge_refunded" => Self::PledgeRefunded,
            "payment_failed" => Self::PaymentFailed,
            "payment_fee" => Self::PaymentFee,
            "boost_purchased" => Self::BoostPurchased,
            "boost_expired" => Self::BoostExpired,
            "boost_refunded" => Self::BoostRefunded,
            "account_suspended" => Self::AccountSuspended,
            "account_unsuspended" => Self::AccountUnsuspended,
            "account_banned" => Self::AccountBanned,
            "account_unbanned" => Self::AccountUnbanned,
            "withdrawal_scheduled" => Self::WithdrawalScheduled,
            "withdrawal_processed" => Self::WithdrawalProcessed,
            other => {
                return Err(CofundError::Validation(format!(
                    "unknown activity kind '{other}'"
                )))
            }
        };
        Ok(kind)
    }
}

/// One immutable activity record: `{type, message, amount?, user_id, resource_id?, created_at}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityEntry {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActivityKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_minor: Option<u64>,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(kind: ActivityKind, user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            amount_minor: None,
            user_id: user_id.into(),
            resource_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_amount(mut self, amount_minor: u64) -> Self {
        self.amount_minor = Some(amount_minor);
        self
    }

    pub fn with_resource(mut self, resource_id: Uuid) -> Self {
        self.resource_id = Some(resource_id);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Filter for reading the log back, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityQuery {
    pub user_id: Option<String>,
    pub resource_id: Option<Uuid>,
    pub kind: Option<ActivityKind>,
    pub limit: Option<usize>,
}

impl ActivityQuery {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::default()
        }
    }

    pub fn for_resource(resource_id: Uuid) -> Self {
        Self {
            resource_id: Some(resource_id),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: ActivityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, entry: &ActivityEntry) -> bool {
        self.user_id
            .as_deref()
            .map_or(true, |user_id| entry.user_id == user_id)
            && self
                .resource_id
                .map_or(true, |resource_id| entry.resource_id == Some(resource_id))
            && self.kind.map_or(true, |kind| entry.kind == kind)
    }
}

/// Render minor units as `12.34` for log messages.
pub fn format_minor(amount_minor: u64) -> String {
    format!("{}.{:02}", amount_minor / 100, amount_minor % 100)
}
