//! Payment gateway boundary.
//!
//! The gateway owns raw money movement. The engine only creates and confirms
//! intents, verifies signed outcome events, and requests refunds and owner
//! payouts. Every outbound call goes through [`GatewayClient`], which bounds it
//! with the configured timeout and turns expiry into an indeterminate outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::FeeQuote;
use crate::error::CofundError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Pledge,
    Boost,
}

impl PaymentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pledge => "pledge",
            Self::Boost => "boost",
        }
    }
}

/// Metadata attached to every intent so settlement needs no extra lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntentMetadata {
    pub resource_id: Uuid,
    pub owner_id: String,
    pub payer_id: String,
    pub kind: PaymentKind,
    pub fees: FeeQuote,
}

/// Synchronous answer from `confirm_intent`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GatewayStatus {
    Succeeded,
    Declined { reason: String },
    /// Accepted but not settled yet; the webhook will carry the outcome.
    Processing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentOutcome {
    Succeeded,
    Failed { reason: String },
    /// Outcome unknown (timeout, still processing). Never counted as a failure.
    Indeterminate { reason: String },
}

impl PaymentOutcome {
    /// Suffix of the settlement idempotency key, `None` for outcomes that are not recorded.
    pub fn settlement_suffix(&self) -> Option<&'static str> {
        match self {
            Self::Succeeded => Some("succeeded"),
            Self::Failed { .. } => Some("failed"),
            Self::Indeterminate { .. } => None,
        }
    }
}

/// A payment outcome, from the webhook or from a synchronous confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentEvent {
    pub event_id: String,
    pub intent_id: String,
    pub amount_minor: u64,
    pub metadata: IntentMetadata,
    pub outcome: PaymentOutcome,
    pub occurred_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn idempotency_key(&self) -> Option<String> {
        self.outcome
            .settlement_suffix()
            .map(|suffix| format!("{}:{}", self.intent_id, suffix))
    }
}

/// Monthly owner payout request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payout {
    pub schedule_id: Uuid,
    pub owner_id: String,
    pub resource_id: Uuid,
    pub amount_minor: u64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferReceipt {
    pub reference: String,
    pub settled_at: DateTime<Utc>,
}

/// External payment processor contract.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_intent(
        &self,
        amount_minor: u64,
        metadata: &IntentMetadata,
    ) -> Result<String, CofundError>;

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method: &str,
    ) -> Result<GatewayStatus, CofundError>;

    /// Verify the signature header over the raw body and decode the event.
    fn verify_and_parse_event(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<PaymentEvent, CofundError>;

    async fn refund(&self, intent_id: &str, reason: &str) -> Result<(), CofundError>;

    async fn transfer(&self, payout: &Payout) -> Result<TransferReceipt, CofundError>;
}

/// Timeout-bounded handle on a [`PaymentGateway`].
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<dyn PaymentGateway>,
    timeout: Duration,
}

impl GatewayClient {
    pub fn new(inner: Arc<dyn PaymentGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name()
    }

    pub async fn create_intent(
        &self,
        amount_minor: u64,
        metadata: &IntentMetadata,
    ) -> Result<String, CofundError> {
        self.bounded("create_intent", self.inner.create_intent(amount_minor, metadata))
            .await
    }

    pub async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method: &str,
    ) -> Result<GatewayStatus, CofundError> {
        self.bounded(
            "confirm_intent",
            self.inner.confirm_intent(intent_id, payment_method),
        )
        .await
    }

    pub fn verify_and_parse_event(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<PaymentEvent, CofundError> {
        self.inner.verify_and_parse_event(raw_body, signature)
    }

    pub async fn refund(&self, intent_id: &str, reason: &str) -> Result<(), CofundError> {
        self.bounded("refund", self.inner.refund(intent_id, reason))
            .await
    }

    pub async fn transfer(&self, payout: &Payout) -> Result<TransferReceipt, CofundError> {
        self.bounded("transfer", self.inner.transfer(payout)).await
    }

    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<T, CofundError>
    where
        F: Future<Output = Result<T, CofundError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    gateway = self.inner.name(),
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "payment gateway call timed out"
                );
                Err(CofundError::UpstreamTimeout(operation.to_string()))
            }
        }
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("gateway", &self.inner.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
