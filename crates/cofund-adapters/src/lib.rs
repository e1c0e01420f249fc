//! Payment gateway adapters for cofund.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use cofund_core::error::CofundError;
use cofund_core::gateway::{
    GatewayStatus, IntentMetadata, PaymentEvent, PaymentGateway, PaymentOutcome, Payout,
    TransferReceipt,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Header carrying the webhook body signature.
pub const SIGNATURE_HEADER: &str = "x-cofund-signature";

const SIGNING_CONTEXT: &str = "cofund 2024-06 payment webhook signing";

/// Hex-encoded keyed BLAKE3 MAC of `body` under a key derived from `secret`.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let key = blake3::derive_key(SIGNING_CONTEXT, secret.as_bytes());
    blake3::keyed_hash(&key, body).to_hex().to_string()
}

fn verify_signature(secret: &str, body: &[u8], signature: &str) -> Result<(), CofundError> {
    let provided = blake3::Hash::from_hex(signature.trim())
        .map_err(|_| CofundError::SignatureInvalid("malformed signature".to_string()))?;
    let key = blake3::derive_key(SIGNING_CONTEXT, secret.as_bytes());
    // `Hash` equality is constant time.
    if blake3::keyed_hash(&key, body) != provided {
        return Err(CofundError::SignatureInvalid(
            "signature does not match body".to_string(),
        ));
    }
    Ok(())
}

/// Payment method tokens understood by [`MockGateway`].
pub mod test_cards {
    pub const OK: &str = "pm_card_ok";
    pub const DECLINED: &str = "pm_card_declined";
    pub const PROCESSING: &str = "pm_card_processing";
}

#[derive(Debug, Clone)]
struct IntentRecord {
    amount_minor: u64,
    metadata: IntentMetadata,
}

#[derive(Debug, Default)]
struct MockState {
    intents: HashMap<String, IntentRecord>,
    refunds: Vec<String>,
    transfers: HashMap<String, (Payout, TransferReceipt)>,
}

/// Deterministic in-process gateway for local runs and workflow tests.
///
/// Charges succeed, decline or stay processing depending on the payment method
/// token (see [`test_cards`]). Webhook bodies are signed with [`sign_payload`].
#[derive(Debug)]
pub struct MockGateway {
    webhook_secret: String,
    latency: Option<Duration>,
    failing_payees: Vec<String>,
    state: Mutex<MockState>,
}

impl MockGateway {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            latency: None,
            failing_payees: Vec::new(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Delay every outbound call; pair with a short client timeout to simulate outages.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Transfers to this payee are declined.
    pub fn with_failing_payee(mut self, owner_id: impl Into<String>) -> Self {
        self.failing_payees.push(owner_id.into());
        self
    }

    /// Build the webhook delivery for an intent's outcome: raw body and signature.
    pub fn signed_event(
        &self,
        intent_id: &str,
        outcome: PaymentOutcome,
    ) -> Result<(Vec<u8>, String), CofundError> {
        let intent = self.intent(intent_id)?;
        let event = PaymentEvent {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            intent_id: intent_id.to_string(),
            amount_minor: intent.amount_minor,
            metadata: intent.metadata,
            outcome,
            occurred_at: Utc::now(),
        };
        let body = serde_json::to_vec(&event)?;
        let signature = sign_payload(&self.webhook_secret, &body);
        Ok((body, signature))
    }

    pub fn refunds(&self) -> Vec<String> {
        self.lock().map(|state| state.refunds.clone()).unwrap_or_default()
    }

    pub fn transfers(&self) -> Vec<Payout> {
        self.lock()
            .map(|state| {
                state
                    .transfers
                    .values()
                    .map(|(payout, _)| payout.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn intent(&self, intent_id: &str) -> Result<IntentRecord, CofundError> {
        self.lock()?
            .intents
            .get(intent_id)
            .cloned()
            .ok_or_else(|| CofundError::NotFound(format!("payment intent {intent_id}")))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, CofundError> {
        self.state
            .lock()
            .map_err(|_| CofundError::gateway("mock gateway state poisoned"))
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new("cofund-local-webhook-secret")
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_intent(
        &self,
        amount_minor: u64,
        metadata: &IntentMetadata,
    ) -> Result<String, CofundError> {
        self.simulate_latency().await;
        if amount_minor == 0 {
            return Err(CofundError::gateway("amount must be positive"));
        }
        let intent_id = format!("pi_{}", Uuid::new_v4().simple());
        self.lock()?.intents.insert(
            intent_id.clone(),
            IntentRecord {
                amount_minor,
                metadata: metadata.clone(),
            },
        );
        tracing::debug!(intent_id = %intent_id, amount_minor, "mock intent created");
        Ok(intent_id)
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method: &str,
    ) -> Result<GatewayStatus, CofundError> {
        self.simulate_latency().await;
        self.intent(intent_id)?;
        let status = match payment_method {
            test_cards::OK => GatewayStatus::Succeeded,
            test_cards::PROCESSING => GatewayStatus::Processing,
            test_cards::DECLINED => GatewayStatus::Declined {
                reason: "card_declined".to_string(),
            },
            _ => GatewayStatus::Declined {
                reason: "invalid_payment_method".to_string(),
            },
        };
        Ok(status)
    }

    fn verify_and_parse_event(
        &self,
        raw_body: &[u8],
        signature: &str,
    ) -> Result<PaymentEvent, CofundError> {
        verify_signature(&self.webhook_secret, raw_body, signature)?;
        Ok(serde_json::from_slice(raw_body)?)
    }

    async fn refund(&self, intent_id: &str, reason: &str) -> Result<(), CofundError> {
        self.simulate_latency().await;
        self.intent(intent_id)?;
        self.lock()?.refunds.push(intent_id.to_string());
        tracing::debug!(intent_id = %intent_id, reason, "mock refund issued");
        Ok(())
    }

    async fn transfer(&self, payout: &Payout) -> Result<TransferReceipt, CofundError> {
        self.simulate_latency().await;
        if self.failing_payees.contains(&payout.owner_id) {
            return Err(CofundError::declined("payee_account_unavailable", None));
        }

        let mut state = self.lock()?;
        if let Some((_, receipt)) = state.transfers.get(&payout.idempotency_key) {
            return Ok(receipt.clone());
        }
        let receipt = TransferReceipt {
            reference: format!("tr_{}", Uuid::new_v4().simple()),
            settled_at: Utc::now(),
        };
        state.transfers.insert(
            payout.idempotency_key.clone(),
            (payout.clone(), receipt.clone()),
        );
        Ok(receipt)
    }
}

/// Gateway that rejects every call; useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailGateway {
    reason: String,
}

impl AlwaysFailGateway {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for AlwaysFailGateway {
    fn name(&self) -> &'static str {
        "always-fail"
    }

    async fn create_intent(
        &self,
        _amount_minor: u64,
        _metadata: &IntentMetadata,
    ) -> Result<String, CofundError> {
        Err(CofundError::gateway(self.reason.clone()))
    }

    async fn confirm_intent(
        &self,
        _intent_id: &str,
        _payment_method: &str,
    ) -> Result<GatewayStatus, CofundError> {
        Err(CofundError::gateway(self.reason.clone()))
    }

    fn verify_and_parse_event(
        &self,
        _raw_body: &[u8],
        _signature: &str,
    ) -> Result<PaymentEvent, CofundError> {
        Err(CofundError::SignatureInvalid(self.reason.clone()))
    }

    async fn refund(&self, _intent_id: &str, _reason: &str) -> Result<(), CofundError> {
        Err(CofundError::gateway(self.reason.clone()))
    }

    async fn transfer(&self, _payout: &Payout) -> Result<TransferReceipt, CofundError> {
        Err(CofundError::gateway(self.reason.clone()))
    }
}
