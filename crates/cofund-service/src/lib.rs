#![deny(unsafe_code)]

pub mod config;
pub mod jobs;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use cofund_adapters::SIGNATURE_HEADER;
use cofund_core::{
    ActivityEntry, ActivityKind, ActivityQuery, Boost, CofundEngine, CofundError, EngineConfig,
    ErrorClass, PaymentGateway, Pledge, PledgeReceipt, ProcessReport, Resource, ResourcePricing,
    ScheduleReport, SettlementOutcome, SweepReport, UserAccount,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Header the upstream auth layer sets to the authenticated user id.
pub const USER_HEADER: &str = "x-user-id";
pub const ADMIN_HEADER: &str = "x-admin-token";

#[derive(Clone)]
pub struct ServiceState {
    pub engine: CofundEngine,
    admin_token: Arc<str>,
}

impl ServiceState {
    pub fn new(engine: CofundEngine, admin_token: impl Into<Arc<str>>) -> Self {
        Self {
            engine,
            admin_token: admin_token.into(),
        }
    }

    pub async fn bootstrap(
        engine_config: EngineConfig,
        gateway: Arc<dyn PaymentGateway>,
        admin_token: &str,
    ) -> Result<Self, ServiceError> {
        let engine = CofundEngine::bootstrap(engine_config, gateway).await?;
        Ok(Self::new(engine, admin_token))
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/resources", post(create_resource))
        .route("/v1/resources/:id/pricing", get(resource_pricing))
        .route(
            "/v1/resources/:id/pledges",
            post(create_pledge).delete(withdraw_pledge),
        )
        .route("/v1/resources/:id/boosts", post(request_boost))
        .route("/v1/boosts/active", get(active_boosts))
        .route("/v1/users/me/payment-method", put(set_payment_method))
        .route("/v1/webhooks/payments", post(payment_webhook))
        .route("/v1/activity", get(list_activity))
        .route("/v1/admin/users/:id/ban", post(ban_user))
        .route("/v1/admin/users/:id/unban", post(unban_user))
        .route("/v1/admin/users/:id/unsuspend", post(unsuspend_user))
        .route("/v1/admin/withdrawals/schedule", post(schedule_withdrawals))
        .route("/v1/admin/withdrawals/process", post(process_withdrawals))
        .route("/v1/admin/boosts/expire", post(expire_boosts))
        .route("/v1/admin/pledges/expire-stale", post(expire_stale_pledges))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] CofundError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CofundError),
}

fn status_for(err: &CofundError) -> StatusCode {
    match err {
        CofundError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CofundError::Conflict(_) => StatusCode::CONFLICT,
        CofundError::Capacity(_) => StatusCode::TOO_MANY_REQUESTS,
        CofundError::NotFound(_) => StatusCode::NOT_FOUND,
        CofundError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        CofundError::Forbidden(_) => StatusCode::FORBIDDEN,
        CofundError::PaymentProcessing { .. } => StatusCode::PAYMENT_REQUIRED,
        CofundError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        CofundError::SignatureInvalid(_) => StatusCode::BAD_REQUEST,
        CofundError::Persistence(_) | CofundError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Core(err) = self;
        let status = status_for(&err);
        if err.class() == ErrorClass::Server {
            tracing::error!(error = %err, "request failed");
        }

        let body = match &err {
            CofundError::PaymentProcessing {
                remaining_attempts: Some(remaining),
                ..
            } => serde_json::json!({ "error": err.to_string(), "remaining_attempts": remaining }),
            _ => serde_json::json!({ "error": err.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            CofundError::Unauthorized(format!("missing {USER_HEADER} header")).into()
        })
}

fn require_admin(state: &ServiceState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = headers
        .get(ADMIN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| CofundError::Unauthorized(format!("missing {ADMIN_HEADER} header")))?;
    if token != &*state.admin_token {
        return Err(CofundError::Forbidden("admin token rejected".to_string()).into());
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    gateway: &'static str,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "cofund-service",
        storage_backend: state.engine.backend_label(),
        gateway: state.engine.gateway_name(),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct CreateResourceRequest {
    name: String,
    target_cost_minor: u64,
    min_cost_per_person_minor: u64,
}

async fn create_resource(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateResourceRequest>,
) -> Result<(StatusCode, Json<Resource>), ApiError> {
    let owner = caller(&headers)?;
    let resource = state
        .engine
        .create_resource(
            &owner,
            &request.name,
            request.target_cost_minor,
            request.min_cost_per_person_minor,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(resource)))
}

async fn resource_pricing(
    State(state): State<ServiceState>,
    Path(resource_id): Path<Uuid>,
) -> Result<Json<ResourcePricing>, ApiError> {
    Ok(Json(state.engine.pledges().pricing(resource_id).await?))
}

#[derive(Debug, Clone, Deserialize)]
struct PledgeRequest {
    amount_minor: u64,
}

async fn create_pledge(
    State(state): State<ServiceState>,
    Path(resource_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<PledgeRequest>,
) -> Result<(StatusCode, Json<PledgeReceipt>), ApiError> {
    let user = caller(&headers)?;
    let receipt = state
        .engine
        .pledges()
        .create(&user, resource_id, request.amount_minor)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn withdraw_pledge(
    State(state): State<ServiceState>,
    Path(resource_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Pledge>, ApiError> {
    let user = caller(&headers)?;
    Ok(Json(state.engine.pledges().withdraw(&user, resource_id).await?))
}

async fn request_boost(
    State(state): State<ServiceState>,
    Path(resource_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Boost>), ApiError> {
    let user = caller(&headers)?;
    let boost = state.engine.boosts().request_boost(&user, resource_id).await?;
    Ok((StatusCode::CREATED, Json(boost)))
}

#[derive(Debug, Clone, Serialize)]
struct ActiveBoostsResponse {
    cap: usize,
    items: Vec<Boost>,
}

async fn active_boosts(
    State(state): State<ServiceState>,
) -> Result<Json<ActiveBoostsResponse>, ApiError> {
    let items = state.engine.boosts().list_active(Utc::now()).await?;
    Ok(Json(ActiveBoostsResponse {
        cap: state.engine.boosts().cap(),
        items,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct PaymentMethodRequest {
    payment_method: String,
}

async fn set_payment_method(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<PaymentMethodRequest>,
) -> Result<Json<UserAccount>, ApiError> {
    let user = caller(&headers)?;
    Ok(Json(
        state
            .engine
            .set_payment_method(&user, &request.payment_method)
            .await?,
    ))
}

async fn payment_webhook(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SettlementOutcome>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            CofundError::SignatureInvalid(format!("missing {SIGNATURE_HEADER} header"))
        })?;
    let outcome = state
        .engine
        .reconciler()
        .handle_webhook(&body, signature)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Clone, Deserialize)]
struct ActivityParams {
    user_id: Option<String>,
    resource_id: Option<Uuid>,
    #[serde(rename = "type")]
    kind: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct ActivityResponse {
    returned: usize,
    items: Vec<ActivityEntry>,
}

async fn list_activity(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(params): Query<ActivityParams>,
) -> Result<Json<ActivityResponse>, ApiError> {
    let (user_id, resource_id) = if headers.contains_key(ADMIN_HEADER) {
        require_admin(&state, &headers)?;
        (params.user_id, params.resource_id)
    } else {
        let caller = caller(&headers)?;
        if params.user_id.as_deref().is_some_and(|user_id| user_id != caller) {
            return Err(CofundError::Forbidden(
                "activity of other users requires the admin token".to_string(),
            )
            .into());
        }
        match params.resource_id {
            // The whole resource trail belongs to its owner.
            Some(resource_id) if params.user_id.is_none() => {
                let resource = state.engine.resource(resource_id).await?;
                if resource.owner_id != caller {
                    return Err(CofundError::Forbidden(format!(
                        "resource {resource_id} is owned by another user"
                    ))
                    .into());
                }
                (None, Some(resource_id))
            }
            resource_id => (Some(caller), resource_id),
        }
    };
    let query = ActivityQuery {
        user_id,
        resource_id,
        kind: params.kind.as_deref().map(ActivityKind::parse).transpose()?,
        limit: params.limit,
    };
    let items = state.engine.activity(&query).await?;
    Ok(Json(ActivityResponse {
        returned: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BanRequest {
    reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct AdminOutcome {
    user_id: String,
    status: &'static str,
}

async fn ban_user(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    body: Option<Json<BanRequest>>,
) -> Result<Json<AdminOutcome>, ApiError> {
    require_admin(&state, &headers)?;
    let reason = body
        .and_then(|Json(request)| request.reason)
        .unwrap_or_else(|| "administrative action".to_string());
    state.engine.ban(&user_id, &reason).await?;
    Ok(Json(AdminOutcome {
        user_id,
        status: "banned",
    }))
}

async fn unban_user(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AdminOutcome>, ApiError> {
    require_admin(&state, &headers)?;
    state.engine.unban(&user_id).await?;
    Ok(Json(AdminOutcome {
        user_id,
        status: "unbanned",
    }))
}

async fn unsuspend_user(
    State(state): State<ServiceState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<cofund_core::FailureStatus>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.unsuspend(&user_id).await?))
}

async fn schedule_withdrawals(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ScheduleReport>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.withdrawals().schedule(Utc::now()).await?))
}

async fn process_withdrawals(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ProcessReport>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.withdrawals().process(Utc::now()).await?))
}

async fn expire_boosts(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.boosts().expire_due(Utc::now()).await?))
}

async fn expire_stale_pledges(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<SweepReport>, ApiError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.engine.expire_stale_pledges(Utc::now()).await?))
}
