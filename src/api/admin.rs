//! Admin delivery-ops endpoints
//!
//! Consumed by the platform's admin UI. Authentication is applied by the
//! platform's auth proxy in front of this router; the delivery subsystem
//! itself does not manage sessions.

use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
};
use serde::Deserialize;

use crate::AppState;
use crate::data::{ActivityType, DeliveryStats, DeliveryStatus};
use crate::error::AppError;
use crate::service::{
    DeliveryDetail, DeliveryFilter, DeliveryListPage, RetryAllOutcome,
};

/// Create admin router
///
/// Routes:
/// - GET /deliveries - List/filter delivery records
/// - GET /deliveries/stats - Aggregate counts
/// - GET /deliveries/:id - Single record with payload
/// - POST /deliveries/:id/retry - Re-queue one failed delivery
/// - POST /deliveries/retry-all - Bounded bulk retry of failed deliveries
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/deliveries", get(list_deliveries))
        .route("/deliveries/stats", get(delivery_stats))
        .route("/deliveries/retry-all", post(retry_all_failed))
        .route("/deliveries/:id", get(get_delivery))
        .route("/deliveries/:id/retry", post(retry_delivery))
}

/// Listing query parameters
#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    #[serde(rename = "type")]
    activity_type: Option<String>,
    #[serde(default)]
    page: u32,
    #[serde(default)]
    limit: u32,
}

impl ListQuery {
    fn into_filter(self) -> Result<DeliveryFilter, AppError> {
        let status = self
            .status
            .map(|raw| {
                DeliveryStatus::parse(&raw)
                    .ok_or_else(|| AppError::Validation(format!("Unknown status: {}", raw)))
            })
            .transpose()?;

        let activity_type = self
            .activity_type
            .map(|raw| {
                ActivityType::parse(&raw)
                    .ok_or_else(|| AppError::Validation(format!("Unknown activity type: {}", raw)))
            })
            .transpose()?;

        Ok(DeliveryFilter {
            status,
            activity_type,
            page: self.page,
            limit: self.limit,
        })
    }
}

/// GET /admin/deliveries
async fn list_deliveries(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<DeliveryListPage>, AppError> {
    let page = state.admin_ops.get_deliveries(query.into_filter()?).await?;
    Ok(Json(page))
}

/// GET /admin/deliveries/stats
async fn delivery_stats(
    State(state): State<AppState>,
) -> Result<Json<DeliveryStats>, AppError> {
    let stats = state.admin_ops.get_delivery_stats().await?;
    Ok(Json(stats))
}

/// GET /admin/deliveries/:id
async fn get_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryDetail>, AppError> {
    let detail = state.admin_ops.get_delivery(&id).await?;
    Ok(Json(detail))
}

/// POST /admin/deliveries/:id/retry
async fn retry_delivery(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeliveryDetail>, AppError> {
    let rearmed = state.admin_ops.retry_delivery(&id).await?;
    Ok(Json(rearmed))
}

/// POST /admin/deliveries/retry-all
async fn retry_all_failed(
    State(state): State<AppState>,
) -> Result<Json<RetryAllOutcome>, AppError> {
    let outcome = state.admin_ops.retry_all_failed().await?;
    Ok(Json(outcome))
}
