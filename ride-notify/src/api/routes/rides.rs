//! Per-ride notification history.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};

use crate::api::error::ApiResult;
use crate::api::models::{CancelRideResponse, RideNotificationsResponse};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{ride_id}/notifications", get(ride_notifications))
        .route("/{ride_id}/notifications/cancel", post(cancel_ride_notifications))
}

async fn ride_notifications(
    State(state): State<AppState>,
    Path(ride_id): Path<String>,
) -> ApiResult<Json<RideNotificationsResponse>> {
    let items = state.queue.history(&ride_id).await?;
    Ok(Json(RideNotificationsResponse { ride_id, items }))
}

async fn cancel_ride_notifications(
    State(state): State<AppState>,
    Path(ride_id): Path<String>,
) -> ApiResult<Json<CancelRideResponse>> {
    let cancelled = state.queue.cancel_by_correlation(&ride_id).await?;
    Ok(Json(CancelRideResponse { ride_id, cancelled }))
}
