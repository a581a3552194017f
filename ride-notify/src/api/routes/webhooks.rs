//! Provider delivery receipt webhook.

use axum::{
    Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post,
};
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::domain::DeliveryReceipt;

pub fn router() -> Router<AppState> {
    Router::new().route("/delivery-receipts", post(delivery_receipt))
}

/// Hand the receipt to the reconciler. 202 once queued; 503 when the
/// reconciler is backed up so the provider retries later.
async fn delivery_receipt(
    State(state): State<AppState>,
    Json(receipt): Json<DeliveryReceipt>,
) -> ApiResult<impl IntoResponse> {
    match state.receipts.try_send(receipt) {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "accepted": true })),
        )),
        Err(TrySendError::Full(receipt)) => {
            warn!(
                provider_ref = ?receipt.provider_message_ref,
                "Receipt buffer full, rejecting webhook"
            );
            Err(ApiError::service_unavailable("Receipt buffer is full"))
        }
        Err(TrySendError::Closed(_)) => {
            Err(ApiError::service_unavailable("Receipt processing has stopped"))
        }
    }
}
