//! Queue observability and manual cancellation.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};

use crate::api::error::ApiResult;
use crate::api::models::{CancelResponse, StatsResponse};
use crate::api::server::AppState;
use crate::domain::NotificationItem;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(stats))
        .route("/{id}", get(get_notification))
        .route("/{id}/cancel", post(cancel_notification))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let queue = state.queue.stats().await?;
    Ok(Json(StatsResponse {
        queue,
        in_flight: state.dispatcher.as_ref().map(|d| d.in_flight()),
        dispatcher_running: state.dispatcher.as_ref().map(|d| d.is_running()),
    }))
}

async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<NotificationItem>> {
    Ok(Json(state.queue.get(&id).await?))
}

/// `cancelled` is false when the item had already reached a terminal state.
async fn cancel_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.queue.cancel(&id).await?;
    Ok(Json(CancelResponse { id, cancelled }))
}

#[cfg(test)]
mod tests {
    use super::super::create_router;
    use super::super::test_support::{body_json, state};
    use crate::domain::NewNotification;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_stats_and_cancel() {
        let (state, _rx) = state(4).await;
        let id = state
            .queue
            .enqueue(NewNotification::sms("+15550001", "hi"))
            .await
            .unwrap();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(Request::get("/api/notifications/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["pending"], 1);
        assert_eq!(body["total"], 1);

        let response = app
            .clone()
            .oneshot(
                Request::post(format!("/api/notifications/{id}/cancel"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["cancelled"], true);

        let response = app
            .oneshot(
                Request::get(format!("/api/notifications/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_json(response).await["status"], "cancelled");
    }

    #[tokio::test]
    async fn test_missing_notification_is_404() {
        let (state, _rx) = state(4).await;
        let response = create_router(state)
            .oneshot(
                Request::get("/api/notifications/does-not-exist")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
