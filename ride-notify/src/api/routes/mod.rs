//! API route modules.

pub mod health;
pub mod logging;
pub mod notifications;
pub mod rides;
pub mod webhooks;

use axum::Router;

use crate::api::server::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api/health", health::router())
        .nest("/api/notifications", notifications::router())
        .nest("/api/rides", rides::router())
        .nest("/api/webhooks", webhooks::router())
        .nest("/api/logging", logging::router())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use crate::api::server::AppState;
    use crate::database::init_memory_pool;
    use crate::database::repositories::SqlxNotificationRepository;
    use crate::domain::DeliveryReceipt;
    use crate::queue::{NotificationQueue, QueueConfig};

    pub async fn state(buffer: usize) -> (AppState, mpsc::Receiver<DeliveryReceipt>) {
        let pool = init_memory_pool().await.unwrap();
        let repo = Arc::new(SqlxNotificationRepository::new(pool));
        let queue = Arc::new(NotificationQueue::new(repo, QueueConfig::default()));
        let (tx, rx) = mpsc::channel(buffer);
        (AppState::new(queue, tx), rx)
    }

    pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }
}
