use dashmap::DashSet;
use rand::random;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use ride_notify::database::repositories::SqlxNotificationRepository;
use ride_notify::database::{DbPool, run_migrations};
use ride_notify::domain::{NewNotification, NotificationPriority};
use ride_notify::queue::{NotificationQueue, QueueConfig};

async fn init_stress_pool(database_url: &str) -> DbPool {
    let connect_options = SqliteConnectOptions::from_str(database_url)
        .unwrap()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        // Make SQLITE_BUSY surface quickly so retry logic is exercised.
        .busy_timeout(Duration::from_millis(1))
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(32)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options)
        .await
        .unwrap()
}

fn priority_for(i: usize) -> NotificationPriority {
    match i % 4 {
        0 => NotificationPriority::Low,
        1 => NotificationPriority::Medium,
        2 => NotificationPriority::High,
        _ => NotificationPriority::Urgent,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "stress test; run explicitly to validate claim correctness under contention"]
async fn sqlite_claim_stress_no_double_sends() {
    const ITEMS: usize = 300;
    const WORKERS: usize = 24;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("stress.db");
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        db_path.to_string_lossy().replace('\\', "/")
    );

    let pool = init_stress_pool(&db_url).await;
    run_migrations(&pool).await.unwrap();

    let queue = Arc::new(NotificationQueue::new(
        Arc::new(SqlxNotificationRepository::new(pool.clone())),
        QueueConfig::default(),
    ));

    for i in 0..ITEMS {
        queue
            .enqueue(
                NewNotification::sms(format!("rider-{i}"), "stress")
                    .with_priority(priority_for(i))
                    .with_correlation_id(format!("ride-{}", i % 17)),
            )
            .await
            .unwrap();
    }

    // Background writer that holds the write lock briefly to force SQLITE_BUSY.
    let locker_pool = pool.clone();
    let locker = tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while tokio::time::Instant::now() < deadline {
            if let Ok(mut tx) = locker_pool.begin().await {
                let _ = sqlx::query(
                    "UPDATE notification_item SET updated_at = updated_at WHERE id IN (SELECT id FROM notification_item LIMIT 1)",
                )
                .execute(&mut *tx)
                .await;
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.commit().await;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    let claimed_ids = Arc::new(DashSet::<String>::new());

    let mut workers = JoinSet::new();
    for _ in 0..WORKERS {
        let queue = queue.clone();
        let claimed_ids = claimed_ids.clone();
        workers.spawn(async move {
            loop {
                let eligible = queue.list_eligible(4).await.unwrap();
                if eligible.is_empty() {
                    if queue.stats().await.unwrap().counts.pending == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }

                for item in eligible {
                    if !queue.claim(&item.id).await.unwrap() {
                        continue;
                    }
                    let inserted = claimed_ids.insert(item.id.clone());
                    assert!(inserted, "double-claimed item {}", item.id);

                    if random::<u8>().is_multiple_of(3) {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(Duration::from_millis(random::<u64>() % 3)).await;
                    }

                    let sent = queue
                        .mark_sent(&item.id, Some(format!("SM-{}", item.id)))
                        .await
                        .unwrap();
                    assert!(sent, "item {} send transition was lost", item.id);
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    let _ = locker.await;

    assert_eq!(claimed_ids.len(), ITEMS, "not all items were claimed");

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.counts.pending, 0, "pending items remain");
    assert_eq!(stats.counts.processing, 0, "processing items remain");
    assert_eq!(stats.counts.sent, ITEMS as u64, "not all items were sent");
}
