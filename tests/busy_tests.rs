mod common;

use common::{count_items, create_items_table, insert_item, temp_database};
use sqlx_sqlite_coordinator::{
   BusyDecision, BusyMode, Configuration, DatabaseQueue, ErrorKind, Result, TransactionKind,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// A queue holding an exclusive lock on a fresh database, and the database path.
async fn locked_database(name: &str) -> (TempDir, std::path::PathBuf, DatabaseQueue) {
   let (dir, path) = temp_database(name);

   let config = Configuration {
      allows_unsafe_transactions: true,
      ..Default::default()
   };
   let holder = DatabaseQueue::open(&path, config).await.unwrap();
   holder
      .write(|conn| Box::pin(create_items_table(conn)))
      .await
      .unwrap();

   (dir, path, holder)
}

async fn take_lock(holder: &DatabaseQueue) {
   holder
      .in_database(|conn| {
         Box::pin(async move {
            conn.begin(TransactionKind::Exclusive).await?;
            insert_item(conn, "held").await
         })
      })
      .await
      .unwrap();
}

async fn release_lock(holder: &DatabaseQueue) {
   holder
      .in_database(|conn| Box::pin(async move { conn.commit().await }))
      .await
      .unwrap();
}

async fn contender(path: &Path, busy_mode: BusyMode) -> DatabaseQueue {
   DatabaseQueue::open(path, Configuration::default().with_busy_mode(busy_mode))
      .await
      .unwrap()
}

async fn try_insert(queue: &DatabaseQueue) -> Result<()> {
   queue
      .write(|conn| Box::pin(insert_item(conn, "contender")))
      .await
}

#[tokio::test]
async fn test_immediate_error_fails_on_first_contention() {
   let (_dir, path, holder) = locked_database("immediate.db").await;
   let queue = contender(&path, BusyMode::ImmediateError).await;
   take_lock(&holder).await;

   let start = Instant::now();
   let err = try_insert(&queue).await.unwrap_err();

   assert!(err.is_busy(), "Expected a busy error, got {:?}", err);
   assert_eq!(err.kind(), ErrorKind::Contention);
   assert!(
      start.elapsed() < Duration::from_secs(1),
      "Immediate error should not wait, took {:?}",
      start.elapsed()
   );

   release_lock(&holder).await;
   try_insert(&queue).await.unwrap();
}

#[tokio::test]
async fn test_timeout_gives_up_after_duration() {
   let (_dir, path, holder) = locked_database("timeout.db").await;
   let queue = contender(&path, BusyMode::Timeout(Duration::from_millis(200))).await;
   take_lock(&holder).await;

   let start = Instant::now();
   let err = try_insert(&queue).await.unwrap_err();

   assert!(err.is_busy(), "Expected a busy error, got {:?}", err);
   assert!(
      start.elapsed() >= Duration::from_millis(150),
      "Timeout should retry before failing, gave up after {:?}",
      start.elapsed()
   );

   release_lock(&holder).await;
}

#[tokio::test]
async fn test_timeout_succeeds_when_lock_is_released() {
   let (_dir, path, holder) = locked_database("timeout_ok.db").await;
   let queue = contender(&path, BusyMode::Timeout(Duration::from_secs(10))).await;
   take_lock(&holder).await;

   let holder = Arc::new(holder);
   let releaser = tokio::spawn({
      let holder = Arc::clone(&holder);
      async move {
         tokio::time::sleep(Duration::from_millis(100)).await;
         release_lock(&holder).await;
      }
   });

   try_insert(&queue).await.unwrap();
   releaser.await.unwrap();

   let count = queue
      .read(|conn| Box::pin(count_items(conn)))
      .await
      .unwrap();
   assert_eq!(count, 2);
}

#[tokio::test]
async fn test_callback_stop_surfaces_busy() {
   let (_dir, path, holder) = locked_database("callback_stop.db").await;

   let highest_attempt = Arc::new(AtomicU32::new(0));
   let seen = Arc::clone(&highest_attempt);
   let queue = contender(
      &path,
      BusyMode::callback(move |attempts| {
         seen.fetch_max(attempts, Ordering::SeqCst);
         if attempts < 3 {
            BusyDecision::Retry
         } else {
            BusyDecision::Stop
         }
      }),
   )
   .await;
   take_lock(&holder).await;

   let err = try_insert(&queue).await.unwrap_err();

   assert!(err.is_busy(), "Expected a busy error, got {:?}", err);
   assert_eq!(highest_attempt.load(Ordering::SeqCst), 3);

   release_lock(&holder).await;
   queue.close().await.unwrap();
}

#[tokio::test]
async fn test_callback_retry_waits_for_lock() {
   let (_dir, path, holder) = locked_database("callback_retry.db").await;

   let calls = Arc::new(AtomicU32::new(0));
   let counter = Arc::clone(&calls);
   let queue = contender(
      &path,
      BusyMode::callback(move |_attempts| {
         counter.fetch_add(1, Ordering::SeqCst);
         std::thread::sleep(Duration::from_millis(5));
         BusyDecision::Retry
      }),
   )
   .await;
   take_lock(&holder).await;

   let holder = Arc::new(holder);
   let releaser = tokio::spawn({
      let holder = Arc::clone(&holder);
      async move {
         tokio::time::sleep(Duration::from_millis(100)).await;
         release_lock(&holder).await;
      }
   });

   try_insert(&queue).await.unwrap();
   releaser.await.unwrap();

   assert!(calls.load(Ordering::SeqCst) > 0, "Callback should have been consulted");
   queue.close().await.unwrap();
}

#[tokio::test]
async fn test_callback_covers_open() {
   let (_dir, path, holder) = locked_database("callback_open.db").await;
   take_lock(&holder).await;

   let holder = Arc::new(holder);
   let releaser = tokio::spawn({
      let holder = Arc::clone(&holder);
      async move {
         tokio::time::sleep(Duration::from_millis(300)).await;
         release_lock(&holder).await;
      }
   });

   let calls = Arc::new(AtomicU32::new(0));
   let counter = Arc::clone(&calls);
   let queue = contender(
      &path,
      BusyMode::callback(move |_attempts| {
         counter.fetch_add(1, Ordering::SeqCst);
         std::thread::sleep(Duration::from_millis(10));
         BusyDecision::Retry
      }),
   )
   .await;
   releaser.await.unwrap();

   assert!(calls.load(Ordering::SeqCst) > 0, "Callback should have been consulted while opening");
   let count = queue
      .read(|conn| Box::pin(count_items(conn)))
      .await
      .unwrap();
   assert_eq!(count, 1);
}

#[tokio::test]
async fn test_immediate_error_fails_open_while_locked() {
   let (_dir, path, holder) = locked_database("immediate_open.db").await;
   take_lock(&holder).await;

   let err = DatabaseQueue::open(&path, Configuration::default())
      .await
      .unwrap_err();
   assert!(err.is_busy(), "Expected a busy error, got {:?}", err);

   release_lock(&holder).await;
}

#[tokio::test]
async fn test_contention_on_one_queue_leaves_holder_intact() {
   let (_dir, path, holder) = locked_database("holder.db").await;
   let queue = contender(&path, BusyMode::ImmediateError).await;
   take_lock(&holder).await;

   assert!(try_insert(&queue).await.unwrap_err().is_busy());

   // The holder's transaction is untouched by the contender's failure
   release_lock(&holder).await;
   let count = holder
      .read(|conn| Box::pin(count_items(conn)))
      .await
      .unwrap();
   assert_eq!(count, 1);
}
