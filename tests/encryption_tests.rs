#![cfg(feature = "sqlcipher")]

mod common;

use common::{count_items, create_items_table, insert_item, temp_database};
use sqlx_sqlite_coordinator::{
   CipherConfiguration, CipherParameters, Configuration, DatabasePool, DatabaseQueue, Error,
   ErrorKind, SaltSource, UnencryptedHeader,
};
use std::path::Path;

fn encrypted(passphrase: &str) -> Configuration {
   Configuration {
      cipher: Some(CipherConfiguration::new(passphrase)),
      ..Default::default()
   }
}

async fn seed(path: &Path, config: Configuration) {
   let queue = DatabaseQueue::open(path, config).await.unwrap();
   queue
      .write(|conn| {
         Box::pin(async move {
            create_items_table(conn).await?;
            insert_item(conn, "secret").await
         })
      })
      .await
      .unwrap();
   queue.close().await.unwrap();
}

async fn item_count(queue: &DatabaseQueue) -> i64 {
   queue
      .read(|conn| Box::pin(count_items(conn)))
      .await
      .unwrap()
}

#[tokio::test]
async fn test_reopen_with_same_passphrase() {
   let (_dir, path) = temp_database("reopen.db");
   seed(&path, encrypted("correct horse")).await;

   let queue = DatabaseQueue::open(&path, encrypted("correct horse"))
      .await
      .unwrap();
   assert_eq!(item_count(&queue).await, 1);
}

#[tokio::test]
async fn test_wrong_passphrase_fails_at_open() {
   let (_dir, path) = temp_database("wrong.db");
   seed(&path, encrypted("correct horse")).await;

   let err = DatabaseQueue::open(&path, encrypted("battery staple"))
      .await
      .unwrap_err();
   assert_eq!(err.kind(), ErrorKind::NotADatabase, "Unexpected error {:?}", err);
}

#[tokio::test]
async fn test_missing_passphrase_fails_at_open() {
   let (_dir, path) = temp_database("missing.db");
   seed(&path, encrypted("correct horse")).await;

   let err = DatabaseQueue::open(&path, Configuration::default())
      .await
      .unwrap_err();
   assert_eq!(err.kind(), ErrorKind::NotADatabase, "Unexpected error {:?}", err);
}

#[tokio::test]
async fn test_queue_change_passphrase() {
   let (_dir, path) = temp_database("rekey_queue.db");
   seed(&path, encrypted("old")).await;

   let queue = DatabaseQueue::open(&path, encrypted("old")).await.unwrap();
   queue.change_passphrase("new").await.unwrap();

   // The open connection keeps working after the rekey
   assert_eq!(item_count(&queue).await, 1);
   queue.close().await.unwrap();

   let reopened = DatabaseQueue::open(&path, encrypted("new")).await.unwrap();
   assert_eq!(item_count(&reopened).await, 1);
   reopened.close().await.unwrap();

   let err = DatabaseQueue::open(&path, encrypted("old")).await.unwrap_err();
   assert_eq!(err.kind(), ErrorKind::NotADatabase);
}

#[tokio::test]
async fn test_pool_change_passphrase_recycles_readers() {
   let (_dir, path) = temp_database("rekey_pool.db");
   seed(&path, encrypted("old")).await;

   let pool = DatabasePool::open(&path, encrypted("old")).await.unwrap();

   let (first, second) = tokio::join!(
      pool.read(|conn| Box::pin(count_items(conn))),
      pool.read(|conn| Box::pin(count_items(conn))),
   );
   assert_eq!(first.unwrap(), 1);
   assert_eq!(second.unwrap(), 1);
   let readers_before = pool.reader_count();
   assert!(readers_before >= 1);

   pool.change_passphrase("new").await.unwrap();
   assert_eq!(pool.reader_count(), readers_before);

   // Readers opened after the change use the new passphrase
   let reader_name = pool
      .read(|conn| {
         Box::pin(async move {
            count_items(conn).await?;
            Ok(conn.name().to_string())
         })
      })
      .await
      .unwrap();
   assert!(
      !reader_name.ends_with("reader.1"),
      "Expected a recycled reader, got {}",
      reader_name
   );

   pool
      .write(|conn| Box::pin(insert_item(conn, "after rekey")))
      .await
      .unwrap();
   pool.close().await.unwrap();

   let reopened = DatabasePool::open(&path, encrypted("new")).await.unwrap();
   let count = reopened
      .read(|conn| Box::pin(count_items(conn)))
      .await
      .unwrap();
   assert_eq!(count, 2);
   reopened.close().await.unwrap();

   let err = DatabasePool::open(&path, encrypted("old")).await.unwrap_err();
   assert_eq!(err.kind(), ErrorKind::NotADatabase, "Unexpected error {:?}", err);
}

#[tokio::test]
async fn test_change_passphrase_requires_encrypted_database() {
   let queue = DatabaseQueue::in_memory(Configuration::default())
      .await
      .unwrap();

   let result = queue.change_passphrase("anything").await;
   assert!(matches!(result, Err(Error::EncryptionNotConfigured)));
}

#[tokio::test]
async fn test_custom_cipher_parameters() {
   let (_dir, path) = temp_database("custom.db");
   let config = || Configuration {
      cipher: Some(
         CipherConfiguration::new("tuned").with_parameters(CipherParameters::Custom {
            page_size: Some(8192),
            kdf_iterations: Some(64_000),
         }),
      ),
      ..Default::default()
   };
   seed(&path, config()).await;

   let queue = DatabaseQueue::open(&path, config()).await.unwrap();
   let (page_size, kdf_iter) = queue
      .read(|conn| {
         Box::pin(async move {
            let page_size: String = sqlx::query_scalar("PRAGMA cipher_page_size")
               .fetch_one(&mut **conn)
               .await?;
            let kdf_iter: String = sqlx::query_scalar("PRAGMA kdf_iter")
               .fetch_one(&mut **conn)
               .await?;
            Ok((page_size, kdf_iter))
         })
      })
      .await
      .unwrap();

   assert_eq!(page_size, "8192");
   assert_eq!(kdf_iter, "64000");
   assert_eq!(item_count(&queue).await, 1);
}

#[tokio::test]
async fn test_plaintext_header_keeps_sqlite_magic() {
   let (_dir, path) = temp_database("header.db");
   let salt = vec![0x5a; 16];
   let config = || Configuration {
      cipher: Some(
         CipherConfiguration::new("visible header").with_unencrypted_header(
            UnencryptedHeader::new(SaltSource::Explicit(salt.clone())),
         ),
      ),
      ..Default::default()
   };
   seed(&path, config()).await;

   let bytes = std::fs::read(&path).unwrap();
   assert_eq!(&bytes[..16], b"SQLite format 3\0");

   let queue = DatabaseQueue::open(&path, config()).await.unwrap();
   assert_eq!(item_count(&queue).await, 1);
}
