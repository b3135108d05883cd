#![allow(dead_code)]

use sqlx_sqlite_coordinator::{Connection, Result};
use std::path::PathBuf;
use tempfile::TempDir;

/// Temporary directory and a database path inside it.
///
/// Keep the directory alive for the duration of the test.
pub fn temp_database(name: &str) -> (TempDir, PathBuf) {
   init_tracing();
   let dir = TempDir::new().unwrap();
   let path = dir.path().join(name);
   (dir, path)
}

/// Routes coordinator logs to the test output. Set `RUST_LOG` to see them.
pub fn init_tracing() {
   let _ = tracing_subscriber::fmt()
      .with_env_filter(
         tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
      )
      .with_test_writer()
      .try_init();
}

pub async fn create_items_table(conn: &mut Connection) -> Result<()> {
   conn
      .execute("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
      .await?;
   Ok(())
}

pub async fn insert_item(conn: &mut Connection, name: &str) -> Result<()> {
   sqlx::query("INSERT INTO items (name) VALUES (?)")
      .bind(name)
      .execute(&mut **conn)
      .await?;
   Ok(())
}

pub async fn count_items(conn: &mut Connection) -> Result<i64> {
   let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
      .fetch_one(&mut **conn)
      .await?;
   Ok(count)
}
