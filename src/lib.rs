//! # sqlx-sqlite-coordinator
//!
//! Coordinates concurrent access to a SQLite database on top of SQLx: a
//! single writer, concurrent snapshot readers, busy-retry policies and
//! SQLCipher passphrase management.
//!
//! ## Core Types
//!
//! - **[`DatabaseQueue`]**: Serialized access through a single connection
//! - **[`DatabasePool`]**: One writer plus up to `maximum_reader_count` readers, in WAL mode
//! - **[`Configuration`]**: Options captured when a queue or pool opens
//! - **[`BusyMode`]**: What a connection does when another one holds the lock
//! - **[`DatabaseAccess`]**: Runs units of work on either access mode
//! - **[`Error`]**: Error type for database operations
//!
//! ## Architecture
//!
//! - **One task per connection**: each connection is owned by a task that runs
//!   units of work one at a time, in submission order
//! - **Units of work**: closures receiving `&mut Connection` and returning a
//!   boxed future, like SQLx's `Connection::transaction`
//! - **Transaction hygiene**: a unit of work returning with a transaction open
//!   is rolled back and reported as [`Error::TransactionLeftOpen`]
//! - **Snapshot reads**: pool reads run in a deferred transaction whose WAL
//!   snapshot is acquired before the first statement
//! - **Barriers**: passphrase changes, collation registration and close wait
//!   for in-flight work and apply to every live connection
//!
//! ## Usage
//!
//! ```no_run
//! use sqlx_sqlite_coordinator::{BusyMode, Configuration, DatabasePool};
//! use std::time::Duration;
//!
//! # async fn example() -> sqlx_sqlite_coordinator::Result<()> {
//! let config = Configuration {
//!    busy_mode: BusyMode::Timeout(Duration::from_secs(5)),
//!    ..Default::default()
//! };
//! let pool = DatabasePool::open("example.db", config).await?;
//!
//! pool
//!    .write(|conn| {
//!       Box::pin(async move {
//!          conn.execute("CREATE TABLE IF NOT EXISTS users (name TEXT)").await?;
//!          sqlx::query("INSERT INTO users (name) VALUES (?)")
//!             .bind("Alice")
//!             .execute(&mut **conn)
//!             .await?;
//!          Ok(())
//!       })
//!    })
//!    .await?;
//!
//! let names: Vec<String> = pool
//!    .read(|conn| {
//!       Box::pin(async move {
//!          let names = sqlx::query_scalar("SELECT name FROM users")
//!             .fetch_all(&mut **conn)
//!             .await?;
//!          Ok(names)
//!       })
//!    })
//!    .await?;
//!
//! pool.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - `sqlcipher`: builds SQLCipher instead of SQLite and enables
//!   [`CipherConfiguration`] and passphrase changes
//!
mod access;
mod busy;
mod cipher;
mod collation;
mod config;
mod connection;
mod error;
mod executor;
mod pool;
mod queue;
mod reader_pool;

pub use access::DatabaseAccess;
pub use busy::{BusyCallback, BusyDecision, BusyMode};
#[cfg(feature = "sqlcipher")]
pub use cipher::SqlCipher;
pub use cipher::{
   CipherConfiguration, CipherParameters, EncryptionManager, NoEncryption, SaltSource,
   UnencryptedHeader,
};
pub use collation::CollationFn;
pub use config::{
   Configuration, ConnectionHook, OpenFlags, ReaderRetention, ThreadingMode, TransactionKind,
};
pub use connection::{Connection, Role};
pub use error::{Error, ErrorKind};
pub use executor::WorkHandle;
pub use pool::{CheckpointMode, CheckpointOutcome, DatabasePool};
pub use queue::DatabaseQueue;

/// A type alias for Results with our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
