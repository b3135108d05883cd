//! Pooled access: one writer and concurrent snapshot readers

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::Result;
use crate::cipher::{self, EncryptionManager};
use crate::collation::{CollationFn, Collations};
use crate::config::{Configuration, ReaderRetention, is_memory_database};
use crate::connection::{self, Connection, Role};
use crate::error::Error;
use crate::executor::{ConnectionExecutor, WorkHandle};
use crate::reader_pool::ReaderPool;

/// Mode of `PRAGMA wal_checkpoint`.
///
/// See <https://www.sqlite.org/pragma.html#pragma_wal_checkpoint>
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
   #[default]
   Passive,
   Full,
   Restart,
   Truncate,
}

impl CheckpointMode {
   fn pragma(self) -> &'static str {
      match self {
         CheckpointMode::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
         CheckpointMode::Full => "PRAGMA wal_checkpoint(FULL)",
         CheckpointMode::Restart => "PRAGMA wal_checkpoint(RESTART)",
         CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
      }
   }
}

/// Row returned by `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOutcome {
   /// The checkpoint could not complete because of a concurrent reader or writer.
   pub busy: bool,
   /// Frames in the WAL, or -1 when the database is not in WAL mode.
   pub log_frames: i64,
   /// Frames moved back into the database file.
   pub checkpointed_frames: i64,
}

impl CheckpointOutcome {
   /// True when frames were left in the WAL.
   pub fn is_starved(&self) -> bool {
      self.busy || self.checkpointed_frames < self.log_frames
   }
}

/// Database access through one writer and up to `maximum_reader_count` readers.
///
/// The database is switched to WAL mode when the pool opens, so readers see
/// a consistent snapshot while the writer commits. Writes are serialized on
/// the writer connection; reads run concurrently on reader connections that
/// are opened on demand.
///
/// Operations that must see the pool quiescent (passphrase changes, collation
/// registration, barrier writes and close) wait for every in-flight read and
/// write, and hold new ones back until they complete.
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_coordinator::{Configuration, DatabasePool};
///
/// # async fn example() -> sqlx_sqlite_coordinator::Result<()> {
/// let pool = DatabasePool::open("library.db", Configuration::default()).await?;
///
/// pool
///    .write(|conn| {
///       Box::pin(async move {
///          conn.execute("CREATE TABLE IF NOT EXISTS book (title TEXT)").await?;
///          Ok(())
///       })
///    })
///    .await?;
///
/// let count: i64 = pool
///    .read(|conn| {
///       Box::pin(async move {
///          let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM book")
///             .fetch_one(&mut **conn)
///             .await?;
///          Ok(count)
///       })
///    })
///    .await?;
///
/// pool.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct DatabasePool {
   path: PathBuf,
   config: Arc<Configuration>,
   writer: ConnectionExecutor,
   readers: ReaderPool,
   encryption: Arc<dyn EncryptionManager>,
   collations: Arc<Collations>,
   /// Shared by reads and writes, exclusive for barrier operations
   gate: RwLock<()>,
   closed: AtomicBool,
}

impl DatabasePool {
   /// Opens a pool on the database at `path`.
   ///
   /// The writer connection is opened right away (creating the file unless the
   /// configuration is read-only) and switches the database to WAL mode.
   /// Readers are opened on demand.
   pub async fn open(path: impl AsRef<Path>, config: Configuration) -> Result<Self> {
      config.validate()?;

      let path = path.as_ref();
      if path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Database path cannot be empty",
         )));
      }
      if is_memory_database(path) {
         return Err(Error::InvalidConfiguration(
            "DatabasePool requires a database file; use DatabaseQueue::in_memory instead".into(),
         ));
      }

      let config = Arc::new(config);
      let encryption = cipher::manager_for(&config);
      let collations = Arc::new(Collations::default());

      let mut writer = Connection::open(
         path,
         Arc::clone(&config),
         Role::Writer,
         config.connection_name("DatabasePool", Some("writer")),
         encryption.as_ref(),
         &collations,
      )
      .await?;

      if !config.readonly {
         let wal = enable_wal(&mut writer).await;
         if let Err(e) = wal {
            if let Err(close_error) = writer.close().await {
               warn!(error = %close_error, "Failed to close writer after WAL setup failed");
            }
            return Err(e);
         }
      }

      let writer = ConnectionExecutor::spawn(writer, config.runtime.as_ref());
      let readers = ReaderPool::new(
         path.to_path_buf(),
         Arc::new(config.for_readers()),
         Arc::clone(&encryption),
         Arc::clone(&collations),
      );

      debug!(writer = writer.name(), path = %path.display(), "Database pool opened");

      Ok(Self {
         path: path.to_path_buf(),
         config,
         writer,
         readers,
         encryption,
         collations,
         gate: RwLock::new(()),
         closed: AtomicBool::new(false),
      })
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Configuration captured when the pool opened.
   pub fn configuration(&self) -> &Configuration {
      &self.config
   }

   /// Number of open reader connections.
   pub fn reader_count(&self) -> usize {
      self.readers.live()
   }

   /// Number of open reader connections not running any work.
   pub fn idle_reader_count(&self) -> usize {
      self.readers.idle()
   }

   async fn enter(&self) -> Result<RwLockReadGuard<'_, ()>> {
      let guard = self.gate.read().await;
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }
      Ok(guard)
   }

   async fn enter_exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
      let guard = self.gate.write().await;
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }
      Ok(guard)
   }

   /// Runs `work` on the writer in a transaction of the configured default kind.
   pub async fn write<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let _gate = self.enter().await?;
      let kind = self.config.default_transaction_kind;
      self
         .writer
         .run(move |conn| Box::pin(conn.run_in_transaction(kind, work)))
         .await
   }

   /// Runs `work` on the writer without an implicit transaction.
   pub async fn write_without_transaction<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let _gate = self.enter().await?;
      let allows_lingering = self.config.allows_unsafe_transactions;
      self
         .writer
         .run(move |conn| Box::pin(conn.run_plain(allows_lingering, work)))
         .await
   }

   /// Enqueues a transactional write without waiting for it.
   ///
   /// Resolves once the write is enqueued; the returned handle yields its result.
   pub async fn spawn_write<T, F>(&self, work: F) -> Result<WorkHandle<T>>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let _gate = self.enter().await?;
      let kind = self.config.default_transaction_kind;
      self
         .writer
         .submit(move |conn| Box::pin(conn.run_in_transaction(kind, work)))
   }

   /// Runs `work` on the writer once every other read and write completed.
   ///
   /// No read or write starts until the work is done.
   pub async fn barrier_write_without_transaction<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let _barrier = self.enter_exclusive().await?;
      let allows_lingering = self.config.allows_unsafe_transactions;
      self
         .writer
         .run(move |conn| Box::pin(conn.run_plain(allows_lingering, work)))
         .await
   }

   /// Runs `work` on a reader, in a snapshot transaction that is always rolled back.
   ///
   /// Waits for a reader when `maximum_reader_count` readers are busy.
   pub async fn read<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let _gate = self.enter().await?;
      let lease = self.readers.acquire().await?;
      lease
         .slot()
         .executor()
         .run(move |conn| Box::pin(conn.run_snapshot_read(false, work)))
         .await
   }

   /// Runs `work` on a reader without a snapshot transaction.
   ///
   /// Successive statements may see different database states. Leaving a
   /// transaction open is always an error on readers.
   pub async fn unsafe_read<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let _gate = self.enter().await?;
      let lease = self.readers.acquire().await?;
      lease
         .slot()
         .executor()
         .run(move |conn| Box::pin(conn.run_plain(false, work)))
         .await
   }

   /// Runs a snapshot read on the writer, ordered with writes.
   ///
   /// The read sees every write submitted before it and none submitted after.
   pub async fn barrier_read<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let _gate = self.enter().await?;
      self
         .writer
         .run(move |conn| Box::pin(conn.run_snapshot_read(false, work)))
         .await
   }

   /// Runs a WAL checkpoint on the writer.
   ///
   /// With [`ReaderRetention::LowWater`], idle readers above the low-water
   /// mark are closed when the checkpoint could not complete.
   pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointOutcome> {
      let _gate = self.enter().await?;

      let outcome = self
         .writer
         .run(move |conn| {
            Box::pin(async move {
               let sql = mode.pragma();
               let (busy, log_frames, checkpointed_frames): (i64, i64, i64) =
                  sqlx::query_as(sql)
                     .fetch_one(&mut **conn)
                     .await
                     .map_err(|e| Error::statement(sql, e))?;
               Ok(CheckpointOutcome {
                  busy: busy != 0,
                  log_frames,
                  checkpointed_frames,
               })
            })
         })
         .await?;

      if outcome.is_starved()
         && let ReaderRetention::LowWater(keep) = self.config.reader_retention
      {
         let closed = self.readers.close_idle(keep).await;
         debug!(closed, ?outcome, "Checkpoint starved, closed idle readers");
      }

      Ok(outcome)
   }

   /// Closes every idle reader and frees memory held by the writer.
   pub async fn release_memory(&self) -> Result<()> {
      let _gate = self.enter().await?;
      self.readers.close_idle(0).await;
      self
         .writer
         .run(|conn| {
            Box::pin(async move {
               conn.execute("PRAGMA shrink_memory").await?;
               Ok(())
            })
         })
         .await
   }

   /// Re-encrypts the database with a new passphrase.
   ///
   /// Waits for in-flight reads and writes, closes the readers, rekeys through
   /// the writer, then reopens as many readers with the new passphrase. Reads
   /// and writes wait until the change completed.
   pub async fn change_passphrase(&self, passphrase: impl Into<String>) -> Result<()> {
      let _barrier = self.enter_exclusive().await?;
      let passphrase = SecretString::from(passphrase.into());
      let encryption = Arc::clone(&self.encryption);

      // Every reader is idle behind the barrier
      let readers = self.readers.close_idle(0).await;

      self
         .writer
         .run(move |conn| {
            Box::pin(async move {
               encryption.rekey(conn, &passphrase).await?;
               encryption.set_passphrase(passphrase)
            })
         })
         .await?;

      self.readers.reopen(readers).await
   }

   /// Registers a collation on every connection, current and future.
   pub async fn add_collation<F>(&self, name: &str, collation: F) -> Result<()>
   where
      F: Fn(&str, &str) -> CmpOrdering + Send + Sync + 'static,
   {
      let _barrier = self.enter_exclusive().await?;
      let collation: CollationFn = Arc::new(collation);
      self.collations.register(name, Arc::clone(&collation));

      let writer_name = name.to_string();
      let writer_collation = Arc::clone(&collation);
      self
         .writer
         .run(move |conn| {
            Box::pin(async move { conn.add_collation(&writer_name, writer_collation).await })
         })
         .await?;

      self.readers.add_collation(name, &collation).await
   }

   /// Closes readers, checkpoints the WAL into the database file and closes
   /// the writer.
   ///
   /// Waits for in-flight reads and writes. Later operations fail with
   /// [`Error::DatabaseClosed`]. Closing twice is a no-op.
   pub async fn close(&self) -> Result<()> {
      let _barrier = self.gate.write().await;
      if self.closed.swap(true, Ordering::SeqCst) {
         return Ok(());
      }

      self.readers.close().await;

      // Flush the WAL and truncate it before the writer goes away
      if !self.config.readonly
         && let Err(e) = self
            .writer
            .run(|conn| {
               Box::pin(async move {
                  conn.execute(CheckpointMode::Truncate.pragma()).await?;
                  Ok(())
               })
            })
            .await
      {
         warn!(error = %e, "Checkpoint on close failed");
      }

      self.writer.close().await?;
      debug!(path = %self.path.display(), "Database pool closed");
      Ok(())
   }

   /// Closes the pool and deletes the database file and its WAL and
   /// shared-memory files.
   pub async fn remove(self) -> Result<()> {
      self.close().await?;
      connection::remove_database_files(&self.path)
   }
}

impl fmt::Debug for DatabasePool {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("DatabasePool")
         .field("path", &self.path)
         .field("reader_count", &self.reader_count())
         .field("closed", &self.closed.load(Ordering::SeqCst))
         .finish_non_exhaustive()
   }
}

async fn enable_wal(writer: &mut Connection) -> Result<()> {
   writer.execute("PRAGMA journal_mode = WAL").await?;
   // https://www.sqlite.org/wal.html#performance_considerations
   writer.execute("PRAGMA synchronous = NORMAL").await?;
   Ok(())
}
