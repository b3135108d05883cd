//! Serialized access through a single connection

use std::cmp::Ordering as CmpOrdering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use secrecy::SecretString;
use tracing::debug;

use crate::Result;
use crate::cipher::{self, EncryptionManager};
use crate::collation::{CollationFn, Collations};
use crate::config::{Configuration, TransactionKind, is_memory_database};
use crate::connection::{self, Connection, Role};
use crate::error::Error;
use crate::executor::{ConnectionExecutor, WorkHandle};

/// Database access through one connection.
///
/// Every unit of work runs on the same connection, one at a time, in the order
/// it was submitted. A queue can write to the database and works with
/// in-memory databases, unlike [`DatabasePool`](crate::DatabasePool).
///
/// # Example
///
/// ```no_run
/// use sqlx_sqlite_coordinator::{Configuration, DatabaseQueue};
///
/// # async fn example() -> sqlx_sqlite_coordinator::Result<()> {
/// let queue = DatabaseQueue::open("library.db", Configuration::default()).await?;
///
/// queue
///    .write(|conn| {
///       Box::pin(async move {
///          conn.execute("CREATE TABLE IF NOT EXISTS book (title TEXT)").await?;
///          sqlx::query("INSERT INTO book (title) VALUES (?)")
///             .bind("Dune")
///             .execute(&mut **conn)
///             .await?;
///          Ok(())
///       })
///    })
///    .await?;
///
/// queue.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct DatabaseQueue {
   path: PathBuf,
   config: Arc<Configuration>,
   executor: ConnectionExecutor,
   encryption: Arc<dyn EncryptionManager>,
   closed: AtomicBool,
}

impl DatabaseQueue {
   /// Opens a queue on the database at `path`, creating the file unless the
   /// configuration is read-only.
   pub async fn open(path: impl AsRef<Path>, config: Configuration) -> Result<Self> {
      config.validate()?;

      let path = path.as_ref();
      if path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Database path cannot be empty",
         )));
      }

      let config = Arc::new(config);
      let encryption = cipher::manager_for(&config);
      let name = config.connection_name("DatabaseQueue", None);

      let connection = Connection::open(
         path,
         Arc::clone(&config),
         Role::Writer,
         name,
         encryption.as_ref(),
         &Collations::default(),
      )
      .await?;

      let executor = ConnectionExecutor::spawn(connection, config.runtime.as_ref());
      debug!(queue = executor.name(), path = %path.display(), "Database queue opened");

      Ok(Self {
         path: path.to_path_buf(),
         config,
         executor,
         encryption,
         closed: AtomicBool::new(false),
      })
   }

   /// Opens a queue on a private in-memory database.
   pub async fn in_memory(config: Configuration) -> Result<Self> {
      Self::open(":memory:", config).await
   }

   pub fn path(&self) -> &Path {
      &self.path
   }

   /// Configuration captured when the queue opened.
   pub fn configuration(&self) -> &Configuration {
      &self.config
   }

   /// Diagnostic name of the queue's connection.
   pub fn name(&self) -> &str {
      self.executor.name()
   }

   fn ensure_open(&self) -> Result<()> {
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }
      Ok(())
   }

   /// Runs `work` without an implicit transaction and waits for it.
   ///
   /// Work returning with a transaction open fails with
   /// [`Error::TransactionLeftOpen`] unless `allows_unsafe_transactions` is set.
   pub async fn in_database<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      self.ensure_open()?;
      let allows_lingering = self.config.allows_unsafe_transactions;
      self
         .executor
         .run(move |conn| Box::pin(conn.run_plain(allows_lingering, work)))
         .await
   }

   /// Enqueues `work` without waiting for it.
   ///
   /// The work is ordered after everything submitted before and completes
   /// even if the handle is dropped.
   pub fn spawn_in_database<T, F>(&self, work: F) -> Result<WorkHandle<T>>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      self.ensure_open()?;
      let allows_lingering = self.config.allows_unsafe_transactions;
      self
         .executor
         .submit(move |conn| Box::pin(conn.run_plain(allows_lingering, work)))
   }

   /// Runs `work` in a transaction of the given kind.
   ///
   /// The transaction commits when the work returns `Ok` and rolls back when
   /// it returns `Err`.
   pub async fn in_transaction<T, F>(&self, kind: TransactionKind, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      self.ensure_open()?;
      self
         .executor
         .run(move |conn| Box::pin(conn.run_in_transaction(kind, work)))
         .await
   }

   /// Runs `work` in a transaction of the configured default kind.
   pub async fn write<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      self
         .in_transaction(self.config.default_transaction_kind, work)
         .await
   }

   /// Runs `work` in a deferred transaction that is always rolled back.
   pub async fn read<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      self.ensure_open()?;
      let allows_lingering = self.config.allows_unsafe_transactions;
      self
         .executor
         .run(move |conn| Box::pin(conn.run_snapshot_read(allows_lingering, work)))
         .await
   }

   /// Re-encrypts the database with a new passphrase.
   ///
   /// Fails with [`Error::EncryptionUnavailable`] without the `sqlcipher`
   /// feature and with [`Error::EncryptionNotConfigured`] when the queue was
   /// opened without a cipher configuration.
   pub async fn change_passphrase(&self, passphrase: impl Into<String>) -> Result<()> {
      self.ensure_open()?;
      let passphrase = SecretString::from(passphrase.into());
      let encryption = Arc::clone(&self.encryption);

      self
         .executor
         .run(move |conn| {
            Box::pin(async move {
               encryption.rekey(conn, &passphrase).await?;
               encryption.set_passphrase(passphrase)
            })
         })
         .await
   }

   /// Registers a collation on the queue's connection.
   pub async fn add_collation<F>(&self, name: &str, collation: F) -> Result<()>
   where
      F: Fn(&str, &str) -> CmpOrdering + Send + Sync + 'static,
   {
      self.ensure_open()?;
      let collation: CollationFn = Arc::new(collation);
      let name = name.to_string();

      self
         .executor
         .run(move |conn| Box::pin(async move { conn.add_collation(&name, collation).await }))
         .await
   }

   /// Closes the connection once previously submitted work completed.
   ///
   /// Later operations fail with [`Error::DatabaseClosed`]. Closing twice is a no-op.
   pub async fn close(&self) -> Result<()> {
      if self.closed.swap(true, Ordering::SeqCst) {
         return Ok(());
      }
      self.executor.close().await?;
      debug!(queue = self.executor.name(), "Database queue closed");
      Ok(())
   }

   /// Closes the queue and deletes the database file and its side files.
   pub async fn remove(self) -> Result<()> {
      self.close().await?;
      if is_memory_database(&self.path) {
         return Ok(());
      }
      connection::remove_database_files(&self.path)
   }
}

impl std::fmt::Debug for DatabaseQueue {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("DatabaseQueue")
         .field("name", &self.executor.name())
         .field("path", &self.path)
         .field("closed", &self.closed.load(Ordering::SeqCst))
         .finish()
   }
}
