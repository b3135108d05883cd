//! A native connection bound to one execution context

use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use libsqlite3_sys::sqlite3_get_autocommit;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqliteQueryResult};
use sqlx::{ConnectOptions, Connection as _};
use tracing::{debug, trace, warn};

use crate::Result;
use crate::busy::{self, BusyHandlerRegistration};
use crate::cipher::EncryptionManager;
use crate::collation::{CollationFn, Collations};
use crate::config::{Configuration, TransactionKind};
use crate::error::Error;

/// Statement that pins the WAL snapshot of a deferred read transaction.
const SNAPSHOT_PIN: &str = "SELECT rootpage FROM sqlite_master LIMIT 1";

/// What a connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
   /// The queue's connection, or the writer of a pool.
   Writer,
   /// A read-only pool connection.
   Reader,
}

/// A SQLite connection owned by an execution context.
///
/// Units of work receive `&mut Connection`. It dereferences to
/// [`SqliteConnection`], so it can be passed to any SQLx executor:
///
/// ```no_run
/// # use sqlx_sqlite_coordinator::{Configuration, DatabaseQueue};
/// # async fn example(queue: DatabaseQueue) -> sqlx_sqlite_coordinator::Result<()> {
/// let count: i64 = queue
///    .read(|conn| {
///       Box::pin(async move {
///          let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM player")
///             .fetch_one(&mut **conn)
///             .await?;
///          Ok(count)
///       })
///    })
///    .await?;
/// # Ok(())
/// # }
/// ```
pub struct Connection {
   // Released before the handle it is registered on
   busy_handler: Option<BusyHandlerRegistration>,
   inner: SqliteConnection,
   name: String,
   role: Role,
   config: Arc<Configuration>,
}

impl Connection {
   /// Opens and prepares a connection.
   ///
   /// The encryption key is applied first. Touching `sqlite_master` right
   /// after makes a wrong passphrase fail here with `SQLITE_NOTADB`.
   pub(crate) async fn open(
      path: &Path,
      config: Arc<Configuration>,
      role: Role,
      name: String,
      encryption: &dyn EncryptionManager,
      collations: &Collations,
   ) -> Result<Self> {
      let options = config.connect_options(path);
      let options = encryption.configure(options);
      let options = collations.apply(options);

      let mut inner = options.connect().await?;

      // Installed before the first read so the policy covers it
      let busy_handler = {
         let mut handle = inner.lock_handle().await?;
         // SAFETY: the handle is locked, so no statement is running on it
         unsafe { busy::install(handle.as_raw_handle().as_ptr(), &config.busy_mode) }
      };

      if let Err(e) = sqlx::query("SELECT count(*) FROM sqlite_master")
         .fetch_one(&mut inner)
         .await
      {
         if let Some(registration) = busy_handler {
            let mut handle = inner.lock_handle().await?;
            // SAFETY: the registration was installed on this handle, which is
            // locked and idle
            unsafe { registration.release(handle.as_raw_handle().as_ptr()) };
         }
         if let Err(close_error) = inner.close().await {
            warn!(
               connection = %name,
               error = %close_error,
               "Failed to close connection after open check failed"
            );
         }
         return Err(e.into());
      }

      debug!(connection = %name, ?role, "Connection opened");

      if let Some(hook) = &config.on_open {
         hook(&name, role);
      }

      Ok(Self {
         busy_handler,
         inner,
         name,
         role,
         config,
      })
   }

   /// Diagnostic name, such as `DatabasePool.reader.2`.
   pub fn name(&self) -> &str {
      &self.name
   }

   pub fn role(&self) -> Role {
      self.role
   }

   /// Configuration the connection was opened with.
   pub fn configuration(&self) -> &Configuration {
      &self.config
   }

   /// Executes a single statement. Errors carry the SQL text.
   pub async fn execute(&mut self, sql: &str) -> Result<SqliteQueryResult> {
      sqlx::query(sql)
         .execute(&mut self.inner)
         .await
         .map_err(|e| Error::statement(sql, e))
   }

   pub async fn begin(&mut self, kind: TransactionKind) -> Result<()> {
      self.execute(kind.begin_sql()).await.map(|_| ())
   }

   pub async fn commit(&mut self) -> Result<()> {
      self.execute("COMMIT TRANSACTION").await.map(|_| ())
   }

   pub async fn rollback(&mut self) -> Result<()> {
      self.execute("ROLLBACK TRANSACTION").await.map(|_| ())
   }

   /// True when a transaction is open, whoever started it.
   pub async fn is_in_transaction(&mut self) -> Result<bool> {
      let mut handle = self.inner.lock_handle().await?;
      // SAFETY: the handle is locked for the duration of the call
      let autocommit = unsafe { sqlite3_get_autocommit(handle.as_raw_handle().as_ptr()) };
      Ok(autocommit == 0)
   }

   pub(crate) async fn add_collation(&mut self, name: &str, collation: CollationFn) -> Result<()> {
      let mut handle = self.inner.lock_handle().await?;
      handle.create_collation(name, move |a: &str, b: &str| collation(a, b))?;
      trace!(connection = %self.name, collation = name, "Collation added");
      Ok(())
   }

   /// Runs `work` without an implicit transaction.
   pub(crate) async fn run_plain<T, F>(&mut self, allows_lingering: bool, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send,
   {
      let result = work(&mut *self).await;
      self.finish_unit(result, allows_lingering).await
   }

   /// Runs `work` in a transaction committed on `Ok` and rolled back on `Err`.
   ///
   /// Work that commits or rolls back by itself is left alone.
   pub(crate) async fn run_in_transaction<T, F>(&mut self, kind: TransactionKind, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send,
   {
      self.begin(kind).await?;

      let result = match work(&mut *self).await {
         Ok(value) => {
            if self.is_in_transaction().await? {
               match self.commit().await {
                  Ok(()) => Ok(value),
                  Err(commit_error) => Err(self.rollback_after(commit_error).await),
               }
            } else {
               Ok(value)
            }
         }
         Err(error) => {
            if self.is_in_transaction().await.unwrap_or(true) {
               Err(self.rollback_after(error).await)
            } else {
               Err(error)
            }
         }
      };

      let allows_lingering = self.config.allows_unsafe_transactions;
      self.finish_unit(result, allows_lingering).await
   }

   /// Runs `work` in a deferred transaction that is always rolled back.
   ///
   /// The snapshot is acquired before `work` runs, so every statement of the
   /// unit sees the same committed state.
   pub(crate) async fn run_snapshot_read<T, F>(&mut self, allows_lingering: bool, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send,
   {
      self.begin(TransactionKind::Deferred).await?;

      if let Err(source) = sqlx::query(SNAPSHOT_PIN).fetch_optional(&mut self.inner).await {
         let error = Error::statement(SNAPSHOT_PIN, source);
         return Err(self.rollback_after(error).await);
      }

      let result = work(&mut *self).await;

      let result = if self.is_in_transaction().await.unwrap_or(true) {
         match (result, self.rollback().await) {
            (result, Ok(())) => result,
            (Ok(_), Err(rollback_error)) => Err(rollback_error),
            (Err(error), Err(rollback_error)) => Err(Error::TransactionRollbackFailed {
               transaction_error: error.to_string(),
               rollback_error: rollback_error.to_string(),
            }),
         }
      } else {
         result
      };

      self.finish_unit(result, allows_lingering).await
   }

   /// Rolls back after `error`, folding a rollback failure into the result.
   async fn rollback_after(&mut self, error: Error) -> Error {
      match self.rollback().await {
         Ok(()) => error,
         Err(rollback_error) => Error::TransactionRollbackFailed {
            transaction_error: error.to_string(),
            rollback_error: rollback_error.to_string(),
         },
      }
   }

   /// Rejects units of work that returned with a transaction open.
   async fn finish_unit<T>(&mut self, result: Result<T>, allows_lingering: bool) -> Result<T> {
      if allows_lingering {
         return result;
      }

      match self.is_in_transaction().await {
         Ok(false) => result,
         Ok(true) => {
            warn!(connection = %self.name, "Transaction left open, rolling back");
            if let Err(e) = self.rollback().await {
               warn!(connection = %self.name, error = %e, "Rollback of lingering transaction failed");
            }
            Err(Error::TransactionLeftOpen(self.name.clone()))
         }
         Err(check_error) => match result {
            Ok(_) => Err(check_error),
            Err(error) => Err(error),
         },
      }
   }

   /// Rolls back whatever a panicking unit of work left behind.
   pub(crate) async fn recover_after_panic(&mut self) {
      if self.is_in_transaction().await.unwrap_or(false)
         && let Err(e) = self.rollback().await
      {
         warn!(connection = %self.name, error = %e, "Rollback after panic failed");
      }
   }

   /// Closes the connection, running the close hook first.
   pub(crate) async fn close(mut self) -> Result<()> {
      if let Some(hook) = &self.config.on_close {
         hook(&self.name, self.role);
      }

      if let Some(registration) = self.busy_handler.take() {
         let mut handle = self.inner.lock_handle().await?;
         // SAFETY: the registration was installed on this handle, which is
         // locked and idle
         unsafe { registration.release(handle.as_raw_handle().as_ptr()) };
      }

      self.inner.close().await?;
      debug!(connection = %self.name, "Connection closed");
      Ok(())
   }
}

/// Deletes a database file along with its WAL and shared-memory files.
///
/// The main file must exist. The side files may not, if WAL was never enabled.
pub(crate) fn remove_database_files(path: &Path) -> Result<()> {
   std::fs::remove_file(path).map_err(Error::Io)?;

   for suffix in ["-wal", "-shm"] {
      let mut side = path.as_os_str().to_owned();
      side.push(suffix);
      if let Err(e) = std::fs::remove_file(&side)
         && e.kind() != std::io::ErrorKind::NotFound
      {
         return Err(Error::Io(e));
      }
   }

   Ok(())
}

impl Deref for Connection {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      &self.inner
   }
}

impl DerefMut for Connection {
   fn deref_mut(&mut self) -> &mut Self::Target {
      &mut self.inner
   }
}

impl std::fmt::Debug for Connection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("Connection")
         .field("name", &self.name)
         .field("role", &self.role)
         .finish_non_exhaustive()
   }
}
