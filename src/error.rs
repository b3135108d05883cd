//! Error types for sqlx-sqlite-coordinator

use thiserror::Error;

/// Primary SQLite result codes the coordinator classifies on.
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_MISUSE: i32 = 21;
const SQLITE_NOTADB: i32 = 26;

/// Errors that may occur when working with sqlx-sqlite-coordinator
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Errors raised by statements run inside a
   /// unit of work end up here when converted with `?`.
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// A statement issued by the coordinator itself failed. The SQL text is
   /// kept so callers can tell which statement it was.
   #[error("{source} (sql: `{sql}`)")]
   Statement {
      sql: String,
      #[source]
      source: sqlx::Error,
   },

   /// Database has been closed and cannot be used
   #[error("Database has been closed")]
   DatabaseClosed,

   /// The execution context of a connection is gone
   #[error("Connection {0} is closed")]
   ConnectionClosed(String),

   /// The unit of work was withdrawn before it started
   #[error("Unit of work was cancelled before it started")]
   WorkCancelled,

   /// A unit of work returned with a transaction still open
   #[error("A transaction has been left opened at the end of a database access on {0}")]
   TransactionLeftOpen(String),

   /// Transaction failed and rollback also failed.
   #[error("Transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },

   /// Configuration cannot be used to open a database
   #[error("Invalid configuration: {0}")]
   InvalidConfiguration(String),

   /// Passphrase change requested on a database opened without a cipher
   #[error("Database was opened without a cipher configuration")]
   EncryptionNotConfigured,

   /// Passphrase change requested on a build without SQLCipher
   #[error("Encryption requires the `sqlcipher` feature")]
   EncryptionUnavailable,
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
   /// The engine could not acquire a lock held by another connection.
   /// Already retried according to the busy mode before it surfaced.
   Contention,
   /// Programmer error: never retried.
   Misuse,
   /// Wrong or missing passphrase, or a file that is not a database.
   /// The engine reports both identically.
   NotADatabase,
   /// SQL compilation or execution failure.
   Engine,
   /// Work withdrawn before it started.
   Cancelled,
   /// Filesystem failure.
   Io,
}

impl Error {
   /// Wraps an sqlx error raised by `sql`.
   pub(crate) fn statement(sql: impl Into<String>, source: sqlx::Error) -> Self {
      Error::Statement {
         sql: sql.into(),
         source,
      }
   }

   fn sqlx_error(&self) -> Option<&sqlx::Error> {
      match self {
         Error::Sqlx(e) | Error::Statement { source: e, .. } => Some(e),
         _ => None,
      }
   }

   /// Extended SQLite result code, when the error came from the engine.
   pub fn sqlite_code(&self) -> Option<i32> {
      let db_err = self.sqlx_error()?.as_database_error()?;
      db_err.code()?.parse().ok()
   }

   /// Primary SQLite result code (the low byte of the extended code).
   pub fn primary_code(&self) -> Option<i32> {
      self.sqlite_code().map(|code| code & 0xff)
   }

   /// SQL text of the failing statement, when the coordinator issued it.
   pub fn sql(&self) -> Option<&str> {
      match self {
         Error::Statement { sql, .. } => Some(sql),
         _ => None,
      }
   }

   /// True for SQLITE_BUSY and SQLITE_LOCKED.
   pub fn is_busy(&self) -> bool {
      self.kind() == ErrorKind::Contention
   }

   pub fn kind(&self) -> ErrorKind {
      match self {
         Error::Io(_) => ErrorKind::Io,
         Error::Sqlx(_) | Error::Statement { .. } => match self.primary_code() {
            Some(SQLITE_BUSY | SQLITE_LOCKED) => ErrorKind::Contention,
            Some(SQLITE_NOTADB | SQLITE_CORRUPT) => ErrorKind::NotADatabase,
            Some(SQLITE_MISUSE) => ErrorKind::Misuse,
            _ => ErrorKind::Engine,
         },
         Error::WorkCancelled => ErrorKind::Cancelled,
         Error::TransactionRollbackFailed { .. } => ErrorKind::Engine,
         Error::DatabaseClosed
         | Error::ConnectionClosed(_)
         | Error::TransactionLeftOpen(_)
         | Error::InvalidConfiguration(_)
         | Error::EncryptionNotConfigured
         | Error::EncryptionUnavailable => ErrorKind::Misuse,
      }
   }

   /// Extract a structured error code from the error type.
   ///
   /// This provides machine-readable error codes for error handling.
   pub fn error_code(&self) -> String {
      match self {
         Error::Sqlx(_) | Error::Statement { .. } => match self.sqlite_code() {
            Some(code) => format!("SQLITE_{}", code),
            None => "SQLX_ERROR".to_string(),
         },
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::DatabaseClosed => "DATABASE_CLOSED".to_string(),
         Error::ConnectionClosed(_) => "CONNECTION_CLOSED".to_string(),
         Error::WorkCancelled => "WORK_CANCELLED".to_string(),
         Error::TransactionLeftOpen(_) => "TRANSACTION_LEFT_OPEN".to_string(),
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
         Error::InvalidConfiguration(_) => "INVALID_CONFIGURATION".to_string(),
         Error::EncryptionNotConfigured => "ENCRYPTION_NOT_CONFIGURED".to_string(),
         Error::EncryptionUnavailable => "ENCRYPTION_UNAVAILABLE".to_string(),
      }
   }
}
