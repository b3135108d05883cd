//! Configuration for database queues and pools

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::ConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;

use crate::Result;
use crate::busy::BusyMode;
#[cfg(feature = "sqlcipher")]
use crate::cipher::CipherConfiguration;
use crate::connection::Role;
use crate::error::Error;

/// Called with the connection name and role when a connection opens or closes.
pub type ConnectionHook = Arc<dyn Fn(&str, Role) + Send + Sync>;

/// Kind of transaction opened by `write` and `in_transaction`.
///
/// See <https://www.sqlite.org/lang_transaction.html>
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
   #[default]
   Deferred,
   Immediate,
   Exclusive,
}

impl TransactionKind {
   pub(crate) fn begin_sql(self) -> &'static str {
      match self {
         TransactionKind::Deferred => "BEGIN DEFERRED TRANSACTION",
         TransactionKind::Immediate => "BEGIN IMMEDIATE TRANSACTION",
         TransactionKind::Exclusive => "BEGIN EXCLUSIVE TRANSACTION",
      }
   }
}

/// Threading mode requested when a connection is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadingMode {
   /// Keep the engine's default open flags.
   #[default]
   Default,
   /// `SQLITE_OPEN_NOMUTEX`
   MultiThread,
   /// `SQLITE_OPEN_FULLMUTEX`
   Serialized,
}

/// What a pool does with idle readers when a WAL checkpoint is starved.
///
/// Idle readers are never closed eagerly. Closing them on every idle period
/// would churn connections; keeping them forever can hold back checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderRetention {
   /// Keep every idle reader open.
   #[default]
   KeepAll,
   /// After a starved checkpoint, close idle readers above this count.
   LowWater(usize),
}

/// Open flags resolved from `readonly` and `threading_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
   pub read_only: bool,
   pub create_if_missing: bool,
   /// `Some(true)` for full mutex, `Some(false)` for no mutex, `None` for the engine default.
   pub serialized: Option<bool>,
}

/// Configuration for a [`DatabaseQueue`](crate::DatabaseQueue) or
/// [`DatabasePool`](crate::DatabasePool).
///
/// The configuration is captured when the queue or pool opens. Changing a copy
/// afterwards has no effect on connections that are already open.
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_coordinator::{BusyMode, Configuration};
/// use std::time::Duration;
///
/// // Use defaults
/// let config = Configuration::default();
///
/// // Override some fields
/// let config = Configuration {
///     label: Some("Library".into()),
///     maximum_reader_count: 3,
///     busy_mode: BusyMode::Timeout(Duration::from_secs(5)),
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
   /// If true, foreign key constraints are checked.
   ///
   /// Default: true
   pub foreign_keys_enabled: bool,

   /// If true, connections are opened read-only and the file is never created.
   ///
   /// Default: false
   pub readonly: bool,

   /// Label used to name execution contexts in logs.
   ///
   /// Without a label the names are `DatabaseQueue`, `DatabasePool.writer` and
   /// `DatabasePool.reader.N`. With the label `MyDatabase` they become
   /// `MyDatabase`, `MyDatabase.writer` and `MyDatabase.reader.N`. `N` grows
   /// with every reader connection opened, so it may exceed
   /// `maximum_reader_count` as connections are closed and reopened. The
   /// format is intended for debugging only.
   ///
   /// Default: None
   pub label: Option<String>,

   /// Behavior when a lock is held by another connection.
   ///
   /// Default: `BusyMode::ImmediateError`
   pub busy_mode: BusyMode,

   /// Kind of transaction opened by `write`.
   ///
   /// Default: `TransactionKind::Deferred`
   pub default_transaction_kind: TransactionKind,

   /// If false, leaving a transaction open at the end of a unit of work is a
   /// programmer error reported as [`Error::TransactionLeftOpen`].
   ///
   /// Pool readers ignore this flag: they never allow it.
   ///
   /// Default: false
   pub allows_unsafe_transactions: bool,

   /// Maximum number of concurrent reader connections (pools only).
   ///
   /// Default: 5
   pub maximum_reader_count: usize,

   /// Default: `ThreadingMode::Default`
   pub threading_mode: ThreadingMode,

   /// Default: `ReaderRetention::KeepAll`
   pub reader_retention: ReaderRetention,

   /// If true, SQLx logs every statement at debug level under the
   /// `sqlx::query` target, and slow statements as warnings.
   ///
   /// Default: true
   pub statement_logging: bool,

   /// Passphrase and cipher parameters of an encrypted database.
   ///
   /// Default: None
   #[cfg(feature = "sqlcipher")]
   #[serde(skip)]
   pub cipher: Option<CipherConfiguration>,

   /// Runtime that connection executors are spawned on. When unset, the
   /// runtime of the task opening the database is used.
   ///
   /// Default: None
   #[serde(skip)]
   pub runtime: Option<tokio::runtime::Handle>,

   /// Called after a connection opened.
   #[serde(skip)]
   pub on_open: Option<ConnectionHook>,

   /// Called before a connection closes.
   #[serde(skip)]
   pub on_close: Option<ConnectionHook>,
}

impl Default for Configuration {
   fn default() -> Self {
      Self {
         foreign_keys_enabled: true,
         readonly: false,
         label: None,
         busy_mode: BusyMode::default(),
         default_transaction_kind: TransactionKind::default(),
         allows_unsafe_transactions: false,
         maximum_reader_count: 5,
         threading_mode: ThreadingMode::default(),
         reader_retention: ReaderRetention::default(),
         statement_logging: true,
         #[cfg(feature = "sqlcipher")]
         cipher: None,
         runtime: None,
         on_open: None,
         on_close: None,
      }
   }
}

impl fmt::Debug for Configuration {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let mut s = f.debug_struct("Configuration");
      s.field("foreign_keys_enabled", &self.foreign_keys_enabled)
         .field("readonly", &self.readonly)
         .field("label", &self.label)
         .field("busy_mode", &self.busy_mode)
         .field("default_transaction_kind", &self.default_transaction_kind)
         .field("allows_unsafe_transactions", &self.allows_unsafe_transactions)
         .field("maximum_reader_count", &self.maximum_reader_count)
         .field("threading_mode", &self.threading_mode)
         .field("reader_retention", &self.reader_retention)
         .field("statement_logging", &self.statement_logging);
      #[cfg(feature = "sqlcipher")]
      s.field("cipher", &self.cipher);
      s.finish_non_exhaustive()
   }
}

impl Configuration {
   /// Sets the label used to name execution contexts.
   pub fn with_label(mut self, label: impl Into<String>) -> Self {
      self.label = Some(label.into());
      self
   }

   pub fn with_busy_mode(mut self, busy_mode: BusyMode) -> Self {
      self.busy_mode = busy_mode;
      self
   }

   pub fn with_maximum_reader_count(mut self, count: usize) -> Self {
      self.maximum_reader_count = count;
      self
   }

   /// Registers a hook called after every connection opened.
   pub fn with_on_open<F>(mut self, hook: F) -> Self
   where
      F: Fn(&str, Role) + Send + Sync + 'static,
   {
      self.on_open = Some(Arc::new(hook));
      self
   }

   /// Registers a hook called before every connection closes.
   pub fn with_on_close<F>(mut self, hook: F) -> Self
   where
      F: Fn(&str, Role) + Send + Sync + 'static,
   {
      self.on_close = Some(Arc::new(hook));
      self
   }

   /// Rejects configurations that cannot open a database.
   pub fn validate(&self) -> Result<()> {
      if self.maximum_reader_count == 0 {
         return Err(Error::InvalidConfiguration(
            "maximum_reader_count must be at least 1".into(),
         ));
      }
      Ok(())
   }

   pub fn open_flags(&self) -> OpenFlags {
      OpenFlags {
         read_only: self.readonly,
         create_if_missing: !self.readonly,
         serialized: match self.threading_mode {
            ThreadingMode::Default => None,
            ThreadingMode::MultiThread => Some(false),
            ThreadingMode::Serialized => Some(true),
         },
      }
   }

   /// Diagnostic name of an execution context.
   pub fn connection_name(&self, default_label: &str, purpose: Option<&str>) -> String {
      let base = self.label.as_deref().unwrap_or(default_label);
      match purpose {
         Some(purpose) => format!("{}.{}", base, purpose),
         None => base.to_string(),
      }
   }

   /// Copy used to open pool readers.
   pub(crate) fn for_readers(&self) -> Self {
      Self {
         readonly: true,
         allows_unsafe_transactions: false,
         ..self.clone()
      }
   }

   /// Connect options shared by every connection, before encryption is applied.
   pub(crate) fn connect_options(&self, path: &Path) -> SqliteConnectOptions {
      let flags = self.open_flags();

      let mut options = if is_memory_database(path) {
         SqliteConnectOptions::new().in_memory(true)
      } else {
         SqliteConnectOptions::new().filename(path)
      };

      options = options
         .read_only(flags.read_only)
         .create_if_missing(flags.create_if_missing)
         .foreign_keys(self.foreign_keys_enabled)
         .busy_timeout(self.busy_mode.engine_timeout());

      if let Some(serialized) = flags.serialized {
         options = options.serialized(serialized);
      }

      if !self.statement_logging {
         options = options.disable_statement_logging();
      }

      options
   }
}

/// True for SQLite's special in-memory filename.
pub(crate) fn is_memory_database(path: &Path) -> bool {
   path.as_os_str() == ":memory:"
}
