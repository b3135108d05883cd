//! Access-mode-agnostic entry point for layers built on top of a queue or pool

use std::future::Future;

use futures::future::BoxFuture;

use crate::Result;
use crate::config::Configuration;
use crate::connection::{Connection, Role};
use crate::pool::DatabasePool;
use crate::queue::DatabaseQueue;

/// Runs units of work without knowing whether a queue or a pool is behind.
///
/// Record and query layers depend on this trait rather than on a concrete
/// access mode, so the same code works with both.
///
/// | role             | `DatabaseQueue`     | `DatabasePool`                |
/// |------------------|---------------------|-------------------------------|
/// | [`Role::Reader`] | `read`              | `read`                        |
/// | [`Role::Writer`] | `in_database`       | `write_without_transaction`   |
pub trait DatabaseAccess: Send + Sync {
   fn configuration(&self) -> &Configuration;

   /// Runs `work` on a connection suited to `role`.
   fn with_connection<T, F>(&self, role: Role, work: F) -> impl Future<Output = Result<T>> + Send
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static;
}

impl DatabaseAccess for DatabaseQueue {
   fn configuration(&self) -> &Configuration {
      DatabaseQueue::configuration(self)
   }

   async fn with_connection<T, F>(&self, role: Role, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      match role {
         Role::Reader => self.read(work).await,
         Role::Writer => self.in_database(work).await,
      }
   }
}

impl DatabaseAccess for DatabasePool {
   fn configuration(&self) -> &Configuration {
      DatabasePool::configuration(self)
   }

   async fn with_connection<T, F>(&self, role: Role, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      match role {
         Role::Reader => self.read(work).await,
         Role::Writer => self.write_without_transaction(work).await,
      }
   }
}
