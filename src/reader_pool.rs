//! Read-only connections of a pool

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::Result;
use crate::cipher::EncryptionManager;
use crate::collation::{CollationFn, Collations};
use crate::config::Configuration;
use crate::connection::{Connection, Role};
use crate::error::Error;
use crate::executor::ConnectionExecutor;

/// A reader connection and the id used in its name.
pub(crate) struct ReaderSlot {
   id: u64,
   executor: ConnectionExecutor,
}

impl ReaderSlot {
   pub(crate) fn executor(&self) -> &ConnectionExecutor {
      &self.executor
   }
}

#[derive(Default)]
struct SlotState {
   idle: Vec<ReaderSlot>,
   /// Idle plus leased slots
   live: usize,
}

/// Lazily opened reader slots, at most `maximum_reader_count` of them.
///
/// A permit of the semaphore is held for every leased slot. Tokio's semaphore
/// is fair, so callers waiting for a slot are served in arrival order.
pub(crate) struct ReaderPool {
   path: PathBuf,
   config: Arc<Configuration>,
   encryption: Arc<dyn EncryptionManager>,
   collations: Arc<Collations>,
   permits: Semaphore,
   state: Mutex<SlotState>,
   next_id: AtomicU64,
}

impl ReaderPool {
   /// `config` must be the read-only copy made for readers.
   pub(crate) fn new(
      path: PathBuf,
      config: Arc<Configuration>,
      encryption: Arc<dyn EncryptionManager>,
      collations: Arc<Collations>,
   ) -> Self {
      let capacity = config.maximum_reader_count;
      Self {
         path,
         config,
         encryption,
         collations,
         permits: Semaphore::new(capacity),
         state: Mutex::new(SlotState::default()),
         next_id: AtomicU64::new(1),
      }
   }

   /// Waits for a slot, reusing an idle one or opening a new one.
   pub(crate) async fn acquire(&self) -> Result<ReaderLease<'_>> {
      let permit = self
         .permits
         .acquire()
         .await
         .map_err(|_| Error::DatabaseClosed)?;

      let idle = self.state.lock().idle.pop();
      let slot = match idle {
         Some(slot) => slot,
         None => self.open_slot().await?,
      };

      Ok(ReaderLease {
         pool: self,
         slot: Some(slot),
         _permit: permit,
      })
   }

   async fn open_slot(&self) -> Result<ReaderSlot> {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      let name = self
         .config
         .connection_name("DatabasePool", Some(&format!("reader.{}", id)));

      let connection = Connection::open(
         &self.path,
         Arc::clone(&self.config),
         Role::Reader,
         name,
         self.encryption.as_ref(),
         &self.collations,
      )
      .await?;

      self.state.lock().live += 1;

      Ok(ReaderSlot {
         id,
         executor: ConnectionExecutor::spawn(connection, self.config.runtime.as_ref()),
      })
   }

   /// Number of open reader connections.
   pub(crate) fn live(&self) -> usize {
      self.state.lock().live
   }

   pub(crate) fn idle(&self) -> usize {
      self.state.lock().idle.len()
   }

   /// Closes idle readers until at most `keep` remain idle.
   ///
   /// The most recently used readers are kept.
   pub(crate) async fn close_idle(&self, keep: usize) -> usize {
      let surplus = {
         let mut state = self.state.lock();
         let excess = state.idle.len().saturating_sub(keep);
         let surplus: Vec<ReaderSlot> = state.idle.drain(..excess).collect();
         state.live -= surplus.len();
         surplus
      };

      let closed = surplus.len();
      close_slots(surplus).await;
      closed
   }

   /// Opens `count` fresh idle readers.
   ///
   /// Used after `close_idle(0)` to replace readers whose connection options
   /// changed, such as the passphrase.
   pub(crate) async fn reopen(&self, count: usize) -> Result<()> {
      let mut fresh = Vec::with_capacity(count);
      for _ in 0..count {
         fresh.push(self.open_slot().await?);
      }
      self.state.lock().idle.extend(fresh);

      debug!(readers = count, "Readers reopened");
      Ok(())
   }

   /// Installs a collation on every idle reader.
   ///
   /// Only called while no slot is leased, so every live reader is idle.
   pub(crate) async fn add_collation(&self, name: &str, collation: &CollationFn) -> Result<()> {
      let slots = std::mem::take(&mut self.state.lock().idle);

      let mut result = Ok(());
      for slot in &slots {
         let name = name.to_string();
         let collation = Arc::clone(collation);
         let outcome = slot
            .executor
            .run(move |conn| Box::pin(async move { conn.add_collation(&name, collation).await }))
            .await;
         if result.is_ok() {
            result = outcome;
         }
      }

      self.state.lock().idle.extend(slots);
      result
   }

   /// Refuses new leases and closes every idle reader.
   pub(crate) async fn close(&self) {
      self.permits.close();
      self.close_idle(0).await;
   }
}

async fn close_slots(slots: Vec<ReaderSlot>) {
   for slot in slots {
      if let Err(e) = slot.executor.close().await {
         warn!(reader = slot.id, error = %e, "Failed to close reader");
      }
   }
}

/// A leased reader slot, returned to the idle list when dropped.
pub(crate) struct ReaderLease<'a> {
   pool: &'a ReaderPool,
   slot: Option<ReaderSlot>,
   _permit: SemaphorePermit<'a>,
}

impl ReaderLease<'_> {
   pub(crate) fn slot(&self) -> &ReaderSlot {
      match &self.slot {
         Some(slot) => slot,
         None => unreachable!("reader slot is only taken on drop"),
      }
   }
}

impl Drop for ReaderLease<'_> {
   fn drop(&mut self) {
      if let Some(slot) = self.slot.take() {
         self.pool.state.lock().idle.push(slot);
      }
   }
}
