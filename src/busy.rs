//! Busy-retry policies applied when a connection cannot acquire a lock.
//!
//! SQLite reports `SQLITE_BUSY` whenever another connection holds the lock a
//! statement needs. The policy selected by [`BusyMode`] is installed on the
//! native handle, so it governs every statement step and not only
//! transaction starts:
//!
//! - [`BusyMode::ImmediateError`]: busy timeout of zero, the first contention fails.
//! - [`BusyMode::Timeout`]: SQLite's own busy handler, which sleeps with a
//!   bounded backoff until the timeout elapses.
//! - [`BusyMode::Callback`]: a native handler that asks a [`BusyCallback`]
//!   whether to try again.

use std::ffi::{c_int, c_void};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use libsqlite3_sys::{sqlite3, sqlite3_busy_handler};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// What to do after the engine reported contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyDecision {
   /// Try to acquire the lock again.
   Retry,
   /// Give up and surface `SQLITE_BUSY`.
   Stop,
}

/// Strategy consulted by [`BusyMode::Callback`].
///
/// `attempts` is the number of times the handler has already been invoked for
/// the current lock request, starting at zero. Returning [`BusyDecision::Retry`]
/// retries immediately, so implementations that want to wait should sleep
/// before returning. The callback runs on the connection's worker thread.
pub trait BusyCallback: Send + Sync {
   fn decide(&self, attempts: u32) -> BusyDecision;
}

impl<F> BusyCallback for F
where
   F: Fn(u32) -> BusyDecision + Send + Sync,
{
   fn decide(&self, attempts: u32) -> BusyDecision {
      self(attempts)
   }
}

/// Behavior when a lock is held by another connection.
///
/// Default: `ImmediateError`
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyMode {
   /// Fail on the first contention.
   #[default]
   ImmediateError,
   /// Retry with backoff until the duration elapses.
   Timeout(Duration),
   /// Ask the callback after every failed attempt.
   #[serde(skip)]
   Callback(Arc<dyn BusyCallback>),
}

impl BusyMode {
   /// Builds a callback mode from a closure.
   pub fn callback<F>(decide: F) -> Self
   where
      F: Fn(u32) -> BusyDecision + Send + Sync + 'static,
   {
      BusyMode::Callback(Arc::new(decide))
   }

   /// Busy timeout handed to SQLx when the connection is established.
   pub(crate) fn engine_timeout(&self) -> Duration {
      match self {
         BusyMode::Timeout(duration) => *duration,
         BusyMode::ImmediateError | BusyMode::Callback(_) => Duration::ZERO,
      }
   }
}

impl fmt::Debug for BusyMode {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         BusyMode::ImmediateError => f.write_str("ImmediateError"),
         BusyMode::Timeout(duration) => f.debug_tuple("Timeout").field(duration).finish(),
         BusyMode::Callback(_) => f.write_str("Callback(..)"),
      }
   }
}

/// Context handed to SQLite as the busy handler's user data.
struct HandlerContext {
   callback: Arc<dyn BusyCallback>,
}

/// Ownership of a callback registered with `sqlite3_busy_handler`.
///
/// The context must outlive every statement of the connection, so it is only
/// reclaimed by [`release`](Self::release), which removes the handler first.
/// A registration dropped without being released leaks its context rather
/// than risk SQLite calling into freed memory.
pub(crate) struct BusyHandlerRegistration {
   context: *mut HandlerContext,
}

// SAFETY: the context is only dereferenced by SQLite on the connection's worker
// thread, and it owns nothing but an `Arc<dyn BusyCallback>`, which is Send + Sync.
unsafe impl Send for BusyHandlerRegistration {}
unsafe impl Sync for BusyHandlerRegistration {}

impl BusyHandlerRegistration {
   /// Removes the handler from `db` and frees the context.
   ///
   /// # Safety
   ///
   /// `db` must be the handle the registration was installed on, still open,
   /// and not executing a statement.
   pub(crate) unsafe fn release(mut self, db: *mut sqlite3) {
      unsafe {
         sqlite3_busy_handler(db, None, ptr::null_mut());
         drop(Box::from_raw(self.context));
      }
      self.context = ptr::null_mut();
      trace!("Busy handler released");
   }
}

impl Drop for BusyHandlerRegistration {
   fn drop(&mut self) {
      if !self.context.is_null() {
         trace!("Busy handler dropped without release, leaking its context");
      }
   }
}

/// Installs the native handler for callback modes.
///
/// Returns `None` for modes handled by the busy timeout alone.
///
/// # Safety
///
/// `db` must be a valid, open sqlite3 handle that is not executing a statement.
pub(crate) unsafe fn install(db: *mut sqlite3, mode: &BusyMode) -> Option<BusyHandlerRegistration> {
   let BusyMode::Callback(callback) = mode else {
      return None;
   };

   let context = Box::into_raw(Box::new(HandlerContext {
      callback: Arc::clone(callback),
   }));

   // SAFETY: db is valid per the caller; context stays alive until release()
   unsafe {
      sqlite3_busy_handler(db, Some(busy_callback), context as *mut c_void);
   }

   trace!("Busy callback installed");
   Some(BusyHandlerRegistration { context })
}

extern "C" fn busy_callback(user_data: *mut c_void, attempts: c_int) -> c_int {
   if user_data.is_null() {
      return 0;
   }

   // SAFETY: user_data is the HandlerContext leaked in install()
   let context = unsafe { &*(user_data as *const HandlerContext) };
   let attempts = u32::try_from(attempts).unwrap_or(0);

   // Unwinding across the FFI boundary is undefined behavior
   match catch_unwind(AssertUnwindSafe(|| context.callback.decide(attempts))) {
      Ok(BusyDecision::Retry) => 1,
      Ok(BusyDecision::Stop) => 0,
      Err(_) => {
         warn!("Busy callback panicked, giving up on the lock");
         0
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use std::sync::atomic::{AtomicU32, Ordering};

   #[test]
   fn test_engine_timeout() {
      assert_eq!(BusyMode::ImmediateError.engine_timeout(), Duration::ZERO);
      assert_eq!(
         BusyMode::Timeout(Duration::from_millis(250)).engine_timeout(),
         Duration::from_millis(250)
      );
      assert_eq!(
         BusyMode::callback(|_| BusyDecision::Stop).engine_timeout(),
         Duration::ZERO
      );
   }

   #[test]
   fn test_default_is_immediate_error() {
      assert!(matches!(BusyMode::default(), BusyMode::ImmediateError));
   }

   #[test]
   fn test_trampoline_maps_decisions() {
      let calls = Arc::new(AtomicU32::new(0));
      let seen = Arc::clone(&calls);
      let mut context = HandlerContext {
         callback: Arc::new(move |attempts: u32| {
            seen.fetch_add(1, Ordering::SeqCst);
            if attempts < 2 {
               BusyDecision::Retry
            } else {
               BusyDecision::Stop
            }
         }),
      };
      let user_data = &mut context as *mut HandlerContext as *mut c_void;

      assert_eq!(busy_callback(user_data, 0), 1);
      assert_eq!(busy_callback(user_data, 1), 1);
      assert_eq!(busy_callback(user_data, 2), 0);
      assert_eq!(calls.load(Ordering::SeqCst), 3);
   }

   #[test]
   fn test_trampoline_stops_on_panic() {
      let mut context = HandlerContext {
         callback: Arc::new(|_: u32| -> BusyDecision { panic!("boom") }),
      };
      let user_data = &mut context as *mut HandlerContext as *mut c_void;

      assert_eq!(busy_callback(user_data, 0), 0);
   }

   #[test]
   fn test_timeout_serde() {
      let mode: BusyMode = serde_json::from_str(r#"{"timeout":{"secs":2,"nanos":0}}"#).unwrap();
      assert!(matches!(mode, BusyMode::Timeout(d) if d == Duration::from_secs(2)));

      let mode: BusyMode = serde_json::from_str(r#""immediate_error""#).unwrap();
      assert!(matches!(mode, BusyMode::ImmediateError));
   }
}
