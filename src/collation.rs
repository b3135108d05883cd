//! Custom collations shared by every connection of a queue or pool

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use sqlx::sqlite::SqliteConnectOptions;

/// Comparison function registered under a collation name.
pub type CollationFn = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Collations registered with `add_collation`.
///
/// New connections get every registered collation at open. Registering a
/// collation also installs it on the live connections, which the queue or pool
/// does before `add_collation` returns.
#[derive(Default)]
pub(crate) struct Collations {
   entries: RwLock<Vec<(Arc<str>, CollationFn)>>,
}

impl Collations {
   /// Records `collation`, replacing an earlier one with the same name.
   pub(crate) fn register(&self, name: &str, collation: CollationFn) {
      let mut entries = self.entries.write();
      entries.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
      entries.push((Arc::from(name), collation));
   }

   /// Adds the registered collations to the options of a fresh connection.
   pub(crate) fn apply(&self, mut options: SqliteConnectOptions) -> SqliteConnectOptions {
      for (name, collation) in self.entries.read().iter() {
         let collation = Arc::clone(collation);
         options = options.collation(Arc::clone(name), move |a: &str, b: &str| collation(a, b));
      }
      options
   }

   #[cfg(test)]
   fn len(&self) -> usize {
      self.entries.read().len()
   }
}

impl fmt::Debug for Collations {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let entries = self.entries.read();
      f.debug_list()
         .entries(entries.iter().map(|(name, _)| name))
         .finish()
   }
}
