//! Serial execution context of a connection
//!
//! Each [`Connection`] is owned by a task that runs submitted units of work one
//! at a time, in submission order. Nothing else touches the connection, so no
//! two units of work ever overlap on it.

use std::any::Any;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, debug_span, trace, warn};

use crate::Result;
use crate::connection::Connection;
use crate::error::Error;

type Job = Box<dyn for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, ()> + Send>;

/// What a job hands back: its result, or the payload of its panic.
type Outcome<T> = std::result::Result<Result<T>, Box<dyn Any + Send>>;

enum Command {
   Run(Job),
   Close(oneshot::Sender<Result<()>>),
}

fn job<F>(f: F) -> Job
where
   F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, ()> + Send + 'static,
{
   Box::new(f)
}

/// Handle to the task owning one connection.
pub(crate) struct ConnectionExecutor {
   name: Arc<str>,
   sender: mpsc::UnboundedSender<Command>,
}

impl ConnectionExecutor {
   /// Moves `connection` onto a new task.
   ///
   /// The task runs on `runtime` when given, on the current runtime otherwise.
   pub(crate) fn spawn(connection: Connection, runtime: Option<&tokio::runtime::Handle>) -> Self {
      let name: Arc<str> = Arc::from(connection.name());
      let (sender, receiver) = mpsc::unbounded_channel();
      let task = drive(connection, receiver).instrument(debug_span!("connection", name = %name));

      match runtime {
         Some(handle) => drop(handle.spawn(task)),
         None => drop(tokio::spawn(task)),
      }

      Self { name, sender }
   }

   pub(crate) fn name(&self) -> &str {
      &self.name
   }

   /// Enqueues `work` and returns without waiting for it.
   ///
   /// The work runs even if the returned handle is dropped.
   pub(crate) fn submit<T, F>(&self, work: F) -> Result<WorkHandle<T>>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let (reply, receiver) = oneshot::channel::<Outcome<T>>();
      let cancelled = Arc::new(AtomicBool::new(false));
      let withdrawn = Arc::clone(&cancelled);

      let job = job(move |conn| {
         Box::pin(async move {
            if withdrawn.load(Ordering::Acquire) {
               trace!("Skipping cancelled unit of work");
               let _ = reply.send(Ok(Err(Error::WorkCancelled)));
               return;
            }

            let outcome = AssertUnwindSafe(async { work(&mut *conn).await })
               .catch_unwind()
               .await;

            if outcome.is_err() {
               warn!("Unit of work panicked");
               conn.recover_after_panic().await;
            }

            // The caller may have stopped waiting
            let _ = reply.send(outcome);
         })
      });

      self
         .sender
         .send(Command::Run(job))
         .map_err(|_| Error::ConnectionClosed(self.name.to_string()))?;

      Ok(WorkHandle {
         connection: Arc::clone(&self.name),
         cancelled,
         receiver,
      })
   }

   /// Runs `work` and waits for its result.
   ///
   /// Dropping the returned future before the work started withdraws it.
   pub(crate) async fn run<T, F>(&self, work: F) -> Result<T>
   where
      F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
      T: Send + 'static,
   {
      let handle = self.submit(work)?;
      let _withdraw = WithdrawOnDrop(Arc::clone(&handle.cancelled));
      handle.wait().await
   }

   /// Closes the connection after every unit of work submitted before.
   ///
   /// Work submitted afterwards fails with [`Error::ConnectionClosed`].
   pub(crate) async fn close(&self) -> Result<()> {
      let (reply, receiver) = oneshot::channel();
      self
         .sender
         .send(Command::Close(reply))
         .map_err(|_| Error::ConnectionClosed(self.name.to_string()))?;
      receiver
         .await
         .map_err(|_| Error::ConnectionClosed(self.name.to_string()))?
   }
}

async fn drive(mut connection: Connection, mut receiver: mpsc::UnboundedReceiver<Command>) {
   trace!("Executor started");

   while let Some(command) = receiver.recv().await {
      match command {
         Command::Run(job) => job(&mut connection).await,
         Command::Close(reply) => {
            // Pending jobs are dropped, their callers see ConnectionClosed
            drop(receiver);
            let _ = reply.send(connection.close().await);
            return;
         }
      }
   }

   // Every handle is gone without an explicit close
   if let Err(e) = connection.close().await {
      warn!(error = %e, "Failed to close abandoned connection");
   }
}

/// Marks a unit of work as withdrawn when dropped.
///
/// Setting the flag after the work started has no effect.
struct WithdrawOnDrop(Arc<AtomicBool>);

impl Drop for WithdrawOnDrop {
   fn drop(&mut self) {
      self.0.store(true, Ordering::Release);
   }
}

/// Result of a unit of work submitted without waiting.
///
/// The work is already enqueued, so its position relative to other work on
/// the same connection is fixed. It completes whether or not the handle is
/// awaited. Awaiting the handle yields the work's result; a panic inside the
/// work resumes on the awaiting task.
#[must_use = "the work runs regardless; await the handle to observe its result"]
pub struct WorkHandle<T> {
   connection: Arc<str>,
   cancelled: Arc<AtomicBool>,
   receiver: oneshot::Receiver<Outcome<T>>,
}

impl<T> WorkHandle<T> {
   /// Withdraws the work if it has not started yet.
   ///
   /// Withdrawn work resolves to [`Error::WorkCancelled`]. Work that already
   /// started runs to completion.
   pub fn cancel(&self) {
      self.cancelled.store(true, Ordering::Release);
   }

   pub fn is_cancelled(&self) -> bool {
      self.cancelled.load(Ordering::Acquire)
   }

   /// Waits for the work to complete.
   pub async fn wait(self) -> Result<T> {
      match self.receiver.await {
         Ok(Ok(result)) => result,
         Ok(Err(payload)) => panic::resume_unwind(payload),
         Err(_) if self.cancelled.load(Ordering::Acquire) => Err(Error::WorkCancelled),
         Err(_) => Err(Error::ConnectionClosed(self.connection.to_string())),
      }
   }
}

impl<T: Send + 'static> IntoFuture for WorkHandle<T> {
   type Output = Result<T>;
   type IntoFuture = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

   fn into_future(self) -> Self::IntoFuture {
      Box::pin(self.wait())
   }
}

impl<T> std::fmt::Debug for WorkHandle<T> {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("WorkHandle")
         .field("connection", &self.connection)
         .field("cancelled", &self.is_cancelled())
         .finish_non_exhaustive()
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::cipher::NoEncryption;
   use crate::collation::Collations;
   use crate::config::Configuration;
   use crate::connection::Role;
   use std::path::PathBuf;
   use std::time::Duration;

   async fn executor() -> ConnectionExecutor {
      let conn = Connection::open(
         &PathBuf::from(":memory:"),
         Arc::new(Configuration::default()),
         Role::Writer,
         "exec".into(),
         &NoEncryption,
         &Collations::default(),
      )
      .await
      .unwrap();
      ConnectionExecutor::spawn(conn, None)
   }

   #[tokio::test]
   async fn test_work_runs_in_submission_order() {
      let executor = executor().await;
      let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

      let mut handles = Vec::new();
      for i in 0..5 {
         let order = Arc::clone(&order);
         handles.push(
            executor
               .submit(move |_conn| {
                  Box::pin(async move {
                     // Earlier work sleeps longer; order must still hold
                     tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                     order.lock().push(i);
                     Ok(i)
                  })
               })
               .unwrap(),
         );
      }

      for (i, handle) in handles.into_iter().enumerate() {
         assert_eq!(handle.await.unwrap(), i as u64);
      }
      assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
   }

   #[tokio::test]
   async fn test_cancelled_work_is_skipped() {
      let executor = executor().await;
      let (release, blocked) = oneshot::channel::<()>();

      let first = executor
         .submit(move |_conn| {
            Box::pin(async move {
               let _ = blocked.await;
               Ok(())
            })
         })
         .unwrap();

      let ran = Arc::new(AtomicBool::new(false));
      let flag = Arc::clone(&ran);
      let second = executor
         .submit(move |_conn| {
            Box::pin(async move {
               flag.store(true, Ordering::SeqCst);
               Ok(())
            })
         })
         .unwrap();

      second.cancel();
      release.send(()).unwrap();

      first.await.unwrap();
      assert!(matches!(second.await, Err(Error::WorkCancelled)));
      assert!(!ran.load(Ordering::SeqCst));
   }

   #[tokio::test]
   async fn test_dropped_handle_still_runs() {
      let executor = executor().await;
      let ran = Arc::new(AtomicBool::new(false));
      let flag = Arc::clone(&ran);

      drop(
         executor
            .submit(move |_conn| {
               Box::pin(async move {
                  flag.store(true, Ordering::SeqCst);
                  Ok(())
               })
            })
            .unwrap(),
      );

      executor
         .run(|_conn| Box::pin(async { Ok(()) }))
         .await
         .unwrap();
      assert!(ran.load(Ordering::SeqCst));
   }

   fn explode() -> Result<()> {
      panic!("boom")
   }

   #[tokio::test]
   #[should_panic(expected = "boom")]
   async fn test_panic_resumes_on_caller() {
      let executor = executor().await;
      let _: Result<()> = executor
         .run(|_conn| Box::pin(async { explode() }))
         .await;
   }

   #[tokio::test]
   async fn test_executor_survives_panic() {
      let executor = executor().await;

      let handle = executor
         .submit(|conn| {
            Box::pin(async move {
               conn.execute("BEGIN").await?;
               if conn.is_in_transaction().await? {
                  panic!("boom");
               }
               Ok(())
            })
         })
         .unwrap();
      let caught = tokio::spawn(handle.wait()).await;
      assert!(caught.unwrap_err().is_panic());

      let in_transaction = executor
         .run(|conn| Box::pin(async move { conn.is_in_transaction().await }))
         .await
         .unwrap();
      assert!(!in_transaction);
   }

   #[tokio::test]
   async fn test_work_after_close_fails() {
      let executor = executor().await;
      executor.close().await.unwrap();

      let result = executor.run(|_conn| Box::pin(async { Ok(()) })).await;
      assert!(matches!(result, Err(Error::ConnectionClosed(name)) if name == "exec"));
   }
}
