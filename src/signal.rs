//! One-shot coordination between experiment tasks and the orchestrator.
//!
//! Both primitives consume themselves on use, so a completion can only be
//! signalled once and a handoff can only be published once.

use tokio::sync::oneshot;

use crate::{Error, Result};

/// Creates a completion signal for the task acting as `role`
pub fn completion<T>(role: &'static str) -> (Completion<T>, CompletionWait<T>) {
   let (tx, rx) = oneshot::channel();
   (Completion { tx, role }, CompletionWait { rx, role })
}

/// Sending half, owned by the task whose phase is running
#[must_use = "a completion that is never signalled reports the task as abandoned"]
pub struct Completion<T> {
   tx:   oneshot::Sender<T>,
   role: &'static str,
}

impl<T> Completion<T> {
   /// Marks the task done and hands its outcome to the waiter
   pub fn complete(self, outcome: T) {
      if self.tx.send(outcome).is_err() {
         tracing::debug!("{}\tnobody waiting on completion", self.role);
      }
   }

   pub const fn role(&self) -> &'static str {
      self.role
   }
}

/// Receiving half, owned by the orchestrator
pub struct CompletionWait<T> {
   rx:   oneshot::Receiver<T>,
   role: &'static str,
}

impl<T> CompletionWait<T> {
   /// Waits for the task to finish.
   ///
   /// Fails with [`Error::Abandoned`] if the task dropped its [`Completion`]
   /// without signalling, e.g. because it panicked.
   pub async fn wait(self) -> Result<T> {
      let Self { rx, role } = self;
      rx.await.map_err(|_| Error::Abandoned(role))
   }
}

/// Creates a single-slot handoff
pub fn handoff<T>() -> (Handoff<T>, HandoffWait<T>) {
   let (tx, rx) = oneshot::channel();
   (Handoff { tx }, HandoffWait { rx })
}

pub struct Handoff<T> {
   tx: oneshot::Sender<T>,
}

impl<T> Handoff<T> {
   /// Publishes `value`. Gives it back if the receiving side is gone.
   pub fn publish(self, value: T) -> Result<(), T> {
      self.tx.send(value)
   }
}

pub struct HandoffWait<T> {
   rx: oneshot::Receiver<T>,
}

impl<T> HandoffWait<T> {
   /// Takes the published value, or `None` if the publisher gave up
   pub async fn take(self) -> Option<T> {
      self.rx.await.ok()
   }
}
