//! Transaction coalescing and epoch-based deferred reclamation (§5
//! "Locks", §4.D "begin_transaction/end_transaction").
//!
//! A transaction nests: `begin_transaction` increments a depth counter,
//! `end_transaction` decrements it, and only the outermost `end` actually
//! runs the suspend/resume + patch cycle. Outside an explicit transaction,
//! every `attach`/`detach`/`replace` call is its own one-operation
//! transaction.

use std::cell::Cell;

thread_local! {
  /// Transactions are a thread-local affair: each thread batches its own
  /// topology changes, matching how the global lock (held by the caller of
  /// this module, not by `Transaction` itself) already serialises actual
  /// patch application across threads.
  static DEPTH: Cell<u32> = Cell::new(0);
}

/// Increments the nesting depth, returning the depth *after* the
/// increment (`1` means this call opened the outermost transaction).
pub(crate) fn enter() -> u32 {
  DEPTH.with(|depth| {
    let next = depth.get() + 1;
    depth.set(next);
    next
  })
}

/// Decrements the nesting depth, returning the depth *after* the
/// decrement (`0` means this call closed the outermost transaction).
pub(crate) fn leave() -> u32 {
  DEPTH.with(|depth| {
    let next = depth.get().saturating_sub(1);
    depth.set(next);
    next
  })
}

/// RAII guard around a single `attach`/`detach`/`replace` call: opens a
/// transaction on construction, closes it on drop. Lets those methods
/// tell whether they're running inside a caller-opened transaction
/// (`begin_transaction`/`end_transaction`) without changing their own
/// control flow either way — only the epoch-reclamation timing (§5) reads
/// `should_commit`.
pub(crate) struct Transaction {
  is_outermost: bool,
}

impl Transaction {
  pub(crate) fn begin() -> Self {
    Transaction { is_outermost: enter() == 1 }
  }

  /// Whether this call is the outermost transaction boundary — i.e.
  /// whether now is the right time to advance the epoch and reclaim
  /// retired function contexts, rather than deferring to an enclosing
  /// `end_transaction`.
  pub(crate) fn should_commit(&self) -> bool {
    self.is_outermost
  }
}

impl Drop for Transaction {
  fn drop(&mut self) {
    leave();
  }
}

/// A global epoch counter, bumped once per suspend/resume cycle (§5 "a
/// form of epoch reclamation"). A retired function context is only ever
/// freed once the epoch has advanced past the one it was retired under —
/// by then, every thread that could have been suspended mid-thunk during
/// that cycle has been resumed and observed the new code, so none can
/// still be executing against the old trampoline.
pub(crate) struct EpochReclaimer {
  epoch: std::sync::atomic::AtomicU64,
  retired: std::sync::Mutex<Vec<(u64, Box<dyn std::any::Any + Send>)>>,
}

impl EpochReclaimer {
  pub(crate) fn new() -> Self {
    EpochReclaimer { epoch: std::sync::atomic::AtomicU64::new(0), retired: std::sync::Mutex::new(Vec::new()) }
  }

  /// Called once per suspend/resume cycle, after threads are resumed.
  pub(crate) fn advance(&self) -> u64 {
    self.epoch.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1
  }

  pub(crate) fn current(&self) -> u64 {
    self.epoch.load(std::sync::atomic::Ordering::Acquire)
  }

  /// Queues `value` for deletion no earlier than the next epoch boundary.
  pub(crate) fn retire<T: Send + 'static>(&self, value: T) {
    let epoch = self.current();
    self.retired.lock().unwrap().push((epoch, Box::new(value)));
  }

  /// Drops everything retired at least one full cycle ago.
  pub(crate) fn collect(&self) {
    let current = self.current();
    self.retired.lock().unwrap().retain(|(epoch, _)| *epoch >= current);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn nested_transactions_only_commit_once() {
    let outer = Transaction::begin();
    assert!(outer.should_commit());
    {
      let inner = Transaction::begin();
      assert!(!inner.should_commit());
    }
    assert!(outer.should_commit());
  }

  #[test]
  fn retired_value_survives_until_next_epoch() {
    let reclaimer = EpochReclaimer::new();
    reclaimer.retire(42i32);
    reclaimer.collect();
    assert_eq!(reclaimer.retired.lock().unwrap().len(), 1);
    reclaimer.advance();
    reclaimer.collect();
    assert_eq!(reclaimer.retired.lock().unwrap().len(), 0);
  }
}
