//! The [`Listener`] trait and the opaque handle `attach` returns.

use super::invocation::InvocationContext;

/// A pair of entry points invoked from the on-trampoline thunks whenever an
/// intercepted call crosses them, with interrupts enabled, on whichever
/// thread happened to make the call.
///
/// Both methods default to doing nothing, so a listener only interested in
/// one side doesn't have to stub out the other.
pub trait Listener: Send + Sync {
  /// Called with arguments still in their call-ABI locations. May read them
  /// via [`InvocationContext::get_nth_argument`] and overwrite them via
  /// [`InvocationContext::replace_nth_argument`].
  fn on_enter(&self, _context: &mut InvocationContext) {}

  /// Called after the original (or replaced) function returns. The return
  /// value is available via [`InvocationContext::get_return_value`] and
  /// mutable via [`InvocationContext::replace_return_value`].
  fn on_leave(&self, _context: &mut InvocationContext) {}
}

/// Opaque handle to an attached listener, returned by `attach` and
/// consumed by `detach`. Carries no pointers — a listener may outlive or
/// underlive the function context it was attached to; only the pair
/// `(target, id)` ties them together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
  pub(crate) target_address: usize,
  pub(crate) id: u64,
}

impl ListenerHandle {
  pub fn target_address(&self) -> usize {
    self.target_address
  }
}
