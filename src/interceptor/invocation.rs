//! Per-call invocation context: what a [`Listener`](super::Listener) sees
//! in `on_enter`/`on_leave`.

use super::registers::{RegisterFile, ReturnValue};
use std::cell::RefCell;
use std::collections::HashMap;

thread_local! {
  /// The current thread's invocation-context stack, keyed by nesting
  /// depth — pushed on enter, popped on leave, exactly as §3 specifies.
  /// Never shared across threads.
  static STACK: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
  /// Per-thread opt-out counter. Non-zero means listener dispatch is
  /// skipped (but the original function is still called) — set explicitly
  /// via `ignore_current_thread`, and bumped automatically around listener
  /// callbacks to prevent recursive dispatch.
  static IGNORE_DEPTH: RefCell<u32> = RefCell::new(0);
  /// User data a listener attached to a frame for enter→leave
  /// communication, keyed by listener id so unrelated listeners on the
  /// same target don't clobber each other's slot.
  static USER_DATA: RefCell<HashMap<(usize, u64), Box<dyn std::any::Any>>> = RefCell::new(HashMap::new());
}

struct Frame {
  target_address: usize,
  original_return_address: usize,
  thread_id: u64,
}

/// A live call's register file and bookkeeping, visible to listeners
/// through [`InvocationContext`].
pub struct InvocationContext<'a> {
  target_address: usize,
  regs: RegsView<'a>,
  entry_rsp: usize,
  thread_id: u64,
  depth: usize,
}

enum RegsView<'a> {
  Enter(&'a mut RegisterFile),
  Leave(&'a mut ReturnValue),
}

impl<'a> InvocationContext<'a> {
  pub(crate) fn for_enter(
    target_address: usize,
    regs: &'a mut RegisterFile,
    entry_rsp: usize,
    thread_id: u64,
    depth: usize,
  ) -> Self {
    InvocationContext { target_address, regs: RegsView::Enter(regs), entry_rsp, thread_id, depth }
  }

  pub(crate) fn for_leave(
    target_address: usize,
    regs: &'a mut ReturnValue,
    entry_rsp: usize,
    thread_id: u64,
    depth: usize,
  ) -> Self {
    InvocationContext { target_address, regs: RegsView::Leave(regs), entry_rsp, thread_id, depth }
  }

  /// The address of the function being intercepted.
  pub fn target_address(&self) -> usize {
    self.target_address
  }

  /// The id of the thread this call is executing on.
  pub fn thread_id(&self) -> u64 {
    self.thread_id
  }

  /// Reads the `n`th argument, per the platform calling convention. Only
  /// meaningful during `on_enter` — returns `0` during `on_leave` (the
  /// argument registers are long gone by the time the function returns).
  pub fn get_nth_argument(&self, n: usize) -> usize {
    match &self.regs {
      RegsView::Enter(regs) => unsafe { regs.nth_argument(n, self.entry_rsp) },
      RegsView::Leave(_) => 0,
    }
  }

  /// Overwrites the `n`th argument. Only meaningful during `on_enter`; a
  /// no-op during `on_leave`.
  pub fn replace_nth_argument(&mut self, n: usize, value: usize) {
    if let RegsView::Enter(regs) = &mut self.regs {
      unsafe { regs.set_nth_argument(n, value, self.entry_rsp) };
    }
  }

  /// Reads the raw integer return value (`rax`). Only meaningful during
  /// `on_leave` — returns `0` during `on_enter` (the function hasn't run
  /// yet).
  pub fn get_return_value(&self) -> usize {
    match &self.regs {
      RegsView::Leave(regs) => regs.rax as usize,
      RegsView::Enter(_) => 0,
    }
  }

  /// Overwrites the return value. Only meaningful during `on_leave`.
  pub fn replace_return_value(&mut self, value: usize) {
    if let RegsView::Leave(regs) = &mut self.regs {
      regs.rax = value as u64;
    }
  }

  /// The parent invocation context, for a nested intercepted call on the
  /// same thread — `None` at the outermost level.
  ///
  /// There is no live `&InvocationContext` for the parent frame to borrow
  /// (it belongs to an outer, still-running thunk invocation further down
  /// the native stack) — only its identity is retained, lazily looked up
  /// the first time it's asked for and cached as `(target, thread, depth)`,
  /// matching Frida-gum's own `GumInvocationContext::get_parent` caching.
  pub fn get_parent(&self) -> Option<ParentHandle> {
    if self.depth == 0 {
      return None;
    }
    STACK.with(|stack| {
      let stack = stack.borrow();
      stack.get(self.depth - 1).map(|frame| ParentHandle {
        target_address: frame.target_address,
        thread_id: frame.thread_id,
        depth: self.depth - 1,
      })
    })
  }

  /// Attaches user data to this frame under `listener_id`, for retrieval in
  /// the matching `on_leave` call of the same listener.
  pub fn set_user_data<T: 'static>(&self, listener_id: u64, value: T) {
    USER_DATA.with(|map| {
      map.borrow_mut().insert((self.target_address, listener_id), Box::new(value));
    });
  }

  /// Retrieves and removes user data previously attached with
  /// `set_user_data` for the matching `on_enter`.
  pub fn take_user_data<T: 'static>(&self, listener_id: u64) -> Option<T> {
    USER_DATA.with(|map| {
      map
        .borrow_mut()
        .remove(&(self.target_address, listener_id))
        .and_then(|boxed| boxed.downcast::<T>().ok())
        .map(|boxed| *boxed)
    })
  }
}

/// Identity of a parent invocation frame, returned by
/// [`InvocationContext::get_parent`]. Frida-gum's own `GumInvocationContext`
/// exposes the same information this way — the parent *frame* object, not a
/// clone of its register file, since the register file is only valid while
/// that frame's thunk invocation is still on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentHandle {
  pub target_address: usize,
  pub thread_id: u64,
  pub depth: usize,
}

/// Pushes a new frame for an intercepted call on entry. Returns the new
/// frame's depth, and the original return address the leave thunk must
/// eventually restore control to.
pub(crate) fn push_frame(target_address: usize, original_return_address: usize, thread_id: u64) -> usize {
  STACK.with(|stack| {
    let mut stack = stack.borrow_mut();
    stack.push(Frame { target_address, original_return_address, thread_id });
    stack.len() - 1
  })
}

/// Pops the innermost frame on leave, returning the original return address
/// saved on enter.
pub(crate) fn pop_frame() -> usize {
  STACK.with(|stack| {
    stack
      .borrow_mut()
      .pop()
      .expect("on-leave thunk fired without a matching on-enter push")
      .original_return_address
  })
}

/// Current nesting depth — `0` means no intercepted call is in flight on
/// this thread.
pub(crate) fn current_depth() -> usize {
  STACK.with(|stack| stack.borrow().len())
}

/// The innermost in-flight frame on this thread, if any — backs
/// `Interceptor::get_current_invocation`, which a listener (or unrelated
/// code running on the same thread) can call without holding a live
/// `InvocationContext` of its own.
pub(crate) fn top_frame() -> Option<ParentHandle> {
  STACK.with(|stack| {
    let stack = stack.borrow();
    stack.last().map(|frame| ParentHandle {
      target_address: frame.target_address,
      thread_id: frame.thread_id,
      depth: stack.len() - 1,
    })
  })
}

/// Thread-local ignore flag: while set, thunks skip listener dispatch (but
/// still chain to the original function).
pub(crate) fn is_ignored() -> bool {
  IGNORE_DEPTH.with(|depth| *depth.borrow() > 0)
}

pub(crate) fn ignore_current_thread() {
  IGNORE_DEPTH.with(|depth| *depth.borrow_mut() += 1);
}

pub(crate) fn unignore_current_thread() {
  IGNORE_DEPTH.with(|depth| {
    let mut depth = depth.borrow_mut();
    *depth = depth.saturating_sub(1);
  });
}

/// Bumps the ignore depth for the duration of `f`, so a listener calling
/// back into an intercepted function doesn't recursively dispatch itself.
pub(crate) fn with_reentrancy_guard<R>(f: impl FnOnce() -> R) -> R {
  ignore_current_thread();
  let result = f();
  unignore_current_thread();
  result
}
