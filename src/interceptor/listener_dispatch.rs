//! The glue the on-enter/on-leave thunks call into: reads the function
//! context's listener list, drives [`InvocationContext`] construction, and
//! enforces the ordering and re-entrancy rules of §5.
//!
//! Deliberately outside `invocation.rs` (which only knows about the
//! thread-local stack) and `function_context.rs` (which only knows about
//! the listener list) — this is where the two meet.
//!
//! Control flow leans on return-address hijacking rather than an explicit
//! jump from enter to leave: the trampoline's tail jump re-enters the real
//! function body, which eventually executes its own `ret`. By the time
//! that happens the slot `dispatch_enter` overwrote on the stack points at
//! the on-leave thunk, so the `ret` lands there for free. A thread that
//! opted out never gets the slot rewritten, so its `ret` goes straight to
//! the real caller and the on-leave thunk never runs for that call.

use crate::interceptor::function_context::FunctionContextData;
use crate::interceptor::invocation::{self, InvocationContext};
use crate::interceptor::registers::{RegisterFile, ReturnValue};
use crate::interceptor::thread_service::current_thread_id;
use std::mem::size_of;

/// Called from the on-enter thunk with `regs` pointing at the just-saved
/// register file (§3 "Invocation context").
///
/// # Safety
/// `context` must be a valid, live `FunctionContextData` pointer baked in
/// by the trampoline builder; `regs` must point at a complete, writable
/// `RegisterFile` immediately below the real return address on the
/// thunk's stack.
pub(crate) unsafe fn dispatch_enter(context: *const FunctionContextData, regs: *mut RegisterFile) {
  let context = &*context;

  // The register file sits directly below the slot the function was
  // entered with `rsp` pointing at (the real return address) — see
  // `interceptor::trampoline` for the push sequence this mirrors.
  let entry_rsp = regs as usize + size_of::<RegisterFile>();

  if invocation::is_ignored() {
    return;
  }

  let original_return_address = *(entry_rsp as *const usize);
  let thread_id = current_thread_id();
  let depth = invocation::push_frame(context.target_address, original_return_address, thread_id);

  let listeners: Vec<_> = {
    let guard = context.listeners.lock().unwrap();
    guard.iter().map(|entry| entry.listener.clone()).collect()
  };

  let regs_ref = &mut *regs;
  invocation::with_reentrancy_guard(|| {
    for listener in listeners {
      let mut ctx = InvocationContext::for_enter(context.target_address, regs_ref, entry_rsp, thread_id, depth);
      listener.on_enter(&mut ctx);
    }
  });

  // Hijack: the function's eventual `ret` will now land on the on-leave
  // thunk instead of the real caller.
  *(entry_rsp as *mut usize) = context.on_leave_address.get();
}

/// Called from the on-leave thunk. Pops the matching frame, runs every
/// listener's `on_leave` in *reverse* insertion order (testable property
/// 3), and returns the real return address for the thunk to jump to.
///
/// Only reached for calls `dispatch_enter` chose to instrument — an
/// ignored thread's call never rewrites the stack slot that would bring it
/// here.
///
/// # Safety
/// Same preconditions as [`dispatch_enter`], for the `ReturnValue` block.
pub(crate) unsafe fn dispatch_leave(context: *const FunctionContextData, regs: *mut ReturnValue) -> usize {
  let context = &*context;
  let entry_rsp = regs as usize;

  let original_return_address = invocation::pop_frame();
  let depth = invocation::current_depth();
  let thread_id = current_thread_id();

  let listeners: Vec<_> = {
    let guard = context.listeners.lock().unwrap();
    guard.iter().rev().map(|entry| entry.listener.clone()).collect()
  };

  let regs_ref = &mut *regs;
  invocation::with_reentrancy_guard(|| {
    for listener in listeners {
      let mut ctx = InvocationContext::for_leave(context.target_address, regs_ref, entry_rsp, thread_id, depth);
      listener.on_leave(&mut ctx);
    }
  });

  original_return_address
}
