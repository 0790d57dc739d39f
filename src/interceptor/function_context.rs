//! The per-target function context (§3 "Function context (interceptor)").
//!
//! Split into two parts deliberately: [`FunctionContext`] is owned by the
//! `Interceptor`'s topology table and only ever touched under the global
//! lock; [`FunctionContextData`] is the slice of it the on-trampoline
//! thunks need, read through a raw pointer baked into the thunk as an
//! immediate so dispatch never has to take that lock (§5).

use crate::alloc::ExecutableMemory;
use crate::interceptor::listener::Listener;
use std::cell::Cell;
use std::sync::{Arc, Mutex};

/// One listener attached to a target, in attach order.
pub(crate) struct ListenerEntry {
  pub(crate) id: u64,
  pub(crate) listener: Arc<dyn Listener>,
}

/// A full-replacement installation, mutually exclusive with listeners on
/// the same target.
pub(crate) struct Replacement {
  pub(crate) id: u64,
  pub(crate) function: usize,
  pub(crate) user_data: usize,
}

/// The thunk-readable half of a function context. Lives behind a stable
/// heap address (boxed by the owning [`FunctionContext`]) for as long as
/// any trampoline built against it might still be executing — see
/// `interceptor::transaction` for the epoch that governs when it's safe to
/// drop.
pub struct FunctionContextData {
  pub(crate) target_address: usize,
  pub(crate) listeners: Mutex<Vec<ListenerEntry>>,
  pub(crate) replacement: Mutex<Option<Replacement>>,
  /// Address of the on-leave thunk, baked in by `arm` once the trampoline
  /// is built and before the redirect patch is installed. The on-enter
  /// thunk writes this over the real return address on the stack (the
  /// hijack that gets control back after the original body runs); nothing
  /// reads it before `arm` sets it or mutates it after, so a `Cell`
  /// (rather than an atomic) is enough.
  pub(crate) on_leave_address: Cell<usize>,
}

impl FunctionContextData {
  /// Built and boxed *before* the trampoline, so its stable address can be
  /// baked into the thunks as they're generated. `on_leave_address` starts
  /// at `0` and is filled in once the trampoline layout is known, strictly
  /// before the redirect patch makes this context reachable from another
  /// thread.
  pub(crate) fn new(target_address: usize) -> Self {
    FunctionContextData {
      target_address,
      listeners: Mutex::new(Vec::new()),
      replacement: Mutex::new(None),
      on_leave_address: Cell::new(0),
    }
  }
}

// `Cell` isn't `Sync`, but `FunctionContextData` is never reached through a
// safe shared reference from more than one thread at a time by the type
// system — only through the raw pointer baked into the trampoline, derefed
// inside the `unsafe fn`s in `listener_dispatch`. The write happens once,
// before the redirect patch publishes the pointer to any other thread.
unsafe impl Sync for FunctionContextData {}

/// Whether a context's redirect patch is currently installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
  Armed,
  Disarmed,
}

/// Owned by the Interceptor's topology table, keyed by `target_address`.
pub(crate) struct FunctionContext {
  pub(crate) target_address: usize,
  /// Bytes overwritten at `target_address`, length `redirect_len`, followed
  /// (when `hot_patch` is `Some`) by the bytes overwritten at the hot-patch
  /// area. Restored verbatim, region by region, on disarm (testable
  /// property 2/6).
  pub(crate) original_prologue: Vec<u8>,
  /// How many of `original_prologue`'s leading bytes belong at
  /// `target_address` itself.
  pub(crate) redirect_len: usize,
  /// `(address, length)` of the hot-patch-area redirect, if the short-jump
  /// form was used because the function body alone had no room for a
  /// direct redirect.
  pub(crate) hot_patch: Option<(usize, usize)>,
  pub(crate) trampoline: ExecutableMemory,
  pub(crate) on_enter_offset: usize,
  pub(crate) on_leave_offset: usize,
  /// Input-offset (from `target_address`) → output-offset (from the
  /// trampoline base) mapping for the relocated prologue, inherited from
  /// `trampoline::TrampolineLayout::mapping`. Kept on the context so it
  /// survives alongside `trampoline`, even though today only `arm` itself
  /// (via `Interceptor::finish_arm`) consults it to redirect a thread
  /// caught mid-prologue during its own patch (§4.D "Atomic patch policy").
  pub(crate) prologue_mapping: Vec<(usize, usize)>,
  pub(crate) state: State,
  /// Boxed so the address handed to the trampoline thunks as an immediate
  /// never moves for the lifetime of this context.
  pub(crate) data: Box<FunctionContextData>,
}

impl FunctionContext {
  /// Assembles a context from its already-built parts. Callers (the `arm`
  /// choreography in `interceptor::mod`) must box the `FunctionContextData`
  /// *before* calling `trampoline::build`, so its address can be baked into
  /// the thunks, and must have already set `data.on_leave_address` from the
  /// trampoline layout `build` returns.
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    target_address: usize,
    original_prologue: Vec<u8>,
    redirect_len: usize,
    hot_patch: Option<(usize, usize)>,
    trampoline: ExecutableMemory,
    on_enter_offset: usize,
    on_leave_offset: usize,
    prologue_mapping: Vec<(usize, usize)>,
    data: Box<FunctionContextData>,
  ) -> Self {
    FunctionContext {
      target_address,
      original_prologue,
      redirect_len,
      hot_patch,
      trampoline,
      on_enter_offset,
      on_leave_offset,
      prologue_mapping,
      state: State::Armed,
      data,
    }
  }

  /// Raw pointer baked into the on-enter/on-leave thunks. Valid as long as
  /// `self` (and therefore `self.data`) is alive.
  pub(crate) fn data_ptr(&self) -> *const FunctionContextData {
    &*self.data as *const FunctionContextData
  }

  pub(crate) fn trampoline_base(&self) -> usize {
    self.trampoline.as_ptr() as usize
  }

  pub(crate) fn on_enter_address(&self) -> usize {
    self.trampoline_base() + self.on_enter_offset
  }

  pub(crate) fn is_empty(&self) -> bool {
    let listeners = self.data.listeners.lock().unwrap();
    let replacement = self.data.replacement.lock().unwrap();
    listeners.is_empty() && replacement.is_none()
  }
}
